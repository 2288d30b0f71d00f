//! Static pusher registry keyed by platform.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::eyre::WrapErr as _;
use push_core::{Config, Platform};

use crate::{ApnsPusher, FcmPusher, Pusher};

/// Pushers resolved once at startup.
#[derive(Clone, Default)]
pub struct Registry {
    pushers: HashMap<Platform, Arc<dyn Pusher>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build pushers for every platform enabled in the config.
    pub fn from_config(config: &Config) -> color_eyre::eyre::Result<Self> {
        let mut registry = Self::new();

        if config.ios.enabled {
            let apns = ApnsPusher::from_config(&config.ios).wrap_err("failed to set up iOS")?;
            registry.register(Arc::new(apns));
        }

        if config.android.enabled {
            let fcm = FcmPusher::new(&config.android).wrap_err("failed to set up Android")?;
            registry.register(Arc::new(fcm));
        }

        if registry.is_empty() {
            tracing::warn!("no push platforms enabled; every delivery will fail");
        }

        Ok(registry)
    }

    /// Register a pusher, replacing any previous one for its platform.
    pub fn register(&mut self, pusher: Arc<dyn Pusher>) {
        self.pushers.insert(pusher.platform(), pusher);
    }

    /// Builder-style [`Registry::register`].
    pub fn with(mut self, pusher: Arc<dyn Pusher>) -> Self {
        self.register(pusher);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn Pusher>> {
        self.pushers.get(&platform).cloned()
    }

    /// Registered platforms, sorted.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.pushers.keys().copied().collect();
        platforms.sort();
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.pushers.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
