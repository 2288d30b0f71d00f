//! In-memory stats engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use push_core::Platform;

use crate::{PlatformStats, StatStore, StatsSnapshot};

#[derive(Debug, Default)]
struct PlatformCounters {
    success: AtomicU64,
    failure: AtomicU64,
}

/// Atomic counters that live for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    ios: PlatformCounters,
    android: PlatformCounters,
    other: PlatformCounters,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, platform: Platform) -> &PlatformCounters {
        match platform {
            Platform::Ios => &self.ios,
            Platform::Android => &self.android,
            Platform::Other(_) => &self.other,
        }
    }
}

impl StatStore for MemoryStats {
    fn increment_submitted(&self, n: u64) -> color_eyre::eyre::Result<()> {
        self.submitted.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    fn increment_succeeded(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()> {
        self.succeeded.fetch_add(n, Ordering::Relaxed);
        self.bucket(platform).success.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    fn increment_failed(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()> {
        self.failed.fetch_add(n, Ordering::Relaxed);
        self.bucket(platform).failure.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    fn snapshot(&self) -> color_eyre::eyre::Result<StatsSnapshot> {
        let mut platforms = BTreeMap::new();
        for platform in [Platform::Ios, Platform::Android, Platform::Other(0)] {
            let bucket = self.bucket(platform);
            platforms.insert(
                platform.name().to_string(),
                PlatformStats {
                    success: bucket.success.load(Ordering::Relaxed),
                    failure: bucket.failure.load(Ordering::Relaxed),
                },
            );
        }

        Ok(StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            platforms,
        })
    }

    fn reset(&self) -> color_eyre::eyre::Result<()> {
        for counter in [&self.submitted, &self.succeeded, &self.failed] {
            counter.store(0, Ordering::Relaxed);
        }
        for bucket in [&self.ios, &self.android, &self.other] {
            bucket.success.store(0, Ordering::Relaxed);
            bucket.failure.store(0, Ordering::Relaxed);
        }
        Ok(())
    }
}
