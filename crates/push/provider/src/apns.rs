//! APNs push implementation using the a2 crate.

use a2::NotificationBuilder as _;
use color_eyre::eyre::WrapErr as _;
use push_core::{DeliveryOutcome, FailureReason, IosConfig, Payload, Platform};

use crate::Pusher;

/// APNs pusher using certificate or token authentication.
pub struct ApnsPusher {
    client: a2::Client,
    /// Topic used when a notification does not name one.
    topic: Option<String>,
}

impl ApnsPusher {
    /// Create a pusher from a PKCS#12 certificate (`.p12`) or a PKCS#8 token
    /// key (`.p8`), chosen by the key file extension.
    pub fn from_config(config: &IosConfig) -> color_eyre::eyre::Result<Self> {
        let path = config
            .key_path
            .as_ref()
            .ok_or_else(|| color_eyre::eyre::eyre!("ios.key_path is required"))?;

        let endpoint = if config.production {
            a2::Endpoint::Production
        } else {
            a2::Endpoint::Sandbox
        };
        let client_config = a2::ClientConfig::new(endpoint);

        let mut file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open APNs key {}", path.display()))?;

        let client = match path.extension().and_then(|ext| ext.to_str()) {
            Some("p8") => {
                let (Some(key_id), Some(team_id)) = (&config.key_id, &config.team_id) else {
                    color_eyre::eyre::bail!("ios.key_id and ios.team_id are required for .p8 keys");
                };
                a2::Client::token(&mut file, key_id, team_id, client_config)
            }
            _ => a2::Client::certificate(&mut file, &config.password, client_config),
        }
        .wrap_err("failed to create APNs client")?;

        tracing::info!(
            key = %path.display(),
            production = config.production,
            "APNs client ready"
        );

        Ok(Self {
            client,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Pusher for ApnsPusher {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn send(&self, token: &str, payload: &Payload) -> DeliveryOutcome {
        let mut builder = a2::DefaultNotificationBuilder::new().set_body(&payload.message);
        if let Some(title) = payload.title.as_deref() {
            builder = builder.set_title(title);
        }
        if let Some(sound) = payload.sound.as_deref() {
            builder = builder.set_sound(sound);
        }
        if let Some(badge) = payload.badge {
            builder = builder.set_badge(badge);
        }

        let mut notification = builder.build(
            token,
            a2::NotificationOptions {
                apns_topic: payload.topic.as_deref().or(self.topic.as_deref()),
                ..Default::default()
            },
        );

        for (key, value) in &payload.data {
            if let Err(e) = notification.add_custom_data(key, value) {
                return DeliveryOutcome::permanent(FailureReason::PayloadRejected(e.to_string()));
            }
        }

        match self.client.send(notification).await {
            Ok(_) => DeliveryOutcome::Success,
            Err(a2::Error::ResponseError(response)) => classify_apns_status(
                response.code,
                response.error.map(|body| format!("{:?}", body.reason)),
            ),
            Err(e) => DeliveryOutcome::retryable(FailureReason::Transport(e.to_string())),
        }
    }
}

/// Classify an APNs HTTP status and reason.
pub fn classify_apns_status(code: u16, reason: Option<String>) -> DeliveryOutcome {
    let reason = reason.unwrap_or_else(|| format!("status {}", code));
    match code {
        400 if matches!(
            reason.as_str(),
            "BadDeviceToken" | "DeviceTokenNotForTopic" | "MissingDeviceToken"
        ) =>
        {
            DeliveryOutcome::permanent(FailureReason::InvalidToken(reason))
        }
        410 => DeliveryOutcome::permanent(FailureReason::InvalidToken(reason)),
        403 => DeliveryOutcome::permanent(FailureReason::Unauthorized(reason)),
        429 => DeliveryOutcome::retryable(FailureReason::RateLimited),
        500..=599 => DeliveryOutcome::retryable(FailureReason::Unavailable(reason)),
        400..=499 => DeliveryOutcome::permanent(FailureReason::PayloadRejected(reason)),
        _ => DeliveryOutcome::retryable(FailureReason::Unavailable(reason)),
    }
}
