//! FCM push implementation over the HTTP API.

use color_eyre::eyre::WrapErr as _;
use push_core::{AndroidConfig, DeliveryOutcome, FailureReason, Payload, Platform, Priority};
use reqwest::StatusCode;

use crate::Pusher;

/// FCM pusher using a server API key.
pub struct FcmPusher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

/// Message body sent to FCM.
#[derive(Debug, serde::Serialize)]
struct FcmMessage<'a> {
    to: &'a str,
    priority: &'static str,
    notification: FcmNotification<'a>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    data: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, serde::Serialize)]
struct FcmNotification<'a> {
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<&'a str>,
}

/// Response body returned by FCM on HTTP 200.
#[derive(Debug, Default, serde::Deserialize)]
struct FcmResponse {
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, serde::Deserialize)]
struct FcmResult {
    #[serde(default)]
    error: Option<String>,
}

impl FcmPusher {
    /// Create a new FCM pusher.
    pub fn new(config: &AndroidConfig) -> color_eyre::eyre::Result<Self> {
        if config.api_key.is_empty() {
            color_eyre::eyre::bail!("android.api_key is required");
        }

        let client = reqwest::Client::builder()
            .build()
            .wrap_err("failed to create FCM client")?;

        tracing::info!(endpoint = %config.endpoint, "FCM client ready");

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Pusher for FcmPusher {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn send(&self, token: &str, payload: &Payload) -> DeliveryOutcome {
        let message = FcmMessage {
            to: token,
            priority: match payload.priority.unwrap_or_default() {
                Priority::High => "high",
                Priority::Normal => "normal",
            },
            notification: FcmNotification {
                body: &payload.message,
                title: payload.title.as_deref(),
                sound: payload.sound.as_deref(),
            },
            data: &payload.data,
        };

        let response = match self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("key={}", self.api_key))
            .json(&message)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return DeliveryOutcome::retryable(FailureReason::Timeout),
            Err(e) => {
                return DeliveryOutcome::retryable(FailureReason::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return classify_fcm_status(status, body);
        }

        match response.json::<FcmResponse>().await {
            Ok(body) => match body.results.into_iter().next().and_then(|r| r.error) {
                Some(code) => classify_fcm_error(&code),
                None => DeliveryOutcome::Success,
            },
            Err(e) => DeliveryOutcome::retryable(FailureReason::Transport(format!(
                "unreadable FCM response: {}",
                e
            ))),
        }
    }
}

/// Classify a non-success FCM HTTP status.
fn classify_fcm_status(status: StatusCode, body: String) -> DeliveryOutcome {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        body
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryOutcome::permanent(FailureReason::Unauthorized(detail))
        }
        StatusCode::TOO_MANY_REQUESTS => DeliveryOutcome::retryable(FailureReason::RateLimited),
        s if s.is_server_error() => DeliveryOutcome::retryable(FailureReason::Unavailable(detail)),
        _ => DeliveryOutcome::permanent(FailureReason::PayloadRejected(detail)),
    }
}

/// Classify a per-message FCM error code.
pub fn classify_fcm_error(code: &str) -> DeliveryOutcome {
    match code {
        "InvalidRegistration" | "NotRegistered" | "MismatchSenderId" | "MissingRegistration" => {
            DeliveryOutcome::permanent(FailureReason::InvalidToken(code.to_string()))
        }
        "Unavailable" | "InternalServerError" => {
            DeliveryOutcome::retryable(FailureReason::Unavailable(code.to_string()))
        }
        "DeviceMessageRateExceeded" | "TopicsMessageRateExceeded" => {
            DeliveryOutcome::retryable(FailureReason::RateLimited)
        }
        _ => DeliveryOutcome::permanent(FailureReason::PayloadRejected(code.to_string())),
    }
}
