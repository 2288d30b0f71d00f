//! Operational endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use push_core::Config;

/// Build information.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}

pub async fn welcome_handler() -> impl IntoResponse {
    (StatusCode::OK, "Welcome to the push notification gateway.")
}

pub async fn version_handler() -> impl IntoResponse {
    Json(VersionResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Current configuration. Credentials are never serialized.
pub async fn config_handler(State(config): State<Arc<Config>>) -> impl IntoResponse {
    Json(Config::clone(&config))
}

/// Heartbeat.
pub async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
