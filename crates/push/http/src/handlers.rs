//! Push and stats handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use push_core::{Batch, Counts, LogEntry, Notification};
use push_engine::{AdmissionError, Dispatch, QueueStatus};
use push_stats::StatsSnapshot;

/// Batch submission request.
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

/// Batch submission response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: String,
    pub counts: Counts,
    pub logs: Vec<LogEntry>,
}

/// Error body for every rejected request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: status.as_u16(),
            message: message.into(),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse::new(status, message))).into_response()
}

/// HTTP status for a rejected batch.
pub fn admission_status(error: &AdmissionError) -> StatusCode {
    match error {
        AdmissionError::QueueFull | AdmissionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Submit a batch of notifications.
pub async fn push_handler<D>(State(engine): State<D>, body: Bytes) -> Response
where
    D: Dispatch,
{
    let request: PushRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let error = AdmissionError::malformed(e);
            return error_response(admission_status(&error), error.to_string());
        }
    };

    let batch = Batch::new(request.notifications);
    tracing::debug!(batch = %batch.id, notifications = batch.len(), "push requested");

    match engine.queue_notification(batch).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(PushResponse {
                success: "ok".to_string(),
                counts: summary.counts,
                logs: summary.logs,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "batch rejected");
            error_response(admission_status(&e), e.to_string())
        }
    }
}

/// Stats snapshot plus queue occupancy.
#[derive(Debug, Serialize)]
pub struct AppStatsResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub queue: QueueStatus,
}

/// Report process-wide delivery counters.
pub async fn stat_app_handler<D>(State(engine): State<D>) -> Response
where
    D: Dispatch,
{
    match engine.stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(AppStatsResponse {
                stats,
                queue: engine.queue_status(),
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read stats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read stats")
        }
    }
}
