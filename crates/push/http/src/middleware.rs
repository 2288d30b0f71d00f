//! HTTP middleware.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

/// Log each request once it has been answered.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if status.is_server_error() {
        tracing::error!(%method, %path, %status, elapsed_ms, "request failed");
    } else if status.is_client_error() {
        tracing::warn!(%method, %path, %status, elapsed_ms, "request rejected");
    } else {
        tracing::info!(%method, %path, %status, elapsed_ms, "request completed");
    }

    response
}
