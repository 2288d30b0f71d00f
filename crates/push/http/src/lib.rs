//! Push Gateway HTTP Layer
//!
//! Axum handlers for batch submission, stats and operational endpoints.

mod api;
mod handlers;
mod middleware;

pub use api::*;
pub use handlers::*;
pub use middleware::*;

use std::sync::Arc;

use axum::Router;
use push_core::Config;

/// Create the push router: batch submission and app stats.
pub fn push_router<D>(engine: D, config: &Config) -> Router
where
    D: push_engine::Dispatch + Clone + 'static,
{
    use axum::routing::{get, post};

    Router::new()
        .route(&config.api.push_uri, post(handlers::push_handler::<D>))
        .route(&config.api.stat_app_uri, get(handlers::stat_app_handler::<D>))
        .with_state(engine)
}

/// Create the operational router: config, version, welcome and health.
pub fn ops_router(config: Arc<Config>) -> Router {
    use axum::routing::get;

    Router::new()
        .route("/api/", get(api::welcome_handler))
        .route("/api/version", get(api::version_handler))
        .route(&config.api.config_uri, get(api::config_handler))
        .route(&config.api.health_uri, get(api::health_handler))
        .with_state(config)
}

/// Every gateway route with request logging and tracing applied.
pub fn app<D>(engine: D, config: Arc<Config>) -> Router
where
    D: push_engine::Dispatch + Clone + 'static,
{
    Router::new()
        .merge(push_router(engine, &config))
        .merge(ops_router(config))
        .layer(axum::middleware::from_fn(logging_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
