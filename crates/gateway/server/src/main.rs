//! Push notification gateway server.

mod cli;

use std::sync::Arc;

use clap::Parser as _;
use color_eyre::eyre::WrapErr as _;
use tokio::signal::unix::{SignalKind, signal};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config().wrap_err("failed to load configuration")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "pushgate starting"
    );

    let stats = push_stats::open_store(&config.stat).wrap_err("failed to open stats engine")?;
    if cli.reset_stats {
        stats.reset().wrap_err("failed to reset stats")?;
        tracing::info!("stats counters reset");
    }

    let registry =
        push_provider::Registry::from_config(&config).wrap_err("failed to set up providers")?;
    let engine = push_engine::Engine::from_config(&config, registry, stats);

    let config = Arc::new(config);
    let app = push_http::app(engine.clone(), config.clone());

    let addr = format!("{}:{}", config.core.address, config.core.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;

    let report = engine.shutdown(config.core.shutdown_grace()).await;
    if report.dropped > 0 {
        tracing::warn!(dropped = report.dropped, "notifications dropped at shutdown");
    }
    tracing::info!("pushgate stopped");

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}
