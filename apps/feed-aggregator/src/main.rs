//! Feed Aggregator Binary
//!
//! Connects to every configured market data source, aggregates per symbol
//! and serves health, metrics and query endpoints.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-aggregator
//! ```
//!
//! # Environment Variables
//!
//! - `FEED_AGGREGATOR_SOURCES_FILE`: Source definitions (default: sources.yaml)
//! - `FEED_AGGREGATOR_HEALTH_PORT`: HTTP port (default: 8083)
//! - `FEED_AGGREGATOR_*`: Engine tunables, see `EngineSettings`
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;

use anyhow::Context;
use feed_aggregator::{
    EngineConfig, EngineSettings, HealthServer, HealthServerState, MarketDataEngine, init_metrics, init_telemetry,
    load_sources,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv_from_ancestors();

    let _telemetry_guard = init_telemetry().context("failed to initialize telemetry")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting feed aggregator");

    init_metrics().context("failed to install Prometheus recorder")?;

    let settings = EngineSettings::from_env().context("invalid engine settings")?;
    let sources = load_sources(&settings.sources_file)
        .with_context(|| format!("failed to load sources from {}", settings.sources_file.display()))?;
    log_config(&settings, sources.len());

    let engine = MarketDataEngine::builder(EngineConfig::from_settings(&settings))
        .with_sources(sources)
        .build()
        .context("invalid source configuration")?;
    engine.start().context("failed to start engine")?;

    let shutdown_token = CancellationToken::new();
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        engine.clone(),
    ));
    let health_server = HealthServer::new(settings.health_port, health_state, shutdown_token.clone());
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Feed aggregator ready");

    await_shutdown(shutdown_token).await;
    engine.shutdown().await;
    if let Err(e) = health_task.await {
        tracing::warn!(error = %e, "Health server task failed");
    }

    tracing::info!("Feed aggregator stopped");
    Ok(())
}

fn log_config(settings: &EngineSettings, sources: usize) {
    tracing::info!(
        sources,
        sources_file = %settings.sources_file.display(),
        health_port = settings.health_port,
        staleness_secs = settings.staleness.as_secs(),
        symbol_ttl_secs = settings.symbol_ttl.as_secs(),
        cache_capacity = settings.cache_capacity,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown_token`.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating shutdown"),
    }

    shutdown_token.cancel();
}
