//! Health, Metrics and Query Endpoint
//!
//! HTTP surface for orchestrators, monitoring and ad-hoc inspection.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health with per-source status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (at least one source connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /snapshot/{symbol}` - Current aggregated view
//! - `GET /history/{symbol}?lookback=N` - Recent candles, oldest first

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::market::NormalizedCandle;
use crate::domain::source::{ConnectionPhase, SourceHealth};
use crate::infrastructure::engine::MarketDataEngine;
use crate::infrastructure::metrics::get_metrics_handle;

const DEFAULT_LOOKBACK: usize = 100;
const MAX_LOOKBACK: usize = 5_000;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Symbols currently tracked.
    pub tracked_symbols: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Per-source status, ordered by id.
    pub sources: Vec<SourceHealth>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every source is connected.
    Healthy,
    /// Some sources are connected.
    Degraded,
    /// No source is connected.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
#[derive(Debug)]
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    engine: MarketDataEngine,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, engine: MarketDataEngine) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            engine,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
#[derive(Debug)]
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self { port, state, cancel }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// All routes over shared state.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/snapshot/{symbol}", get(snapshot_handler))
        .route("/history/{symbol}", get(history_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let ready = state
        .engine
        .source_health()
        .iter()
        .any(|h| h.phase == ConnectionPhase::Connected);

    if ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn snapshot_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    match state.engine.snapshot(&symbol) {
        Some(view) => (StatusCode::OK, Json(view)).into_response(),
        None => (StatusCode::NOT_FOUND, format!("symbol {symbol} is not tracked")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    lookback: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    symbol: String,
    candles: Vec<NormalizedCandle>,
}

async fn history_handler(
    State(state): State<Arc<HealthServerState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let lookback = query.lookback.unwrap_or(DEFAULT_LOOKBACK).min(MAX_LOOKBACK);
    let candles = state.engine.history(&symbol, lookback).iter().cloned().collect();
    Json(HistoryResponse { symbol, candles })
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let sources = state.engine.source_health();
    let stats = state.engine.dispatcher_stats();

    HealthResponse {
        status: determine_health_status(&sources),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        tracked_symbols: state.engine.tracked_symbols().len(),
        subscriptions: stats.subscriptions.subscription_count,
        sources,
    }
}

fn determine_health_status(sources: &[SourceHealth]) -> HealthStatus {
    let connected = sources
        .iter()
        .filter(|h| h.phase == ConnectionPhase::Connected)
        .count();

    match connected {
        0 => HealthStatus::Unhealthy,
        n if n == sources.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    use super::*;
    use crate::domain::market::{MarketEvent, NormalizedTick, SourceId};
    use crate::domain::source::{SourceDescriptor, SourceSchema};
    use crate::infrastructure::engine::EngineConfig;

    fn source(id: &str, phase: ConnectionPhase) -> SourceHealth {
        SourceHealth {
            source_id: SourceId::new(id),
            phase,
            consecutive_failures: 0,
            current_backoff_ms: None,
            last_message_at: None,
            last_error: None,
            messages_received: 0,
            restarts: 0,
        }
    }

    fn state() -> Arc<HealthServerState> {
        let engine = MarketDataEngine::builder(EngineConfig::default())
            .with_source(SourceDescriptor::new("coinbase", SourceSchema::Coinbase, "wss://ws-feed.exchange.coinbase.com").with_symbol("BTC-USD"))
            .build()
            .unwrap();
        engine.ingest(MarketEvent::Tick(NormalizedTick {
            symbol: "BTC-USD".into(),
            price: dec!(100),
            bid_price: None,
            ask_price: None,
            volume: dec!(1),
            source_id: SourceId::new("coinbase"),
            source_timestamp: 1,
            received_at: 1,
        }));
        Arc::new(HealthServerState::new("test".into(), engine))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[test]
    fn status_follows_connected_sources() {
        let all = [source("a", ConnectionPhase::Connected), source("b", ConnectionPhase::Connected)];
        assert_eq!(determine_health_status(&all), HealthStatus::Healthy);

        let some = [source("a", ConnectionPhase::Connected), source("b", ConnectionPhase::Backoff)];
        assert_eq!(determine_health_status(&some), HealthStatus::Degraded);

        let none = [source("a", ConnectionPhase::Degraded), source("b", ConnectionPhase::Disconnected)];
        assert_eq!(determine_health_status(&none), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn unstarted_engine_is_not_ready() {
        let (status, body) = get(state(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "NOT READY");

        let (status, body) = get(state(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["tracked_symbols"], 1);
        assert_eq!(json["sources"][0]["source_id"], "coinbase");
    }

    #[tokio::test]
    async fn snapshot_of_tracked_symbol() {
        let (status, body) = get(state(), "/snapshot/BTC-USD").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["symbol"], "BTC-USD");
    }

    #[tokio::test]
    async fn snapshot_of_unknown_symbol_is_404() {
        let (status, _) = get(state(), "/snapshot/DOGE-USD").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_of_unknown_symbol_is_empty() {
        let (status, body) = get(state(), "/history/DOGE-USD?lookback=10").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["candles"].as_array().map(Vec::len), Some(0));
    }
}
