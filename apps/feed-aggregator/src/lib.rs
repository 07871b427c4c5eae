#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::default_trait_access
    )
)]

//! Feed Aggregator - Multi-Source Market Data Engine
//!
//! Keeps one supervised connection per configured market data source,
//! normalizes every feed into a canonical tick/candle model and publishes a
//! merged per-symbol view to in-process subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Canonical data model
//!   - `market`: Ticks, candles, raw frames, the aggregated view
//!   - `source`: Source descriptors, connection phases, health
//!   - `subscription`: Symbol patterns and the subscription index
//!   - `time`: Injectable clock
//!
//! - **Application**: Aggregation core and ports
//!   - `ports`: Normalizer, transport and history interfaces
//!   - `services`: Aggregator, cache, dispatcher, pipeline
//!
//! - **Infrastructure**: Adapters and wiring
//!   - `feeds`: WebSocket/polling transports, supervisor, backfill
//!   - `normalizers`: Binance, Coinbase, Kraken, Alpaca
//!   - `engine`: The `MarketDataEngine` handle
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Source A ──┐
//!            │   ┌────────────┐   ┌──────────┐   ┌────────────┐
//! Source B ──┼──►│ Normalizer │──►│ Pipeline │──►│ Dispatcher │──► Subscribers
//!            │   └────────────┘   └──────────┘   └────────────┘
//! Source C ──┘                         │
//!                                      └── Cache ◄── REST backfill
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Canonical market data types with no I/O.
pub mod domain;

/// Application layer - Aggregation services and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    AggregatedSymbolView, MarketEvent, NormalizedCandle, NormalizedTick, RawMessage, RawPayload, SourceId, Symbol,
};
pub use domain::source::{
    ConnectionPhase, Credentials, SourceDescriptor, SourceHealth, SourceSchema, SymbolMapping, TransportKind,
};
pub use domain::subscription::{SubscriptionHandle, SymbolPattern};
pub use domain::time::{Clock, EpochMillis, ManualClock, SystemClock};

// Ports and services
pub use application::ports::{
    BackfillError, ConnectorError, FeedTransport, FrameSink, HistoryProvider, NormalizeError, Normalizer,
};
pub use application::services::{History, IngestOutcome, IngestReport, Subscriber, SubscriberError};

// Engine
pub use infrastructure::engine::{EngineBuilder, EngineConfig, EngineError, MarketDataEngine};

// Configuration
pub use infrastructure::config::{ConfigError, EngineSettings, load_sources, load_sources_from_str};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
