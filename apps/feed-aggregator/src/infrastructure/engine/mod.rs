//! Market Data Engine
//!
//! The handle consumers hold. It wires supervised sources into the
//! aggregation pipeline:
//!
//! ```text
//! Transport ──► ConnectorSink ──mpsc──► frame pump ──► Normalizer ──► Pipeline ──► Dispatcher
//!     ▲                                    │
//!     └──────── ConnectionSupervisor       └── first sight of a symbol ──► backfill
//! ```
//!
//! Each source has its own frame pump task, so a slow or failing source
//! never holds up another. A sweep task evicts idle symbols.

mod builder;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use builder::EngineBuilder;

use crate::application::ports::{HistoryProvider, NormalizeError, Normalizer};
use crate::application::services::{
    AggregatorConfig, DispatchError, DispatcherConfig, DispatcherStats, History, IngestOutcome, IngestReport,
    MarketDataPipeline, PipelineConfig, Subscriber,
};
use crate::domain::market::{AggregatedSymbolView, MarketEvent, NormalizedTick, RawMessage, SourceId, Symbol};
use crate::domain::source::{SourceDescriptor, SourceHealth, SymbolMapping};
use crate::domain::subscription::{PatternError, SubscriptionHandle, SymbolPattern};
use crate::domain::time::Clock;
use crate::infrastructure::config::EngineSettings;
use crate::infrastructure::feeds::{
    ConnectionSupervisor, HeartbeatConfig, SourceMonitor, SupervisorConfig, SupervisorError,
};
use crate::infrastructure::metrics::{record_message_received, record_message_rejected, record_processing_duration};

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Aggregation, cache and TTL.
    pub pipeline: PipelineConfig,
    /// Subscriber delivery.
    pub dispatcher: DispatcherConfig,
    /// Restart and health policy.
    pub supervisor: SupervisorConfig,
    /// WebSocket liveness.
    pub heartbeat: HeartbeatConfig,
    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,
    /// Candles requested per backfill (0 disables backfill).
    pub backfill_limit: usize,
    /// Frames buffered per source between transport and pipeline.
    pub frame_buffer: usize,
    /// Upper bound on graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            supervisor: SupervisorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            sweep_interval: Duration::from_secs(30),
            backfill_limit: 500,
            frame_buffer: 1024,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Build from process settings.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            pipeline: PipelineConfig {
                aggregator: AggregatorConfig {
                    staleness_threshold: settings.staleness,
                },
                cache_capacity: settings.cache_capacity,
                symbol_ttl: settings.symbol_ttl,
            },
            dispatcher: DispatcherConfig {
                failure_limit: settings.subscriber_failure_limit,
            },
            supervisor: SupervisorConfig::from_settings(settings),
            heartbeat: HeartbeatConfig::from_settings(settings),
            sweep_interval: settings.sweep_interval,
            backfill_limit: settings.backfill_limit,
            ..Self::default()
        }
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The source list is empty.
    #[error("no sources configured")]
    NoSourcesConfigured,

    /// Two sources share an id.
    #[error("duplicate source id {0}")]
    DuplicateSource(SourceId),

    /// A source subscribes to nothing.
    #[error("source {0} has no symbols")]
    NoSymbols(SourceId),

    /// An endpoint URL is unusable for its transport.
    #[error("source {source_id} has invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// Offending source.
        source_id: SourceId,
        /// Endpoint as configured.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The source id is not configured.
    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    /// The HTTP client could not be created.
    #[error("failed to create HTTP client: {0}")]
    HttpClient(String),

    /// `start` was already called.
    #[error("engine already started")]
    AlreadyStarted,

    /// The engine has been shut down.
    #[error("engine is shut down")]
    ShutDown,

    /// `start` was called outside a Tokio runtime.
    #[error("engine must be started inside a Tokio runtime")]
    NoRuntime,

    /// Invalid subscription pattern.
    #[error(transparent)]
    Pattern(#[from] PatternError),

    /// Subscription refused by the dispatcher.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Supervisor refused a request.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// An injected frame failed normalization.
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

// =============================================================================
// Engine
// =============================================================================

struct SourceRuntime {
    descriptor: Arc<SourceDescriptor>,
    normalizer: Arc<dyn Normalizer>,
    monitor: Arc<SourceMonitor>,
    frames: Mutex<Option<mpsc::Receiver<RawMessage>>>,
}

struct EngineInner {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    sources: BTreeMap<SourceId, SourceRuntime>,
    supervisor: Arc<ConnectionSupervisor>,
    pipeline: MarketDataPipeline,
    history: Arc<dyn HistoryProvider>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    started: AtomicBool,
}

/// Handle to a running (or startable) engine. Cheap to clone.
#[derive(Clone)]
pub struct MarketDataEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MarketDataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataEngine")
            .field("sources", &self.inner.sources.keys().collect::<Vec<_>>())
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MarketDataEngine {
    /// Start with a builder.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Spawn frame pumps, the sweep and every source's supervision task.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoRuntime` outside a Tokio runtime,
    /// `EngineError::AlreadyStarted` on a second call and
    /// `EngineError::ShutDown` after shutdown.
    pub fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        if inner.cancel.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }

        for (source_id, source) in &inner.sources {
            if let Some(frames) = source.frames.lock().take() {
                inner
                    .tracker
                    .spawn_on(pump_frames(Arc::clone(inner), source_id.clone(), frames), &runtime);
            }
        }
        inner.tracker.spawn_on(sweep_loop(Arc::clone(inner)), &runtime);
        let started = inner.supervisor.start()?;

        tracing::info!(sources = started, "Engine started");
        Ok(())
    }

    /// Register a consumer for every symbol matching `pattern` (`*` and `?`
    /// wildcards). The engine holds the subscriber weakly.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Pattern` for an invalid pattern or
    /// `EngineError::Dispatch` after shutdown.
    pub fn subscribe<S>(&self, pattern: &str, subscriber: &Arc<S>) -> Result<SubscriptionHandle, EngineError>
    where
        S: Subscriber + 'static,
    {
        let pattern = SymbolPattern::parse(pattern)?;
        Ok(self.inner.pipeline.dispatcher().subscribe(pattern, subscriber)?)
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.pipeline.dispatcher().unsubscribe(handle)
    }

    /// Current view of a symbol, or `None` if it is not tracked.
    #[must_use]
    pub fn snapshot(&self, symbol: &str) -> Option<AggregatedSymbolView> {
        self.inner.pipeline.snapshot(symbol)
    }

    /// The most recent `lookback` candles of a symbol, oldest first.
    #[must_use]
    pub fn history(&self, symbol: &str, lookback: usize) -> History {
        self.inner.pipeline.history(symbol, lookback)
    }

    /// The most recent `lookback` ticks of a symbol, oldest first.
    #[must_use]
    pub fn recent_ticks(&self, symbol: &str, lookback: usize) -> Vec<NormalizedTick> {
        self.inner.pipeline.recent_ticks(symbol, lookback)
    }

    /// Health of every source, ordered by id.
    #[must_use]
    pub fn source_health(&self) -> Vec<SourceHealth> {
        self.inner.supervisor.health()
    }

    /// Symbols currently tracked, sorted.
    #[must_use]
    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.inner.pipeline.tracked_symbols()
    }

    /// Subscriber delivery counters.
    #[must_use]
    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.inner.pipeline.dispatcher().stats()
    }

    /// Inject an already normalized event. Native symbols of configured
    /// sources are mapped to canonical names.
    pub fn ingest(&self, mut event: MarketEvent) -> IngestReport {
        let descriptor = self.inner.sources.get(event.source_id()).map(|s| Arc::clone(&s.descriptor));
        if let Some(descriptor) = &descriptor {
            let canonical = descriptor.canonical_symbol(event.symbol());
            event.set_symbol(canonical);
        }
        self.inner.ingest_event(event, descriptor.as_ref())
    }

    /// Inject a raw frame as if it had arrived from its source.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownSource` for an unconfigured source and
    /// `EngineError::Normalize` if the frame is rejected.
    pub fn ingest_raw(&self, raw: RawMessage) -> Result<Vec<IngestReport>, EngineError> {
        let source = self
            .inner
            .sources
            .get(&raw.source_id)
            .ok_or_else(|| EngineError::UnknownSource(raw.source_id.clone()))?;
        Ok(self.inner.process_frame(source, raw)?)
    }

    /// Stop one source permanently. Frames it already queued are discarded.
    /// Returns `false` if the source is unknown or already stopped.
    pub fn stop_source(&self, source_id: &SourceId) -> bool {
        self.inner.supervisor.stop_source(source_id)
    }

    /// Cancel every task and wait for them, bounded by the shutdown timeout.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();

        let drain = async {
            inner.supervisor.shutdown().await;
            inner.tracker.close();
            inner.tracker.wait().await;
            inner.pipeline.dispatcher().shutdown().await;
        };
        if tokio::time::timeout(inner.config.shutdown_timeout, drain).await.is_err() {
            tracing::warn!(timeout = ?inner.config.shutdown_timeout, "Engine shutdown timed out");
        } else {
            tracing::info!("Engine stopped");
        }
    }
}

impl EngineInner {
    fn process_frame(self: &Arc<Self>, source: &SourceRuntime, raw: RawMessage) -> Result<Vec<IngestReport>, NormalizeError> {
        let source_id = source.descriptor.id();
        record_message_received(source_id);

        let events = source.normalizer.normalize(&raw).inspect_err(|e| {
            tracing::warn!(%source_id, reason = e.reason(), error = %e, "Dropping rejected frame");
            record_message_rejected(source_id, e.reason());
        })?;

        let reports = events
            .into_iter()
            .map(|mut event| {
                let canonical = source.descriptor.canonical_symbol(event.symbol());
                event.set_symbol(canonical);
                self.ingest_event(event, Some(&source.descriptor))
            })
            .collect();

        let elapsed = self.clock.now_millis().saturating_sub(raw.received_at);
        record_processing_duration(source_id, Duration::from_millis(u64::try_from(elapsed).unwrap_or(0)));
        Ok(reports)
    }

    fn ingest_event(self: &Arc<Self>, event: MarketEvent, origin: Option<&Arc<SourceDescriptor>>) -> IngestReport {
        let report = self.pipeline.ingest(event);
        if let IngestOutcome::CacheRejected(e) = &report.outcome {
            tracing::debug!(symbol = %report.symbol, error = %e, "Update not published");
        }
        if report.seeded {
            self.spawn_backfill(&report.symbol, origin);
        }
        report
    }

    /// Pick a source able to serve history for `symbol`, preferring the one
    /// that produced the seeding event.
    fn backfill_source(
        &self,
        symbol: &str,
        origin: Option<&Arc<SourceDescriptor>>,
    ) -> Option<(Arc<SourceDescriptor>, SymbolMapping)> {
        let serves = |descriptor: &Arc<SourceDescriptor>| {
            descriptor.history_endpoint()?;
            descriptor
                .mapping_for(symbol)
                .map(|mapping| (Arc::clone(descriptor), mapping.clone()))
        };
        origin
            .and_then(serves)
            .or_else(|| self.sources.values().find_map(|source| serves(&source.descriptor)))
    }

    fn spawn_backfill(self: &Arc<Self>, symbol: &str, origin: Option<&Arc<SourceDescriptor>>) {
        if self.config.backfill_limit == 0 || self.cancel.is_cancelled() {
            return;
        }
        let Some((descriptor, mapping)) = self.backfill_source(symbol, origin) else {
            tracing::debug!(symbol, "No history endpoint serves symbol, skipping backfill");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(symbol, "No runtime, skipping backfill");
            return;
        };

        let inner = Arc::clone(self);
        let symbol = symbol.to_string();
        self.tracker.spawn_on(
            async move {
                let fetch = inner
                    .history
                    .fetch_candles(&descriptor, &mapping, inner.config.backfill_limit);
                let result = tokio::select! {
                    () = inner.cancel.cancelled() => return,
                    result = fetch => result,
                };
                match result {
                    Ok(candles) => {
                        let fetched = candles.len();
                        let stored = inner.pipeline.backfill(&symbol, candles);
                        tracing::info!(%symbol, source_id = %descriptor.id(), fetched, stored, "Backfill complete");
                    }
                    Err(e) => {
                        tracing::warn!(%symbol, source_id = %descriptor.id(), error = %e, "Backfill failed");
                    }
                }
            },
            &runtime,
        );
    }
}

/// Drain one source's frame channel into the pipeline.
async fn pump_frames(inner: Arc<EngineInner>, source_id: SourceId, mut frames: mpsc::Receiver<RawMessage>) {
    let Some(source) = inner.sources.get(&source_id) else {
        return;
    };
    loop {
        let raw = tokio::select! {
            () = inner.cancel.cancelled() => break,
            raw = frames.recv() => raw,
        };
        let Some(raw) = raw else {
            break;
        };
        if source.monitor.is_stopped() {
            tracing::trace!(%source_id, "Discarding frame from stopped source");
            continue;
        }
        // Rejections are logged and counted inside.
        let _ = inner.process_frame(source, raw);
    }
    tracing::debug!(%source_id, "Frame pump ended");
}

/// Periodic TTL eviction and staleness refresh.
async fn sweep_loop(inner: Arc<EngineInner>) {
    let mut ticker = tokio::time::interval(inner.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = inner.pipeline.sweep_once();
                if !report.evicted.is_empty() || report.refreshed > 0 {
                    tracing::debug!(
                        evicted = report.evicted.len(),
                        refreshed = report.refreshed,
                        "Sweep complete"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;
    use crate::application::ports::{BackfillError, ConnectorError, FeedTransport, FrameSink, MockHistoryProvider};
    use crate::domain::market::{NormalizedCandle, RawPayload};
    use crate::domain::source::{SourceSchema, SymbolMapping, TransportKind};
    use crate::domain::time::ManualClock;

    const NOW: i64 = 1_700_000_000_000;

    fn binance() -> SourceDescriptor {
        SourceDescriptor::new("binance", SourceSchema::Binance, "wss://stream.binance.com:9443/stream")
            .with_mapping(SymbolMapping::new("BTCUSD", "BTCUSDT"))
            .with_history_endpoint("https://api.binance.com/api/v3/klines?symbol={symbol}&limit={limit}")
    }

    fn candle(symbol: &str, open_time: i64) -> NormalizedCandle {
        NormalizedCandle {
            symbol: symbol.to_string(),
            open_time,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(3),
            source_id: SourceId::new("binance"),
        }
    }

    fn engine_with(history: MockHistoryProvider) -> MarketDataEngine {
        MarketDataEngine::builder(EngineConfig::default())
            .with_source(binance())
            .with_clock(Arc::new(ManualClock::new(NOW)))
            .with_history_provider(Arc::new(history))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_source_list_is_fatal() {
        let err = MarketDataEngine::builder(EngineConfig::default()).build().unwrap_err();
        assert!(matches!(err, EngineError::NoSourcesConfigured));
    }

    #[test]
    fn duplicate_source_is_fatal() {
        let err = MarketDataEngine::builder(EngineConfig::default())
            .with_sources([binance(), binance()])
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSource(id) if id.as_str() == "binance"));
    }

    #[test]
    fn source_without_symbols_is_fatal() {
        let err = MarketDataEngine::builder(EngineConfig::default())
            .with_source(SourceDescriptor::new("empty", SourceSchema::Coinbase, "wss://x"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSymbols(_)));
    }

    #[test_case("not a url", TransportKind::Streaming ; "unparseable")]
    #[test_case("https://api.example.com", TransportKind::Streaming ; "http for streaming")]
    #[test_case("wss://stream.example.com", TransportKind::Polling { interval: Duration::from_secs(1) } ; "ws for polling")]
    fn bad_endpoint_is_fatal(endpoint: &str, transport: TransportKind) {
        let err = MarketDataEngine::builder(EngineConfig::default())
            .with_source(
                SourceDescriptor::new("src", SourceSchema::Kraken, endpoint)
                    .with_transport(transport)
                    .with_symbol("XBT/USD"),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEndpoint { .. }), "{err}");
    }

    #[tokio::test]
    async fn first_sight_of_symbol_triggers_backfill() {
        let mut history = MockHistoryProvider::new();
        history
            .expect_fetch_candles()
            .times(1)
            .returning(|descriptor, mapping, limit| {
                assert_eq!(descriptor.id().as_str(), "binance");
                assert_eq!(mapping.native, "BTCUSDT");
                assert_eq!(limit, 500);
                Ok(vec![candle("BTCUSD", NOW - 120_000), candle("BTCUSD", NOW - 60_000)])
            });
        let engine = engine_with(history);

        let raw = RawMessage::text(
            SourceId::new("binance"),
            NOW,
            r#"{"e":"trade","E":1700000000000,"s":"BTCUSDT","p":"100","q":"2","T":1700000000000}"#,
        );
        let reports = engine.ingest_raw(raw.clone()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].symbol, "BTCUSD");
        assert!(reports[0].seeded);

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.history("BTCUSD", 10).len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Same symbol again: no second backfill.
        assert!(!engine.ingest_raw(raw).unwrap()[0].seeded);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn backfill_failure_is_not_fatal() {
        let mut history = MockHistoryProvider::new();
        history
            .expect_fetch_candles()
            .times(1)
            .returning(|_, _, _| Err(BackfillError::Http("connection reset".into())));
        let engine = engine_with(history);

        engine.ingest(MarketEvent::Tick(NormalizedTick {
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            bid_price: None,
            ask_price: None,
            volume: dec!(1),
            source_id: SourceId::new("binance"),
            source_timestamp: NOW,
            received_at: NOW,
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.tracked_symbols(), vec!["BTCUSD".to_string()]);
        assert!(engine.history("BTCUSD", 10).is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_frame_reports_reason() {
        let engine = engine_with(MockHistoryProvider::new());
        let err = engine
            .ingest_raw(RawMessage::text(SourceId::new("binance"), NOW, "{not json"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Normalize(NormalizeError::Malformed(_))));
        assert!(engine.tracked_symbols().is_empty());
    }

    #[test]
    fn raw_frame_from_unknown_source_rejected() {
        let engine = engine_with(MockHistoryProvider::new());
        let err = engine
            .ingest_raw(RawMessage {
                source_id: SourceId::new("nope"),
                received_at: NOW,
                payload: RawPayload::Text("{}".into()),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSource(_)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let engine = engine_with(MockHistoryProvider::new());
        assert!(matches!(engine.start(), Err(EngineError::NoRuntime)));
    }

    #[derive(Debug)]
    struct IdleTransport;

    #[async_trait::async_trait]
    impl FeedTransport for IdleTransport {
        async fn run_session(
            &self,
            _descriptor: &SourceDescriptor,
            _normalizer: &dyn Normalizer,
            sink: &dyn FrameSink,
            cancel: &CancellationToken,
        ) -> Result<(), ConnectorError> {
            sink.connected();
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let engine = MarketDataEngine::builder(EngineConfig::default())
            .with_source(binance())
            .with_transport("binance", Arc::new(IdleTransport))
            .with_history_provider(Arc::new(MockHistoryProvider::new()))
            .build()
            .unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyStarted)));
        engine.stop_source(&SourceId::new("binance"));
        engine.shutdown().await;
        assert!(matches!(engine.start(), Err(EngineError::ShutDown)));
    }
}
