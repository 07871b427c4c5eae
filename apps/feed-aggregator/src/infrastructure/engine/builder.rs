//! Engine construction and startup validation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{EngineConfig, EngineError, EngineInner, MarketDataEngine, SourceRuntime};
use crate::application::ports::{FeedTransport, HistoryProvider, MergeEligibility, Normalizer};
use crate::application::services::{Dispatcher, MarketDataPipeline};
use crate::domain::market::SourceId;
use crate::domain::source::{SourceDescriptor, TransportKind};
use crate::domain::time::{Clock, SystemClock};
use crate::infrastructure::feeds::{ConnectionSupervisor, PollingTransport, RestBackfill, WebSocketTransport};
use crate::infrastructure::normalizers::NormalizerRegistry;

/// Builds a [`MarketDataEngine`].
///
/// Every source gets the built-in normalizer for its schema and the
/// transport for its kind unless overridden.
pub struct EngineBuilder {
    config: EngineConfig,
    sources: Vec<SourceDescriptor>,
    clock: Arc<dyn Clock>,
    normalizers: Vec<(SourceId, Arc<dyn Normalizer>)>,
    transports: HashMap<SourceId, Arc<dyn FeedTransport>>,
    history: Option<Arc<dyn HistoryProvider>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Start with no sources.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            clock: Arc::new(SystemClock),
            normalizers: Vec::new(),
            transports: HashMap::new(),
            history: None,
        }
    }

    /// Add one source.
    #[must_use]
    pub fn with_source(mut self, descriptor: SourceDescriptor) -> Self {
        self.sources.push(descriptor);
        self
    }

    /// Add several sources.
    #[must_use]
    pub fn with_sources(mut self, descriptors: impl IntoIterator<Item = SourceDescriptor>) -> Self {
        self.sources.extend(descriptors);
        self
    }

    /// Replace the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a custom normalizer for one source.
    #[must_use]
    pub fn with_normalizer(mut self, source_id: impl Into<SourceId>, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizers.push((source_id.into(), normalizer));
        self
    }

    /// Use a custom transport for one source.
    #[must_use]
    pub fn with_transport(mut self, source_id: impl Into<SourceId>, transport: Arc<dyn FeedTransport>) -> Self {
        self.transports.insert(source_id.into(), transport);
        self
    }

    /// Replace the REST backfill.
    #[must_use]
    pub fn with_history_provider(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    /// Validate the sources and wire the engine. Nothing is spawned until
    /// [`MarketDataEngine::start`].
    ///
    /// # Errors
    ///
    /// Returns `EngineError` for an empty source list, duplicate ids, a
    /// source without symbols, or an unusable endpoint.
    pub fn build(self) -> Result<MarketDataEngine, EngineError> {
        let Self {
            config,
            sources,
            clock,
            normalizers,
            mut transports,
            history,
        } = self;

        validate_sources(&sources)?;

        let mut registry = NormalizerRegistry::for_sources(&sources);
        for (source_id, normalizer) in normalizers {
            registry.register(source_id, normalizer);
        }
        let registry = Arc::new(registry);

        let http = reqwest::Client::builder()
            .user_agent(concat!("feed-aggregator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::HttpClient(e.to_string()))?;

        let supervisor = Arc::new(ConnectionSupervisor::new(config.supervisor, Arc::clone(&clock)));
        let eligibility: Arc<dyn MergeEligibility> = supervisor.clone();
        let pipeline = MarketDataPipeline::new(
            config.pipeline,
            Arc::clone(&clock),
            eligibility,
            Dispatcher::new(config.dispatcher),
        );
        let history = history.unwrap_or_else(|| Arc::new(RestBackfill::new(http.clone(), Arc::clone(&registry))));
        let websocket: Arc<dyn FeedTransport> = Arc::new(WebSocketTransport::new(config.heartbeat));
        let polling: Arc<dyn FeedTransport> = Arc::new(PollingTransport::new(http));

        let mut runtimes = BTreeMap::new();
        for descriptor in sources {
            let descriptor = Arc::new(descriptor);
            let source_id = descriptor.id().clone();
            let normalizer = registry
                .get(&source_id)
                .ok_or_else(|| EngineError::UnknownSource(source_id.clone()))?;
            let transport = transports.remove(&source_id).unwrap_or_else(|| match descriptor.transport() {
                TransportKind::Streaming => Arc::clone(&websocket),
                TransportKind::Polling { .. } => Arc::clone(&polling),
            });

            let (frames_tx, frames_rx) = mpsc::channel(config.frame_buffer.max(1));
            let monitor = supervisor.register(Arc::clone(&descriptor), transport, Arc::clone(&normalizer), frames_tx)?;
            runtimes.insert(
                source_id,
                SourceRuntime {
                    descriptor,
                    normalizer,
                    monitor,
                    frames: Mutex::new(Some(frames_rx)),
                },
            );
        }

        tracing::info!(sources = runtimes.len(), "Engine built");
        Ok(MarketDataEngine {
            inner: Arc::new(EngineInner {
                config,
                clock,
                sources: runtimes,
                supervisor,
                pipeline,
                history,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                started: std::sync::atomic::AtomicBool::new(false),
            }),
        })
    }
}

fn validate_sources(sources: &[SourceDescriptor]) -> Result<(), EngineError> {
    if sources.is_empty() {
        return Err(EngineError::NoSourcesConfigured);
    }
    let mut seen = HashSet::new();
    for descriptor in sources {
        if !seen.insert(descriptor.id()) {
            return Err(EngineError::DuplicateSource(descriptor.id().clone()));
        }
        if descriptor.symbols().is_empty() {
            return Err(EngineError::NoSymbols(descriptor.id().clone()));
        }
        let schemes: &[&str] = match descriptor.transport() {
            TransportKind::Streaming => &["ws", "wss"],
            TransportKind::Polling { .. } => &["http", "https"],
        };
        check_endpoint(descriptor, descriptor.endpoint(), schemes)?;
        if let Some(history) = descriptor.history_endpoint() {
            check_endpoint(descriptor, history, &["http", "https"])?;
        }
    }
    Ok(())
}

fn check_endpoint(descriptor: &SourceDescriptor, endpoint: &str, schemes: &[&str]) -> Result<(), EngineError> {
    let invalid = |reason: String| EngineError::InvalidEndpoint {
        source_id: descriptor.id().clone(),
        endpoint: endpoint.to_string(),
        reason,
    };
    let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(format!("scheme must be one of {schemes:?}")));
    }
    Ok(())
}
