//! Connection Supervisor
//!
//! Applies one lifecycle and fault policy to every source:
//!
//! ```text
//!            ┌──────────── restart after backoff ────────────┐
//!            ▼                                               │
//!      Connecting ──► Connected ◄──► Degraded                │
//!            │            │             │                    │
//!            └────────────┴──── failure ┴──► Disconnected ──► Backoff
//! ```
//!
//! Each source runs its own supervision task, so a failing source never
//! delays another. A watchdog tick marks silent sources `Degraded` and resets
//! the backoff once a connection has been stable long enough. The supervisor
//! doubles as the merge eligibility policy: only `Connected` sources
//! contribute to aggregated views.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connector::{ConnectorSignal, ConnectorSink, SourceConnector};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{ConnectorError, FeedTransport, MergeEligibility, Normalizer};
use crate::domain::market::{RawMessage, SourceId};
use crate::domain::source::{ConnectionPhase, SourceDescriptor, SourceHealth};
use crate::domain::time::{Clock, EpochMillis, duration_millis};
use crate::infrastructure::config::EngineSettings;
use crate::infrastructure::metrics::{record_reconnect, set_source_phase};

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Supervisor policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorConfig {
    /// Backoff between restarts.
    pub reconnect: ReconnectConfig,
    /// Continuous `Connected` time after which the backoff resets.
    pub stable_reset: Duration,
    /// How often silence and stability are checked.
    pub watchdog_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            stable_reset: Duration::from_secs(60),
            watchdog_interval: Duration::from_millis(250),
        }
    }
}

impl SupervisorConfig {
    /// Build from process settings.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_settings(settings),
            stable_reset: settings.stable_reset,
            ..Self::default()
        }
    }
}

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// A source with this id is already registered.
    #[error("source {0} is already supervised")]
    DuplicateSource(SourceId),

    /// Supervision tasks need a Tokio runtime.
    #[error("supervisor must be started inside a Tokio runtime")]
    NoRuntime,

    /// The supervisor has been shut down.
    #[error("supervisor is shut down")]
    ShutDown,
}

// =============================================================================
// Source Monitor
// =============================================================================

#[derive(Debug)]
struct MonitorState {
    phase: ConnectionPhase,
    consecutive_failures: u32,
    current_backoff: Option<Duration>,
    last_message_at: Option<EpochMillis>,
    last_error: Option<String>,
    messages_received: u64,
    restarts: u64,
    connected_since: Option<EpochMillis>,
}

/// Connection state of one source.
///
/// Written only by the source's supervision task and its connector sink;
/// everything else reads [`SourceMonitor::health`].
#[derive(Debug)]
pub struct SourceMonitor {
    source_id: SourceId,
    heartbeat_window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    stopped: AtomicBool,
}

impl SourceMonitor {
    /// Fresh monitor in `Disconnected`.
    #[must_use]
    pub fn new(descriptor: &SourceDescriptor, clock: Arc<dyn Clock>) -> Self {
        Self {
            source_id: descriptor.id().clone(),
            heartbeat_window: descriptor.heartbeat_window(),
            clock,
            state: Mutex::new(MonitorState {
                phase: ConnectionPhase::Disconnected,
                consecutive_failures: 0,
                current_backoff: None,
                last_message_at: None,
                last_error: None,
                messages_received: 0,
                restarts: 0,
                connected_since: None,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Source id.
    #[must_use]
    pub const fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.state.lock().phase
    }

    /// Whether the source was stopped. Frames from a stopped source are
    /// discarded downstream.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// A data frame arrived at `now`. Leaves `Degraded` immediately.
    pub fn record_message(&self, now: EpochMillis) {
        let mut state = self.state.lock();
        state.messages_received += 1;
        state.last_message_at = Some(now);
        if state.phase == ConnectionPhase::Degraded && !self.is_stopped() {
            state.connected_since = Some(now);
            self.transition(&mut state, ConnectionPhase::Connected);
        }
    }

    /// Point-in-time health.
    #[must_use]
    pub fn health(&self) -> SourceHealth {
        let state = self.state.lock();
        SourceHealth {
            source_id: self.source_id.clone(),
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            current_backoff_ms: state
                .current_backoff
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            last_message_at: state.last_message_at,
            last_error: state.last_error.clone(),
            messages_received: state.messages_received,
            restarts: state.restarts,
        }
    }

    fn transition(&self, state: &mut MonitorState, phase: ConnectionPhase) {
        if state.phase == phase {
            return;
        }
        tracing::info!(
            source_id = %self.source_id,
            from = state.phase.as_str(),
            to = phase.as_str(),
            "Source phase changed"
        );
        state.phase = phase;
        set_source_phase(&self.source_id, phase);
    }

    fn on_connecting(&self, restart: bool) {
        let mut state = self.state.lock();
        if restart {
            state.restarts += 1;
        }
        state.current_backoff = None;
        self.transition(&mut state, ConnectionPhase::Connecting);
    }

    fn on_connected(&self) {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        state.connected_since = Some(now);
        self.transition(&mut state, ConnectionPhase::Connected);
    }

    fn on_failure(&self, error: &ConnectorError) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        state.connected_since = None;
        self.transition(&mut state, ConnectionPhase::Disconnected);
        state.consecutive_failures
    }

    fn on_backoff(&self, delay: Duration) {
        let mut state = self.state.lock();
        state.current_backoff = Some(delay);
        self.transition(&mut state, ConnectionPhase::Backoff);
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.current_backoff = None;
        state.connected_since = None;
        self.transition(&mut state, ConnectionPhase::Disconnected);
    }

    /// Periodic check. Returns `true` when the connection has been stable
    /// for `stable_reset` after earlier failures, so the backoff should reset.
    fn watchdog(&self, now: EpochMillis, stable_reset: Duration) -> bool {
        let mut state = self.state.lock();
        if state.phase != ConnectionPhase::Connected {
            return false;
        }
        let Some(since) = state.connected_since else {
            return false;
        };

        let last_activity = state.last_message_at.map_or(since, |at| at.max(since));
        if now.saturating_sub(last_activity) > duration_millis(self.heartbeat_window) {
            tracing::warn!(
                source_id = %self.source_id,
                silent_ms = now.saturating_sub(last_activity),
                "No data within heartbeat window"
            );
            state.connected_since = None;
            self.transition(&mut state, ConnectionPhase::Degraded);
            return false;
        }

        if state.consecutive_failures > 0 && now.saturating_sub(since) >= duration_millis(stable_reset) {
            tracing::debug!(source_id = %self.source_id, "Connection stable, resetting backoff");
            state.consecutive_failures = 0;
            return true;
        }
        false
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct Supervised {
    connector: SourceConnector,
    monitor: Arc<SourceMonitor>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<ConnectorSignal>>>,
    cancel: CancellationToken,
}

/// Owns every source's connector and connection state.
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    sources: RwLock<BTreeMap<SourceId, Arc<Supervised>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("config", &self.config)
            .field("sources", &self.sources.read().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Create a supervisor with no sources.
    #[must_use]
    pub fn new(config: SupervisorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            sources: RwLock::new(BTreeMap::new()),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a source. Its frames will be sent on `frames`.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::DuplicateSource` if the id is taken.
    pub fn register(
        &self,
        descriptor: Arc<SourceDescriptor>,
        transport: Arc<dyn FeedTransport>,
        normalizer: Arc<dyn Normalizer>,
        frames: mpsc::Sender<RawMessage>,
    ) -> Result<Arc<SourceMonitor>, SupervisorError> {
        let mut sources = self.sources.write();
        if sources.contains_key(descriptor.id()) {
            return Err(SupervisorError::DuplicateSource(descriptor.id().clone()));
        }

        let monitor = Arc::new(SourceMonitor::new(&descriptor, Arc::clone(&self.clock)));
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ConnectorSink::new(
            Arc::clone(&descriptor),
            Arc::clone(&self.clock),
            Arc::clone(&monitor),
            frames,
            signals_tx,
        ));
        let connector = SourceConnector::new(Arc::clone(&descriptor), transport, normalizer, sink);

        sources.insert(
            descriptor.id().clone(),
            Arc::new(Supervised {
                connector,
                monitor: Arc::clone(&monitor),
                signals: Mutex::new(Some(signals_rx)),
                cancel: self.cancel.child_token(),
            }),
        );
        Ok(monitor)
    }

    /// Spawn a supervision task for every registered source not yet started.
    ///
    /// # Errors
    ///
    /// Returns `SupervisorError::NoRuntime` outside a Tokio runtime, or
    /// `SupervisorError::ShutDown` after [`ConnectionSupervisor::shutdown`].
    pub fn start(&self) -> Result<usize, SupervisorError> {
        if self.cancel.is_cancelled() {
            return Err(SupervisorError::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SupervisorError::NoRuntime)?;

        let mut started = 0;
        for entry in self.sources.read().values() {
            let Some(signals) = entry.signals.lock().take() else {
                continue;
            };
            self.tracker.spawn_on(
                supervise(self.config, Arc::clone(&self.clock), Arc::clone(entry), signals),
                &runtime,
            );
            started += 1;
        }
        Ok(started)
    }

    /// Stop one source permanently. Returns `false` if it is unknown or
    /// already stopped.
    pub fn stop_source(&self, source_id: &SourceId) -> bool {
        let Some(entry) = self.sources.read().get(source_id).cloned() else {
            return false;
        };
        if entry.monitor.is_stopped() {
            return false;
        }
        entry.monitor.mark_stopped();
        entry.cancel.cancel();
        entry.connector.stop();
        tracing::info!(%source_id, "Source stopped");
        true
    }

    /// Monitor for one source.
    #[must_use]
    pub fn monitor(&self, source_id: &SourceId) -> Option<Arc<SourceMonitor>> {
        self.sources.read().get(source_id).map(|e| Arc::clone(&e.monitor))
    }

    /// Health of every source, ordered by id.
    #[must_use]
    pub fn health(&self) -> Vec<SourceHealth> {
        self.sources.read().values().map(|e| e.monitor.health()).collect()
    }

    /// Stop every source and wait for supervision tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.sources.read().values() {
            entry.connector.stop();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl MergeEligibility for ConnectionSupervisor {
    fn is_eligible(&self, source: &SourceId) -> bool {
        self.sources.read().get(source).is_none_or(|entry| {
            !entry.monitor.is_stopped() && entry.monitor.phase() == ConnectionPhase::Connected
        })
    }
}

/// Lifecycle loop of one source.
async fn supervise(
    config: SupervisorConfig,
    clock: Arc<dyn Clock>,
    entry: Arc<Supervised>,
    mut signals: mpsc::UnboundedReceiver<ConnectorSignal>,
) {
    let monitor = &entry.monitor;
    let source_id = monitor.source_id().clone();
    let mut policy = ReconnectPolicy::new(config.reconnect);
    let mut watchdog = tokio::time::interval(config.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut restart = false;

    while !entry.cancel.is_cancelled() {
        monitor.on_connecting(restart);
        restart = true;
        entry.connector.start(&entry.cancel);

        let failure = loop {
            tokio::select! {
                () = entry.cancel.cancelled() => break None,
                _ = watchdog.tick() => {
                    if monitor.watchdog(clock.now_millis(), config.stable_reset) {
                        policy.reset();
                    }
                }
                signal = signals.recv() => match signal {
                    Some(ConnectorSignal::Connected) => monitor.on_connected(),
                    Some(ConnectorSignal::Failed(error)) => break Some(error),
                    Some(ConnectorSignal::Finished) | None => break None,
                },
            }
        };
        let Some(error) = failure else {
            break;
        };

        let failures = monitor.on_failure(&error);
        let Some(delay) = policy.next_delay() else {
            tracing::error!(%source_id, error = %error, failures, "Reconnect attempts exhausted, giving up");
            break;
        };
        tracing::warn!(
            %source_id,
            error = %error,
            kind = error.kind(),
            failures,
            delay_ms = delay.as_millis(),
            "Source failed, scheduling restart"
        );
        monitor.on_backoff(delay);
        record_reconnect(&source_id);

        tokio::select! {
            () = entry.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    entry.connector.stop();
    monitor.mark_stopped();
    tracing::debug!(%source_id, "Supervision ended");
}
