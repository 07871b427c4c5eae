//! Source Connector
//!
//! Owns one source's session task. A connector stamps every received frame
//! with the engine clock and forwards it to the source's pipeline channel;
//! it never retries. Session outcomes are reported to the supervisor as
//! [`ConnectorSignal`]s.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::supervisor::SourceMonitor;
use crate::application::ports::{ConnectorError, FeedTransport, FrameSink, Normalizer};
use crate::domain::market::{RawMessage, RawPayload};
use crate::domain::source::SourceDescriptor;
use crate::domain::time::Clock;

/// Session lifecycle events reported to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorSignal {
    /// Transport open and subscribed.
    Connected,
    /// Session ended with an error.
    Failed(ConnectorError),
    /// Session ended because it was cancelled.
    Finished,
}

/// Where a session hands its frames.
///
/// Stamps each frame with the receive time, records it on the source's
/// monitor, and pushes it onto the bounded pipeline channel. A full channel
/// applies backpressure to the session's read loop.
pub struct ConnectorSink {
    descriptor: Arc<SourceDescriptor>,
    clock: Arc<dyn Clock>,
    monitor: Arc<SourceMonitor>,
    frames: mpsc::Sender<RawMessage>,
    signals: mpsc::UnboundedSender<ConnectorSignal>,
}

impl ConnectorSink {
    /// Create a sink for one source.
    #[must_use]
    pub fn new(
        descriptor: Arc<SourceDescriptor>,
        clock: Arc<dyn Clock>,
        monitor: Arc<SourceMonitor>,
        frames: mpsc::Sender<RawMessage>,
        signals: mpsc::UnboundedSender<ConnectorSignal>,
    ) -> Self {
        Self {
            descriptor,
            clock,
            monitor,
            frames,
            signals,
        }
    }

    fn signal(&self, signal: ConnectorSignal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!(source_id = %self.descriptor.id(), "Supervisor gone, signal dropped");
        }
    }
}

#[async_trait]
impl FrameSink for ConnectorSink {
    fn connected(&self) {
        self.signal(ConnectorSignal::Connected);
    }

    async fn deliver(&self, payload: RawPayload) -> Result<(), ConnectorError> {
        let received_at = self.clock.now_millis();
        self.monitor.record_message(received_at);

        let message = RawMessage {
            source_id: self.descriptor.id().clone(),
            received_at,
            payload,
        };
        self.frames
            .send(message)
            .await
            .map_err(|_| ConnectorError::SinkClosed)
    }
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs sessions of one transport against one source.
pub struct SourceConnector {
    descriptor: Arc<SourceDescriptor>,
    transport: Arc<dyn FeedTransport>,
    normalizer: Arc<dyn Normalizer>,
    sink: Arc<ConnectorSink>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for SourceConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConnector")
            .field("source_id", self.descriptor.id())
            .field("transport", &self.descriptor.transport().as_str())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SourceConnector {
    /// Create an idle connector.
    #[must_use]
    pub fn new(
        descriptor: Arc<SourceDescriptor>,
        transport: Arc<dyn FeedTransport>,
        normalizer: Arc<dyn Normalizer>,
        sink: Arc<ConnectorSink>,
    ) -> Self {
        Self {
            descriptor,
            transport,
            normalizer,
            sink,
            session: Mutex::new(None),
        }
    }

    /// Source served by this connector.
    #[must_use]
    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Spawn a session and return immediately.
    ///
    /// The session is cancelled with `parent`. Returns `false` if a session
    /// is already running.
    pub fn start(&self, parent: &CancellationToken) -> bool {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return false;
        }

        let cancel = parent.child_token();
        let descriptor = Arc::clone(&self.descriptor);
        let transport = Arc::clone(&self.transport);
        let normalizer = Arc::clone(&self.normalizer);
        let sink = Arc::clone(&self.sink);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(
                source_id = %descriptor.id(),
                transport = descriptor.transport().as_str(),
                "Starting session"
            );
            let result = transport
                .run_session(&descriptor, normalizer.as_ref(), sink.as_ref(), &token)
                .await;
            // A session that ends on its own is a disconnect, even without an error.
            let signal = match result {
                _ if token.is_cancelled() => ConnectorSignal::Finished,
                Ok(()) => ConnectorSignal::Failed(ConnectorError::ClosedByRemote),
                Err(e) => ConnectorSignal::Failed(e),
            };
            sink.signal(signal);
        });

        *session = Some(Session { cancel, handle });
        true
    }

    /// Cancel the running session. Idempotent.
    pub fn stop(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
    }

    /// Whether a session task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| !s.cancel.is_cancelled() && !s.handle.is_finished())
    }
}
