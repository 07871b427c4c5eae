//! Source Connectors and Supervision
//!
//! Transports that run one session against one source, the connector that
//! owns a source's session task, and the supervisor that restarts failed
//! sessions with backoff and tracks per-source health.

pub mod backfill;
pub mod connector;
pub mod heartbeat;
pub mod polling;
pub mod reconnect;
pub mod supervisor;
pub mod websocket;

pub use backfill::RestBackfill;
pub use connector::{ConnectorSignal, ConnectorSink, SourceConnector};
pub use heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
pub use polling::PollingTransport;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use supervisor::{ConnectionSupervisor, SourceMonitor, SupervisorConfig, SupervisorError};
pub use websocket::WebSocketTransport;
