//! WebSocket Transport
//!
//! Streaming sessions over `tokio-tungstenite`. After connecting, the
//! normalizer's subscribe frames are sent in order, then the session loop
//! forwards text and binary frames to the sink and keeps ping/pong liveness.
//! A close frame, end of stream or an unanswered ping ends the session with
//! an error; only cancellation ends it cleanly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{Heartbeat, HeartbeatAction, HeartbeatConfig};
use crate::application::ports::{ConnectorError, FeedTransport, FrameSink, Normalizer};
use crate::domain::market::RawPayload;
use crate::domain::source::SourceDescriptor;

/// Streaming transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    heartbeat: HeartbeatConfig,
}

impl WebSocketTransport {
    /// Create a transport with the given liveness settings.
    #[must_use]
    pub const fn new(heartbeat: HeartbeatConfig) -> Self {
        Self { heartbeat }
    }
}

fn transport_error(e: impl std::fmt::Display) -> ConnectorError {
    ConnectorError::Transport(e.to_string())
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn run_session(
        &self,
        descriptor: &SourceDescriptor,
        normalizer: &dyn Normalizer,
        sink: &dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        let session_id = uuid::Uuid::new_v4();
        let source_id = descriptor.id();
        tracing::info!(%source_id, %session_id, url = %descriptor.endpoint(), "Connecting to stream");

        let connect = tokio_tungstenite::connect_async(descriptor.endpoint());
        let (ws_stream, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = connect => result.map_err(transport_error)?,
        };
        let (mut write, mut read) = ws_stream.split();

        for frame in normalizer.subscribe_frames(descriptor) {
            write.send(Message::text(frame)).await.map_err(transport_error)?;
        }
        sink.connected();
        tracing::info!(%source_id, %session_id, "Stream connected");

        let mut heartbeat = Heartbeat::new(self.heartbeat, Instant::now());
        let mut ticker = tokio::time::interval_at(
            Instant::now() + heartbeat.ping_interval(),
            heartbeat.ping_interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    tracing::info!(%source_id, %session_id, "Stream session cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match heartbeat.on_tick(Instant::now()) {
                        HeartbeatAction::SendPing => {
                            write.send(Message::Ping(Vec::new().into())).await.map_err(transport_error)?;
                        }
                        HeartbeatAction::Wait => {}
                        HeartbeatAction::Expired(waited) => {
                            tracing::warn!(%source_id, %session_id, ?waited, "Heartbeat timeout");
                            return Err(ConnectorError::HeartbeatTimeout(waited));
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.on_frame(Instant::now());
                            sink.deliver(RawPayload::Text(text.as_str().to_owned())).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat.on_frame(Instant::now());
                            sink.deliver(RawPayload::Binary(data.to_vec())).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.on_pong(Instant::now());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.on_frame(Instant::now());
                            write.send(Message::Pong(data)).await.map_err(transport_error)?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(%source_id, %session_id, ?frame, "Server sent close frame");
                            return Err(ConnectorError::ClosedByRemote);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(transport_error(e)),
                        None => {
                            tracing::info!(%source_id, %session_id, "WebSocket stream ended");
                            return Err(ConnectorError::ClosedByRemote);
                        }
                    }
                }
            }
        }
    }
}
