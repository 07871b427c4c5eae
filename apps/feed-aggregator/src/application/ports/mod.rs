//! Port Interfaces
//!
//! Contracts between the aggregation core and the outside world, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these; the application services only ever see the traits.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Normalizer`]: maps one source schema into canonical events
//! - [`FeedTransport`]: runs one connection session against a source
//! - [`HistoryProvider`]: bulk candle fetch for cache warm-up
//!
//! ## Supporting Contracts
//!
//! - [`FrameSink`]: where a transport hands received frames
//! - [`MergeEligibility`]: which sources may contribute to a merge

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::market::{MarketEvent, NormalizedCandle, RawMessage, RawPayload, SourceId};
use crate::domain::source::{Credentials, SourceDescriptor, SourceSchema, SymbolMapping};

// =============================================================================
// Normalizer
// =============================================================================

/// Reasons a raw frame is rejected by a normalizer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Payload is not valid for the schema (bad JSON, unknown shape).
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A required field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A numeric field could not be parsed.
    #[error("field `{field}` is not numeric: {value:?}")]
    NonNumeric {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A price was zero or negative.
    #[error("field `{field}` must be a positive price, got {value}")]
    NonPositivePrice {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A volume was negative.
    #[error("field `{field}` has negative volume {value}")]
    NegativeVolume {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A timestamp could not be interpreted.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A candle failed OHLC consistency checks.
    #[error("invalid candle: {0}")]
    InvalidCandle(String),

    /// The source itself reported an error frame.
    #[error("source reported error: {0}")]
    SourceError(String),

    /// Payload encoding is not supported by this schema.
    #[error("unsupported payload encoding for {0}")]
    UnsupportedEncoding(SourceSchema),
}

impl NormalizeError {
    /// Stable label for the rejection metric.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingField(_) => "missing_field",
            Self::NonNumeric { .. } => "non_numeric",
            Self::NonPositivePrice { .. } => "non_positive_price",
            Self::NegativeVolume { .. } => "negative_volume",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::InvalidCandle(_) => "invalid_candle",
            Self::SourceError(_) => "source_error",
            Self::UnsupportedEncoding(_) => "unsupported_encoding",
        }
    }
}

/// Pure, stateless mapping from one source schema to canonical events.
///
/// Implementations never panic on input; every malformed frame becomes a
/// [`NormalizeError`]. Symbols in the returned events are the source's
/// native names; the pipeline maps them to canonical symbols.
pub trait Normalizer: Send + Sync + std::fmt::Debug {
    /// Schema handled by this normalizer.
    fn schema(&self) -> SourceSchema;

    /// Decode one frame. Control frames yield an empty vector.
    ///
    /// # Errors
    ///
    /// Returns `NormalizeError` if the frame fails schema validation.
    fn normalize(&self, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError>;

    /// Decode a REST history body into candles for `native_symbol`.
    ///
    /// # Errors
    ///
    /// Returns `NormalizeError` if the body is not a valid history payload.
    fn normalize_history(
        &self,
        source_id: &SourceId,
        native_symbol: &str,
        body: &[u8],
    ) -> Result<Vec<NormalizedCandle>, NormalizeError>;

    /// Frames sent right after a streaming connection opens.
    fn subscribe_frames(&self, _descriptor: &SourceDescriptor) -> Vec<String> {
        Vec::new()
    }

    /// HTTP headers carrying credentials for REST calls.
    fn auth_headers(&self, _credentials: &Credentials) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

// =============================================================================
// Feed Transport
// =============================================================================

/// Reasons a connection session ends in failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    /// Connect, read or write failed at the transport level.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP request returned a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// Remote sent something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No pong within the liveness window.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    /// Remote closed the connection.
    #[error("connection closed by remote")]
    ClosedByRemote,

    /// The downstream pipeline is gone.
    #[error("frame sink closed")]
    SinkClosed,
}

impl ConnectorError {
    /// Stable label for error metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::HttpStatus { .. } => "http_status",
            Self::Protocol(_) => "protocol",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::ClosedByRemote => "closed",
            Self::SinkClosed => "sink_closed",
        }
    }
}

/// Receives frames from a running transport session.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// The transport is open and subscribed.
    fn connected(&self);

    /// Stamp a received frame and forward it downstream.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::SinkClosed` if the pipeline has shut down.
    async fn deliver(&self, payload: RawPayload) -> Result<(), ConnectorError>;
}

/// One connection session to one source.
///
/// A session runs until it fails or `cancel` fires. It never retries on its
/// own; reconnect policy belongs to the supervisor.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Run a session.
    ///
    /// Returns `Ok(())` only when cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError` on any transport or protocol failure.
    async fn run_session(
        &self,
        descriptor: &SourceDescriptor,
        normalizer: &dyn Normalizer,
        sink: &dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError>;
}

// =============================================================================
// History Provider
// =============================================================================

/// Reasons a backfill request fails.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// The source has no history endpoint.
    #[error("source {0} has no history endpoint")]
    NotConfigured(SourceId),

    /// No normalizer is registered for the source.
    #[error("no normalizer registered for source {0}")]
    UnknownSource(SourceId),

    /// Request failed.
    #[error("history request failed: {0}")]
    Http(String),

    /// Non-success status.
    #[error("history request returned HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// Body could not be decoded.
    #[error("history decode failed: {0}")]
    Decode(#[from] NormalizeError),
}

/// Bulk historical candle fetch.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Fetch up to `limit` recent candles for one symbol of one source.
    /// Returned candles carry the canonical symbol.
    ///
    /// # Errors
    ///
    /// Returns `BackfillError` if the request or decoding fails.
    async fn fetch_candles(
        &self,
        descriptor: &SourceDescriptor,
        symbol: &SymbolMapping,
        limit: usize,
    ) -> Result<Vec<NormalizedCandle>, BackfillError>;
}

// =============================================================================
// Merge Eligibility
// =============================================================================

/// Decides which sources may contribute to a merge.
pub trait MergeEligibility: Send + Sync {
    /// Whether `source` is currently eligible.
    fn is_eligible(&self, source: &SourceId) -> bool;
}

/// Every source is eligible.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllSourcesEligible;

impl MergeEligibility for AllSourcesEligible {
    fn is_eligible(&self, _source: &SourceId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_reasons_are_stable() {
        assert_eq!(NormalizeError::MissingField("price").reason(), "missing_field");
        assert_eq!(
            NormalizeError::NegativeVolume {
                field: "v",
                value: "-1".to_string()
            }
            .reason(),
            "negative_volume"
        );
    }

    #[test]
    fn connector_error_display() {
        let err = ConnectorError::HttpStatus {
            status: 503,
            url: "http://x".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503 from http://x");
        assert_eq!(err.kind(), "http_status");
    }

    #[test]
    fn all_sources_eligible() {
        assert!(AllSourcesEligible.is_eligible(&SourceId::new("any")));
    }
}
