//! Source Descriptors and Health
//!
//! A [`SourceDescriptor`] identifies one external feed and is immutable once
//! built; the engine shares it behind an `Arc`. [`ConnectionPhase`] and
//! [`SourceHealth`] describe the supervisor's view of that feed.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::market::{SourceId, Symbol};
use crate::domain::time::EpochMillis;

// =============================================================================
// Transport and Schema
// =============================================================================

/// How the engine reaches a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Persistent WebSocket connection.
    Streaming,
    /// Scheduled HTTP GET.
    Polling {
        /// Time between polls.
        interval: Duration,
    },
}

impl TransportKind {
    /// Label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Polling { .. } => "polling",
        }
    }
}

/// Wire schema spoken by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSchema {
    /// Binance spot streams and REST.
    Binance,
    /// Coinbase Exchange feed.
    Coinbase,
    /// Kraken v1 public feed.
    Kraken,
    /// Alpaca market data streams (JSON or `MessagePack`).
    Alpaca,
}

impl SourceSchema {
    /// Schema name as used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Coinbase => "coinbase",
            Self::Kraken => "kraken",
            Self::Alpaca => "alpaca",
        }
    }
}

impl fmt::Display for SourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Opaque API credentials for a source.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    key: String,
    secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(key: String, secret: String) -> Self {
        Self { key, secret }
    }

    /// API key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// API secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Source Descriptor
// =============================================================================

/// Maps a source's native instrument name to the canonical symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapping {
    /// Name used by the engine and its consumers.
    pub canonical: Symbol,
    /// Name used on the wire by this source.
    pub native: String,
}

impl SymbolMapping {
    /// Mapping where both names differ.
    #[must_use]
    pub fn new(canonical: impl Into<Symbol>, native: impl Into<String>) -> Self {
        Self {
            canonical: canonical.into(),
            native: native.into(),
        }
    }

    /// Mapping where the native name is the canonical name.
    #[must_use]
    pub fn identity(symbol: impl Into<Symbol>) -> Self {
        let symbol = symbol.into();
        Self {
            native: symbol.clone(),
            canonical: symbol,
        }
    }
}

/// Immutable description of one external feed.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    id: SourceId,
    schema: SourceSchema,
    endpoint: String,
    transport: TransportKind,
    symbols: Vec<SymbolMapping>,
    credentials: Option<Credentials>,
    expected_update_interval: Option<Duration>,
    history_endpoint: Option<String>,
}

impl SourceDescriptor {
    /// Default expected interval between data frames.
    pub const DEFAULT_EXPECTED_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

    /// Start building a streaming descriptor.
    #[must_use]
    pub fn new(id: impl Into<String>, schema: SourceSchema, endpoint: impl Into<String>) -> Self {
        Self {
            id: SourceId::new(id),
            schema,
            endpoint: endpoint.into(),
            transport: TransportKind::Streaming,
            symbols: Vec::new(),
            credentials: None,
            expected_update_interval: None,
            history_endpoint: None,
        }
    }

    /// Set the transport kind.
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Add a symbol whose native and canonical names are equal.
    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<Symbol>) -> Self {
        self.symbols.push(SymbolMapping::identity(symbol));
        self
    }

    /// Add a symbol with a distinct native name.
    #[must_use]
    pub fn with_mapping(mut self, mapping: SymbolMapping) -> Self {
        self.symbols.push(mapping);
        self
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the expected interval between data frames.
    #[must_use]
    pub const fn with_expected_update_interval(mut self, interval: Duration) -> Self {
        self.expected_update_interval = Some(interval);
        self
    }

    /// Set the REST endpoint template used for backfill.
    #[must_use]
    pub fn with_history_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.history_endpoint = Some(endpoint.into());
        self
    }

    /// Source id.
    #[must_use]
    pub const fn id(&self) -> &SourceId {
        &self.id
    }

    /// Wire schema.
    #[must_use]
    pub const fn schema(&self) -> SourceSchema {
        self.schema
    }

    /// Streaming URL or polling URL template.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Transport kind.
    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Configured symbols.
    #[must_use]
    pub fn symbols(&self) -> &[SymbolMapping] {
        &self.symbols
    }

    /// Native symbol names, in configuration order.
    pub fn native_symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|m| m.native.as_str())
    }

    /// Credentials, if configured.
    #[must_use]
    pub const fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Expected interval between data frames. A polling source never
    /// expects data faster than it polls.
    #[must_use]
    pub fn expected_update_interval(&self) -> Duration {
        let configured = self
            .expected_update_interval
            .unwrap_or(Self::DEFAULT_EXPECTED_UPDATE_INTERVAL);
        match self.transport {
            TransportKind::Streaming => configured,
            TransportKind::Polling { interval } => configured.max(interval),
        }
    }

    /// Silence longer than this marks a connected source as degraded
    /// (1.5x the expected update interval).
    #[must_use]
    pub fn heartbeat_window(&self) -> Duration {
        self.expected_update_interval().mul_f64(1.5)
    }

    /// REST endpoint template for backfill.
    #[must_use]
    pub fn history_endpoint(&self) -> Option<&str> {
        self.history_endpoint.as_deref()
    }

    /// Map a native name to its canonical symbol.
    ///
    /// Unknown names fall back to their upper-cased form.
    #[must_use]
    pub fn canonical_symbol(&self, native: &str) -> Symbol {
        self.symbols
            .iter()
            .find(|m| m.native == native)
            .or_else(|| {
                self.symbols
                    .iter()
                    .find(|m| m.native.eq_ignore_ascii_case(native))
            })
            .map_or_else(|| native.to_ascii_uppercase(), |m| m.canonical.clone())
    }

    /// Mapping for a canonical symbol, if this source carries it.
    #[must_use]
    pub fn mapping_for(&self, canonical: &str) -> Option<&SymbolMapping> {
        self.symbols.iter().find(|m| m.canonical == canonical)
    }
}

// =============================================================================
// Connection Phase and Health
// =============================================================================

/// Lifecycle phase of a supervised source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// Transport is being opened.
    Connecting,
    /// Transport is open and data is flowing.
    Connected,
    /// Transport is open but silent beyond the heartbeat window.
    Degraded,
    /// Transport failed or was stopped.
    Disconnected,
    /// Waiting out a reconnect delay.
    Backoff,
}

impl ConnectionPhase {
    /// Phase name for logs and JSON.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
            Self::Backoff => "backoff",
        }
    }

    /// Numeric code exported on the phase gauge.
    #[must_use]
    pub const fn gauge_value(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Backoff => 1.0,
            Self::Connecting => 2.0,
            Self::Degraded => 3.0,
            Self::Connected => 4.0,
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time health of one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    /// Source id.
    pub source_id: SourceId,
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Failures since the last stable connection.
    pub consecutive_failures: u32,
    /// Delay of the pending reconnect, while in backoff.
    pub current_backoff_ms: Option<u64>,
    /// Receipt time of the last data frame (last success).
    pub last_message_at: Option<EpochMillis>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// Frames received over the source's lifetime.
    pub messages_received: u64,
    /// Sessions started after the first.
    pub restarts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new("kraken", SourceSchema::Kraken, "wss://ws.kraken.com")
            .with_mapping(SymbolMapping::new("BTCUSD", "XBT/USD"))
            .with_symbol("ETHUSD")
    }

    #[test]
    fn canonical_symbol_uses_mapping() {
        let d = descriptor();
        assert_eq!(d.canonical_symbol("XBT/USD"), "BTCUSD");
        assert_eq!(d.canonical_symbol("xbt/usd"), "BTCUSD");
        assert_eq!(d.canonical_symbol("ETHUSD"), "ETHUSD");
    }

    #[test]
    fn canonical_symbol_falls_back_to_uppercase() {
        assert_eq!(descriptor().canonical_symbol("solusd"), "SOLUSD");
    }

    #[test]
    fn heartbeat_window_is_one_and_a_half_intervals() {
        let d = descriptor().with_expected_update_interval(Duration::from_secs(2));
        assert_eq!(d.heartbeat_window(), Duration::from_secs(3));
    }

    #[test]
    fn polling_cadence_bounds_expected_interval() {
        let polling = descriptor().with_transport(TransportKind::Polling {
            interval: Duration::from_secs(5),
        });
        assert_eq!(polling.expected_update_interval(), Duration::from_secs(5));
        assert_eq!(polling.heartbeat_window(), Duration::from_millis(7500));

        let slower = polling.clone().with_expected_update_interval(Duration::from_secs(8));
        assert_eq!(slower.expected_update_interval(), Duration::from_secs(8));

        let faster = polling.with_expected_update_interval(Duration::from_millis(500));
        assert_eq!(faster.expected_update_interval(), Duration::from_secs(5));
    }

    #[test]
    fn mapping_for_canonical() {
        let d = descriptor();
        assert_eq!(d.mapping_for("BTCUSD").unwrap().native, "XBT/USD");
        assert!(d.mapping_for("DOGEUSD").is_none());
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new("key123".to_string(), "secret456".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn phase_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionPhase::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(ConnectionPhase::Backoff.to_string(), "backoff");
    }

    #[test]
    fn schema_deserializes_lowercase() {
        let schema: SourceSchema = serde_json::from_str("\"coinbase\"").unwrap();
        assert_eq!(schema, SourceSchema::Coinbase);
    }
}
