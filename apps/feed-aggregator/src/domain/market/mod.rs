//! Canonical Market Data Types
//!
//! The shapes every source is normalized into, plus the per-symbol view the
//! aggregator publishes. Prices and volumes use [`Decimal`] so merging never
//! accumulates binary floating-point error.
//!
//! # Lifecycle
//!
//! - [`RawMessage`]: one frame as received, consumed immediately by the
//!   normalizer registered for its source.
//! - [`NormalizedTick`] / [`NormalizedCandle`]: transient, produced once per
//!   update and consumed once by the pipeline.
//! - [`AggregatedSymbolView`]: one per tracked symbol, replaced on every
//!   aggregation step and evicted after the symbol TTL.

use std::collections::BTreeSet;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::time::EpochMillis;

// =============================================================================
// Identifiers
// =============================================================================

/// Canonical symbol (e.g. `BTCUSD`, `AAPL`).
pub type Symbol = String;

/// Identifier of one configured source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a source id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// =============================================================================
// Raw Frames
// =============================================================================

/// Payload of a raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    /// UTF-8 frame (JSON text, REST body).
    Text(String),
    /// Binary frame (`MessagePack`).
    Binary(Vec<u8>),
}

impl RawPayload {
    /// Size of the payload in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A frame as received from a source, stamped at receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Source that produced the frame.
    pub source_id: SourceId,
    /// Local receipt time.
    pub received_at: EpochMillis,
    /// Undecoded payload.
    pub payload: RawPayload,
}

impl RawMessage {
    /// Create a text frame.
    #[must_use]
    pub fn text(source_id: SourceId, received_at: EpochMillis, text: impl Into<String>) -> Self {
        Self {
            source_id,
            received_at,
            payload: RawPayload::Text(text.into()),
        }
    }

    /// Create a binary frame.
    #[must_use]
    pub const fn binary(source_id: SourceId, received_at: EpochMillis, bytes: Vec<u8>) -> Self {
        Self {
            source_id,
            received_at,
            payload: RawPayload::Binary(bytes),
        }
    }
}

// =============================================================================
// Normalized Events
// =============================================================================

/// A single price/volume update for a symbol from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTick {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Last or mid price.
    pub price: Decimal,
    /// Best bid, when the source quotes one.
    pub bid_price: Option<Decimal>,
    /// Best ask, when the source quotes one.
    pub ask_price: Option<Decimal>,
    /// Volume reported alongside the price (rolling 24h for ticker
    /// channels, trade size for trade channels, zero for pure quotes).
    pub volume: Decimal,
    /// Producing source.
    pub source_id: SourceId,
    /// Exchange timestamp.
    pub source_timestamp: EpochMillis,
    /// Local receipt time.
    pub received_at: EpochMillis,
}

/// An OHLC summary over one fixed bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCandle {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Bucket start.
    pub open_time: EpochMillis,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Bucket volume.
    pub volume: Decimal,
    /// Producing source.
    pub source_id: SourceId,
}

impl NormalizedCandle {
    /// Check OHLC consistency: positive prices, non-negative volume and a
    /// high/low range that contains open and close.
    ///
    /// Returns a description of the first violation.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err("prices must be positive".to_string());
        }
        if self.volume < Decimal::ZERO {
            return Err(format!("negative volume {}", self.volume));
        }
        if self.high < self.low {
            return Err(format!("high {} below low {}", self.high, self.low));
        }
        if self.open > self.high || self.close > self.high {
            return Err("open/close above high".to_string());
        }
        if self.open < self.low || self.close < self.low {
            return Err("open/close below low".to_string());
        }
        Ok(())
    }
}

/// Output of a normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    /// Price update.
    Tick(NormalizedTick),
    /// OHLC bucket update.
    Candle(NormalizedCandle),
}

impl MarketEvent {
    /// Symbol the event refers to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Tick(tick) => &tick.symbol,
            Self::Candle(candle) => &candle.symbol,
        }
    }

    /// Source that produced the event.
    #[must_use]
    pub const fn source_id(&self) -> &SourceId {
        match self {
            Self::Tick(tick) => &tick.source_id,
            Self::Candle(candle) => &candle.source_id,
        }
    }

    /// Replace the symbol, used when mapping native to canonical names.
    pub fn set_symbol(&mut self, symbol: Symbol) {
        match self {
            Self::Tick(tick) => tick.symbol = symbol,
            Self::Candle(candle) => candle.symbol = symbol,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Tick(_) => "tick",
            Self::Candle(_) => "candle",
        }
    }
}

// =============================================================================
// Aggregated View
// =============================================================================

/// The merged, authoritative state of one symbol across all sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregatedSymbolView {
    /// Canonical symbol.
    pub symbol: Symbol,
    /// Volume-weighted price over non-stale sources.
    pub merged_price: Decimal,
    /// Sum of non-stale source volumes.
    pub merged_volume: Decimal,
    /// Best ask minus best bid over non-stale sources quoting both sides.
    pub spread: Option<Decimal>,
    /// Sources that contributed to this merge.
    pub contributing_sources: BTreeSet<SourceId>,
    /// Time of this aggregation step, strictly increasing per symbol.
    pub last_update: EpochMillis,
    /// Set when no source is currently fresh; the price is the last merge.
    pub stale: bool,
    /// Per-symbol update counter.
    pub sequence: u64,
}
