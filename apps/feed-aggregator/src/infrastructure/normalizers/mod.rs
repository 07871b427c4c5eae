//! Schema Normalizers
//!
//! One [`Normalizer`] per wire schema, plus the shared decoding helpers they
//! are built from.
//!
//! # Supported Schemas
//!
//! | Schema     | Streaming frames                          | History body            |
//! |------------|-------------------------------------------|-------------------------|
//! | `binance`  | combined-stream `{stream, data}` JSON     | `/klines` arrays        |
//! | `coinbase` | channel JSON with RFC 3339 times          | `/candles` arrays       |
//! | `kraken`   | v1 array frames                           | `/OHLC` result object   |
//! | `alpaca`   | JSON arrays or `MessagePack` arrays       | `{"bars": [...]}`       |
//!
//! Every helper turns bad input into a [`NormalizeError`]; nothing here
//! panics on wire data.

pub mod alpaca;
pub mod binance;
pub mod coinbase;
pub mod kraken;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::application::ports::{NormalizeError, Normalizer};
use crate::domain::market::{NormalizedCandle, SourceId};
use crate::domain::source::{SourceDescriptor, SourceSchema};
use crate::domain::time::EpochMillis;

pub use alpaca::AlpacaNormalizer;
pub use binance::BinanceNormalizer;
pub use coinbase::CoinbaseNormalizer;
pub use kraken::KrakenNormalizer;

// =============================================================================
// Registry
// =============================================================================

/// Normalizer selected per source id.
#[derive(Debug, Clone, Default)]
pub struct NormalizerRegistry {
    by_source: HashMap<SourceId, Arc<dyn Normalizer>>,
}

impl NormalizerRegistry {
    /// Built-in normalizer for a schema.
    #[must_use]
    pub fn builtin(schema: SourceSchema) -> Arc<dyn Normalizer> {
        match schema {
            SourceSchema::Binance => Arc::new(BinanceNormalizer),
            SourceSchema::Coinbase => Arc::new(CoinbaseNormalizer),
            SourceSchema::Kraken => Arc::new(KrakenNormalizer),
            SourceSchema::Alpaca => Arc::new(AlpacaNormalizer),
        }
    }

    /// Registry with the built-in normalizer for every descriptor.
    #[must_use]
    pub fn for_sources<'a>(descriptors: impl IntoIterator<Item = &'a SourceDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.register(descriptor.id().clone(), Self::builtin(descriptor.schema()));
        }
        registry
    }

    /// Register or replace the normalizer for a source.
    pub fn register(&mut self, source_id: SourceId, normalizer: Arc<dyn Normalizer>) {
        self.by_source.insert(source_id, normalizer);
    }

    /// Normalizer for a source.
    #[must_use]
    pub fn get(&self, source_id: &SourceId) -> Option<Arc<dyn Normalizer>> {
        self.by_source.get(source_id).cloned()
    }

    /// Number of registered sources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    /// Whether no sources are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}

// =============================================================================
// Wire Values
// =============================================================================

/// A scalar as sources send it: numbers arrive as JSON strings, JSON
/// numbers, or `MessagePack` ints and floats.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    Text(String),
}

impl WireValue {
    /// Parse as a decimal.
    ///
    /// # Errors
    ///
    /// Returns `NormalizeError::NonNumeric` if the value is not a number.
    pub fn decimal(&self, field: &'static str) -> Result<Decimal, NormalizeError> {
        let non_numeric = || NormalizeError::NonNumeric {
            field,
            value: self.to_string(),
        };
        match self {
            Self::Int(i) => Ok(Decimal::from(*i)),
            Self::Float(f) if f.is_finite() => Decimal::try_from(*f).map_err(|_| non_numeric()),
            Self::Float(_) => Err(non_numeric()),
            Self::Text(s) => {
                let s = s.trim();
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .map_err(|_| non_numeric())
            }
        }
    }

    /// Interpret as an epoch timestamp or RFC 3339 string.
    ///
    /// # Errors
    ///
    /// Returns `NormalizeError::InvalidTimestamp` if the value is neither.
    #[allow(clippy::cast_precision_loss)]
    pub fn epoch_millis(&self) -> Result<EpochMillis, NormalizeError> {
        match self {
            Self::Int(i) => epoch_to_millis(*i as f64),
            Self::Float(f) => epoch_to_millis(*f),
            Self::Text(s) => match s.trim().parse::<f64>() {
                Ok(n) => epoch_to_millis(n),
                Err(_) => rfc3339_millis(s),
            },
        }
    }
}

impl std::fmt::Display for WireValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

/// Require a field to be present.
///
/// # Errors
///
/// Returns `NormalizeError::MissingField` if it is absent.
pub fn required<T>(value: Option<T>, field: &'static str) -> Result<T, NormalizeError> {
    value.ok_or(NormalizeError::MissingField(field))
}

/// Parse a strictly positive price.
///
/// # Errors
///
/// Returns `NormalizeError` if the field is missing, non-numeric or not
/// positive.
pub fn price(value: Option<&WireValue>, field: &'static str) -> Result<Decimal, NormalizeError> {
    let parsed = required(value, field)?.decimal(field)?;
    if parsed <= Decimal::ZERO {
        return Err(NormalizeError::NonPositivePrice {
            field,
            value: parsed.to_string(),
        });
    }
    Ok(parsed)
}

/// Parse an optional quote side. Zero means "no quote" on several feeds.
///
/// # Errors
///
/// Returns `NormalizeError` if present and non-numeric or negative.
pub fn quote_side(value: Option<&WireValue>, field: &'static str) -> Result<Option<Decimal>, NormalizeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = value.decimal(field)?;
    if parsed < Decimal::ZERO {
        return Err(NormalizeError::NonPositivePrice {
            field,
            value: parsed.to_string(),
        });
    }
    Ok((parsed > Decimal::ZERO).then_some(parsed))
}

/// Parse a non-negative volume. A missing volume is zero.
///
/// # Errors
///
/// Returns `NormalizeError` if present and non-numeric or negative.
pub fn volume(value: Option<&WireValue>, field: &'static str) -> Result<Decimal, NormalizeError> {
    let Some(value) = value else {
        return Ok(Decimal::ZERO);
    };
    let parsed = value.decimal(field)?;
    if parsed < Decimal::ZERO {
        return Err(NormalizeError::NegativeVolume {
            field,
            value: parsed.to_string(),
        });
    }
    Ok(parsed)
}

/// Validate an assembled candle.
///
/// # Errors
///
/// Returns `NormalizeError::InvalidCandle` on OHLC inconsistency.
pub fn checked_candle(candle: NormalizedCandle) -> Result<NormalizedCandle, NormalizeError> {
    candle.check_consistency().map_err(NormalizeError::InvalidCandle)?;
    Ok(candle)
}

/// Midpoint of a two-sided quote.
#[must_use]
pub fn midpoint(bid: Decimal, ask: Decimal) -> Decimal {
    (bid + ask) / Decimal::TWO
}

// =============================================================================
// Timestamp Helpers
// =============================================================================

/// Interpret a numeric epoch by magnitude: seconds below 1e11, milliseconds
/// below 1e14, microseconds below 1e17, nanoseconds above.
///
/// # Errors
///
/// Returns `NormalizeError::InvalidTimestamp` for non-finite or
/// non-positive values.
#[allow(clippy::cast_possible_truncation)]
pub fn epoch_to_millis(value: f64) -> Result<EpochMillis, NormalizeError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(NormalizeError::InvalidTimestamp(value.to_string()));
    }
    let millis = if value < 1e11 {
        value * 1_000.0
    } else if value < 1e14 {
        value
    } else if value < 1e17 {
        value / 1_000.0
    } else {
        value / 1_000_000.0
    };
    Ok(millis.round() as EpochMillis)
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
///
/// Returns `NormalizeError::InvalidTimestamp` if it does not parse.
pub fn rfc3339_millis(value: &str) -> Result<EpochMillis, NormalizeError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| NormalizeError::InvalidTimestamp(value.to_string()))
}

/// Parse a JSON document, mapping syntax errors to `Malformed`.
///
/// # Errors
///
/// Returns `NormalizeError::Malformed` if the text is not valid for `T`.
pub fn parse_json<'a, T: Deserialize<'a>>(text: &'a str) -> Result<T, NormalizeError> {
    serde_json::from_str(text).map_err(|e| NormalizeError::Malformed(e.to_string()))
}

/// Parse a JSON byte body, mapping syntax errors to `Malformed`.
///
/// # Errors
///
/// Returns `NormalizeError::Malformed` if the body is not valid for `T`.
pub fn parse_json_bytes<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, NormalizeError> {
    serde_json::from_slice(body).map_err(|e| NormalizeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;

    #[test_case(1_700_000_000.0, 1_700_000_000_000 ; "seconds")]
    #[test_case(1_700_000_000.5, 1_700_000_000_500 ; "fractional seconds")]
    #[test_case(1_700_000_000_123.0, 1_700_000_000_123 ; "milliseconds")]
    #[test_case(1_700_000_000_123_456.0, 1_700_000_000_123 ; "microseconds")]
    #[test_case(1_700_000_000_123_456_789.0, 1_700_000_000_123 ; "nanoseconds")]
    fn epoch_heuristics(input: f64, expected: EpochMillis) {
        assert_eq!(epoch_to_millis(input).unwrap(), expected);
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(-5.0 ; "negative")]
    #[test_case(f64::NAN ; "nan")]
    fn invalid_epochs(input: f64) {
        assert!(matches!(epoch_to_millis(input), Err(NormalizeError::InvalidTimestamp(_))));
    }

    #[test]
    fn rfc3339_with_nanos() {
        assert_eq!(
            rfc3339_millis("2023-11-14T22:13:20.123456789Z").unwrap(),
            1_700_000_000_123
        );
        assert!(rfc3339_millis("yesterday").is_err());
    }

    #[test_case(WireValue::Text("101.50".into()), dec!(101.50) ; "string")]
    #[test_case(WireValue::Int(7), dec!(7) ; "integer")]
    #[test_case(WireValue::Float(0.25), dec!(0.25) ; "float")]
    #[test_case(WireValue::Text("1e-3".into()), dec!(0.001) ; "scientific")]
    fn wire_decimals(value: WireValue, expected: Decimal) {
        assert_eq!(value.decimal("p").unwrap(), expected);
    }

    #[test]
    fn non_numeric_price_rejected() {
        let err = price(Some(&WireValue::Text("abc".into())), "price").unwrap_err();
        assert_eq!(
            err,
            NormalizeError::NonNumeric {
                field: "price",
                value: "abc".into()
            }
        );
    }

    #[test]
    fn zero_price_rejected() {
        let err = price(Some(&WireValue::Int(0)), "price").unwrap_err();
        assert!(matches!(err, NormalizeError::NonPositivePrice { .. }));
    }

    #[test]
    fn missing_price_rejected() {
        assert_eq!(price(None, "price"), Err(NormalizeError::MissingField("price")));
    }

    #[test]
    fn negative_volume_rejected() {
        let err = volume(Some(&WireValue::Text("-1".into())), "volume").unwrap_err();
        assert!(matches!(err, NormalizeError::NegativeVolume { .. }));
        assert_eq!(volume(None, "volume").unwrap(), Decimal::ZERO);
    }

    #[test]
    fn zero_quote_side_is_absent() {
        assert_eq!(quote_side(Some(&WireValue::Int(0)), "bid").unwrap(), None);
        assert_eq!(quote_side(Some(&WireValue::Float(1.5)), "bid").unwrap(), Some(dec!(1.5)));
    }

    #[test]
    fn registry_uses_schema_of_each_source() {
        let sources = [
            SourceDescriptor::new("bn", SourceSchema::Binance, "wss://a"),
            SourceDescriptor::new("kr", SourceSchema::Kraken, "wss://b"),
        ];
        let registry = NormalizerRegistry::for_sources(&sources);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&SourceId::new("kr")).unwrap().schema(), SourceSchema::Kraken);
        assert!(registry.get(&SourceId::new("cb")).is_none());
    }
}
