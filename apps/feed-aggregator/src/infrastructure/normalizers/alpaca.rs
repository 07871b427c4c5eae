//! Alpaca Market Data Normalizer
//!
//! Alpaca streams send arrays of objects tagged by `T`, as JSON text or as
//! `MessagePack` binary frames with the same keys.
//!
//! | `T`                  | Output                                     |
//! |----------------------|--------------------------------------------|
//! | `q`                  | tick at the quote midpoint, zero volume    |
//! | `t`                  | tick with the trade size as volume         |
//! | `b`, `d`, `u`        | candle                                     |
//! | `success`, `subscription` | nothing                               |
//! | `error`              | rejection                                  |

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::{WireValue, checked_candle, midpoint, parse_json_bytes, price, required, volume};
use crate::application::ports::{NormalizeError, Normalizer};
use crate::domain::market::{MarketEvent, NormalizedCandle, NormalizedTick, RawMessage, RawPayload, SourceId};
use crate::domain::source::{Credentials, SourceDescriptor, SourceSchema};

/// `c` is the close on bars and the condition list on trades and quotes.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CloseOrConditions {
    Close(WireValue),
    Conditions(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "T")]
    kind: Option<String>,
    #[serde(rename = "S")]
    symbol: Option<String>,
    bp: Option<WireValue>,
    ap: Option<WireValue>,
    p: Option<WireValue>,
    s: Option<WireValue>,
    o: Option<WireValue>,
    h: Option<WireValue>,
    l: Option<WireValue>,
    c: Option<CloseOrConditions>,
    v: Option<WireValue>,
    t: Option<WireValue>,
    msg: Option<String>,
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    t: WireValue,
    o: WireValue,
    h: WireValue,
    l: WireValue,
    c: WireValue,
    #[serde(default)]
    v: Option<WireValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BarsField {
    Single(Vec<Bar>),
    BySymbol(HashMap<String, Vec<Bar>>),
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    bars: Option<BarsField>,
}

/// Alpaca stock and crypto data streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlpacaNormalizer;

fn decode_frames(payload: &RawPayload) -> Result<Vec<Frame>, NormalizeError> {
    match payload {
        RawPayload::Text(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') {
                serde_json::from_str::<Frame>(trimmed)
                    .map(|frame| vec![frame])
                    .map_err(|e| NormalizeError::Malformed(e.to_string()))
            } else {
                serde_json::from_str(trimmed).map_err(|e| NormalizeError::Malformed(e.to_string()))
            }
        }
        RawPayload::Binary(bytes) => {
            rmp_serde::from_slice(bytes).map_err(|e| NormalizeError::Malformed(e.to_string()))
        }
    }
}

fn convert(frame: Frame, raw: &RawMessage) -> Result<Option<MarketEvent>, NormalizeError> {
    let kind = required(frame.kind, "T")?;
    match kind.as_str() {
        "success" | "subscription" => Ok(None),
        "error" => Err(NormalizeError::SourceError(format!(
            "{} (code {})",
            frame.msg.unwrap_or_default(),
            frame.code.unwrap_or_default()
        ))),
        "q" => {
            let bid = price(frame.bp.as_ref(), "bp")?;
            let ask = price(frame.ap.as_ref(), "ap")?;
            Ok(Some(MarketEvent::Tick(NormalizedTick {
                symbol: required(frame.symbol, "S")?,
                price: midpoint(bid, ask),
                bid_price: Some(bid),
                ask_price: Some(ask),
                volume: Decimal::ZERO,
                source_id: raw.source_id.clone(),
                source_timestamp: required(frame.t.as_ref(), "t")?.epoch_millis()?,
                received_at: raw.received_at,
            })))
        }
        "t" => Ok(Some(MarketEvent::Tick(NormalizedTick {
            symbol: required(frame.symbol, "S")?,
            price: price(frame.p.as_ref(), "p")?,
            bid_price: None,
            ask_price: None,
            volume: volume(frame.s.as_ref(), "s")?,
            source_id: raw.source_id.clone(),
            source_timestamp: required(frame.t.as_ref(), "t")?.epoch_millis()?,
            received_at: raw.received_at,
        }))),
        "b" | "d" | "u" => {
            let close = match frame.c {
                Some(CloseOrConditions::Close(c)) => c,
                _ => return Err(NormalizeError::MissingField("c")),
            };
            let candle = checked_candle(NormalizedCandle {
                symbol: required(frame.symbol, "S")?,
                open_time: required(frame.t.as_ref(), "t")?.epoch_millis()?,
                open: price(frame.o.as_ref(), "o")?,
                high: price(frame.h.as_ref(), "h")?,
                low: price(frame.l.as_ref(), "l")?,
                close: price(Some(&close), "c")?,
                volume: volume(frame.v.as_ref(), "v")?,
                source_id: raw.source_id.clone(),
            })?;
            Ok(Some(MarketEvent::Candle(candle)))
        }
        other => {
            tracing::trace!(kind = other, "Ignoring unhandled Alpaca message type");
            Ok(None)
        }
    }
}

fn bar_candle(bar: &Bar, symbol: &str, source_id: &SourceId) -> Result<NormalizedCandle, NormalizeError> {
    checked_candle(NormalizedCandle {
        symbol: symbol.to_string(),
        open_time: bar.t.epoch_millis()?,
        open: price(Some(&bar.o), "o")?,
        high: price(Some(&bar.h), "h")?,
        low: price(Some(&bar.l), "l")?,
        close: price(Some(&bar.c), "c")?,
        volume: volume(bar.v.as_ref(), "v")?,
        source_id: source_id.clone(),
    })
}

impl Normalizer for AlpacaNormalizer {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Alpaca
    }

    fn normalize(&self, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        let mut events = Vec::new();
        for frame in decode_frames(&raw.payload)? {
            if let Some(event) = convert(frame, raw)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn normalize_history(
        &self,
        source_id: &SourceId,
        native_symbol: &str,
        body: &[u8],
    ) -> Result<Vec<NormalizedCandle>, NormalizeError> {
        let response: BarsResponse = parse_json_bytes(body)?;
        let bars = match response.bars {
            None => Vec::new(),
            Some(BarsField::Single(bars)) => bars,
            Some(BarsField::BySymbol(mut by_symbol)) => by_symbol.remove(native_symbol).unwrap_or_default(),
        };
        bars.iter().map(|bar| bar_candle(bar, native_symbol, source_id)).collect()
    }

    fn subscribe_frames(&self, descriptor: &SourceDescriptor) -> Vec<String> {
        let mut frames = Vec::with_capacity(2);
        if let Some(credentials) = descriptor.credentials() {
            frames.push(
                serde_json::json!({
                    "action": "auth",
                    "key": credentials.key(),
                    "secret": credentials.secret(),
                })
                .to_string(),
            );
        }
        let symbols: Vec<&str> = descriptor.native_symbols().collect();
        if !symbols.is_empty() {
            frames.push(
                serde_json::json!({
                    "action": "subscribe",
                    "quotes": symbols,
                    "trades": symbols,
                    "bars": symbols,
                })
                .to_string(),
            );
        }
        frames
    }

    fn auth_headers(&self, credentials: &Credentials) -> Vec<(&'static str, String)> {
        vec![
            ("APCA-API-KEY-ID", credentials.key().to_string()),
            ("APCA-API-SECRET-KEY", credentials.secret().to_string()),
        ]
    }
}
