//! Kraken v1 Normalizer
//!
//! Public data arrives as arrays `[channelID, payload, channelName, pair]`.
//! Status traffic arrives as objects tagged by `event`.
//!
//! - `ticker`: no exchange timestamp, so the tick is stamped with the
//!   receipt time.
//! - `ohlc-N`: the payload carries the bucket end (`etime`, fractional
//!   seconds); the bucket start is `etime - N minutes`.
//! - `trade`: one tick per trade.
//!
//! The REST `Ticker` and `OHLC` endpoints wrap results in
//! `{"error": [...], "result": {PAIR: ...}}`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::{WireValue, checked_candle, parse_json, parse_json_bytes, price, quote_side, volume};
use crate::application::ports::{NormalizeError, Normalizer};
use crate::domain::market::{MarketEvent, NormalizedCandle, NormalizedTick, RawMessage, RawPayload, SourceId};
use crate::domain::source::{SourceDescriptor, SourceSchema};
use crate::domain::time::EpochMillis;

/// Ticker payload: each field is an array whose first element is the price
/// (`a`, `b`, `c`) or whose second element is the rolling 24h figure (`v`).
#[derive(Debug, Deserialize)]
struct TickerPayload {
    a: Option<Vec<WireValue>>,
    b: Option<Vec<WireValue>>,
    c: Option<Vec<WireValue>>,
    v: Option<Vec<WireValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventFrame {
    event: Option<String>,
    status: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: BTreeMap<String, Value>,
}

/// Kraken v1 websocket feed and REST.
#[derive(Debug, Default, Clone, Copy)]
pub struct KrakenNormalizer;

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, NormalizeError> {
    serde_json::from_value(value).map_err(|e| NormalizeError::Malformed(e.to_string()))
}

fn ticker_tick(
    pair: String,
    payload: TickerPayload,
    raw: &RawMessage,
) -> Result<NormalizedTick, NormalizeError> {
    let first = |v: &Option<Vec<WireValue>>| v.as_ref().and_then(|items| items.first().cloned());
    Ok(NormalizedTick {
        symbol: pair,
        price: price(first(&payload.c).as_ref(), "c")?,
        bid_price: quote_side(first(&payload.b).as_ref(), "b")?,
        ask_price: quote_side(first(&payload.a).as_ref(), "a")?,
        volume: volume(payload.v.as_ref().and_then(|v| v.get(1)), "v")?,
        source_id: raw.source_id.clone(),
        source_timestamp: raw.received_at,
        received_at: raw.received_at,
    })
}

/// Interval in minutes from a channel name like `ohlc-5`.
fn ohlc_interval(channel: &str) -> Option<i64> {
    channel
        .strip_prefix("ohlc-")?
        .parse()
        .ok()
        .filter(|&minutes: &i64| minutes > 0)
}

fn ohlc_candle(
    pair: String,
    interval_minutes: i64,
    row: &[WireValue],
    raw: &RawMessage,
) -> Result<NormalizedCandle, NormalizeError> {
    // [time, etime, open, high, low, close, vwap, volume, count]
    let [_, etime, open, high, low, close, _, vol, ..] = row else {
        return Err(NormalizeError::Malformed(format!("ohlc payload has {} fields", row.len())));
    };
    let end: EpochMillis = etime.epoch_millis()?;
    let open_time = interval_minutes
        .checked_mul(60_000)
        .and_then(|span| end.checked_sub(span))
        .ok_or_else(|| NormalizeError::Malformed(format!("ohlc interval {interval_minutes} out of range")))?;
    checked_candle(NormalizedCandle {
        symbol: pair,
        open_time,
        open: price(Some(open), "open")?,
        high: price(Some(high), "high")?,
        low: price(Some(low), "low")?,
        close: price(Some(close), "close")?,
        volume: volume(Some(vol), "volume")?,
        source_id: raw.source_id.clone(),
    })
}

fn trade_ticks(pair: &str, trades: Vec<Vec<WireValue>>, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
    trades
        .iter()
        .map(|trade| {
            // [price, volume, time, side, orderType, misc]
            let [p, v, t, ..] = trade.as_slice() else {
                return Err(NormalizeError::Malformed("trade entry too short".to_string()));
            };
            Ok(MarketEvent::Tick(NormalizedTick {
                symbol: pair.to_string(),
                price: price(Some(p), "price")?,
                bid_price: None,
                ask_price: None,
                volume: volume(Some(v), "volume")?,
                source_id: raw.source_id.clone(),
                source_timestamp: t.epoch_millis()?,
                received_at: raw.received_at,
            }))
        })
        .collect()
}

impl KrakenNormalizer {
    fn channel_frame(&self, mut items: Vec<Value>, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        if items.len() < 4 {
            return Err(NormalizeError::Malformed(format!("channel frame has {} elements", items.len())));
        }
        let pair = match items.pop() {
            Some(Value::String(pair)) => pair,
            _ => return Err(NormalizeError::MissingField("pair")),
        };
        let channel = match items.pop() {
            Some(Value::String(channel)) => channel,
            _ => return Err(NormalizeError::MissingField("channelName")),
        };
        let payload = items.swap_remove(1);

        if channel == "ticker" {
            let ticker: TickerPayload = from_value(payload)?;
            return Ok(vec![MarketEvent::Tick(ticker_tick(pair, ticker, raw)?)]);
        }
        if channel == "trade" {
            let trades: Vec<Vec<WireValue>> = from_value(payload)?;
            return trade_ticks(&pair, trades, raw);
        }
        if let Some(minutes) = ohlc_interval(&channel) {
            let row: Vec<WireValue> = from_value(payload)?;
            return Ok(vec![MarketEvent::Candle(ohlc_candle(pair, minutes, &row, raw)?)]);
        }
        Err(NormalizeError::Malformed(format!("unsupported channel {channel}")))
    }

    fn rest_result(body: Value) -> Result<BTreeMap<String, Value>, NormalizeError> {
        let envelope: RestEnvelope = from_value(body)?;
        if !envelope.error.is_empty() {
            return Err(NormalizeError::SourceError(envelope.error.join(", ")));
        }
        Ok(envelope.result)
    }
}

impl Normalizer for KrakenNormalizer {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Kraken
    }

    fn normalize(&self, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        let RawPayload::Text(text) = &raw.payload else {
            return Err(NormalizeError::UnsupportedEncoding(SourceSchema::Kraken));
        };

        match parse_json::<Value>(text)? {
            Value::Array(items) => self.channel_frame(items, raw),
            Value::Object(map) if map.contains_key("event") => {
                let frame: EventFrame = from_value(Value::Object(map))?;
                if frame.status.as_deref() == Some("error") || frame.event.as_deref() == Some("error") {
                    return Err(NormalizeError::SourceError(
                        frame.error_message.unwrap_or_else(|| "unspecified error".to_string()),
                    ));
                }
                Ok(Vec::new())
            }
            Value::Object(map) if map.contains_key("result") || map.contains_key("error") => {
                // REST ticker, used by polling sources.
                let result = Self::rest_result(Value::Object(map))?;
                result
                    .into_iter()
                    .map(|(pair, payload)| {
                        let ticker: TickerPayload = from_value(payload)?;
                        ticker_tick(pair, ticker, raw).map(MarketEvent::Tick)
                    })
                    .collect()
            }
            other => Err(NormalizeError::Malformed(format!("unexpected frame {other}"))),
        }
    }

    fn normalize_history(
        &self,
        source_id: &SourceId,
        native_symbol: &str,
        body: &[u8],
    ) -> Result<Vec<NormalizedCandle>, NormalizeError> {
        let result = Self::rest_result(parse_json_bytes(body)?)?;
        // Result holds one array keyed by Kraken's internal pair name plus
        // a scalar `last` cursor.
        let rows = result
            .into_values()
            .find(Value::is_array)
            .ok_or(NormalizeError::MissingField("result"))?;
        let rows: Vec<Vec<WireValue>> = from_value(rows)?;

        rows.iter()
            .map(|row| {
                // [time, open, high, low, close, vwap, volume, count]
                let [time, open, high, low, close, _, vol, ..] = row.as_slice() else {
                    return Err(NormalizeError::Malformed(format!("OHLC row has {} fields", row.len())));
                };
                checked_candle(NormalizedCandle {
                    symbol: native_symbol.to_string(),
                    open_time: time.epoch_millis()?,
                    open: price(Some(open), "open")?,
                    high: price(Some(high), "high")?,
                    low: price(Some(low), "low")?,
                    close: price(Some(close), "close")?,
                    volume: volume(Some(vol), "volume")?,
                    source_id: source_id.clone(),
                })
            })
            .collect()
    }

    fn subscribe_frames(&self, descriptor: &SourceDescriptor) -> Vec<String> {
        let pairs: Vec<&str> = descriptor.native_symbols().collect();
        if pairs.is_empty() {
            return Vec::new();
        }
        vec![
            serde_json::json!({"event": "subscribe", "pair": pairs, "subscription": {"name": "ticker"}}).to_string(),
            serde_json::json!({"event": "subscribe", "pair": pairs, "subscription": {"name": "ohlc", "interval": 1}})
                .to_string(),
        ]
    }
}
