//! Coinbase Exchange Normalizer
//!
//! Frames are objects tagged by `type`. `ticker` and `match` carry prices;
//! `subscriptions` and `heartbeat` are control frames; `error` is a
//! rejection. Times are RFC 3339 strings.

use serde::Deserialize;

use super::{WireValue, checked_candle, parse_json, parse_json_bytes, price, quote_side, required, volume};
use crate::application::ports::{NormalizeError, Normalizer};
use crate::domain::market::{MarketEvent, NormalizedCandle, NormalizedTick, RawMessage, RawPayload, SourceId};
use crate::domain::source::{SourceDescriptor, SourceSchema};

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: Option<String>,
    product_id: Option<String>,
    price: Option<WireValue>,
    best_bid: Option<WireValue>,
    best_ask: Option<WireValue>,
    volume_24h: Option<WireValue>,
    size: Option<WireValue>,
    time: Option<String>,
    message: Option<String>,
    reason: Option<String>,
}

/// Coinbase Exchange websocket feed and REST candles.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoinbaseNormalizer;

impl Normalizer for CoinbaseNormalizer {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Coinbase
    }

    fn normalize(&self, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        let RawPayload::Text(text) = &raw.payload else {
            return Err(NormalizeError::UnsupportedEncoding(SourceSchema::Coinbase));
        };
        let frame: Frame = parse_json(text)?;

        let source_timestamp = |frame: &Frame| {
            frame
                .time
                .as_deref()
                .map_or(Ok(raw.received_at), super::rfc3339_millis)
        };

        match required(frame.kind.as_deref(), "type")? {
            "ticker" => Ok(vec![MarketEvent::Tick(NormalizedTick {
                symbol: required(frame.product_id.clone(), "product_id")?,
                price: price(frame.price.as_ref(), "price")?,
                bid_price: quote_side(frame.best_bid.as_ref(), "best_bid")?,
                ask_price: quote_side(frame.best_ask.as_ref(), "best_ask")?,
                volume: volume(frame.volume_24h.as_ref(), "volume_24h")?,
                source_id: raw.source_id.clone(),
                source_timestamp: source_timestamp(&frame)?,
                received_at: raw.received_at,
            })]),
            "match" | "last_match" => Ok(vec![MarketEvent::Tick(NormalizedTick {
                symbol: required(frame.product_id.clone(), "product_id")?,
                price: price(frame.price.as_ref(), "price")?,
                bid_price: None,
                ask_price: None,
                volume: volume(frame.size.as_ref(), "size")?,
                source_id: raw.source_id.clone(),
                source_timestamp: source_timestamp(&frame)?,
                received_at: raw.received_at,
            })]),
            "subscriptions" | "heartbeat" => Ok(Vec::new()),
            "error" => Err(NormalizeError::SourceError(
                [frame.message, frame.reason]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(": "),
            )),
            other => Err(NormalizeError::Malformed(format!("unsupported message type {other}"))),
        }
    }

    fn normalize_history(
        &self,
        source_id: &SourceId,
        native_symbol: &str,
        body: &[u8],
    ) -> Result<Vec<NormalizedCandle>, NormalizeError> {
        // [time_s, low, high, open, close, volume], newest first
        let rows: Vec<Vec<WireValue>> = parse_json_bytes(body)?;
        rows.iter()
            .map(|row| {
                let [time, low, high, open, close, vol, ..] = row.as_slice() else {
                    return Err(NormalizeError::Malformed(format!(
                        "candle row has {} columns",
                        row.len()
                    )));
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
        let products: Vec<&str> = descriptor.native_symbols().collect();
        if products.is_empty() {
            return Vec::new();
        }
        vec![
            serde_json::json!({
                "type": "subscribe",
                "product_ids": products,
                "channels": ["ticker", "heartbeat"],
            })
            .to_string(),
        ]
    }
}
