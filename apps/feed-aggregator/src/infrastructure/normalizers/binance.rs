//! Binance Normalizer
//!
//! Handles the spot combined-stream envelope (`{"stream": ..., "data": ...}`)
//! as well as bare event objects, and the REST 24h ticker used by polling
//! sources.
//!
//! | Event         | Output                                   |
//! |---------------|------------------------------------------|
//! | `24hrTicker`  | tick: last price, bid/ask, 24h volume    |
//! | `trade`       | tick: trade price and quantity           |
//! | `kline`       | candle                                   |
//! | `bookTicker`  | tick at mid-price, zero volume           |
//! | REST ticker   | tick: `lastPrice`, `bidPrice`/`askPrice` |

use serde::Deserialize;
use serde_json::Value;

use super::{
    WireValue, checked_candle, midpoint, parse_json, parse_json_bytes, price, quote_side, required,
    volume,
};
use crate::application::ports::{NormalizeError, Normalizer};
use crate::domain::market::{
    MarketEvent, NormalizedCandle, NormalizedTick, RawMessage, RawPayload, SourceId,
};
use crate::domain::source::{SourceDescriptor, SourceSchema};
use crate::domain::time::EpochMillis;

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "e")]
    event: Option<String>,
    #[serde(rename = "E")]
    event_time: Option<WireValue>,
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "c")]
    close: Option<WireValue>,
    #[serde(rename = "b")]
    bid: Option<WireValue>,
    #[serde(rename = "a")]
    ask: Option<WireValue>,
    #[serde(rename = "v")]
    volume: Option<WireValue>,
    #[serde(rename = "p")]
    price: Option<WireValue>,
    #[serde(rename = "q")]
    quantity: Option<WireValue>,
    #[serde(rename = "T")]
    trade_time: Option<WireValue>,
    #[serde(rename = "k")]
    kline: Option<Kline>,
    #[serde(rename = "u")]
    update_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Kline {
    #[serde(rename = "t")]
    open_time: Option<WireValue>,
    #[serde(rename = "o")]
    open: Option<WireValue>,
    #[serde(rename = "h")]
    high: Option<WireValue>,
    #[serde(rename = "l")]
    low: Option<WireValue>,
    #[serde(rename = "c")]
    close: Option<WireValue>,
    #[serde(rename = "v")]
    volume: Option<WireValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTicker {
    symbol: Option<String>,
    last_price: Option<WireValue>,
    bid_price: Option<WireValue>,
    ask_price: Option<WireValue>,
    volume: Option<WireValue>,
    close_time: Option<WireValue>,
}

/// Binance spot streams and REST.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinanceNormalizer;

impl BinanceNormalizer {
    fn decode_value(&self, value: Value, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        match value {
            Value::Array(items) => {
                let mut events = Vec::with_capacity(items.len());
                for item in items {
                    events.extend(self.decode_value(item, raw)?);
                }
                Ok(events)
            }
            Value::Object(mut map) => {
                if let Some(data) = map.remove("data") {
                    return self.decode_value(data, raw);
                }
                if map.contains_key("result") && map.contains_key("id") {
                    return Ok(Vec::new());
                }
                if let Some(msg) = map.get("msg").and_then(Value::as_str) {
                    return Err(NormalizeError::SourceError(msg.to_string()));
                }
                if map.contains_key("lastPrice") {
                    let ticker: RestTicker = from_value(Value::Object(map))?;
                    return rest_ticker(ticker, raw).map(|tick| vec![MarketEvent::Tick(tick)]);
                }
                let event: StreamEvent = from_value(Value::Object(map))?;
                stream_event(event, raw)
            }
            other => Err(NormalizeError::Malformed(format!(
                "expected object or array, got {other}"
            ))),
        }
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, NormalizeError> {
    serde_json::from_value(value).map_err(|e| NormalizeError::Malformed(e.to_string()))
}

fn event_time(value: Option<&WireValue>, raw: &RawMessage) -> Result<EpochMillis, NormalizeError> {
    value.map_or(Ok(raw.received_at), WireValue::epoch_millis)
}

fn stream_event(event: StreamEvent, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
    let symbol = required(event.symbol, "s")?;

    match event.event.as_deref() {
        Some("24hrTicker") => Ok(vec![MarketEvent::Tick(NormalizedTick {
            symbol,
            price: price(event.close.as_ref(), "c")?,
            bid_price: quote_side(event.bid.as_ref(), "b")?,
            ask_price: quote_side(event.ask.as_ref(), "a")?,
            volume: volume(event.volume.as_ref(), "v")?,
            source_id: raw.source_id.clone(),
            source_timestamp: event_time(event.event_time.as_ref(), raw)?,
            received_at: raw.received_at,
        })]),
        Some("trade" | "aggTrade") => Ok(vec![MarketEvent::Tick(NormalizedTick {
            symbol,
            price: price(event.price.as_ref(), "p")?,
            bid_price: None,
            ask_price: None,
            volume: volume(event.quantity.as_ref(), "q")?,
            source_id: raw.source_id.clone(),
            source_timestamp: event_time(event.trade_time.as_ref().or(event.event_time.as_ref()), raw)?,
            received_at: raw.received_at,
        })]),
        Some("kline") => {
            let k = required(event.kline, "k")?;
            let candle = checked_candle(NormalizedCandle {
                symbol,
                open_time: required(k.open_time.as_ref(), "k.t")?.epoch_millis()?,
                open: price(k.open.as_ref(), "k.o")?,
                high: price(k.high.as_ref(), "k.h")?,
                low: price(k.low.as_ref(), "k.l")?,
                close: price(k.close.as_ref(), "k.c")?,
                volume: volume(k.volume.as_ref(), "k.v")?,
                source_id: raw.source_id.clone(),
            })?;
            Ok(vec![MarketEvent::Candle(candle)])
        }
        Some("bookTicker") | None if event.update_id.is_some() || event.bid.is_some() => {
            let bid = price(event.bid.as_ref(), "b")?;
            let ask = price(event.ask.as_ref(), "a")?;
            Ok(vec![MarketEvent::Tick(NormalizedTick {
                symbol,
                price: midpoint(bid, ask),
                bid_price: Some(bid),
                ask_price: Some(ask),
                volume: rust_decimal::Decimal::ZERO,
                source_id: raw.source_id.clone(),
                source_timestamp: event_time(event.trade_time.as_ref().or(event.event_time.as_ref()), raw)?,
                received_at: raw.received_at,
            })])
        }
        Some(other) => Err(NormalizeError::Malformed(format!("unsupported event type {other}"))),
        None => Err(NormalizeError::MissingField("e")),
    }
}

fn rest_ticker(ticker: RestTicker, raw: &RawMessage) -> Result<NormalizedTick, NormalizeError> {
    Ok(NormalizedTick {
        symbol: required(ticker.symbol, "symbol")?,
        price: price(ticker.last_price.as_ref(), "lastPrice")?,
        bid_price: quote_side(ticker.bid_price.as_ref(), "bidPrice")?,
        ask_price: quote_side(ticker.ask_price.as_ref(), "askPrice")?,
        volume: volume(ticker.volume.as_ref(), "volume")?,
        source_id: raw.source_id.clone(),
        source_timestamp: event_time(ticker.close_time.as_ref(), raw)?,
        received_at: raw.received_at,
    })
}

impl Normalizer for BinanceNormalizer {
    fn schema(&self) -> SourceSchema {
        SourceSchema::Binance
    }

    fn normalize(&self, raw: &RawMessage) -> Result<Vec<MarketEvent>, NormalizeError> {
        let RawPayload::Text(text) = &raw.payload else {
            return Err(NormalizeError::UnsupportedEncoding(SourceSchema::Binance));
        };
        let value: Value = parse_json(text)?;
        self.decode_value(value, raw)
    }

    fn normalize_history(
        &self,
        source_id: &SourceId,
        native_symbol: &str,
        body: &[u8],
    ) -> Result<Vec<NormalizedCandle>, NormalizeError> {
        // [openTime, open, high, low, close, volume, closeTime, ...]
        let rows: Vec<Vec<WireValue>> = parse_json_bytes(body)?;
        rows.iter()
            .map(|row| {
                if row.len() < 6 {
                    return Err(NormalizeError::Malformed(format!(
                        "kline row has {} columns",
                        row.len()
                    )));
                }
                checked_candle(NormalizedCandle {
                    symbol: native_symbol.to_string(),
                    open_time: row[0].epoch_millis()?,
                    open: price(Some(&row[1]), "open")?,
                    high: price(Some(&row[2]), "high")?,
                    low: price(Some(&row[3]), "low")?,
                    close: price(Some(&row[4]), "close")?,
                    volume: volume(Some(&row[5]), "volume")?,
                    source_id: source_id.clone(),
                })
            })
            .collect()
    }

    fn subscribe_frames(&self, descriptor: &SourceDescriptor) -> Vec<String> {
        let params: Vec<String> = descriptor
            .native_symbols()
            .flat_map(|s| {
                let s = s.to_ascii_lowercase();
                [format!("{s}@ticker"), format!("{s}@kline_1m")]
            })
            .collect();
        if params.is_empty() {
            return Vec::new();
        }
        vec![serde_json::json!({"method": "SUBSCRIBE", "params": params, "id": 1}).to_string()]
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    const RECEIVED: EpochMillis = 1_700_000_000_999;

    fn raw(text: &str) -> RawMessage {
        RawMessage::text(SourceId::new("binance"), RECEIVED, text)
    }

    fn single_tick(text: &str) -> NormalizedTick {
        match BinanceNormalizer.normalize(&raw(text)).unwrap().as_slice() {
            [MarketEvent::Tick(tick)] => tick.clone(),
            other => panic!("expected one tick, got {other:?}"),
        }
    }

    #[test]
    fn combined_stream_ticker() {
        let tick = single_tick(
            r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1700000000000,"s":"BTCUSDT","c":"37000.50","b":"37000.00","a":"37001.00","v":"1234.5"}}"#,
        );
        assert_eq!(tick.symbol, "BTCUSDT");
        assert_eq!(tick.price, dec!(37000.50));
        assert_eq!(tick.bid_price, Some(dec!(37000.00)));
        assert_eq!(tick.ask_price, Some(dec!(37001.00)));
        assert_eq!(tick.volume, dec!(1234.5));
        assert_eq!(tick.source_timestamp, 1_700_000_000_000);
        assert_eq!(tick.received_at, RECEIVED);
    }

    #[test]
    fn trade_event() {
        let tick = single_tick(r#"{"e":"trade","E":1700000000001,"s":"ETHUSDT","p":"2000.1","q":"0.5","T":1700000000000}"#);
        assert_eq!(tick.price, dec!(2000.1));
        assert_eq!(tick.volume, dec!(0.5));
        assert_eq!(tick.source_timestamp, 1_700_000_000_000);
    }

    #[test]
    fn book_ticker_uses_mid_price() {
        let tick = single_tick(r#"{"u":400900217,"s":"BNBUSDT","b":"25.00","B":"31.2","a":"26.00","A":"40.6"}"#);
        assert_eq!(tick.price, dec!(25.50));
        assert_eq!(tick.volume, dec!(0));
        assert_eq!(tick.source_timestamp, RECEIVED);
    }

    #[test]
    fn kline_event_becomes_candle() {
        let events = BinanceNormalizer
            .normalize(&raw(r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000040000,"o":"100","h":"110","l":"95","c":"105","v":"12"}}"#))
            .unwrap();
        let [MarketEvent::Candle(candle)] = events.as_slice() else {
            panic!("expected candle, got {events:?}");
        };
        assert_eq!(candle.open_time, 1_700_000_040_000);
        assert_eq!(candle.high, dec!(110));
    }

    #[test]
    fn inverted_kline_rejected() {
        let err = BinanceNormalizer
            .normalize(&raw(r#"{"e":"kline","s":"BTCUSDT","k":{"t":1,"o":"100","h":"90","l":"95","c":"100","v":"1"}}"#))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidCandle(_)));
    }

    #[test]
    fn rest_ticker_for_polling() {
        let tick = single_tick(r#"{"symbol":"BTCUSDT","lastPrice":"36999.99","bidPrice":"36999.00","askPrice":"37000.00","volume":"100","closeTime":1700000000000}"#);
        assert_eq!(tick.price, dec!(36999.99));
        assert_eq!(tick.source_timestamp, 1_700_000_000_000);
    }

    #[test]
    fn subscription_ack_is_ignored() {
        assert!(BinanceNormalizer.normalize(&raw(r#"{"result":null,"id":1}"#)).unwrap().is_empty());
    }

    #[test]
    fn error_frame_rejected() {
        let err = BinanceNormalizer
            .normalize(&raw(r#"{"code":2,"msg":"Invalid request"}"#))
            .unwrap_err();
        assert_eq!(err, NormalizeError::SourceError("Invalid request".into()));
    }

    #[test]
    fn non_numeric_price_rejected() {
        let err = BinanceNormalizer
            .normalize(&raw(r#"{"e":"24hrTicker","E":1,"s":"BTCUSDT","c":"n/a"}"#))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::NonNumeric { field: "c", .. }));
    }

    #[test]
    fn missing_symbol_rejected() {
        let err = BinanceNormalizer
            .normalize(&raw(r#"{"e":"24hrTicker","E":1,"c":"1"}"#))
            .unwrap_err();
        assert_eq!(err, NormalizeError::MissingField("s"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            BinanceNormalizer.normalize(&raw("not json")),
            Err(NormalizeError::Malformed(_))
        ));
    }

    #[test]
    fn binary_payload_unsupported() {
        let msg = RawMessage::binary(SourceId::new("binance"), RECEIVED, vec![0x90]);
        assert_eq!(
            BinanceNormalizer.normalize(&msg),
            Err(NormalizeError::UnsupportedEncoding(SourceSchema::Binance))
        );
    }

    #[test]
    fn klines_history() {
        let body = br#"[[1700000000000,"100","110","90","105","5",1700000059999,"0",1,"0","0","0"],[1700000060000,"105","106","104","105.5","2",1700000119999,"0",1,"0","0","0"]]"#;
        let candles = BinanceNormalizer
            .normalize_history(&SourceId::new("binance"), "BTCUSDT", body)
            .unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].close, dec!(105.5));
        assert_eq!(candles[0].symbol, "BTCUSDT");
    }

    #[test]
    fn subscribe_frame_lists_streams() {
        let descriptor = SourceDescriptor::new("binance", SourceSchema::Binance, "wss://x").with_symbol("BTCUSDT");
        let frames = BinanceNormalizer.subscribe_frames(&descriptor);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("btcusdt@ticker"));
        assert!(frames[0].contains("btcusdt@kline_1m"));
    }
}
