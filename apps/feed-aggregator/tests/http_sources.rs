//! HTTP Source Integration Tests
//!
//! Polling transport and REST backfill against a mock HTTP server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feed_aggregator::infrastructure::feeds::RestBackfill;
use feed_aggregator::infrastructure::normalizers::NormalizerRegistry;
use feed_aggregator::{
    BackfillError, ConnectionPhase, EngineConfig, HistoryProvider, MarketDataEngine, RawMessage, SourceDescriptor,
    SourceId, SourceSchema, SymbolMapping, TransportKind,
};

const KLINES: &str = r#"[
    [1700000040000, "101", "103", "100", "102", "5", 1700000099999],
    [1699999980000, "100", "102", "99", "101", "4", 1700000039999],
    [1700000100000, "102", "104", "101", "103", "6", 1700000159999]
]"#;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn history_source(server: &MockServer) -> SourceDescriptor {
    SourceDescriptor::new("binance", SourceSchema::Binance, "wss://stream.binance.com:9443/stream")
        .with_mapping(SymbolMapping::new("BTCUSD", "BTCUSDT"))
        .with_history_endpoint(format!(
            "{}/api/v3/klines?symbol={{symbol}}&interval=1m&limit={{limit}}",
            server.uri()
        ))
}

#[tokio::test]
async fn polling_source_feeds_the_merge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .and(query_param("symbol", "BTCUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"symbol":"BTCUSDT","lastPrice":"36999.99","bidPrice":"36999.00","askPrice":"37000.00","volume":"100","closeTime":1700000000000}"#,
        ))
        .mount(&server)
        .await;

    let source = SourceDescriptor::new(
        "binance-rest",
        SourceSchema::Binance,
        format!("{}/api/v3/ticker/24hr?symbol={{symbol}}", server.uri()),
    )
    .with_transport(TransportKind::Polling {
        interval: Duration::from_millis(50),
    })
    .with_mapping(SymbolMapping::new("BTCUSD", "BTCUSDT"));

    let engine = MarketDataEngine::builder(EngineConfig {
        backfill_limit: 0,
        ..EngineConfig::default()
    })
    .with_source(source)
    .build()
    .unwrap();
    engine.start().unwrap();

    wait_until(|| engine.snapshot("BTCUSD").is_some_and(|v| !v.stale)).await;
    let view = engine.snapshot("BTCUSD").unwrap();
    assert_eq!(view.merged_price, dec!(36999.99));
    assert_eq!(view.spread, Some(dec!(1.00)));
    assert_eq!(engine.source_health()[0].phase, ConnectionPhase::Connected);

    engine.shutdown().await;
}

#[tokio::test]
async fn polling_error_status_keeps_source_out_of_the_merge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = SourceDescriptor::new("binance-rest", SourceSchema::Binance, format!("{}/ticker", server.uri()))
        .with_transport(TransportKind::Polling {
            interval: Duration::from_millis(20),
        })
        .with_symbol("BTCUSDT");
    let mut config = EngineConfig::default();
    config.supervisor.reconnect.base_delay = Duration::from_millis(10);
    config.supervisor.reconnect.max_delay = Duration::from_millis(20);
    let engine = MarketDataEngine::builder(config).with_source(source).build().unwrap();
    engine.start().unwrap();

    wait_until(|| engine.source_health()[0].consecutive_failures >= 2).await;
    let health = &engine.source_health()[0];
    assert_ne!(health.phase, ConnectionPhase::Connected);
    assert!(health.last_error.as_deref().is_some_and(|e| e.contains("503")));
    assert!(engine.tracked_symbols().is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn first_tick_backfills_history() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .and(query_param("symbol", "BTCUSDT"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(KLINES))
        .expect(1)
        .mount(&server)
        .await;

    let engine = MarketDataEngine::builder(EngineConfig {
        backfill_limit: 2,
        ..EngineConfig::default()
    })
    .with_source(history_source(&server))
    .build()
    .unwrap();

    let trade = r#"{"e":"trade","E":1700000160000,"s":"BTCUSDT","p":"103.5","q":"1","T":1700000160000}"#;
    let reports = engine
        .ingest_raw(RawMessage::text(SourceId::new("binance"), 1_700_000_160_000, trade))
        .unwrap();
    assert!(reports[0].seeded);

    wait_until(|| engine.history("BTCUSD", 10).len() == 2).await;
    let history = engine.history("BTCUSD", 10);
    let open_times: Vec<_> = history.iter().map(|c| c.open_time).collect();
    assert_eq!(open_times, vec![1_700_000_040_000, 1_700_000_100_000]);
    assert!(history.iter().all(|c| c.symbol == "BTCUSD"));

    engine.shutdown().await;
}

#[tokio::test]
async fn rest_backfill_reports_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let source = history_source(&server);
    let backfill = RestBackfill::new(
        reqwest::Client::new(),
        Arc::new(NormalizerRegistry::for_sources([&source])),
    );
    let mapping = source.mapping_for("BTCUSD").unwrap().clone();

    let err = assert_err!(backfill.fetch_candles(&source, &mapping, 10).await);
    assert!(matches!(err, BackfillError::Status { status: 429, ref body } if body == "rate limited"));
}

#[tokio::test]
async fn rest_backfill_requires_history_endpoint() {
    let source = SourceDescriptor::new("coinbase", SourceSchema::Coinbase, "wss://ws-feed.exchange.coinbase.com")
        .with_symbol("BTC-USD");
    let backfill = RestBackfill::new(
        reqwest::Client::new(),
        Arc::new(NormalizerRegistry::for_sources([&source])),
    );
    let mapping = source.symbols()[0].clone();

    let err = assert_err!(backfill.fetch_candles(&source, &mapping, 10).await);
    assert!(matches!(err, BackfillError::NotConfigured(_)));
}

#[tokio::test]
async fn rest_backfill_trims_to_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/klines"))
        .respond_with(ResponseTemplate::new(200).set_body_string(KLINES))
        .mount(&server)
        .await;

    let source = history_source(&server);
    let backfill = RestBackfill::new(
        reqwest::Client::new(),
        Arc::new(NormalizerRegistry::for_sources([&source])),
    );
    let mapping = source.mapping_for("BTCUSD").unwrap().clone();

    let candles = assert_ok!(backfill.fetch_candles(&source, &mapping, 1).await);
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].open_time, 1_700_000_100_000);
    assert_eq!(candles[0].close, dec!(103));
}
