//! Market Data Pipeline
//!
//! Orchestrates one aggregation step per normalized event:
//!
//! ```text
//! MarketEvent ──► SymbolAggregator ──► TimeWindowedCache ──► Dispatcher
//!                 (merge)              (write)               (notify)
//! ```
//!
//! Each tracked symbol has its own state behind its own mutex, so sources
//! updating different symbols never contend, and updates to one symbol are
//! serialized. A failed cache write suppresses the notification.
//!
//! The periodic sweep evicts symbols silent for longer than the TTL and
//! re-evaluates staleness for the rest, publishing only when the set of
//! contributing sources or the stale flag changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::application::ports::MergeEligibility;
use crate::application::services::aggregator::{AggregatorConfig, SymbolAggregator, TickOutcome};
use crate::application::services::cache::{AppendOutcome, CacheError, History, TimeWindowedCache};
use crate::application::services::dispatcher::Dispatcher;
use crate::domain::market::{AggregatedSymbolView, MarketEvent, NormalizedCandle, NormalizedTick, Symbol};
use crate::domain::time::{Clock, EpochMillis, duration_millis};
use crate::infrastructure::metrics::{record_symbols_evicted, record_update_published, set_tracked_symbols};

/// Pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Merge settings.
    pub aggregator: AggregatorConfig,
    /// Per-symbol cache capacity.
    pub cache_capacity: usize,
    /// Silence after which a symbol is evicted.
    pub symbol_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            cache_capacity: TimeWindowedCache::DEFAULT_CAPACITY,
            symbol_ttl: Duration::from_secs(300),
        }
    }
}

/// What one ingested event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// View recomputed and published.
    Published(AggregatedSymbolView),
    /// Candle written to history.
    CandleStored(AppendOutcome),
    /// Tick older than the source's current contribution.
    OutOfOrder,
    /// Cache refused the write; nothing was published.
    CacheRejected(CacheError),
}

/// Result of [`MarketDataPipeline::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// Symbol updated.
    pub symbol: Symbol,
    /// What happened.
    pub outcome: IngestOutcome,
    /// The event started tracking the symbol.
    pub seeded: bool,
}

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Symbols removed for inactivity.
    pub evicted: Vec<Symbol>,
    /// Views republished because their staleness changed.
    pub refreshed: usize,
}

#[derive(Debug)]
struct SymbolState {
    aggregator: SymbolAggregator,
    last_activity: EpochMillis,
    evicted: bool,
}

/// Per-symbol aggregation, caching and notification.
pub struct MarketDataPipeline {
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
    eligibility: Arc<dyn MergeEligibility>,
    cache: TimeWindowedCache,
    dispatcher: Dispatcher,
    symbols: RwLock<HashMap<Symbol, Arc<Mutex<SymbolState>>>>,
}

impl std::fmt::Debug for MarketDataPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataPipeline")
            .field("config", &self.config)
            .field("tracked_symbols", &self.symbols.read().len())
            .finish_non_exhaustive()
    }
}

impl MarketDataPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
        eligibility: Arc<dyn MergeEligibility>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            config,
            clock,
            eligibility,
            cache: TimeWindowedCache::new(config.cache_capacity),
            dispatcher,
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatcher used for notifications.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Apply one event under its symbol's lock.
    pub fn ingest(&self, event: MarketEvent) -> IngestReport {
        let symbol = event.symbol().to_string();
        let now = self.clock.now_millis();

        loop {
            let (state, seeded) = self.state_for(&symbol);
            let mut guard = state.lock();
            if guard.evicted {
                // Lost a race with the sweep; the next lookup re-seeds.
                continue;
            }
            guard.last_activity = now;

            let outcome = match &event {
                MarketEvent::Tick(tick) => self.apply_tick(&mut guard, &symbol, tick, now),
                MarketEvent::Candle(candle) => self.apply_candle(&symbol, candle),
            };

            return IngestReport { symbol, outcome, seeded };
        }
    }

    fn apply_tick(
        &self,
        state: &mut SymbolState,
        symbol: &str,
        tick: &NormalizedTick,
        now: EpochMillis,
    ) -> IngestOutcome {
        // Validate before the aggregator mutates, so the view and the tick
        // ring never disagree.
        if let Err(e) = TimeWindowedCache::check_tick(symbol, tick) {
            tracing::warn!(symbol, source_id = %tick.source_id, error = %e, "Tick rejected");
            return IngestOutcome::CacheRejected(e);
        }

        let view = match state.aggregator.apply_tick(tick, now, self.eligibility.as_ref()) {
            TickOutcome::Updated(view) => view,
            TickOutcome::OutOfOrder { current } => {
                tracing::debug!(
                    symbol,
                    source_id = %tick.source_id,
                    source_timestamp = tick.source_timestamp,
                    current,
                    "Ignoring out-of-order tick"
                );
                return IngestOutcome::OutOfOrder;
            }
            TickOutcome::WrongSymbol => {
                return IngestOutcome::CacheRejected(CacheError::Invalid {
                    symbol: symbol.to_string(),
                    reason: format!("tick carries symbol {}", tick.symbol),
                });
            }
        };

        if let Err(e) = self.cache.record_tick(symbol, tick.clone()) {
            tracing::warn!(symbol, error = %e, "Cache write failed, notification suppressed");
            return IngestOutcome::CacheRejected(e);
        }

        self.dispatcher.publish(&view);
        record_update_published();
        IngestOutcome::Published(view)
    }

    fn apply_candle(&self, symbol: &str, candle: &NormalizedCandle) -> IngestOutcome {
        match self.cache.append(symbol, candle.clone()) {
            Ok(outcome) => IngestOutcome::CandleStored(outcome),
            Err(e) => {
                tracing::warn!(symbol, source_id = %candle.source_id, error = %e, "Candle rejected by cache");
                IngestOutcome::CacheRejected(e)
            }
        }
    }

    fn state_for(&self, symbol: &str) -> (Arc<Mutex<SymbolState>>, bool) {
        if let Some(state) = self.symbols.read().get(symbol) {
            return (Arc::clone(state), false);
        }

        let mut symbols = self.symbols.write();
        if let Some(state) = symbols.get(symbol) {
            return (Arc::clone(state), false);
        }

        let state = Arc::new(Mutex::new(SymbolState {
            aggregator: SymbolAggregator::new(symbol, self.config.aggregator),
            last_activity: self.clock.now_millis(),
            evicted: false,
        }));
        symbols.insert(symbol.to_string(), Arc::clone(&state));
        set_tracked_symbols(symbols.len());
        tracing::debug!(symbol, "Tracking new symbol");
        (state, true)
    }

    /// Store historical candles without counting as activity.
    ///
    /// Candles for symbols that are not tracked are dropped. Returns the
    /// number stored.
    pub fn backfill(&self, symbol: &str, mut candles: Vec<NormalizedCandle>) -> usize {
        let Some(state) = self.symbols.read().get(symbol).cloned() else {
            return 0;
        };
        let guard = state.lock();
        if guard.evicted {
            return 0;
        }

        candles.sort_by_key(|c| c.open_time);
        let mut stored = 0;
        for candle in candles {
            match self.cache.append(symbol, candle) {
                Ok(_) => stored += 1,
                Err(e) => tracing::debug!(symbol, error = %e, "Skipping backfill candle"),
            }
        }
        drop(guard);
        stored
    }

    /// Current view of a symbol, re-evaluating staleness first.
    ///
    /// Returns `None` for symbols never seen, evicted, or silent past the
    /// TTL.
    #[must_use]
    pub fn snapshot(&self, symbol: &str) -> Option<AggregatedSymbolView> {
        let state = self.symbols.read().get(symbol).cloned()?;
        let now = self.clock.now_millis();
        let mut guard = state.lock();

        if guard.evicted || self.expired(guard.last_activity, now) {
            return None;
        }
        if let Some(view) = guard.aggregator.refresh(now, self.eligibility.as_ref()) {
            self.dispatcher.publish(&view);
            record_update_published();
        }
        guard.aggregator.view().cloned()
    }

    /// The most recent `lookback` candles of a symbol, oldest first.
    #[must_use]
    pub fn history(&self, symbol: &str, lookback: usize) -> History {
        self.cache.get(symbol, lookback)
    }

    /// The most recent `lookback` ticks of a symbol, oldest first.
    #[must_use]
    pub fn recent_ticks(&self, symbol: &str, lookback: usize) -> Vec<NormalizedTick> {
        self.cache.recent_ticks(symbol, lookback)
    }

    /// Symbols currently tracked, sorted.
    #[must_use]
    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.symbols.read().keys().cloned().collect();
        symbols.sort_unstable();
        symbols
    }

    fn expired(&self, last_activity: EpochMillis, now: EpochMillis) -> bool {
        now.saturating_sub(last_activity) > duration_millis(self.config.symbol_ttl)
    }

    /// Evict expired symbols and republish views whose staleness changed.
    pub fn sweep_once(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let states: Vec<_> = self
            .symbols
            .read()
            .iter()
            .map(|(symbol, state)| (symbol.clone(), Arc::clone(state)))
            .collect();

        let mut report = SweepReport::default();
        for (symbol, state) in states {
            let mut guard = state.lock();
            if guard.evicted {
                continue;
            }

            if self.expired(guard.last_activity, now) {
                guard.evicted = true;
                self.symbols.write().remove(&symbol);
                self.cache.evict(&symbol);
                tracing::info!(
                    symbol = %symbol,
                    idle_ms = now.saturating_sub(guard.last_activity),
                    "Evicted inactive symbol"
                );
                report.evicted.push(symbol);
            } else if let Some(view) = guard.aggregator.refresh(now, self.eligibility.as_ref()) {
                tracing::debug!(
                    symbol = %symbol,
                    stale = view.stale,
                    sources = view.contributing_sources.len(),
                    "Contributing sources changed"
                );
                self.dispatcher.publish(&view);
                record_update_published();
                report.refreshed += 1;
            }
        }

        if !report.evicted.is_empty() {
            record_symbols_evicted(report.evicted.len() as u64);
            set_tracked_symbols(self.symbols.read().len());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::application::ports::AllSourcesEligible;
    use crate::domain::market::SourceId;
    use crate::domain::time::ManualClock;

    const T0: EpochMillis = 1_700_000_000_000;

    fn pipeline(clock: &Arc<ManualClock>) -> MarketDataPipeline {
        MarketDataPipeline::new(
            PipelineConfig::default(),
            Arc::clone(clock) as Arc<dyn Clock>,
            Arc::new(AllSourcesEligible),
            Dispatcher::default(),
        )
    }

    fn tick(source: &str, price: Decimal, volume: Decimal, at: EpochMillis) -> MarketEvent {
        MarketEvent::Tick(NormalizedTick {
            symbol: "BTCUSD".to_string(),
            price,
            bid_price: None,
            ask_price: None,
            volume,
            source_id: SourceId::new(source),
            source_timestamp: at,
            received_at: at,
        })
    }

    fn candle(open_time: EpochMillis, close: Decimal) -> NormalizedCandle {
        NormalizedCandle {
            symbol: "BTCUSD".to_string(),
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            source_id: SourceId::new("a"),
        }
    }

    #[test]
    fn first_tick_seeds_symbol() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);

        let first = p.ingest(tick("a", dec!(100), dec!(1), T0));
        assert!(first.seeded);
        assert!(matches!(first.outcome, IngestOutcome::Published(_)));

        let second = p.ingest(tick("b", dec!(102), dec!(3), T0));
        assert!(!second.seeded);
        assert_eq!(p.snapshot("BTCUSD").unwrap().merged_price, dec!(101.5));
    }

    #[test]
    fn mismatched_tick_leaves_view_and_ring_untouched() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0));
        let before = p.snapshot("BTCUSD").unwrap();

        let MarketEvent::Tick(mut stray) = tick("b", dec!(500), dec!(9), T0 + 1) else {
            unreachable!()
        };
        stray.symbol = "ETHUSD".to_string();
        let (state, seeded) = p.state_for("BTCUSD");
        assert!(!seeded);
        let outcome = p.apply_tick(&mut state.lock(), "BTCUSD", &stray, T0 + 1);

        assert!(matches!(outcome, IngestOutcome::CacheRejected(CacheError::Invalid { .. })));
        assert_eq!(p.snapshot("BTCUSD").unwrap(), before);
        assert_eq!(p.recent_ticks("BTCUSD", 10).len(), 1);
        assert_eq!(p.dispatcher().stats().published, 1);
    }

    #[test]
    fn candle_does_not_change_price() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0));

        let report = p.ingest(MarketEvent::Candle(candle(T0, dec!(150))));
        assert_eq!(report.outcome, IngestOutcome::CandleStored(AppendOutcome::Inserted));
        assert_eq!(p.snapshot("BTCUSD").unwrap().merged_price, dec!(100));
        assert_eq!(p.history("BTCUSD", 10).len(), 1);
    }

    #[test]
    fn invalid_candle_reported() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        let mut bad = candle(T0, dec!(100));
        bad.high = dec!(50);

        let report = p.ingest(MarketEvent::Candle(bad));
        assert!(matches!(report.outcome, IngestOutcome::CacheRejected(CacheError::Invalid { .. })));
    }

    #[test]
    fn sweep_evicts_after_ttl_and_reseeds() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0));
        p.ingest(MarketEvent::Candle(candle(T0, dec!(100))));

        clock.advance(Duration::from_secs(301));
        assert!(p.snapshot("BTCUSD").is_none());

        let report = p.sweep_once();
        assert_eq!(report.evicted, vec!["BTCUSD".to_string()]);
        assert!(p.tracked_symbols().is_empty());
        assert!(p.history("BTCUSD", 10).is_empty());

        let now = clock.now_millis();
        let again = p.ingest(tick("a", dec!(105), dec!(1), now));
        assert!(again.seeded);
        let view = p.snapshot("BTCUSD").unwrap();
        assert_eq!(view.merged_price, dec!(105));
        assert_eq!(view.sequence, 1);
    }

    #[test]
    fn sweep_marks_view_stale_once() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0));

        clock.advance(Duration::from_secs(31));
        assert_eq!(p.sweep_once().refreshed, 1);
        assert!(p.snapshot("BTCUSD").unwrap().stale);
        assert_eq!(p.sweep_once().refreshed, 0);
    }

    #[test]
    fn backfill_keeps_activity_untouched() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0));

        clock.advance(Duration::from_secs(200));
        let stored = p.backfill("BTCUSD", vec![candle(120_000, dec!(2)), candle(60_000, dec!(1))]);
        assert_eq!(stored, 2);

        clock.advance(Duration::from_secs(101));
        assert_eq!(p.sweep_once().evicted.len(), 1);
    }

    #[test]
    fn backfill_for_untracked_symbol_is_dropped() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        assert_eq!(p.backfill("BTCUSD", vec![candle(0, dec!(1))]), 0);
        assert!(p.history("BTCUSD", 10).is_empty());
    }

    #[test]
    fn out_of_order_tick_reported() {
        let clock = Arc::new(ManualClock::new(T0));
        let p = pipeline(&clock);
        p.ingest(tick("a", dec!(100), dec!(1), T0 + 5));
        let report = p.ingest(tick("a", dec!(99), dec!(1), T0));
        assert_eq!(report.outcome, IngestOutcome::OutOfOrder);
    }
}
