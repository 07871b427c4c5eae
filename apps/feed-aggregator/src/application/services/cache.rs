//! Time-Windowed Cache
//!
//! Bounded per-symbol history. Candles are keyed by bucket start so a
//! repeated bucket overwrites in place; when a symbol holds `capacity`
//! candles the oldest bucket is dropped. The most recent ticks are kept in a
//! ring of the same capacity.
//!
//! Symbol-level TTL eviction is driven by the pipeline, which owns the
//! activity timestamps; the cache only exposes [`TimeWindowedCache::evict`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::market::{NormalizedCandle, NormalizedTick, Symbol};
use crate::domain::time::EpochMillis;

/// Cache write failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Candle is older than everything retained and the buffer is full.
    #[error("candle at {open_time} for {symbol} is older than the retained window (oldest {oldest})")]
    OutsideWindow {
        /// Symbol.
        symbol: Symbol,
        /// Rejected bucket start.
        open_time: EpochMillis,
        /// Oldest retained bucket start.
        oldest: EpochMillis,
    },

    /// Entry failed validation.
    #[error("invalid entry for {symbol}: {reason}")]
    Invalid {
        /// Symbol.
        symbol: Symbol,
        /// What was wrong.
        reason: String,
    },
}

/// Result of a successful candle append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New bucket stored.
    Inserted,
    /// Existing bucket overwritten.
    Replaced,
}

/// Snapshot of a symbol's most recent candles, oldest first.
///
/// Cloning is cheap and every clone can be iterated any number of times.
#[derive(Debug, Clone, Default)]
pub struct History {
    candles: Arc<[NormalizedCandle]>,
}

impl History {
    /// Iterate oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, NormalizedCandle> {
        self.candles.iter()
    }

    /// Number of candles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Most recent candle.
    #[must_use]
    pub fn latest(&self) -> Option<&NormalizedCandle> {
        self.candles.last()
    }

    /// Borrow as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[NormalizedCandle] {
        &self.candles
    }
}

impl<'a> IntoIterator for &'a History {
    type Item = &'a NormalizedCandle;
    type IntoIter = std::slice::Iter<'a, NormalizedCandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Default)]
struct SymbolHistory {
    candles: BTreeMap<EpochMillis, NormalizedCandle>,
    ticks: VecDeque<NormalizedTick>,
}

/// Bounded per-symbol candle and tick buffer.
#[derive(Debug)]
pub struct TimeWindowedCache {
    capacity: usize,
    entries: RwLock<HashMap<Symbol, SymbolHistory>>,
}

impl TimeWindowedCache {
    /// Default per-symbol capacity.
    pub const DEFAULT_CAPACITY: usize = 500;

    /// Create a cache holding up to `capacity` candles and ticks per symbol.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Per-symbol capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store a candle, overwriting any candle with the same `open_time`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Invalid` if the candle is for another symbol or
    /// fails OHLC checks, and `CacheError::OutsideWindow` if the buffer is
    /// full and the candle predates everything retained.
    pub fn append(&self, symbol: &str, candle: NormalizedCandle) -> Result<AppendOutcome, CacheError> {
        if candle.symbol != symbol {
            return Err(CacheError::Invalid {
                symbol: symbol.to_string(),
                reason: format!("candle carries symbol {}", candle.symbol),
            });
        }
        candle.check_consistency().map_err(|reason| CacheError::Invalid {
            symbol: symbol.to_string(),
            reason,
        })?;

        let mut entries = self.entries.write();
        let history = entries.entry(symbol.to_string()).or_default();

        if history.candles.contains_key(&candle.open_time) {
            history.candles.insert(candle.open_time, candle);
            return Ok(AppendOutcome::Replaced);
        }

        if history.candles.len() >= self.capacity
            && let Some((&oldest, _)) = history.candles.first_key_value()
            && candle.open_time < oldest
        {
            return Err(CacheError::OutsideWindow {
                symbol: symbol.to_string(),
                open_time: candle.open_time,
                oldest,
            });
        }

        history.candles.insert(candle.open_time, candle);
        while history.candles.len() > self.capacity {
            history.candles.pop_first();
        }
        Ok(AppendOutcome::Inserted)
    }

    /// Whether [`Self::record_tick`] would accept `tick` under `symbol`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Invalid` if the tick is for another symbol.
    pub fn check_tick(symbol: &str, tick: &NormalizedTick) -> Result<(), CacheError> {
        if tick.symbol != symbol {
            return Err(CacheError::Invalid {
                symbol: symbol.to_string(),
                reason: format!("tick carries symbol {}", tick.symbol),
            });
        }
        Ok(())
    }

    /// Store a tick in the symbol's recent-tick ring.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Invalid` if the tick is for another symbol.
    pub fn record_tick(&self, symbol: &str, tick: NormalizedTick) -> Result<(), CacheError> {
        Self::check_tick(symbol, &tick)?;

        let mut entries = self.entries.write();
        let history = entries.entry(symbol.to_string()).or_default();
        if history.ticks.len() >= self.capacity {
            history.ticks.pop_front();
        }
        history.ticks.push_back(tick);
        Ok(())
    }

    /// The most recent `lookback` candles, oldest first. Unknown symbols
    /// yield an empty history.
    #[must_use]
    pub fn get(&self, symbol: &str, lookback: usize) -> History {
        let entries = self.entries.read();
        let Some(history) = entries.get(symbol) else {
            return History::default();
        };

        let skip = history.candles.len().saturating_sub(lookback);
        History {
            candles: history.candles.values().skip(skip).cloned().collect(),
        }
    }

    /// The most recent `lookback` ticks, oldest first.
    #[must_use]
    pub fn recent_ticks(&self, symbol: &str, lookback: usize) -> Vec<NormalizedTick> {
        let entries = self.entries.read();
        entries.get(symbol).map_or_else(Vec::new, |history| {
            let skip = history.ticks.len().saturating_sub(lookback);
            history.ticks.iter().skip(skip).cloned().collect()
        })
    }

    /// Drop everything held for a symbol. Returns whether it was present.
    pub fn evict(&self, symbol: &str) -> bool {
        self.entries.write().remove(symbol).is_some()
    }

    /// Number of symbols with cached data.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for TimeWindowedCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
