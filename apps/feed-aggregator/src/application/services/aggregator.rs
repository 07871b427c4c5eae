//! Per-Symbol Aggregator
//!
//! Holds the latest contribution of every source for one symbol and derives
//! the [`AggregatedSymbolView`] from the contributions that are both fresh
//! (received within the staleness threshold) and eligible (their source is
//! healthy).
//!
//! # Merge Rule
//!
//! - price: volume-weighted average of eligible contributions; a single
//!   contribution is used directly; when all volumes are zero the plain
//!   mean is used
//! - volume: sum of eligible volumes
//! - spread: lowest ask minus highest bid over contributions quoting both
//! - no eligible contribution: the previous price is kept and the view is
//!   flagged stale
//!
//! The aggregator is not synchronized. The pipeline owns one per symbol
//! behind that symbol's lock, which gives the single-writer discipline.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::ports::MergeEligibility;
use crate::domain::market::{AggregatedSymbolView, NormalizedTick, SourceId, Symbol};
use crate::domain::time::{EpochMillis, duration_millis};

/// Aggregator configuration.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// A contribution older than this is excluded from the merge.
    pub staleness_threshold: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(30),
        }
    }
}

/// One source's latest price for a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceContribution {
    /// Contributing source.
    pub source_id: SourceId,
    /// Price.
    pub price: Decimal,
    /// Weighting volume.
    pub volume: Decimal,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Exchange timestamp.
    pub source_timestamp: EpochMillis,
    /// Local receipt time.
    pub received_at: EpochMillis,
}

impl PriceContribution {
    fn from_tick(tick: &NormalizedTick) -> Self {
        Self {
            source_id: tick.source_id.clone(),
            price: tick.price,
            volume: tick.volume,
            bid: tick.bid_price,
            ask: tick.ask_price,
            source_timestamp: tick.source_timestamp,
            received_at: tick.received_at,
        }
    }
}

/// Result of merging a set of contributions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedQuote {
    /// Merged price.
    pub price: Decimal,
    /// Total volume.
    pub volume: Decimal,
    /// Consolidated spread.
    pub spread: Option<Decimal>,
    /// Sources merged.
    pub sources: BTreeSet<SourceId>,
}

/// Merge contributions. Returns `None` for an empty input.
#[must_use]
pub fn merge_contributions<'a>(
    contributions: impl IntoIterator<Item = &'a PriceContribution>,
) -> Option<MergedQuote> {
    let mut count = 0u32;
    let mut price_sum = Decimal::ZERO;
    let mut weighted_sum = Decimal::ZERO;
    let mut volume = Decimal::ZERO;
    let mut best_bid: Option<Decimal> = None;
    let mut best_ask: Option<Decimal> = None;
    let mut sources = BTreeSet::new();

    for c in contributions {
        count += 1;
        price_sum += c.price;
        weighted_sum += c.price * c.volume;
        volume += c.volume;
        if let (Some(bid), Some(ask)) = (c.bid, c.ask) {
            best_bid = Some(best_bid.map_or(bid, |b| b.max(bid)));
            best_ask = Some(best_ask.map_or(ask, |a| a.min(ask)));
        }
        sources.insert(c.source_id.clone());
    }

    if count == 0 {
        return None;
    }

    let price = if volume > Decimal::ZERO {
        weighted_sum / volume
    } else {
        price_sum / Decimal::from(count)
    };

    let spread = match (best_bid, best_ask) {
        (Some(bid), Some(ask)) => Some(ask - bid),
        _ => None,
    };

    Some(MergedQuote {
        price,
        volume,
        spread,
        sources,
    })
}

/// What happened to a tick handed to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The view was recomputed.
    Updated(AggregatedSymbolView),
    /// Older than the source's current contribution; ignored.
    OutOfOrder {
        /// Timestamp already held for the source.
        current: EpochMillis,
    },
    /// Tick is for another symbol.
    WrongSymbol,
}

/// Merges contributions for one symbol.
#[derive(Debug)]
pub struct SymbolAggregator {
    symbol: Symbol,
    config: AggregatorConfig,
    contributions: HashMap<SourceId, PriceContribution>,
    view: Option<AggregatedSymbolView>,
}

impl SymbolAggregator {
    /// Create an aggregator with no contributions.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, config: AggregatorConfig) -> Self {
        Self {
            symbol: symbol.into(),
            config,
            contributions: HashMap::new(),
            view: None,
        }
    }

    /// Symbol handled.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current view, if any tick has been applied.
    #[must_use]
    pub const fn view(&self) -> Option<&AggregatedSymbolView> {
        self.view.as_ref()
    }

    /// Number of sources with a stored contribution (fresh or not).
    #[must_use]
    pub fn contribution_count(&self) -> usize {
        self.contributions.len()
    }

    /// Record a tick and recompute the view.
    pub fn apply_tick(
        &mut self,
        tick: &NormalizedTick,
        now: EpochMillis,
        eligibility: &dyn MergeEligibility,
    ) -> TickOutcome {
        if tick.symbol != self.symbol {
            return TickOutcome::WrongSymbol;
        }

        if let Some(current) = self.contributions.get(&tick.source_id)
            && tick.source_timestamp < current.source_timestamp
        {
            return TickOutcome::OutOfOrder {
                current: current.source_timestamp,
            };
        }

        self.contributions
            .insert(tick.source_id.clone(), PriceContribution::from_tick(tick));

        TickOutcome::Updated(self.recompute(now, eligibility))
    }

    /// Recompute without new data. Returns the new view only when the set of
    /// contributing sources or the stale flag changed.
    pub fn refresh(
        &mut self,
        now: EpochMillis,
        eligibility: &dyn MergeEligibility,
    ) -> Option<AggregatedSymbolView> {
        let previous = self.view.as_ref()?;
        let fresh = self.fresh_sources(now, eligibility);

        let unchanged = if fresh.is_empty() {
            previous.stale
        } else {
            !previous.stale && previous.contributing_sources == fresh
        };
        if unchanged {
            return None;
        }

        Some(self.recompute(now, eligibility))
    }

    fn is_fresh(&self, contribution: &PriceContribution, now: EpochMillis) -> bool {
        now.saturating_sub(contribution.received_at) <= duration_millis(self.config.staleness_threshold)
    }

    fn fresh_sources(&self, now: EpochMillis, eligibility: &dyn MergeEligibility) -> BTreeSet<SourceId> {
        self.contributions
            .values()
            .filter(|c| self.is_fresh(c, now) && eligibility.is_eligible(&c.source_id))
            .map(|c| c.source_id.clone())
            .collect()
    }

    fn recompute(&mut self, now: EpochMillis, eligibility: &dyn MergeEligibility) -> AggregatedSymbolView {
        let merged = merge_contributions(
            self.contributions
                .values()
                .filter(|c| self.is_fresh(c, now) && eligibility.is_eligible(&c.source_id)),
        );

        let (last_update, sequence) = match &self.view {
            Some(prev) => (now.max(prev.last_update + 1), prev.sequence + 1),
            None => (now, 1),
        };

        let view = match (merged, &self.view) {
            (Some(m), _) => AggregatedSymbolView {
                symbol: self.symbol.clone(),
                merged_price: m.price,
                merged_volume: m.volume,
                spread: m.spread,
                contributing_sources: m.sources,
                last_update,
                stale: false,
                sequence,
            },
            (None, Some(prev)) => AggregatedSymbolView {
                contributing_sources: BTreeSet::new(),
                merged_volume: Decimal::ZERO,
                spread: None,
                last_update,
                stale: true,
                sequence,
                ..prev.clone()
            },
            (None, None) => {
                // First tick came from an ineligible source: seed from it.
                let seed = self.contributions.values().max_by_key(|c| c.received_at);
                AggregatedSymbolView {
                    symbol: self.symbol.clone(),
                    merged_price: seed.map_or(Decimal::ZERO, |c| c.price),
                    merged_volume: Decimal::ZERO,
                    spread: None,
                    contributing_sources: BTreeSet::new(),
                    last_update,
                    stale: true,
                    sequence,
                }
            }
        };

        self.view = Some(view.clone());
        view
    }
}
