//! Application Services
//!
//! Services that turn normalized events into published views.
//!
//! - `SymbolAggregator`: merges per-source contributions for one symbol
//! - `TimeWindowedCache`: bounded per-symbol candle and tick history
//! - `Dispatcher`: pattern routing and per-subscriber coalescing delivery
//! - `MarketDataPipeline`: per-symbol single-writer orchestration and TTL sweep

pub mod aggregator;
pub mod cache;
pub mod dispatcher;
pub mod pipeline;

pub use aggregator::{AggregatorConfig, SymbolAggregator, TickOutcome, merge_contributions};
pub use cache::{AppendOutcome, CacheError, History, TimeWindowedCache};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig, DispatcherStats, Subscriber, SubscriberError};
pub use pipeline::{IngestOutcome, IngestReport, MarketDataPipeline, PipelineConfig, SweepReport};
