//! Domain Layer - Canonical market data model.
//!
//! Pure types shared by every other layer: the normalized tick/candle
//! model, source descriptors and their health, subscription patterns and
//! the clock abstraction. Nothing here performs I/O.

/// Wall-clock abstraction and epoch-millisecond helpers.
pub mod time;

/// Canonical ticks, candles, raw frames and the aggregated view.
pub mod market;

/// Source descriptors, connection phases and per-source health.
pub mod source;

/// Symbol patterns and the subscription index.
pub mod subscription;
