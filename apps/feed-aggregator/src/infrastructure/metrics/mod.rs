//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingestion**: frames received and rejected per source
//! - **Aggregation**: updates published, symbols tracked and evicted
//! - **Delivery**: subscriber deliveries by outcome
//! - **Connections**: per-source phase and reconnect counts
//! - **Latency**: raw frame to publish processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op, so library code and tests never need a
//! recorder installed.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::market::SourceId;
use crate::domain::source::ConnectionPhase;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the installed handle.
///
/// # Errors
///
/// Returns `BuildError` if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "feed_aggregator_messages_received_total",
        "Frames received from each source"
    );
    describe_counter!(
        "feed_aggregator_messages_rejected_total",
        "Frames dropped by normalization, by source and reason"
    );
    describe_counter!(
        "feed_aggregator_updates_published_total",
        "Aggregated views handed to the dispatcher"
    );
    describe_counter!(
        "feed_aggregator_deliveries_total",
        "Subscriber deliveries by outcome"
    );
    describe_counter!(
        "feed_aggregator_reconnects_total",
        "Source restarts scheduled by the supervisor"
    );
    describe_gauge!(
        "feed_aggregator_source_phase",
        "Connection phase per source (0 disconnected, 1 backoff, 2 connecting, 3 degraded, 4 connected)"
    );
    describe_gauge!(
        "feed_aggregator_tracked_symbols",
        "Symbols with a live aggregated view"
    );
    describe_counter!(
        "feed_aggregator_symbols_evicted_total",
        "Symbols removed after the inactivity TTL"
    );
    describe_histogram!(
        "feed_aggregator_processing_seconds",
        "Time from frame receipt to publish"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for subscriber deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Callback returned `Ok`.
    Delivered,
    /// Callback returned an error or panicked.
    Failed,
    /// An undelivered view was replaced by a newer one.
    Coalesced,
}

impl DeliveryOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Coalesced => "coalesced",
        }
    }
}

/// Record a frame received from a source.
pub fn record_message_received(source: &SourceId) {
    counter!(
        "feed_aggregator_messages_received_total",
        "source" => source.as_str().to_string()
    )
    .increment(1);
}

/// Record a frame rejected by the source's normalizer.
pub fn record_message_rejected(source: &SourceId, reason: &'static str) {
    counter!(
        "feed_aggregator_messages_rejected_total",
        "source" => source.as_str().to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record one view published.
pub fn record_update_published() {
    counter!("feed_aggregator_updates_published_total").increment(1);
}

/// Record one delivery attempt.
pub fn record_delivery(outcome: DeliveryOutcome) {
    counter!(
        "feed_aggregator_deliveries_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a scheduled restart.
pub fn record_reconnect(source: &SourceId) {
    counter!(
        "feed_aggregator_reconnects_total",
        "source" => source.as_str().to_string()
    )
    .increment(1);
}

/// Export a source's phase.
pub fn set_source_phase(source: &SourceId, phase: ConnectionPhase) {
    gauge!(
        "feed_aggregator_source_phase",
        "source" => source.as_str().to_string()
    )
    .set(phase.gauge_value());
}

/// Export the number of tracked symbols.
#[allow(clippy::cast_precision_loss)]
pub fn set_tracked_symbols(count: usize) {
    gauge!("feed_aggregator_tracked_symbols").set(count as f64);
}

/// Record symbols evicted by a sweep.
pub fn record_symbols_evicted(count: u64) {
    counter!("feed_aggregator_symbols_evicted_total").increment(count);
}

/// Record frame processing duration.
pub fn record_processing_duration(source: &SourceId, duration: Duration) {
    histogram!(
        "feed_aggregator_processing_seconds",
        "source" => source.as_str().to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_outcome_as_str() {
        assert_eq!(DeliveryOutcome::Delivered.as_str(), "delivered");
        assert_eq!(DeliveryOutcome::Failed.as_str(), "failed");
        assert_eq!(DeliveryOutcome::Coalesced.as_str(), "coalesced");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        let source = SourceId::new("binance");
        record_message_received(&source);
        record_message_rejected(&source, "malformed");
        set_source_phase(&source, ConnectionPhase::Connected);
        record_processing_duration(&source, Duration::from_millis(3));
        set_tracked_symbols(2);
    }
}
