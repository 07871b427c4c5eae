//! Reconnection Policy
//!
//! Exponential backoff for source restarts. The delay before the k-th
//! consecutive retry (k counted from zero) is
//!
//! ```text
//! delay(k) = min(base * multiplier^k, cap)
//! ```
//!
//! optionally spread by a symmetric jitter fraction. The supervisor calls
//! [`ReconnectPolicy::reset`] once a connection has stayed up long enough.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::EngineSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%). Zero disables it.
    pub jitter_factor: f64,
    /// Retries allowed before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Build from process settings.
    #[must_use]
    pub const fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            base_delay: settings.backoff_base,
            max_delay: settings.backoff_max,
            multiplier: settings.backoff_multiplier,
            jitter_factor: settings.backoff_jitter,
            max_attempts: 0,
        }
    }

    /// Un-jittered delay for retry `k`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, k: u32) -> Duration {
        let exponent = i32::try_from(k).unwrap_or(i32::MAX);
        let scaled = (self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent)).round();
        if !scaled.is_finite() || scaled >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(scaled.max(0.0) as u64)
    }
}

/// Backoff state for one source.
///
/// # Example
///
/// ```rust
/// use feed_aggregator::infrastructure::feeds::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
///
/// // Connection stayed up: start over.
/// policy.reset();
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    last_delay: Option<Duration>,
}

impl ReconnectPolicy {
    /// Create a policy with no failures recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_delay: None,
        }
    }

    /// Delay before the next retry, advancing the attempt counter.
    ///
    /// Returns `None` once `max_attempts` retries have been handed out.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        let delay = self.apply_jitter(self.config.delay_for(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = Some(delay);
        Some(delay)
    }

    /// Forget past failures.
    pub const fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
    }

    /// Retries handed out since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Most recent delay handed out.
    #[must_use]
    pub const fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt < self.config.max_attempts
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let base = delay.as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn config(base_ms: u64, max_ms: u64, multiplier: f64) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
    }

    #[test_case(0, 1_000 ; "first retry uses base")]
    #[test_case(1, 2_000 ; "second retry doubles")]
    #[test_case(5, 32_000 ; "sixth retry")]
    #[test_case(6, 60_000 ; "capped")]
    #[test_case(200, 60_000 ; "huge exponent stays capped")]
    fn delay_formula(k: u32, expected_ms: u64) {
        assert_eq!(
            config(1_000, 60_000, 2.0).delay_for(k),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn consecutive_failures_follow_formula() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000, 2.0));
        let delays: Vec<_> = (0..4).filter_map(|_| policy.next_delay()).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.attempt_count(), 4);
        assert_eq!(policy.last_delay(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::new(config(100, 10_000, 2.0));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.last_delay(), None);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn max_attempts_enforced() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            max_attempts: 2,
            ..config(100, 1_000, 2.0)
        });
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                jitter_factor: 0.1,
                ..config(1_000, 10_000, 2.0)
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1_100).contains(&millis), "delay {millis}ms outside ±10%");
        }
    }
}
