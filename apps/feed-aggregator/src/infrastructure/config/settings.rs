//! Engine Settings
//!
//! Process-level tunables loaded from environment variables. Every setting
//! has a default, so an empty environment yields a working configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the engine, its supervisor and its HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Port for `/health`, `/metrics` and the query endpoints.
    pub health_port: u16,
    /// YAML file listing the sources.
    pub sources_file: PathBuf,
    /// Age after which a source's contribution leaves the merge.
    pub staleness: Duration,
    /// Silence after which a symbol is evicted.
    pub symbol_ttl: Duration,
    /// Interval between eviction sweeps.
    pub sweep_interval: Duration,
    /// Candles and ticks retained per symbol.
    pub cache_capacity: usize,
    /// Candles requested per backfill.
    pub backfill_limit: usize,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Reconnect delay growth factor.
    pub backoff_multiplier: f64,
    /// Reconnect delay jitter fraction.
    pub backoff_jitter: f64,
    /// Continuous connected time that resets the backoff.
    pub stable_reset: Duration,
    /// WebSocket ping cadence.
    pub ping_interval: Duration,
    /// WebSocket pong deadline.
    pub pong_timeout: Duration,
    /// Consecutive delivery failures before a subscriber is dropped (0 = never).
    pub subscriber_failure_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_port: 8083,
            sources_file: PathBuf::from("sources.yaml"),
            staleness: Duration::from_secs(30),
            symbol_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            cache_capacity: 500,
            backfill_limit: 500,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            backoff_jitter: 0.0,
            stable_reset: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
            subscriber_failure_limit: 10,
        }
    }
}

impl EngineSettings {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if a value is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unparseable values fall back to
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if a value is out of range.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };
        let defaults = Self::default();

        let settings = Self {
            health_port: env.parse("FEED_AGGREGATOR_HEALTH_PORT", defaults.health_port),
            sources_file: lookup("FEED_AGGREGATOR_SOURCES_FILE").map_or(defaults.sources_file, PathBuf::from),
            staleness: env.secs("FEED_AGGREGATOR_STALENESS_SECS", defaults.staleness),
            symbol_ttl: env.secs("FEED_AGGREGATOR_SYMBOL_TTL_SECS", defaults.symbol_ttl),
            sweep_interval: env.secs("FEED_AGGREGATOR_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            cache_capacity: env.parse("FEED_AGGREGATOR_CACHE_CAPACITY", defaults.cache_capacity),
            backfill_limit: env.parse("FEED_AGGREGATOR_BACKFILL_LIMIT", defaults.backfill_limit),
            backoff_base: env.millis("FEED_AGGREGATOR_BACKOFF_BASE_MS", defaults.backoff_base),
            backoff_max: env.secs("FEED_AGGREGATOR_BACKOFF_MAX_SECS", defaults.backoff_max),
            backoff_multiplier: env.parse("FEED_AGGREGATOR_BACKOFF_MULTIPLIER", defaults.backoff_multiplier),
            backoff_jitter: env.parse("FEED_AGGREGATOR_BACKOFF_JITTER", defaults.backoff_jitter),
            stable_reset: env.secs("FEED_AGGREGATOR_STABLE_RESET_SECS", defaults.stable_reset),
            ping_interval: env.secs("FEED_AGGREGATOR_PING_INTERVAL_SECS", defaults.ping_interval),
            pong_timeout: env.secs("FEED_AGGREGATOR_PONG_TIMEOUT_SECS", defaults.pong_timeout),
            subscriber_failure_limit: env.parse(
                "FEED_AGGREGATOR_SUBSCRIBER_FAILURE_LIMIT",
                defaults.subscriber_failure_limit,
            ),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity == 0 {
            return Err(ConfigError::Validation("cache capacity must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() || self.ping_interval.is_zero() {
            return Err(ConfigError::Validation(
                "sweep and ping intervals must be non-zero".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "backoff multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Validation(format!(
                "backoff jitter must be in [0, 1), got {}",
                self.backoff_jitter
            )));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Validation(
                "backoff base must not exceed the backoff cap".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A referenced environment variable is unset and has no default.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// The sources file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The sources file is not valid YAML for the expected shape.
    #[error("invalid sources file: {0}")]
    Yaml(#[from] serde_yaml_bw::Error),

    /// A value is present but not acceptable.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.lookup)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineSettings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        EngineSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let settings = from_pairs(&[]).unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.health_port, 8083);
        assert_eq!(settings.staleness, Duration::from_secs(30));
        assert_eq!(settings.symbol_ttl, Duration::from_secs(300));
        assert_eq!(settings.cache_capacity, 500);
        assert_eq!(settings.subscriber_failure_limit, 10);
    }

    #[test]
    fn overrides_are_applied() {
        let settings = from_pairs(&[
            ("FEED_AGGREGATOR_HEALTH_PORT", "9000"),
            ("FEED_AGGREGATOR_SOURCES_FILE", "/etc/feeds.yaml"),
            ("FEED_AGGREGATOR_BACKOFF_BASE_MS", "250"),
            ("FEED_AGGREGATOR_BACKOFF_MULTIPLIER", "1.5"),
            ("FEED_AGGREGATOR_STALENESS_SECS", " 10 "),
        ])
        .unwrap();
        assert_eq!(settings.health_port, 9000);
        assert_eq!(settings.sources_file, PathBuf::from("/etc/feeds.yaml"));
        assert_eq!(settings.backoff_base, Duration::from_millis(250));
        assert!((settings.backoff_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(settings.staleness, Duration::from_secs(10));
    }

    #[test]
    fn unparseable_values_fall_back() {
        let settings = from_pairs(&[("FEED_AGGREGATOR_HEALTH_PORT", "not-a-port")]).unwrap();
        assert_eq!(settings.health_port, 8083);
    }

    #[test]
    fn out_of_range_values_rejected() {
        for pairs in [
            [("FEED_AGGREGATOR_CACHE_CAPACITY", "0")],
            [("FEED_AGGREGATOR_BACKOFF_MULTIPLIER", "0.5")],
            [("FEED_AGGREGATOR_BACKOFF_JITTER", "1.5")],
            [("FEED_AGGREGATOR_BACKOFF_BASE_MS", "120000")],
        ] {
            assert!(matches!(from_pairs(&pairs), Err(ConfigError::Validation(_))), "{pairs:?}");
        }
    }
}
