//! Source Definitions
//!
//! Loads [`SourceDescriptor`]s from YAML. Values may reference environment
//! variables as `${VAR}` or `${VAR:-default}`, so credentials stay out of
//! the file.
//!
//! ```yaml
//! sources:
//!   - id: binance
//!     schema: binance
//!     endpoint: wss://stream.binance.com:9443/stream
//!     history_endpoint: https://api.binance.com/api/v3/klines?symbol={symbol}&interval=1m&limit={limit}
//!     symbols:
//!       - { canonical: BTCUSD, native: BTCUSDT }
//!   - id: alpaca
//!     schema: alpaca
//!     endpoint: wss://stream.data.alpaca.markets/v2/iex
//!     credentials: { key: "${ALPACA_KEY}", secret: "${ALPACA_SECRET}" }
//!     symbols: [AAPL, MSFT]
//! ```

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::Deserialize;

use super::ConfigError;
use crate::domain::source::{Credentials, SourceDescriptor, SourceSchema, SymbolMapping, TransportKind};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransportEntry {
    #[default]
    Streaming,
    Polling,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceEntry {
    id: String,
    schema: SourceSchema,
    endpoint: String,
    #[serde(default)]
    transport: TransportEntry,
    poll_interval_ms: Option<u64>,
    expected_update_interval_ms: Option<u64>,
    history_endpoint: Option<String>,
    credentials: Option<CredentialsEntry>,
    #[serde(default)]
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CredentialsEntry {
    key: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SymbolEntry {
    Same(String),
    Mapped { canonical: String, native: String },
}

impl SourceEntry {
    fn into_descriptor(self) -> Result<SourceDescriptor, ConfigError> {
        let transport = match self.transport {
            TransportEntry::Streaming => TransportKind::Streaming,
            TransportEntry::Polling => {
                let interval = self.poll_interval_ms.filter(|&ms| ms > 0).ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "source {}: polling transport needs a positive poll_interval_ms",
                        self.id
                    ))
                })?;
                TransportKind::Polling {
                    interval: Duration::from_millis(interval),
                }
            }
        };

        let mut descriptor = SourceDescriptor::new(self.id, self.schema, self.endpoint).with_transport(transport);
        if let Some(ms) = self.expected_update_interval_ms {
            if ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "source {}: expected_update_interval_ms must be positive",
                    descriptor.id()
                )));
            }
            descriptor = descriptor.with_expected_update_interval(Duration::from_millis(ms));
        }
        if let Some(endpoint) = self.history_endpoint {
            descriptor = descriptor.with_history_endpoint(endpoint);
        }
        if let Some(credentials) = self.credentials {
            if credentials.key.is_empty() || credentials.secret.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "source {}: credentials key and secret cannot be empty",
                    descriptor.id()
                )));
            }
            descriptor = descriptor.with_credentials(Credentials::new(credentials.key, credentials.secret));
        }
        for symbol in self.symbols {
            descriptor = match symbol {
                SymbolEntry::Same(symbol) => descriptor.with_symbol(symbol),
                SymbolEntry::Mapped { canonical, native } => {
                    descriptor.with_mapping(SymbolMapping::new(canonical, native))
                }
            };
        }
        Ok(descriptor)
    }
}

/// Load source descriptors from a YAML file.
///
/// # Errors
///
/// Returns a `ConfigError` if the file cannot be read, an interpolated
/// variable is missing, or the YAML is invalid.
pub fn load_sources(path: &Path) -> Result<Vec<SourceDescriptor>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_sources_from_str(&contents)
}

/// Load source descriptors from a YAML string, interpolating from the
/// process environment.
///
/// # Errors
///
/// Same as [`load_sources`], minus I/O.
pub fn load_sources_from_str(yaml: &str) -> Result<Vec<SourceDescriptor>, ConfigError> {
    load_sources_with(yaml, |key| std::env::var(key).ok())
}

fn load_sources_with(
    yaml: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<SourceDescriptor>, ConfigError> {
    let interpolated = interpolate_env_vars(yaml, lookup)?;
    let file: SourcesFile = serde_yaml_bw::from_str(&interpolated)?;
    file.sources.into_iter().map(SourceEntry::into_descriptor).collect()
}

/// Replace `${VAR}` and `${VAR:-default}`. An unset or empty variable takes
/// its default; without a default it is an error.
#[allow(clippy::expect_used)]
fn interpolate_env_vars(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    static ENV_VAR_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = ENV_VAR_REGEX.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var regex is valid")
    });

    let mut missing = None;
    let result = re.replace_all(input, |cap: &Captures<'_>| {
        let name = &cap[1];
        match (lookup(name).filter(|v| !v.is_empty()), cap.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(result.into_owned()),
    }
}
