//! Polling Transport
//!
//! Scheduled HTTP GETs for sources without a stream. The endpoint may carry
//! a `{symbol}` placeholder, in which case every poll issues one request per
//! native symbol; otherwise one request per poll. Each response body is one
//! frame.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ConnectorError, FeedTransport, FrameSink, Normalizer};
use crate::domain::market::RawPayload;
use crate::domain::source::{SourceDescriptor, TransportKind};

const SYMBOL_PLACEHOLDER: &str = "{symbol}";

/// HTTP polling transport.
#[derive(Debug, Clone)]
pub struct PollingTransport {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl Default for PollingTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl PollingTransport {
    /// Default per-request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a transport sharing `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn fetch(
        &self,
        url: &str,
        descriptor: &SourceDescriptor,
        normalizer: &dyn Normalizer,
    ) -> Result<RawPayload, ConnectorError> {
        let mut request = self.client.get(url).timeout(self.request_timeout);
        if let Some(credentials) = descriptor.credentials() {
            for (name, value) in normalizer.auth_headers(credentials) {
                request = request.header(name, value);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ConnectorError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        Ok(match String::from_utf8(body.to_vec()) {
            Ok(text) => RawPayload::Text(text),
            Err(e) => RawPayload::Binary(e.into_bytes()),
        })
    }
}

/// URLs requested on every poll.
fn poll_urls(descriptor: &SourceDescriptor) -> Vec<String> {
    let endpoint = descriptor.endpoint();
    if !endpoint.contains(SYMBOL_PLACEHOLDER) {
        return vec![endpoint.to_string()];
    }
    descriptor
        .native_symbols()
        .map(|symbol| endpoint.replace(SYMBOL_PLACEHOLDER, symbol))
        .collect()
}

#[async_trait]
impl FeedTransport for PollingTransport {
    async fn run_session(
        &self,
        descriptor: &SourceDescriptor,
        normalizer: &dyn Normalizer,
        sink: &dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectorError> {
        let TransportKind::Polling { interval } = descriptor.transport() else {
            return Err(ConnectorError::Protocol(format!(
                "source {} is not configured for polling",
                descriptor.id()
            )));
        };
        let urls = poll_urls(descriptor);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut announced = false;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            for url in &urls {
                let payload = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    result = self.fetch(url, descriptor, normalizer) => result?,
                };
                if !announced {
                    sink.connected();
                    announced = true;
                }
                sink.deliver(payload).await?;
            }
            tracing::trace!(source_id = %descriptor.id(), requests = urls.len(), "Poll complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::source::{SourceSchema, SymbolMapping};

    #[test]
    fn urls_substitute_native_symbols() {
        let descriptor = SourceDescriptor::new(
            "binance-rest",
            SourceSchema::Binance,
            "https://api.binance.com/api/v3/ticker/24hr?symbol={symbol}",
        )
        .with_mapping(SymbolMapping::new("BTCUSD", "BTCUSDT"))
        .with_symbol("ETHUSDT");

        assert_eq!(
            poll_urls(&descriptor),
            vec![
                "https://api.binance.com/api/v3/ticker/24hr?symbol=BTCUSDT".to_string(),
                "https://api.binance.com/api/v3/ticker/24hr?symbol=ETHUSDT".to_string(),
            ]
        );
    }

    #[test]
    fn endpoint_without_placeholder_is_polled_once() {
        let descriptor = SourceDescriptor::new("k", SourceSchema::Kraken, "https://x/ticker")
            .with_symbol("A")
            .with_symbol("B");
        assert_eq!(poll_urls(&descriptor), vec!["https://x/ticker".to_string()]);
    }
}
