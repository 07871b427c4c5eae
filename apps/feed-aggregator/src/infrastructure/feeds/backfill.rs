//! REST Backfill
//!
//! Fetches recent candles from a source's history endpoint to warm the
//! cache when a symbol is first seen. The endpoint template may contain
//! `{symbol}` (native name) and `{limit}` placeholders.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::application::ports::{BackfillError, HistoryProvider};
use crate::domain::market::NormalizedCandle;
use crate::domain::source::{SourceDescriptor, SymbolMapping};
use crate::infrastructure::normalizers::NormalizerRegistry;

const MAX_ERROR_BODY: usize = 256;

/// [`HistoryProvider`] over HTTP.
#[derive(Debug, Clone)]
pub struct RestBackfill {
    client: reqwest::Client,
    normalizers: Arc<NormalizerRegistry>,
    timeout: Duration,
}

impl RestBackfill {
    /// Create a provider decoding bodies with the source's normalizer.
    #[must_use]
    pub const fn new(client: reqwest::Client, normalizers: Arc<NormalizerRegistry>) -> Self {
        Self {
            client,
            normalizers,
            timeout: Duration::from_secs(15),
        }
    }

    /// Override the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Expand the endpoint template for one symbol.
fn history_url(template: &str, native_symbol: &str, limit: usize) -> String {
    template
        .replace("{symbol}", native_symbol)
        .replace("{limit}", &limit.to_string())
}

#[async_trait]
impl HistoryProvider for RestBackfill {
    async fn fetch_candles(
        &self,
        descriptor: &SourceDescriptor,
        symbol: &SymbolMapping,
        limit: usize,
    ) -> Result<Vec<NormalizedCandle>, BackfillError> {
        let template = descriptor
            .history_endpoint()
            .ok_or_else(|| BackfillError::NotConfigured(descriptor.id().clone()))?;
        let normalizer = self
            .normalizers
            .get(descriptor.id())
            .ok_or_else(|| BackfillError::UnknownSource(descriptor.id().clone()))?;
        let url = history_url(template, &symbol.native, limit);

        let mut request = self.client.get(&url).timeout(self.timeout);
        if let Some(credentials) = descriptor.credentials() {
            for (name, value) in normalizer.auth_headers(credentials) {
                request = request.header(name, value);
            }
        }

        tracing::debug!(source_id = %descriptor.id(), symbol = %symbol.canonical, %url, "Fetching history");
        let response = request
            .send()
            .await
            .map_err(|e| BackfillError::Http(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| BackfillError::Http(e.to_string()))?;
        if !status.is_success() {
            let mut text = String::from_utf8_lossy(&body).into_owned();
            if text.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0);
                text.truncate(cut);
            }
            return Err(BackfillError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let mut candles = normalizer.normalize_history(descriptor.id(), &symbol.native, &body)?;
        candles.sort_by_key(|c| c.open_time);
        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }
        for candle in &mut candles {
            candle.symbol.clone_from(&symbol.canonical);
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_placeholders_expand() {
        assert_eq!(
            history_url("https://api.binance.com/api/v3/klines?symbol={symbol}&interval=1m&limit={limit}", "BTCUSDT", 500),
            "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=1m&limit=500"
        );
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        assert_eq!(history_url("https://x/h", "A", 1), "https://x/h");
    }
}
