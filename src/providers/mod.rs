//! Historical OHLCV providers.
//!
//! A provider takes the canonical symbol (`BTC-USD`, `AAPL`) and maps it to its
//! own ticker convention internally; callers never see provider tickers.

pub mod binance;
pub mod error;
pub mod mock;
pub mod polygon;
pub mod registry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::RawBar;

pub use binance::BinanceKlinesProvider;
pub use error::ProviderError;
pub use mock::{MockDataProvider, MockResponse};
pub use polygon::PolygonAggregatesProvider;
pub use registry::{ProviderFactory, ProviderRegistry};

/// One historical window request in canonical terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRequest {
    pub symbol: String,
    pub interval: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HistoricalRequest {
    pub fn new(
        symbol: impl Into<String>,
        interval: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            start,
            end,
        }
    }
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Label used in logs, audit events and the cache `provider` column
    fn name(&self) -> &str;

    /// Provider-specific ticker for a canonical symbol
    fn normalize_symbol(&self, symbol: &str) -> String;

    /// Bars inside `[start, end]`. No data is `Ok(vec![])`, never an error.
    async fn fetch_historical(
        &self,
        request: &HistoricalRequest,
    ) -> Result<Vec<RawBar>, ProviderError>;
}

/// Split a canonical `BASE-QUOTE` / `BASE/QUOTE` pair; plain tickers return `None`
pub(crate) fn split_pair(symbol: &str) -> Option<(String, String)> {
    let upper = symbol.trim().to_uppercase();
    let (base, quote) = upper.split_once(|c| c == '-' || c == '/')?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base.to_string(), quote.to_string()))
}

/// Map an HTTP status to the provider error taxonomy
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        return Err(ProviderError::RateLimited(body));
    }
    Err(ProviderError::Http {
        status: status.as_u16(),
        body,
    })
}
