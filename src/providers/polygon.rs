use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{check_status, split_pair, DataProvider, HistoricalRequest, ProviderError};
use crate::types::{Interval, IntervalUnit, RawBar};

/// `next_url` pages followed per request before the result is cut short
const MAX_PAGES: usize = 100;

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Option<Vec<AggregateBar>>,
    #[serde(default)]
    error: Option<String>,
    /// Set when `limit` truncated the response; carries the cursor but not the key
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AggregateBar {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

/// Polygon.io aggregates (`GET /v2/aggs/ticker/{ticker}/range/...`)
pub struct PolygonAggregatesProvider {
    rest_url: String,
    api_key: String,
    http_client: Client,
}

impl PolygonAggregatesProvider {
    pub fn new(
        rest_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client,
        })
    }

    fn timespan(interval: &str) -> Result<(i64, &'static str), ProviderError> {
        let parsed = Interval::parse(interval)
            .ok_or_else(|| ProviderError::UnsupportedInterval(interval.to_string()))?;
        let span = match parsed.unit() {
            IntervalUnit::Minute => "minute",
            IntervalUnit::Hour => "hour",
            IntervalUnit::Day => "day",
            IntervalUnit::Week => "week",
        };
        Ok((parsed.magnitude(), span))
    }

    async fn fetch_page(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<AggregatesResponse, ProviderError> {
        let response = request.query(&[("apiKey", self.api_key.as_str())]).send().await?;
        let body: AggregatesResponse = check_status(response).await?.json().await?;
        if body.status.as_deref() == Some("ERROR") {
            return Err(ProviderError::Other(
                body.error.unwrap_or_else(|| "polygon returned status ERROR".to_string()),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl DataProvider for PolygonAggregatesProvider {
    fn name(&self) -> &str {
        "polygon"
    }

    /// Crypto pairs take the `X:` prefix (`BTC-USD` -> `X:BTCUSD`); equities are upper-cased
    fn normalize_symbol(&self, symbol: &str) -> String {
        match split_pair(symbol) {
            Some((base, quote)) => format!("X:{}{}", base, quote),
            None => symbol.trim().to_uppercase(),
        }
    }

    async fn fetch_historical(
        &self,
        request: &HistoricalRequest,
    ) -> Result<Vec<RawBar>, ProviderError> {
        let ticker = self.normalize_symbol(&request.symbol);
        let (multiplier, timespan) = Self::timespan(&request.interval)?;
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.rest_url,
            ticker,
            multiplier,
            timespan,
            request.start.timestamp_millis(),
            request.end.timestamp_millis()
        );

        let first = self.http_client.get(&url).query(&[
            ("adjusted", "true"),
            ("sort", "asc"),
            ("limit", "50000"),
        ]);
        let mut body = self.fetch_page(first).await?;
        let mut bars: Vec<RawBar> = Vec::new();
        let mut pages = 1;

        loop {
            bars.extend(
                body.results
                    .take()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|a| RawBar::from_millis(a.t, a.o, a.h, a.l, a.c, a.v)),
            );
            let next_url = match body.next_url.take() {
                Some(next_url) => next_url,
                None => break,
            };
            if pages >= MAX_PAGES {
                warn!(
                    symbol = %ticker,
                    pages,
                    rows = bars.len(),
                    "polygon page cap reached; result truncated"
                );
                break;
            }
            body = self.fetch_page(self.http_client.get(&next_url)).await?;
            pages += 1;
        }

        debug!(symbol = %ticker, rows = bars.len(), pages, "fetched polygon aggregates");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_normalisation() {
        let p = PolygonAggregatesProvider::new("http://localhost", "key", Duration::from_secs(1))
            .unwrap();
        assert_eq!(p.normalize_symbol("BTC-USD"), "X:BTCUSD");
        assert_eq!(p.normalize_symbol("aapl"), "AAPL");
    }

    #[test]
    fn test_timespan() {
        assert_eq!(PolygonAggregatesProvider::timespan("5m").unwrap(), (5, "minute"));
        assert_eq!(PolygonAggregatesProvider::timespan("1d").unwrap(), (1, "day"));
        assert!(PolygonAggregatesProvider::timespan("1mo").is_err());
    }

    #[test]
    fn test_response_without_results_is_empty() {
        let body: AggregatesResponse =
            serde_json::from_str(r#"{"status":"OK","resultsCount":0}"#).unwrap();
        assert!(body.results.is_none());
    }
}
