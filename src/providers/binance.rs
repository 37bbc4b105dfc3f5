use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{check_status, split_pair, DataProvider, HistoricalRequest, ProviderError};
use crate::types::{Interval, IntervalUnit, RawBar};

const KLINES_LIMIT: usize = 1000;
const MAX_PAGES: usize = 1000;

/// Binance spot klines (`GET /api/v3/klines`)
pub struct BinanceKlinesProvider {
    rest_url: String,
    http_client: Client,
    max_pages: usize,
}

impl BinanceKlinesProvider {
    pub fn new(rest_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            http_client,
            max_pages: MAX_PAGES,
        })
    }

    /// Cap on pages fetched per request; a window needing more is cut short with a warning
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn interval_param(interval: &str) -> Result<String, ProviderError> {
        let parsed = Interval::parse(interval)
            .ok_or_else(|| ProviderError::UnsupportedInterval(interval.to_string()))?;
        let supported: &[i64] = match parsed.unit() {
            IntervalUnit::Minute => &[1, 3, 5, 15, 30],
            IntervalUnit::Hour => &[1, 2, 4, 6, 8, 12],
            IntervalUnit::Day => &[1, 3],
            IntervalUnit::Week => &[1],
        };
        if !supported.contains(&parsed.magnitude()) {
            return Err(ProviderError::UnsupportedInterval(interval.to_string()));
        }
        Ok(parsed.to_string())
    }

    async fn fetch_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<RawBar>, ProviderError> {
        let url = format!("{}/api/v3/klines", self.rest_url);
        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", KLINES_LIMIT.to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<Vec<Value>> = check_status(response).await?.json().await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }
}

fn parse_kline(row: &[Value]) -> Result<RawBar, ProviderError> {
    if row.len() < 6 {
        return Err(ProviderError::Parse(format!(
            "kline has {} fields, expected at least 6",
            row.len()
        )));
    }
    let open_time = row[0]
        .as_i64()
        .ok_or_else(|| ProviderError::Parse("kline open time is not an integer".to_string()))?;
    let field = |idx: usize| -> Result<f64, ProviderError> {
        match &row[idx] {
            Value::String(s) => s
                .parse::<f64>()
                .map_err(|e| ProviderError::Parse(format!("kline field {}: {}", idx, e))),
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| ProviderError::Parse(format!("kline field {} out of range", idx))),
            other => Err(ProviderError::Parse(format!(
                "kline field {} has unexpected type: {}",
                idx, other
            ))),
        }
    };
    Ok(RawBar::from_millis(
        open_time,
        field(1)?,
        field(2)?,
        field(3)?,
        field(4)?,
        field(5)?,
    ))
}

#[async_trait]
impl DataProvider for BinanceKlinesProvider {
    fn name(&self) -> &str {
        "binance"
    }

    /// `BTC-USD` -> `BTCUSDT`, `ETH/USDC` -> `ETHUSDC`, `btcusdt` -> `BTCUSDT`
    fn normalize_symbol(&self, symbol: &str) -> String {
        match split_pair(symbol) {
            Some((base, quote)) if quote == "USD" => format!("{}USDT", base),
            Some((base, quote)) => format!("{}{}", base, quote),
            None => symbol.trim().to_uppercase(),
        }
    }

    async fn fetch_historical(
        &self,
        request: &HistoricalRequest,
    ) -> Result<Vec<RawBar>, ProviderError> {
        let ticker = self.normalize_symbol(&request.symbol);
        let interval = Self::interval_param(&request.interval)?;
        let end_ms = request.end.timestamp_millis();
        let mut cursor = request.start.timestamp_millis();
        let mut bars = Vec::new();
        let mut pages = 0;

        while cursor <= end_ms {
            if pages >= self.max_pages {
                warn!(
                    symbol = %ticker,
                    pages,
                    rows = bars.len(),
                    "kline page cap reached; result truncated before {}",
                    cursor
                );
                break;
            }
            pages += 1;
            let page = self.fetch_page(&ticker, &interval, cursor, end_ms).await?;
            let page_len = page.len();
            let last_open = match page.last() {
                Some(bar) => match bar.timestamp.to_utc() {
                    Some(ts) => ts.timestamp_millis(),
                    None => break,
                },
                None => break,
            };
            bars.extend(page);
            debug!(symbol = %ticker, rows = page_len, "fetched klines page");
            if page_len < KLINES_LIMIT {
                break;
            }
            cursor = last_open + 1;
        }

        Ok(bars)
    }
}
