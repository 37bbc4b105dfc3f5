use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{DataProvider, HistoricalRequest, ProviderError};
use crate::types::{Interval, RawBar};

const MAX_SYNTHETIC_BARS: usize = 10_000;

/// One scripted reply
#[derive(Debug, Clone)]
pub enum MockResponse {
    Bars(Vec<RawBar>),
    Empty,
    Fail(ProviderError),
    /// Deterministic bars on interval boundaries covering the requested window
    Synthetic,
}

/// Scripted provider for tests and dry runs. Replies are popped from the
/// script in order; once it is drained every call gets the fallback reply.
#[derive(Debug)]
pub struct MockDataProvider {
    name: String,
    script: Mutex<VecDeque<MockResponse>>,
    fallback: MockResponse,
    calls: AtomicUsize,
    requests: Mutex<Vec<HistoricalRequest>>,
}

impl MockDataProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: MockResponse::Synthetic,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, response: MockResponse) -> Self {
        self.fallback = response;
        self
    }

    pub fn then(self, response: MockResponse) -> Self {
        self.push(response);
        self
    }

    pub fn push(&self, response: MockResponse) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(response);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HistoricalRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next_response(&self) -> MockResponse {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Bars on every interval boundary inside `[start, end]`
pub fn synthetic_bars(request: &HistoricalRequest) -> Result<Vec<RawBar>, ProviderError> {
    let step = Interval::parse(&request.interval)
        .and_then(|interval| interval.duration())
        .ok_or_else(|| ProviderError::UnsupportedInterval(request.interval.clone()))?
        .num_milliseconds();
    let start = request.start.timestamp_millis();
    let end = request.end.timestamp_millis();

    let mut ts = start.div_euclid(step) * step;
    if ts < start {
        ts += step;
    }

    let mut bars = Vec::new();
    while ts <= end && bars.len() < MAX_SYNTHETIC_BARS {
        let base = 100.0 + ((ts / step) % 50) as f64;
        bars.push(RawBar::from_millis(ts, base, base + 1.0, base - 1.0, base + 0.5, 1_000.0));
        ts += step;
    }
    Ok(bars)
}

#[async_trait]
impl DataProvider for MockDataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn normalize_symbol(&self, symbol: &str) -> String {
        symbol.to_string()
    }

    async fn fetch_historical(
        &self,
        request: &HistoricalRequest,
    ) -> Result<Vec<RawBar>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match self.next_response() {
            MockResponse::Bars(bars) => Ok(bars),
            MockResponse::Empty => Ok(Vec::new()),
            MockResponse::Fail(e) => Err(e),
            MockResponse::Synthetic => synthetic_bars(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn request() -> HistoricalRequest {
        HistoricalRequest::new(
            "BTC-USD",
            "1h",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_synthetic_bars_are_aligned() {
        let bars = synthetic_bars(&request()).unwrap();
        let hours: Vec<_> = bars
            .iter()
            .map(|b| b.timestamp.to_utc().unwrap())
            .collect();
        assert_eq!(
            hours,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let provider = MockDataProvider::new("mock")
            .with_fallback(MockResponse::Empty)
            .then(MockResponse::Fail(ProviderError::Transport("reset".into())))
            .then(MockResponse::Synthetic);

        assert!(provider.fetch_historical(&request()).await.is_err());
        assert_eq!(provider.fetch_historical(&request()).await.unwrap().len(), 3);
        assert!(provider.fetch_historical(&request()).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 3);
        assert_eq!(provider.requests()[0].symbol, "BTC-USD");
    }
}
