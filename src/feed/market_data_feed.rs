use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::FeedError;
use super::fallback::{ProviderChain, ProviderFrame};
use crate::audit::{AuditEvent, AuditEventKind, AuditSink, LogSink};
use crate::config::FeedConfig;
use crate::providers::{HistoricalRequest, ProviderRegistry};
use crate::risk::KillSwitch;
use crate::store::{MarketDataStore, StoreError};
use crate::types::{Bar, Period};

/// Period used when a query carries neither dates nor a period
pub const DEFAULT_PERIOD: &str = "1mo";

/// Historical window request. Explicit dates win over `period`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalQuery {
    pub symbol: String,
    pub interval: String,
    pub period: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoricalQuery {
    pub fn period(symbol: impl Into<String>, period: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            period: Some(period.into()),
            start: None,
            end: None,
        }
    }

    pub fn range(
        symbol: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            period: None,
            start: Some(start),
            end: Some(end),
        }
    }

    /// Absolute `[start, end]` plus the window label used in the memo key
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>, String), FeedError> {
        if let Some(start) = self.start {
            let end = self.end.unwrap_or(now);
            if start > end {
                return Err(FeedError::InvalidWindow { start, end });
            }
            let label = match self.end {
                Some(end) => format!("range:{}-{}", start.timestamp_millis(), end.timestamp_millis()),
                None => format!("since:{}", start.timestamp_millis()),
            };
            return Ok((start, end, label));
        }

        let raw = self.period.as_deref().unwrap_or(DEFAULT_PERIOD);
        let period = Period::parse(raw).ok_or_else(|| FeedError::InvalidPeriod(raw.to_string()))?;
        let (start, end) = period
            .window_ending(self.end.unwrap_or(now))
            .ok_or_else(|| FeedError::InvalidPeriod(raw.to_string()))?;
        Ok((start, end, format!("period:{}", raw.trim().to_ascii_lowercase())))
    }
}

type MemoKey = (String, String, String);

/// Run a synchronous store operation on the blocking pool
async fn on_store<T, F>(store: &Arc<MarketDataStore>, operation: F) -> Result<T, FeedError>
where
    T: Send + 'static,
    F: FnOnce(&MarketDataStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(&store))
        .await
        .map_err(|e| FeedError::StoreTask(e.to_string()))?
        .map_err(FeedError::from)
}

/// Cache-first historical fetch over a provider fallback chain, plus the
/// polling stream (see `stream.rs`).
pub struct MarketDataFeed {
    pub(crate) chain: ProviderChain,
    store: Option<Arc<MarketDataStore>>,
    use_cache: bool,
    memo: DashMap<MemoKey, Arc<Vec<Bar>>>,
    pub(crate) sink: Arc<dyn AuditSink>,
    pub(crate) kill_switch: Option<Arc<KillSwitch>>,
}

impl MarketDataFeed {
    pub fn new(chain: ProviderChain) -> Self {
        Self {
            chain,
            store: None,
            use_cache: false,
            memo: DashMap::new(),
            sink: Arc::new(LogSink),
            kill_switch: None,
        }
    }

    /// Build the chain from `config` and attach `store` when caching is enabled
    pub fn from_config(
        config: &FeedConfig,
        registry: &ProviderRegistry,
        store: Option<Arc<MarketDataStore>>,
    ) -> Result<Self, FeedError> {
        let chain = ProviderChain::new(registry.build_chain(config)?)?;
        let mut feed = Self::new(chain);
        if let Some(store) = store {
            feed = feed.with_store(store);
        }
        Ok(feed.with_cache(config.use_cache))
    }

    /// Attaching a store turns caching on
    pub fn with_store(mut self, store: Arc<MarketDataStore>) -> Self {
        self.store = Some(store);
        self.use_cache = true;
        self
    }

    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.use_cache = enabled;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Trip `kill_switch` when the polling stream hits its failure limit.
    /// Without one the limit only ends the stream.
    pub fn with_kill_switch(mut self, kill_switch: Arc<KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn kill_switch(&self) -> Option<&Arc<KillSwitch>> {
        self.kill_switch.as_ref()
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    pub fn store(&self) -> Option<&Arc<MarketDataStore>> {
        self.store.as_ref()
    }

    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    pub fn clear_memo(&self) {
        self.memo.clear();
    }

    pub(crate) async fn fetch_from_chain(
        &self,
        request: &HistoricalRequest,
    ) -> Result<ProviderFrame, FeedError> {
        let frame = self.chain.fetch(request).await?;
        if frame.fell_back {
            self.sink.emit(
                &AuditEvent::new(
                    AuditEventKind::ProviderFallback,
                    json!({
                        "symbol": request.symbol,
                        "primary": self.chain.primary(),
                        "provider": frame.provider,
                        "failed": frame.failures.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
                    }),
                )
                .with_context("interval", request.interval.clone()),
            );
        }
        Ok(frame)
    }

    /// Bars for `query`, ascending by timestamp
    pub async fn fetch_historical(&self, query: &HistoricalQuery) -> Result<Vec<Bar>, FeedError> {
        let (start, end, window) = query.resolve(Utc::now())?;
        let key = (query.symbol.clone(), window, query.interval.clone());
        if let Some(hit) = self.memo.get(&key) {
            debug!(symbol = %query.symbol, window = %key.1, "memo hit");
            return Ok(hit.value().as_ref().clone());
        }

        let bars = match (&self.store, self.use_cache) {
            (Some(store), true) => self.fetch_through_cache(store, query, start, end).await?,
            _ => {
                let request = HistoricalRequest::new(&query.symbol, &query.interval, start, end);
                let frame = self.fetch_from_chain(&request).await?;
                frame
                    .bars
                    .into_iter()
                    .filter(|b| b.timestamp >= start && b.timestamp <= end)
                    .collect()
            }
        };

        self.memo.insert(key, Arc::new(bars.clone()));
        Ok(bars)
    }

    async fn fetch_through_cache(
        &self,
        store: &Arc<MarketDataStore>,
        query: &HistoricalQuery,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>, FeedError> {
        let (symbol, interval) = (query.symbol.clone(), query.interval.clone());
        let missing = on_store(store, move |store| {
            store.missing_ranges(&symbol, &interval, start, end)
        })
        .await?;
        if missing.is_empty() {
            debug!(symbol = %query.symbol, interval = %query.interval, "served entirely from cache");
        }

        for range in &missing {
            let request = HistoricalRequest::new(&query.symbol, &query.interval, range.start, range.end);
            let frame = self.fetch_from_chain(&request).await?;
            if frame.bars.is_empty() {
                continue;
            }
            let ProviderFrame { provider, bars, .. } = frame;
            let (symbol, interval, source) =
                (query.symbol.clone(), query.interval.clone(), provider.clone());
            let written = on_store(store, move |store| {
                store.put(&symbol, &interval, &bars, &source)
            })
            .await?;
            info!(
                symbol = %query.symbol,
                interval = %query.interval,
                provider = %provider,
                rows = written,
                "filled cache gap {}",
                range
            );
        }

        let (symbol, interval) = (query.symbol.clone(), query.interval.clone());
        let rows = on_store(store, move |store| store.get(&symbol, &interval, start, end)).await?;
        Ok(rows.into_iter().map(Bar::from).collect())
    }

    /// Most recent bar within `lookback`, straight from the chain (no memo, no cache)
    pub async fn fetch_latest(
        &self,
        symbol: &str,
        interval: &str,
        lookback: ChronoDuration,
    ) -> Result<Option<Bar>, FeedError> {
        let end = Utc::now();
        let request = HistoricalRequest::new(symbol, interval, end - lookback, end);
        let frame = self.fetch_from_chain(&request).await?;
        Ok(frame.bars.into_iter().last())
    }
}
