use std::sync::Arc;
use tracing::{debug, warn};

use super::error::FeedError;
use crate::providers::{DataProvider, HistoricalRequest, ProviderError};
use crate::types::{Bar, RawBar};

/// Result of one chain walk
#[derive(Debug, Clone)]
pub struct ProviderFrame {
    /// Provider that produced `bars` (or the last one consulted when empty)
    pub provider: String,
    pub bars: Vec<Bar>,
    /// True when a non-primary provider served the frame
    pub fell_back: bool,
    /// Providers that errored before the frame was produced
    pub failures: Vec<(String, ProviderError)>,
}

/// Ordered list of providers; the first non-empty frame wins
pub struct ProviderChain {
    providers: Vec<Arc<dyn DataProvider>>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>) -> Result<Self, FeedError> {
        if providers.is_empty() {
            return Err(FeedError::NoProviders);
        }
        Ok(Self { providers })
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn primary(&self) -> &str {
        self.providers.first().map(|p| p.name()).unwrap_or("none")
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Try each provider in order. Fails only when every provider returned an
    /// error; an empty answer from at least one provider is an empty frame.
    pub async fn fetch(&self, request: &HistoricalRequest) -> Result<ProviderFrame, FeedError> {
        let mut failures: Vec<(String, ProviderError)> = Vec::new();
        let mut last_empty: Option<String> = None;

        for (idx, provider) in self.providers.iter().enumerate() {
            let name = provider.name().to_string();
            match provider.fetch_historical(request).await {
                Ok(raw) => {
                    let bars = normalize_frame(&name, &request.symbol, raw);
                    if bars.is_empty() {
                        debug!(provider = %name, symbol = %request.symbol, "provider returned no rows");
                        last_empty = Some(name);
                        continue;
                    }
                    let fell_back = idx > 0;
                    if fell_back {
                        warn!(
                            provider = %name,
                            primary = %self.primary(),
                            symbol = %request.symbol,
                            "served by fallback provider; primary is degraded"
                        );
                    }
                    return Ok(ProviderFrame {
                        provider: name,
                        bars,
                        fell_back,
                        failures,
                    });
                }
                Err(e) => {
                    warn!(
                        provider = %name,
                        symbol = %request.symbol,
                        transient = e.is_transient(),
                        "provider fetch failed: {}",
                        e
                    );
                    failures.push((name, e));
                }
            }
        }

        if let Some(provider) = last_empty {
            return Ok(ProviderFrame {
                provider,
                bars: Vec::new(),
                fell_back: false,
                failures,
            });
        }

        match failures.last().map(|(_, e)| e.clone()) {
            Some(last) => Err(FeedError::AllProvidersFailed {
                symbol: request.symbol.clone(),
                attempts: failures,
                last,
            }),
            None => Err(FeedError::NoProviders),
        }
    }
}

/// Coerce a provider frame to UTC, ascending, one row per timestamp (last wins)
pub fn normalize_frame(provider: &str, symbol: &str, raw: Vec<RawBar>) -> Vec<Bar> {
    let naive = raw.iter().filter(|b| b.timestamp.is_naive()).count();
    if naive > 0 {
        warn!(
            provider = %provider,
            symbol = %symbol,
            naive_rows = naive,
            "provider returned timezone-naive timestamps; assuming UTC"
        );
    }

    let total = raw.len();
    let mut bars: Vec<Bar> = raw.into_iter().filter_map(|b| b.into_bar(symbol)).collect();
    if bars.len() < total {
        warn!(
            provider = %provider,
            symbol = %symbol,
            dropped = total - bars.len(),
            "dropped rows with out-of-range timestamps"
        );
    }

    // stable sort keeps provider order among equal timestamps, so the later row wins below
    bars.sort_by_key(|b| b.timestamp);
    let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match deduped.last_mut() {
            Some(prev) if prev.timestamp == bar.timestamp => *prev = bar,
            _ => deduped.push(bar),
        }
    }
    deduped
}
