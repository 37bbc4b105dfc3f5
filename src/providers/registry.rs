use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    BinanceKlinesProvider, DataProvider, MockDataProvider, PolygonAggregatesProvider,
    ProviderError,
};
use crate::config::FeedConfig;

pub type ProviderFactory =
    Box<dyn Fn(&FeedConfig) -> Result<Arc<dyn DataProvider>, ProviderError> + Send + Sync>;

/// Maps provider identifiers to constructors. Unknown identifiers are an
/// error; there is no implicit default provider.
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `binance`, `polygon` and `mock`
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("binance", |config: &FeedConfig| {
            let provider = BinanceKlinesProvider::new(
                config.binance_rest_url.clone(),
                Duration::from_millis(config.request_timeout_ms),
            )?;
            Ok(Arc::new(provider) as Arc<dyn DataProvider>)
        });
        registry.register("polygon", |config: &FeedConfig| {
            let api_key = config.polygon_api_key.clone().unwrap_or_default();
            if api_key.is_empty() {
                warn!("Polygon provider configured without an API key");
            }
            let provider = PolygonAggregatesProvider::new(
                config.polygon_rest_url.clone(),
                api_key,
                Duration::from_millis(config.request_timeout_ms),
            )?;
            Ok(Arc::new(provider) as Arc<dyn DataProvider>)
        });
        registry.register("mock", |_: &FeedConfig| {
            Ok(Arc::new(MockDataProvider::new("mock")) as Arc<dyn DataProvider>)
        });
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&FeedConfig) -> Result<Arc<dyn DataProvider>, ProviderError> + Send + Sync + 'static,
    {
        self.factories
            .insert(id.trim().to_ascii_lowercase(), Box::new(factory));
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn build(&self, id: &str, config: &FeedConfig) -> Result<Arc<dyn DataProvider>, ProviderError> {
        let key = id.trim().to_ascii_lowercase();
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| ProviderError::UnknownProvider(id.to_string()))?;
        factory(config)
    }

    /// Primary first, then fallbacks in order. Duplicates are dropped.
    pub fn build_chain(&self, config: &FeedConfig) -> Result<Vec<Arc<dyn DataProvider>>, ProviderError> {
        let mut seen: Vec<String> = Vec::new();
        let mut chain = Vec::new();
        for id in std::iter::once(&config.primary_provider).chain(config.fallback_providers.iter()) {
            let key = id.trim().to_ascii_lowercase();
            if seen.contains(&key) {
                warn!("Provider '{}' listed more than once; ignoring duplicate", id);
                continue;
            }
            chain.push(self.build(&key, config)?);
            seen.push(key);
        }
        info!("Provider chain: {}", seen.join(" -> "));
        Ok(chain)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
