//! Configuration for the data/risk core.
//!
//! Every section has defaults, so an empty JSON object is a valid config.
//! Durations are plain millisecond/second numbers here; the runtime option
//! types convert them with `From` impls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub feed: FeedConfig,
    pub stream: StreamConfig,
    pub websocket: WebSocketConfig,
    pub resilience: ResilienceConfig,
    pub risk: VarConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file holding the OHLCV cache and the kill switch record
    pub db_path: PathBuf,
    /// Root of the monthly Parquet snapshots; `None` disables them
    pub snapshot_dir: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/trade_guard.db"),
            snapshot_dir: Some(PathBuf::from("data/snapshots")),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub primary_provider: String,
    pub fallback_providers: Vec<String>,
    pub use_cache: bool,
    pub binance_rest_url: String,
    pub polygon_rest_url: String,
    pub polygon_api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            primary_provider: "binance".to_string(),
            fallback_providers: vec!["polygon".to_string()],
            use_cache: true,
            binance_rest_url: "https://api.binance.com".to_string(),
            polygon_rest_url: "https://api.polygon.io".to_string(),
            polygon_api_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub interval_secs: u64,
    pub bar_interval: String,
    pub lookback_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub max_consecutive_failure_cycles: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            bar_interval: "1m".to_string(),
            lookback_secs: 3_600,
            backoff_base_secs: 5,
            backoff_max_secs: 300,
            max_consecutive_failure_cycles: Some(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub url: String,
    pub event_type: String,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "wss://socket.polygon.io/stocks".to_string(),
            event_type: "AM".to_string(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub failure_limit: u32,
    pub skip_retries: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
            failure_limit: 3,
            skip_retries: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VarConfig {
    pub window: usize,
    pub confidence: f64,
    /// Maximum tolerated 95% VaR as a fraction; `<= 0` disables the gate
    pub max_var_pct: f64,
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            window: 252,
            confidence: 0.95,
            max_var_pct: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
    /// Per-module overrides, e.g. `{"trade_guard::feed": "debug"}`
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            module_levels: BTreeMap::new(),
        }
    }
}

impl CoreConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRADE_GUARD_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TRADE_GUARD_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("TRADE_GUARD_SNAPSHOT_DIR") {
            self.store.snapshot_dir = if dir.is_empty() {
                None
            } else {
                Some(PathBuf::from(dir))
            };
        }
        if let Some(provider) = lookup("TRADE_GUARD_PRIMARY_PROVIDER") {
            self.feed.primary_provider = provider;
        }
        if let Some(level) = lookup("TRADE_GUARD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(key) = lookup("TRADE_GUARD_POLYGON_API_KEY") {
            self.feed.polygon_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resilience.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "resilience.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.resilience.failure_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "resilience.failure_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.risk.confidence > 0.0 && self.risk.confidence < 1.0) {
            return Err(ConfigError::Invalid {
                field: "risk.confidence",
                reason: format!("{} is outside (0, 1)", self.risk.confidence),
            });
        }
        if self.risk.window == 0 {
            return Err(ConfigError::Invalid {
                field: "risk.window",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stream.backoff_max_secs < self.stream.backoff_base_secs {
            return Err(ConfigError::Invalid {
                field: "stream.backoff_max_secs",
                reason: "must not be smaller than backoff_base_secs".to_string(),
            });
        }
        if self.websocket.reconnect_max_ms < self.websocket.reconnect_base_ms {
            return Err(ConfigError::Invalid {
                field: "websocket.reconnect_max_ms",
                reason: "must not be smaller than reconnect_base_ms".to_string(),
            });
        }
        if self.feed.primary_provider.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "feed.primary_provider",
                reason: "must name a provider".to_string(),
            });
        }
        Ok(())
    }
}
