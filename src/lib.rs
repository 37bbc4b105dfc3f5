//! Resilience and data-integrity core for an automated trading loop: a
//! gap-aware market data cache, a provider-fallback feed with polling and
//! websocket streams, a durable kill switch, a historical-simulation VaR gate
//! and a retry/circuit-breaker wrapper for broker calls.

pub mod audit;
pub mod config;
pub mod feed;
pub mod logging;
pub mod providers;
pub mod resilience;
pub mod risk;
pub mod store;
pub mod types;

pub use audit::{AuditEvent, AuditEventKind, AuditSink, FanoutSink, LogSink, RecordingSink};
pub use config::{ConfigError, CoreConfig};
pub use feed::{
    FeedError, HistoricalQuery, MarketDataFeed, PolygonWebSocketFeed, ProviderChain,
    StreamCallbacks, StreamOptions, WebSocketOptions,
};
pub use logging::init_logging;
pub use providers::{DataProvider, HistoricalRequest, ProviderError, ProviderRegistry};
pub use resilience::{with_broker_retry, BrokerGuard, ResilienceError, RetryConfig, RetryState};
pub use risk::{pre_trade_check, KillSwitch, KillSwitchError, PortfolioVaR};
pub use store::{MarketDataStore, SnapshotStore, StoreError};
pub use types::{Bar, CacheRange, Interval, Period};
