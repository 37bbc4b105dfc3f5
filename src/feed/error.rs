use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::providers::ProviderError;
use crate::store::StoreError;

fn summarize(attempts: &[(String, ProviderError)]) -> String {
    attempts
        .iter()
        .map(|(provider, e)| format!("{}: {}", provider, e))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("all {} provider(s) failed for {symbol}: {}", .attempts.len(), summarize(.attempts))]
    AllProvidersFailed {
        symbol: String,
        attempts: Vec<(String, ProviderError)>,
        #[source]
        last: ProviderError,
    },
    #[error("no data providers configured")]
    NoProviders,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("cache error: {0}")]
    Store(#[from] StoreError),
    #[error("cache task failed: {0}")]
    StoreTask(String),
    #[error("invalid period '{0}'")]
    InvalidPeriod(String),
    #[error("invalid window: start {start} is after end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("stream halted after {consecutive_failures} consecutive failed cycle(s) (kill switch tripped: {kill_switch_tripped})")]
    FailureLimitReached {
        consecutive_failures: u32,
        kill_switch_tripped: bool,
    },
}

impl FeedError {
    /// Providers tried, in order, when every provider failed
    pub fn providers_tried(&self) -> Vec<&str> {
        match self {
            FeedError::AllProvidersFailed { attempts, .. } => {
                attempts.iter().map(|(name, _)| name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}
