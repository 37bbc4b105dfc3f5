//! Retry and circuit-breaker wrapper for broker calls.
//!
//! Transient failures are retried with jittered exponential backoff. When a
//! call exhausts its attempts often enough in a row, the shared kill switch is
//! triggered so every process sharing the store halts.

pub mod broker;
pub mod retry;

pub use broker::{with_broker_retry, BrokerGuard, ResilienceError};
pub use retry::{exponential_backoff, RetryConfig, RetryState};
