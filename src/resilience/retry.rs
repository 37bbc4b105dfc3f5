use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::ResilienceConfig;

/// `min(max, base * 2^(n-1))` for `n >= 1`; saturates at `max` on overflow
pub fn exponential_backoff(base: Duration, max: Duration, n: u32) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.checked_pow(n - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    /// Consecutive exhausted calls before the kill switch is triggered
    pub failure_limit: u32,
    /// Force a single attempt (useful for order paths that must not repeat)
    pub skip_retries: bool,
}

impl RetryConfig {
    pub fn effective_attempts(&self) -> u32 {
        if self.skip_retries {
            1
        } else {
            self.max_attempts.max(1)
        }
    }

    /// Backoff before the attempt following `attempt` (1-based), jitter excluded
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.base_delay, self.max_delay, attempt)
    }

    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        self.base_backoff(attempt) + sample_jitter(self.jitter)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        ResilienceConfig::default().into()
    }
}

impl From<ResilienceConfig> for RetryConfig {
    fn from(config: ResilienceConfig) -> Self {
        Self::from(&config)
    }
}

impl From<&ResilienceConfig> for RetryConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            failure_limit: config.failure_limit,
            skip_retries: config.skip_retries,
        }
    }
}

// Kept synchronous so the thread-local RNG never lives across an await.
fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let micros = rand::thread_rng().gen_range(0..=max.as_micros() as u64);
    Duration::from_micros(micros)
}

/// Shared breaker state. One instance per "breaker" the caller wants; pass it
/// by reference (or `Arc`) to every call site that should count together.
#[derive(Debug, Default)]
pub struct RetryState {
    consecutive_failures: AtomicU32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Returns the new consecutive failure count
    pub(crate) fn record_exhaustion(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub fn reset(&self) {
        self.record_success();
    }
}
