use log::{error, info, warn};
use serde_json::json;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::retry::{RetryConfig, RetryState};
use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::risk::{KillSwitch, KillSwitchError};

#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("{operation} failed after {attempts} attempt(s): {}", .errors.join(" | "))]
    Exhausted {
        operation: String,
        attempts: u32,
        errors: Vec<String>,
        breaker_tripped: bool,
    },
    #[error("{operation} refused: {source}")]
    Halted {
        operation: String,
        #[source]
        source: KillSwitchError,
    },
}

impl ResilienceError {
    pub fn breaker_tripped(&self) -> bool {
        matches!(
            self,
            ResilienceError::Exhausted {
                breaker_tripped: true,
                ..
            }
        )
    }
}

/// Run `call` with bounded retries, escalating into `kill_switch` once
/// `state` records `failure_limit` exhausted calls in a row.
pub async fn with_broker_retry<T, E, F, Fut>(
    operation: &str,
    mut call: F,
    state: &RetryState,
    kill_switch: &KillSwitch,
    config: &RetryConfig,
    sink: &dyn AuditSink,
) -> Result<T, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = config.effective_attempts();
    let mut errors = Vec::with_capacity(max_attempts as usize);

    for attempt in 1..=max_attempts {
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} recovered on attempt {}/{}", operation, attempt, max_attempts);
                    sink.emit(&AuditEvent::new(
                        AuditEventKind::Recovery,
                        json!({
                            "operation": operation,
                            "attempt": attempt,
                            "max_attempts": max_attempts,
                        }),
                    ));
                }
                state.record_success();
                return Ok(value);
            }
            Err(e) => {
                let message = e.to_string();
                let is_final = attempt == max_attempts;
                let delay = if is_final {
                    Duration::ZERO
                } else {
                    config.delay_for(attempt)
                };
                let kind = if is_final {
                    AuditEventKind::TerminalError
                } else {
                    AuditEventKind::TransientError
                };

                warn!(
                    "{} failed (attempt {}/{}): {}{}",
                    operation,
                    attempt,
                    max_attempts,
                    message,
                    if is_final {
                        String::new()
                    } else {
                        format!(", retrying in {:?}", delay)
                    }
                );
                sink.emit(&AuditEvent::new(
                    kind,
                    json!({
                        "operation": operation,
                        "attempt": attempt,
                        "max_attempts": max_attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "error": message,
                    }),
                ));
                errors.push(message);

                if !is_final {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    let failures = state.record_exhaustion();
    let mut breaker_tripped = false;
    if failures >= config.failure_limit {
        let reason = format!(
            "circuit breaker: {} exhausted {} consecutive time(s); last error: {}",
            operation,
            failures,
            errors.last().map(String::as_str).unwrap_or("unknown")
        );
        match kill_switch.trigger(&reason) {
            Ok(()) => {
                breaker_tripped = true;
                sink.emit(&AuditEvent::new(
                    AuditEventKind::CircuitBreakerHalt,
                    json!({
                        "operation": operation,
                        "consecutive_failures": failures,
                        "failure_limit": config.failure_limit,
                        "reason": reason,
                    }),
                ));
            }
            Err(e) => {
                error!("Failed to trigger kill switch after {}: {}", operation, e);
            }
        }
    }

    Err(ResilienceError::Exhausted {
        operation: operation.to_string(),
        attempts: max_attempts,
        errors,
        breaker_tripped,
    })
}

/// Bundles the shared breaker pieces a trading loop hands to every broker call site
#[derive(Clone)]
pub struct BrokerGuard {
    kill_switch: Arc<KillSwitch>,
    state: Arc<RetryState>,
    config: RetryConfig,
    sink: Arc<dyn AuditSink>,
}

impl BrokerGuard {
    pub fn new(
        kill_switch: Arc<KillSwitch>,
        state: Arc<RetryState>,
        config: RetryConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            kill_switch,
            state,
            config,
            sink,
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry-wrapped call without the kill switch pre-check (cancels, queries)
    pub async fn call<T, E, F, Fut>(&self, operation: &str, call: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        with_broker_retry(
            operation,
            call,
            &self.state,
            &self.kill_switch,
            &self.config,
            self.sink.as_ref(),
        )
        .await
    }

    /// Order submission path: refuse while halted, then retry-wrap the call
    pub async fn guarded_submit<T, E, F, Fut>(
        &self,
        operation: &str,
        call: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.kill_switch
            .check_and_raise()
            .map_err(|source| ResilienceError::Halted {
                operation: operation.to_string(),
                source,
            })?;
        self.call(operation, call).await
    }
}
