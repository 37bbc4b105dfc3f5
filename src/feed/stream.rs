//! Polling bar stream with per-symbol isolation and whole-cycle backoff.

use chrono::Duration as ChronoDuration;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::FeedError;
use super::market_data_feed::MarketDataFeed;
use crate::audit::{AuditEvent, AuditEventKind};
use crate::config::StreamConfig;
use crate::resilience::exponential_backoff;
use crate::types::Bar;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    /// Sleep between successful cycles
    pub interval: Duration,
    /// Bar interval requested from providers, e.g. `1m`
    pub bar_interval: String,
    /// How far back each cycle looks for the latest bar
    pub lookback: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_consecutive_failure_cycles: Option<u32>,
    /// Stop after this many cycles (tests, orderly shutdown)
    pub max_cycles: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamConfig::default().into()
    }
}

impl From<StreamConfig> for StreamOptions {
    fn from(config: StreamConfig) -> Self {
        Self::from(&config)
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            bar_interval: config.bar_interval.clone(),
            lookback: Duration::from_secs(config.lookback_secs),
            backoff_base: Duration::from_secs(config.backoff_base_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
            max_consecutive_failure_cycles: config.max_consecutive_failure_cycles,
            max_cycles: None,
        }
    }
}

/// `min(backoff_max, backoff_base * 2^(failures-1))`
pub fn backoff_delay(base: Duration, max: Duration, consecutive_failures: u32) -> Duration {
    exponential_backoff(base, max, consecutive_failures.max(1))
}

pub type BarCallback = Box<dyn FnMut(&Bar) + Send>;
pub type EventCallback = Box<dyn FnMut(&AuditEvent) + Send>;

/// `on_bar` receives every bar; heartbeat and recovery events go to
/// `on_heartbeat`; symbol errors, backoff and the failure limit go to `on_error`.
pub struct StreamCallbacks {
    on_bar: BarCallback,
    on_heartbeat: Option<EventCallback>,
    on_error: Option<EventCallback>,
}

impl StreamCallbacks {
    pub fn new(on_bar: impl FnMut(&Bar) + Send + 'static) -> Self {
        Self {
            on_bar: Box::new(on_bar),
            on_heartbeat: None,
            on_error: None,
        }
    }

    pub fn on_heartbeat(mut self, callback: impl FnMut(&AuditEvent) + Send + 'static) -> Self {
        self.on_heartbeat = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnMut(&AuditEvent) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub(crate) fn bar(&mut self, bar: &Bar) {
        (self.on_bar)(bar);
    }

    pub(crate) fn heartbeat(&mut self, event: &AuditEvent) {
        if let Some(callback) = self.on_heartbeat.as_mut() {
            callback(event);
        }
    }

    pub(crate) fn error(&mut self, event: &AuditEvent) {
        if let Some(callback) = self.on_error.as_mut() {
            callback(event);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub cycles: u64,
    pub bars: u64,
    pub failed_cycles: u64,
    pub symbol_errors: u64,
}

/// What a spawned stream sends over its channel
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Bar(Bar),
    Event(AuditEvent),
}

impl MarketDataFeed {
    fn stream_event(&self, callbacks: &mut StreamCallbacks, event: AuditEvent) {
        self.sink.emit(&event);
        match event.kind {
            AuditEventKind::Heartbeat | AuditEventKind::Recovered => callbacks.heartbeat(&event),
            _ => callbacks.error(&event),
        }
    }

    /// Trip the attached kill switch, if any. Returns whether it was tripped.
    fn escalate_failure_limit(&self, symbols: &[String], consecutive_failures: u32) -> bool {
        let kill_switch = match &self.kill_switch {
            Some(kill_switch) => kill_switch,
            None => return false,
        };
        let reason = format!(
            "stream failure limit: {} consecutive cycle(s) without bars for [{}]",
            consecutive_failures,
            symbols.join(", ")
        );
        match kill_switch.trigger(&reason) {
            Ok(()) => true,
            Err(e) => {
                error!("failed to trigger kill switch after stream failure limit: {}", e);
                false
            }
        }
    }

    /// Poll `symbols` until `max_cycles` is reached or the failure limit trips.
    ///
    /// Hitting the failure limit ends the stream; with a kill switch attached
    /// (`with_kill_switch`) it also halts trading. A cycle always runs to completion; the bound is checked between cycles.
    pub async fn stream(
        &self,
        symbols: &[String],
        callbacks: &mut StreamCallbacks,
        options: &StreamOptions,
    ) -> Result<StreamSummary, FeedError> {
        let lookback = ChronoDuration::from_std(options.lookback)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut summary = StreamSummary::default();
        let mut consecutive_failures: u32 = 0;

        info!(
            symbols = symbols.len(),
            interval_secs = options.interval.as_secs(),
            "starting polling stream"
        );

        loop {
            if let Some(max) = options.max_cycles {
                if summary.cycles >= max {
                    break;
                }
            }
            summary.cycles += 1;
            let cycle = summary.cycles;
            let mut produced: u64 = 0;

            for symbol in symbols {
                let outcome = self
                    .fetch_latest(symbol, &options.bar_interval, lookback)
                    .await;
                match outcome {
                    Ok(Some(bar)) => {
                        debug!(symbol = %symbol, ts = %bar.timestamp, "bar");
                        callbacks.bar(&bar);
                        produced += 1;
                    }
                    other => {
                        let message = match other {
                            Err(e) => e.to_string(),
                            _ => "no data returned".to_string(),
                        };
                        warn!(symbol = %symbol, cycle, "symbol fetch failed: {}", message);
                        summary.symbol_errors += 1;
                        self.stream_event(
                            callbacks,
                            AuditEvent::new(
                                AuditEventKind::SymbolError,
                                json!({ "symbol": symbol, "cycle": cycle, "error": message }),
                            ),
                        );
                    }
                }
            }

            let last_cycle = options.max_cycles.map_or(false, |max| cycle >= max);

            if produced > 0 {
                summary.bars += produced;
                self.stream_event(
                    callbacks,
                    AuditEvent::new(
                        AuditEventKind::Heartbeat,
                        json!({ "cycle": cycle, "bars": produced }),
                    ),
                );
                if consecutive_failures > 0 {
                    info!(cycle, after = consecutive_failures, "stream recovered");
                    self.stream_event(
                        callbacks,
                        AuditEvent::new(
                            AuditEventKind::Recovered,
                            json!({
                                "cycle": cycle,
                                "bars": produced,
                                "after_failed_cycles": consecutive_failures,
                            }),
                        ),
                    );
                }
                consecutive_failures = 0;
                if last_cycle {
                    break;
                }
                tokio::time::sleep(options.interval).await;
            } else {
                consecutive_failures += 1;
                summary.failed_cycles += 1;

                if let Some(limit) = options.max_consecutive_failure_cycles {
                    if consecutive_failures >= limit {
                        error!(cycle, consecutive_failures, "stream failure limit reached");
                        self.stream_event(
                            callbacks,
                            AuditEvent::new(
                                AuditEventKind::FailureLimitReached,
                                json!({
                                    "cycle": cycle,
                                    "consecutive_failures": consecutive_failures,
                                    "limit": limit,
                                }),
                            ),
                        );
                        let kill_switch_tripped = self.escalate_failure_limit(symbols, consecutive_failures);
                        return Err(FeedError::FailureLimitReached {
                            consecutive_failures,
                            kill_switch_tripped,
                        });
                    }
                }

                let delay = backoff_delay(options.backoff_base, options.backoff_max, consecutive_failures);
                warn!(cycle, consecutive_failures, delay_secs = delay.as_secs_f64(), "no bars this cycle; backing off");
                self.stream_event(
                    callbacks,
                    AuditEvent::new(
                        AuditEventKind::Backoff,
                        json!({
                            "cycle": cycle,
                            "consecutive_failures": consecutive_failures,
                            "delay_ms": delay.as_millis() as u64,
                        }),
                    ),
                );
                if last_cycle {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        }

        Ok(summary)
    }
}

/// Run `feed.stream` on its own task, forwarding bars and events over a channel
pub fn spawn_stream(
    feed: Arc<MarketDataFeed>,
    symbols: Vec<String>,
    options: StreamOptions,
) -> (
    JoinHandle<Result<StreamSummary, FeedError>>,
    mpsc::UnboundedReceiver<StreamMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let bar_tx = tx.clone();
    let heartbeat_tx = tx.clone();
    let error_tx = tx;

    let handle = tokio::spawn(async move {
        let mut callbacks = StreamCallbacks::new(move |bar: &Bar| {
            let _ = bar_tx.send(StreamMessage::Bar(bar.clone()));
        })
        .on_heartbeat(move |event: &AuditEvent| {
            let _ = heartbeat_tx.send(StreamMessage::Event(event.clone()));
        })
        .on_error(move |event: &AuditEvent| {
            let _ = error_tx.send(StreamMessage::Event(event.clone()));
        });
        feed.stream(&symbols, &mut callbacks, &options).await
    });

    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, max, 7), Duration::from_secs(300));
        assert_eq!(backoff_delay(base, max, 0), Duration::from_secs(5));
    }

    #[test]
    fn test_options_from_config() {
        let options = StreamOptions::default();
        assert_eq!(options.interval, Duration::from_secs(60));
        assert_eq!(options.backoff_base, Duration::from_secs(5));
        assert_eq!(options.backoff_max, Duration::from_secs(300));
        assert_eq!(options.bar_interval, "1m");
        assert!(options.max_cycles.is_none());
    }
}
