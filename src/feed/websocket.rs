//! Persistent-connection bar feed (Polygon aggregate-minute channel).

use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::stream::StreamCallbacks;
use crate::audit::{AuditEvent, AuditEventKind, AuditSink, LogSink};
use crate::config::WebSocketConfig;
use crate::resilience::exponential_backoff;
use crate::types::Bar;

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("gave up after {attempts} reconnect attempt(s): {last_error}")]
    ReconnectsExhausted { attempts: u32, last_error: String },
    #[error("authentication rejected: {0}")]
    AuthFailed(String),
    #[error("no symbols to subscribe")]
    NoSymbols,
}

/// Per-message problems; logged and skipped, never fatal
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("bar for {symbol} has no start time")]
    MissingTimestamp { symbol: String },
    #[error("bar for {symbol} has invalid start time {millis}")]
    InvalidTimestamp { symbol: String, millis: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketOptions {
    pub url: String,
    /// Channel prefix and `ev` value of interest, e.g. `AM`
    pub event_type: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    /// Stop after this many inbound text frames (tests, orderly shutdown)
    pub max_messages: Option<u64>,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        WebSocketConfig::default().into()
    }
}

impl From<WebSocketConfig> for WebSocketOptions {
    fn from(config: WebSocketConfig) -> Self {
        Self::from(&config)
    }
}

impl From<&WebSocketConfig> for WebSocketOptions {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            event_type: config.event_type.clone(),
            reconnect_base: Duration::from_millis(config.reconnect_base_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_messages: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebSocketSummary {
    pub connections: u32,
    pub messages: u64,
    pub bars: u64,
    pub skipped_messages: u64,
}

/// Fields of an aggregate element; read only after `ev` and `sym` matched
#[derive(Debug, Deserialize)]
struct WireBar {
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
    /// bar start, epoch millis
    #[serde(default)]
    s: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    ev: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Matching bars from one inbound batch, plus the matching elements that could not be read
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub bars: Vec<Bar>,
    pub skipped: Vec<MessageError>,
}

fn batch_items(text: &str) -> Result<Vec<Value>, MessageError> {
    Ok(match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => items,
        single => vec![single],
    })
}

fn parse_bar(symbol: &str, item: Value) -> Result<Bar, MessageError> {
    let wire: WireBar = serde_json::from_value(item)?;
    let millis = wire.s.ok_or_else(|| MessageError::MissingTimestamp {
        symbol: symbol.to_string(),
    })?;
    let timestamp = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        MessageError::InvalidTimestamp {
            symbol: symbol.to_string(),
            millis,
        }
    })?;
    Ok(Bar::new(symbol, timestamp, wire.o, wire.h, wire.l, wire.c, wire.v))
}

/// Bars in one inbound batch that match `event_type` and a subscribed symbol.
/// `symbols` maps the wire ticker to the canonical symbol.
///
/// Only a frame that is not JSON at all is an error. Elements of other event
/// types are never decoded; a matching element that fails to decode is
/// reported in `skipped` without affecting its neighbours.
pub fn parse_batch(
    text: &str,
    event_type: &str,
    symbols: &HashMap<String, String>,
) -> Result<ParsedBatch, MessageError> {
    let mut batch = ParsedBatch::default();
    for item in batch_items(text)? {
        if item.get("ev").and_then(Value::as_str) != Some(event_type) {
            continue;
        }
        let canonical = match item
            .get("sym")
            .and_then(Value::as_str)
            .and_then(|sym| symbols.get(sym))
        {
            Some(canonical) => canonical,
            None => continue,
        };
        match parse_bar(canonical, item) {
            Ok(bar) => batch.bars.push(bar),
            Err(e) => batch.skipped.push(e),
        }
    }
    Ok(batch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthStatus {
    Accepted,
    Rejected(String),
}

/// `auth_failed` is fatal and `auth_success` marks the session as live;
/// other status frames are informational
fn auth_status(text: &str) -> Option<AuthStatus> {
    let statuses: Vec<WireStatus> = batch_items(text)
        .ok()?
        .into_iter()
        .filter_map(|item| serde_json::from_value::<WireStatus>(item).ok())
        .filter(|status| status.ev == "status")
        .collect();

    if let Some(failed) = statuses
        .iter()
        .find(|s| s.status.as_deref() == Some("auth_failed"))
    {
        let reason = failed.message.clone().unwrap_or_else(|| "auth_failed".to_string());
        return Some(AuthStatus::Rejected(reason));
    }
    statuses
        .iter()
        .any(|s| s.status.as_deref() == Some("auth_success"))
        .then_some(AuthStatus::Accepted)
}

pub struct PolygonWebSocketFeed {
    api_key: String,
    options: WebSocketOptions,
    sink: Arc<dyn AuditSink>,
    status: ConnectionStatus,
}

impl PolygonWebSocketFeed {
    pub fn new(api_key: impl Into<String>, options: WebSocketOptions) -> Self {
        Self {
            api_key: api_key.into(),
            options,
            sink: Arc::new(LogSink),
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn options(&self) -> &WebSocketOptions {
        &self.options
    }

    fn wire_symbol(symbol: &str) -> String {
        symbol.trim().to_uppercase()
    }

    /// Connect, subscribe and deliver bars until `max_messages` is reached.
    ///
    /// Connection-level failures reconnect the whole session with backoff.
    /// The attempt counter resets only after a connection was accepted
    /// (`auth_success`) or delivered a bar, so a server that accepts and
    /// immediately drops still exhausts the attempts.
    pub async fn run(
        &mut self,
        symbols: &[String],
        callbacks: &mut StreamCallbacks,
    ) -> Result<WebSocketSummary, WebSocketError> {
        if symbols.is_empty() {
            return Err(WebSocketError::NoSymbols);
        }
        let symbol_map: HashMap<String, String> = symbols
            .iter()
            .map(|s| (Self::wire_symbol(s), s.clone()))
            .collect();
        let channels = symbol_map
            .keys()
            .map(|s| format!("{}.{}", self.options.event_type, s))
            .collect::<Vec<_>>()
            .join(",");

        let mut summary = WebSocketSummary::default();
        let mut attempts: u32 = 0;

        loop {
            self.status = ConnectionStatus::Connecting;
            let (live, last_error) = match connect_async(self.options.url.as_str()).await {
                Ok((ws, _)) => {
                    self.status = ConnectionStatus::Connected;
                    summary.connections += 1;
                    info!(url = %self.options.url, channels = %channels, "websocket connected");
                    let (mut write, mut read) = ws.split();

                    let auth = json!({ "action": "auth", "params": self.api_key });
                    let subscribe = json!({ "action": "subscribe", "params": channels });
                    let handshake = async {
                        write.send(Message::Text(auth.to_string())).await?;
                        write.send(Message::Text(subscribe.to_string())).await
                    };

                    let handshake_result = handshake.await;
                    match handshake_result {
                        Err(e) => (false, format!("handshake failed: {}", e)),
                        Ok(()) => {
                            let mut live = false;
                            let mut last_error = "connection closed by server".to_string();
                            while let Some(frame) = read.next().await {
                                match frame {
                                    Ok(Message::Text(text)) => {
                                        summary.messages += 1;
                                        match auth_status(&text) {
                                            Some(AuthStatus::Rejected(reason)) => {
                                                self.status = ConnectionStatus::Failed;
                                                error!("websocket authentication failed: {}", reason);
                                                return Err(WebSocketError::AuthFailed(reason));
                                            }
                                            Some(AuthStatus::Accepted) => live = true,
                                            None => {}
                                        }
                                        if self.handle_text(&text, &symbol_map, callbacks, &mut summary) > 0 {
                                            live = true;
                                        }
                                        if self
                                            .options
                                            .max_messages
                                            .map_or(false, |max| summary.messages >= max)
                                        {
                                            let _ = write.send(Message::Close(None)).await;
                                            self.status = ConnectionStatus::Disconnected;
                                            return Ok(summary);
                                        }
                                    }
                                    Ok(Message::Ping(payload)) => {
                                        if let Err(e) = write.send(Message::Pong(payload)).await {
                                            last_error = format!("pong failed: {}", e);
                                            break;
                                        }
                                    }
                                    Ok(Message::Close(_)) => break,
                                    Ok(_) => {}
                                    Err(e) => {
                                        last_error = e.to_string();
                                        break;
                                    }
                                }
                            }
                            (live, last_error)
                        }
                    }
                }
                Err(e) => (false, format!("connect failed: {}", e)),
            };

            if live {
                attempts = 0;
            }
            attempts += 1;
            warn!(attempt = attempts, "websocket disconnected: {}", last_error);

            if attempts > self.options.max_reconnect_attempts {
                self.status = ConnectionStatus::Failed;
                let attempts = attempts - 1;
                error!(attempts, "websocket reconnect attempts exhausted");
                self.sink.emit(&AuditEvent::new(
                    AuditEventKind::WsReconnectsExhausted,
                    json!({ "attempts": attempts, "error": last_error }),
                ));
                return Err(WebSocketError::ReconnectsExhausted {
                    attempts,
                    last_error,
                });
            }

            self.status = ConnectionStatus::Reconnecting;
            let delay = exponential_backoff(
                self.options.reconnect_base,
                self.options.reconnect_max,
                attempts,
            );
            self.sink.emit(&AuditEvent::new(
                AuditEventKind::WsReconnect,
                json!({
                    "attempt": attempts,
                    "max_attempts": self.options.max_reconnect_attempts,
                    "delay_ms": delay.as_millis() as u64,
                    "error": last_error,
                }),
            ));
            tokio::time::sleep(delay).await;
        }
    }

    /// Deliver the bars in one text frame; returns how many were delivered
    fn handle_text(
        &self,
        text: &str,
        symbol_map: &HashMap<String, String>,
        callbacks: &mut StreamCallbacks,
        summary: &mut WebSocketSummary,
    ) -> usize {
        let batch = match parse_batch(text, &self.options.event_type, symbol_map) {
            Ok(batch) => batch,
            Err(e) => {
                summary.skipped_messages += 1;
                warn!("skipping websocket message: {}", e);
                return 0;
            }
        };

        for e in &batch.skipped {
            warn!("skipping websocket element: {}", e);
        }
        summary.skipped_messages += batch.skipped.len() as u64;

        let bars = batch.bars;
        if bars.is_empty() {
            debug!("batch carried no matching bars");
            return 0;
        }
        for bar in &bars {
            callbacks.bar(bar);
        }
        summary.bars += bars.len() as u64;
        let event = AuditEvent::new(
            AuditEventKind::Heartbeat,
            json!({ "source": "websocket", "bars": bars.len() }),
        );
        self.sink.emit(&event);
        callbacks.heartbeat(&event);
        bars.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols() -> HashMap<String, String> {
        [("AAPL".to_string(), "aapl".to_string()), ("MSFT".to_string(), "MSFT".to_string())]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_parse_batch_filters_event_and_symbol() {
        let text = r#"[
            {"ev":"status","status":"auth_success"},
            {"ev":"AM","sym":"AAPL","o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":100,"s":1700000000000,"e":1700000060000},
            {"ev":"AM","sym":"TSLA","o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":100,"s":1700000000000},
            {"ev":"T","sym":"MSFT","p":10.0,"s":5}
        ]"#;
        let bars = parse_batch(text, "AM", &symbols()).unwrap().bars;
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].symbol, "aapl");
        assert_eq!(bars[0].timestamp_millis(), 1_700_000_000_000);
        assert_eq!(bars[0].close, 1.5);
    }

    #[test]
    fn test_parse_batch_single_object_and_errors() {
        let single = r#"{"ev":"AM","sym":"MSFT","o":1,"h":1,"l":1,"c":1,"v":1,"s":0}"#;
        assert_eq!(parse_batch(single, "AM", &symbols()).unwrap().bars.len(), 1);
        assert!(matches!(
            parse_batch("not json", "AM", &symbols()),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_unrelated_element_does_not_drop_batch() {
        // trade conditions are an array; the trade must not be decoded as a bar
        let text = r#"[
            {"ev":"T","sym":"AAPL","p":10.0,"s":5,"c":[12,37],"t":1700000000000},
            {"ev":"AM","sym":"AAPL","o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":100,"s":1700000000000}
        ]"#;
        let batch = parse_batch(text, "AM", &symbols()).unwrap();
        assert_eq!(batch.bars.len(), 1);
        assert!(batch.skipped.is_empty());
    }

    #[test]
    fn test_bad_element_is_skipped_alone() {
        let text = r#"[
            {"ev":"AM","sym":"AAPL","o":1.0,"h":2.0,"l":0.5,"c":"oops","v":100,"s":1700000000000},
            {"ev":"AM","sym":"MSFT","o":3.0,"h":4.0,"l":2.5,"c":3.5,"v":200,"s":1700000000000}
        ]"#;
        let batch = parse_batch(text, "AM", &symbols()).unwrap();
        assert_eq!(batch.bars.len(), 1);
        assert_eq!(batch.bars[0].symbol, "MSFT");
        assert_eq!(batch.skipped.len(), 1);
        assert!(matches!(batch.skipped[0], MessageError::Malformed(_)));
    }

    #[test]
    fn test_missing_start_time_is_not_epoch() {
        let text = r#"[{"ev":"AM","sym":"AAPL","o":1,"h":1,"l":1,"c":1,"v":1}]"#;
        let batch = parse_batch(text, "AM", &symbols()).unwrap();
        assert!(batch.bars.is_empty());
        assert!(matches!(
            batch.skipped.as_slice(),
            [MessageError::MissingTimestamp { symbol }] if symbol == "aapl"
        ));
    }

    #[test]
    fn test_auth_status_detection() {
        let text = r#"[{"ev":"status","status":"auth_failed","message":"bad key"}]"#;
        assert_eq!(auth_status(text), Some(AuthStatus::Rejected("bad key".to_string())));
        assert_eq!(
            auth_status(r#"[{"ev":"status","status":"auth_success"}]"#),
            Some(AuthStatus::Accepted)
        );
        assert_eq!(auth_status(r#"[{"ev":"status","status":"connected"}]"#), None);
        assert_eq!(auth_status("{not json"), None);
    }

    #[test]
    fn test_options_from_config() {
        let options = WebSocketOptions::default();
        assert_eq!(options.max_reconnect_attempts, 10);
        assert_eq!(options.event_type, "AM");
    }
}
