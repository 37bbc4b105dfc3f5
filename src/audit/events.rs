use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Severity used when mirroring an event to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Every event type emitted by the feed, the stream, the broker wrapper and the kill switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    // polling stream
    Heartbeat,
    Recovered,
    SymbolError,
    Backoff,
    FailureLimitReached,
    // historical fetch
    ProviderFallback,
    // broker wrapper
    TransientError,
    TerminalError,
    Recovery,
    CircuitBreakerHalt,
    // kill switch
    KillSwitchTriggered,
    KillSwitchReset,
    // websocket variant
    WsReconnect,
    WsReconnectsExhausted,
}

impl AuditEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::Recovered => "RECOVERED",
            Self::SymbolError => "SYMBOL_ERROR",
            Self::Backoff => "BACKOFF",
            Self::FailureLimitReached => "FAILURE_LIMIT_REACHED",
            Self::ProviderFallback => "PROVIDER_FALLBACK",
            Self::TransientError => "TRANSIENT_ERROR",
            Self::TerminalError => "TERMINAL_ERROR",
            Self::Recovery => "RECOVERY",
            Self::CircuitBreakerHalt => "CIRCUIT_BREAKER_HALT",
            Self::KillSwitchTriggered => "KILL_SWITCH_TRIGGERED",
            Self::KillSwitchReset => "KILL_SWITCH_RESET",
            Self::WsReconnect => "WS_RECONNECT",
            Self::WsReconnectsExhausted => "WS_RECONNECTS_EXHAUSTED",
        }
    }

    pub fn level(&self) -> AuditLevel {
        match self {
            Self::Heartbeat | Self::Recovered | Self::Recovery | Self::KillSwitchReset => {
                AuditLevel::Info
            }
            Self::SymbolError
            | Self::Backoff
            | Self::ProviderFallback
            | Self::TransientError
            | Self::WsReconnect => AuditLevel::Warning,
            Self::TerminalError => AuditLevel::Error,
            Self::FailureLimitReached
            | Self::CircuitBreakerHalt
            | Self::KillSwitchTriggered
            | Self::WsReconnectsExhausted => AuditLevel::Critical,
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record: `(event_type, payload, **context)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditEventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub context: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            payload,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn level(&self) -> AuditLevel {
        self.kind.level()
    }

    /// Convenience accessor for string payload fields
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(|v| v.as_u64())
    }
}

/// Receiver of audit events. Implementations must not block for long; emit is
/// called inline from retry loops and stream cycles.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(AuditEventKind::FailureLimitReached.as_str(), "FAILURE_LIMIT_REACHED");
        let encoded = serde_json::to_string(&AuditEventKind::TransientError).unwrap();
        assert_eq!(encoded, "\"TRANSIENT_ERROR\"");
    }

    #[test]
    fn test_event_levels() {
        assert_eq!(AuditEventKind::Heartbeat.level(), AuditLevel::Info);
        assert_eq!(AuditEventKind::TransientError.level(), AuditLevel::Warning);
        assert_eq!(AuditEventKind::TerminalError.level(), AuditLevel::Error);
        assert_eq!(AuditEventKind::KillSwitchTriggered.level(), AuditLevel::Critical);
    }

    #[test]
    fn test_event_payload_and_context() {
        let event = AuditEvent::new(AuditEventKind::SymbolError, json!({"symbol": "AAPL", "cycle": 3}))
            .with_context("stream", "equities");
        assert_eq!(event.payload_str("symbol"), Some("AAPL"));
        assert_eq!(event.payload_u64("cycle"), Some(3));
        assert_eq!(event.context.get("stream").map(String::as_str), Some("equities"));
    }
}
