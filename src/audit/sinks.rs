use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::events::{AuditEvent, AuditEventKind, AuditLevel, AuditSink};

/// Mirrors every event to the `log` facade at the event's severity
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn emit(&self, event: &AuditEvent) {
        let context = if event.context.is_empty() {
            String::new()
        } else {
            format!(" {:?}", event.context)
        };
        match event.level() {
            AuditLevel::Info => log::info!("[{}] {}{}", event.kind, event.payload, context),
            AuditLevel::Warning => log::warn!("[{}] {}{}", event.kind, event.payload, context),
            AuditLevel::Error => log::error!("[{}] {}{}", event.kind, event.payload, context),
            AuditLevel::Critical => {
                log::error!("[CRITICAL] [{}] {}{}", event.kind, event.payload, context)
            }
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn emit(&self, _event: &AuditEvent) {}
}

/// Keeps the most recent events in memory for inspection
pub struct RecordingSink {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
}

impl RecordingSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AuditEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All retained events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn events_of(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.lock().iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.lock().iter().map(|e| e.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl AuditSink for RecordingSink {
    fn emit(&self, event: &AuditEvent) {
        let mut events = self.lock();
        events.push_back(event.clone());
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}

/// Broadcasts every event to each registered sink in order
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for FanoutSink {
    fn emit(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_sink_keeps_last_n() {
        let sink = RecordingSink::new(2);
        for cycle in 0..3 {
            sink.emit(&AuditEvent::new(AuditEventKind::Heartbeat, json!({ "cycle": cycle })));
        }
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload_u64("cycle"), Some(1));
        assert_eq!(events[1].payload_u64("cycle"), Some(2));
    }

    #[test]
    fn test_recording_sink_counts_by_kind() {
        let sink = RecordingSink::default();
        sink.emit(&AuditEvent::new(AuditEventKind::TransientError, json!({})));
        sink.emit(&AuditEvent::new(AuditEventKind::TransientError, json!({})));
        sink.emit(&AuditEvent::new(AuditEventKind::Recovery, json!({})));
        assert_eq!(sink.count(AuditEventKind::TransientError), 2);
        assert_eq!(sink.count(AuditEventKind::Recovery), 1);
        assert_eq!(sink.count(AuditEventKind::TerminalError), 0);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_fanout_sink_reaches_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(LogSink));
        assert_eq!(fanout.len(), 3);

        fanout.emit(&AuditEvent::new(AuditEventKind::Backoff, json!({"delay_secs": 5.0})));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }
}
