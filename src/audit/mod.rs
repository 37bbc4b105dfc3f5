/// Structured audit events and the sinks that receive them
pub mod events;
pub mod sinks;

pub use events::{AuditEvent, AuditEventKind, AuditLevel, AuditSink};
pub use sinks::{FanoutSink, LogSink, NullSink, RecordingSink};

#[cfg(test)]
pub use events::MockAuditSink;
