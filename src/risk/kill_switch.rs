//! Durable, cross-process halt flag.
//!
//! The state lives in a singleton row of the shared SQLite file. It is created
//! once with `INSERT OR IGNORE`, never deleted, and every read goes to the
//! database so a trigger from another process is visible immediately.

use chrono::{DateTime, Utc};
use log::{error, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kill_switch (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        active INTEGER NOT NULL DEFAULT 0,
        reason TEXT,
        triggered_at TEXT,
        reset_by TEXT,
        reset_at TEXT
    );
    INSERT OR IGNORE INTO kill_switch (id, active) VALUES (1, 0);
"#;

#[derive(Debug, Error)]
pub enum KillSwitchError {
    #[error("kill switch active since {triggered_at}: {reason}")]
    Active {
        reason: String,
        triggered_at: String,
    },
    #[error("reset requires a non-empty operator id")]
    MissingOperator,
    #[error("kill switch record is missing")]
    MissingRecord,
    #[error("kill switch storage error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create kill switch directory: {0}")]
    Directory(#[from] std::io::Error),
    #[error("kill switch connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSwitchState {
    Inactive,
    Active,
}

impl fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSwitchState::Inactive => write!(f, "INACTIVE"),
            KillSwitchState::Active => write!(f, "ACTIVE"),
        }
    }
}

/// Full record, for dashboards and operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchStatus {
    pub state: KillSwitchState,
    pub reason: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub reset_by: Option<String>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl KillSwitchStatus {
    pub fn is_active(&self) -> bool {
        self.state == KillSwitchState::Active
    }
}

pub struct KillSwitch {
    conn: Mutex<Connection>,
    sink: Option<Arc<dyn AuditSink>>,
}

impl KillSwitch {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KillSwitchError> {
        Self::open_with_timeout(path, Duration::from_secs(5))
    }

    pub fn open_with_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self, KillSwitchError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KillSwitchError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, KillSwitchError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            sink: None,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KillSwitchError> {
        self.conn.lock().map_err(|_| KillSwitchError::Poisoned)
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(&event);
        }
    }

    /// Activate the switch. Repeated calls overwrite the reason and clear any reset info.
    pub fn trigger(&self, reason: &str) -> Result<(), KillSwitchError> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE kill_switch
                 SET active = 1, reason = ?1, triggered_at = ?2, reset_by = NULL, reset_at = NULL
                 WHERE id = 1",
                params![reason, now],
            )?;
        }
        error!("KILL SWITCH TRIGGERED: {} (at {})", reason, now);
        self.emit(AuditEvent::new(
            AuditEventKind::KillSwitchTriggered,
            json!({ "reason": reason, "triggered_at": now }),
        ));
        Ok(())
    }

    /// Deactivate the switch on behalf of `operator_id`
    pub fn reset(&self, operator_id: &str) -> Result<(), KillSwitchError> {
        let operator = operator_id.trim();
        if operator.is_empty() {
            return Err(KillSwitchError::MissingOperator);
        }
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE kill_switch SET active = 0, reset_by = ?1, reset_at = ?2 WHERE id = 1",
                params![operator, now],
            )?;
        }
        warn!("Kill switch reset by {} at {}", operator, now);
        self.emit(AuditEvent::new(
            AuditEventKind::KillSwitchReset,
            json!({ "reset_by": operator, "reset_at": now }),
        ));
        Ok(())
    }

    /// Fail with the trigger reason if the switch is active. Call before every order.
    pub fn check_and_raise(&self) -> Result<(), KillSwitchError> {
        let row = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT active, reason, triggered_at FROM kill_switch WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?
        };

        match row {
            Some((active, reason, triggered_at)) if active != 0 => Err(KillSwitchError::Active {
                reason: reason.unwrap_or_else(|| "unspecified".to_string()),
                triggered_at: triggered_at.unwrap_or_else(|| "unknown".to_string()),
            }),
            Some(_) => Ok(()),
            None => Err(KillSwitchError::MissingRecord),
        }
    }

    pub fn is_active(&self) -> Result<bool, KillSwitchError> {
        match self.check_and_raise() {
            Ok(()) => Ok(false),
            Err(KillSwitchError::Active { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn status(&self) -> Result<KillSwitchStatus, KillSwitchError> {
        let conn = self.lock()?;
        let status = conn
            .query_row(
                "SELECT active, reason, triggered_at, reset_by, reset_at FROM kill_switch WHERE id = 1",
                [],
                |row| {
                    Ok(KillSwitchStatus {
                        state: if row.get::<_, i64>(0)? != 0 {
                            KillSwitchState::Active
                        } else {
                            KillSwitchState::Inactive
                        },
                        reason: row.get(1)?,
                        triggered_at: parse_ts(row.get(2)?),
                        reset_by: row.get(3)?,
                        reset_at: parse_ts(row.get(4)?),
                    })
                },
            )
            .optional()?;
        status.ok_or(KillSwitchError::MissingRecord)
    }
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!("Unparseable kill switch timestamp '{}': {}", raw, e);
            None
        }
    }
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillSwitch")
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
