use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive `[start, end]` UTC window: either a request or a detected gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CacheRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// A gap covering a single bar has `start == end`
    pub fn is_single_point(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for CacheRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
