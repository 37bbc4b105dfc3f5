use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One OHLCV observation for a symbol at a UTC timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Timestamp as epoch milliseconds, the storage key used by the cache
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

impl fmt::Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} O={} H={} L={} C={} V={}",
            self.symbol,
            self.timestamp.to_rfc3339(),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume
        )
    }
}

/// A bar as persisted in the durable cache, tagged with its producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRow {
    pub symbol: String,
    pub interval: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedRow {
    pub fn to_bar(&self) -> Bar {
        Bar::new(
            self.symbol.clone(),
            self.timestamp,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

impl From<CachedRow> for Bar {
    fn from(row: CachedRow) -> Self {
        Bar {
            symbol: row.symbol,
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        }
    }
}

/// Timestamp exactly as a provider reported it, before UTC coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimestamp {
    EpochMillis(i64),
    Aware(DateTime<FixedOffset>),
    /// No zone information; interpreted as UTC by the feed
    Naive(NaiveDateTime),
}

impl RawTimestamp {
    /// Parse an ISO-8601 style string. Strings without an offset become `Naive`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Some(Self::Aware(ts));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                return Some(Self::Naive(naive));
            }
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(Self::Naive)
    }

    pub fn is_naive(&self) -> bool {
        matches!(self, Self::Naive(_))
    }

    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        match self {
            Self::EpochMillis(ms) => DateTime::from_timestamp_millis(ms),
            Self::Aware(ts) => Some(ts.with_timezone(&Utc)),
            Self::Naive(naive) => Some(naive.and_utc()),
        }
    }
}

/// Provider output row; the feed turns these into `Bar`s
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub timestamp: RawTimestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawBar {
    pub fn new(timestamp: RawTimestamp, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn from_millis(ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self::new(RawTimestamp::EpochMillis(ms), open, high, low, close, volume)
    }

    pub fn from_utc(ts: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self::new(
            RawTimestamp::Aware(ts.fixed_offset()),
            open,
            high,
            low,
            close,
            volume,
        )
    }

    /// Attach a canonical symbol. Returns `None` when the timestamp is out of range.
    pub fn into_bar(self, symbol: &str) -> Option<Bar> {
        let timestamp = self.timestamp.to_utc()?;
        Some(Bar::new(
            symbol,
            timestamp,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_aware_timestamp_converts_to_utc() {
        let raw = RawTimestamp::parse("2024-03-01T09:30:00-05:00").unwrap();
        assert!(!raw.is_naive());
        assert_eq!(
            raw.to_utc().unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_naive_timestamp_assumes_utc() {
        let raw = RawTimestamp::parse("2024-03-01 09:30:00").unwrap();
        assert!(raw.is_naive());
        assert_eq!(
            raw.to_utc().unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
        );

        let date_only = RawTimestamp::parse("2024-03-01").unwrap();
        assert!(date_only.is_naive());
    }

    #[test]
    fn test_parse_garbage_timestamp() {
        assert!(RawTimestamp::parse("yesterday").is_none());
    }

    #[test]
    fn test_raw_bar_into_bar() {
        let raw = RawBar::from_millis(1_700_000_000_000, 1.0, 2.0, 0.5, 1.5, 10.0);
        let bar = raw.into_bar("BTC-USD").unwrap();
        assert_eq!(bar.symbol, "BTC-USD");
        assert_eq!(bar.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(bar.close, 1.5);
    }

    #[test]
    fn test_cached_row_into_bar() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let row = CachedRow {
            symbol: "AAPL".to_string(),
            interval: "1d".to_string(),
            timestamp: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
            provider: "polygon".to_string(),
            fetched_at: ts,
        };
        let bar: Bar = row.clone().into();
        assert_eq!(bar, row.to_bar());
        assert_eq!(bar.timestamp, ts);
    }
}
