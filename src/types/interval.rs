use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use std::fmt;

/// Unit letter of a bar interval string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
}

impl IntervalUnit {
    fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "m" => Some(Self::Minute),
            "h" => Some(Self::Hour),
            "d" => Some(Self::Day),
            "w" => Some(Self::Week),
            _ => None,
        }
    }

    pub fn letter(&self) -> &'static str {
        match self {
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
        }
    }
}

/// Fixed-duration bar interval such as `15m`, `1h` or `1d`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    magnitude: i64,
    unit: IntervalUnit,
}

impl Interval {
    pub fn new(magnitude: i64, unit: IntervalUnit) -> Self {
        Self { magnitude, unit }
    }

    /// Parse a leading integer and a trailing unit letter. Unknown units
    /// (e.g. `1mo`), non-positive magnitudes and spans too large for a
    /// `Duration` yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (split, _) = value.char_indices().last()?;
        let (magnitude, unit) = value.split_at(split);
        let magnitude: i64 = magnitude.parse().ok()?;
        if magnitude <= 0 {
            return None;
        }
        let interval = Self {
            magnitude,
            unit: IntervalUnit::from_letter(unit)?,
        };
        interval.duration().map(|_| interval)
    }

    pub fn magnitude(&self) -> i64 {
        self.magnitude
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    /// `None` when the span does not fit in a `Duration`
    pub fn duration(&self) -> Option<Duration> {
        match self.unit {
            IntervalUnit::Minute => Duration::try_minutes(self.magnitude),
            IntervalUnit::Hour => Duration::try_hours(self.magnitude),
            IntervalUnit::Day => Duration::try_days(self.magnitude),
            IntervalUnit::Week => Duration::try_weeks(self.magnitude),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.magnitude, self.unit.letter())
    }
}

/// Shorthand for `Interval::parse(value).and_then(|i| i.duration())`
pub fn interval_duration(value: &str) -> Option<Duration> {
    Interval::parse(value).and_then(|interval| interval.duration())
}

/// Lookback period used when a caller asks for "the last N days" instead of dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Lookback(Duration),
    YearToDate,
    Max,
}

impl Period {
    /// Accepts `Nd`, `Nw`, `Nmo` (30 days each), `Ny` (365 days), `ytd` and `max`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "ytd" => return Some(Self::YearToDate),
            "max" => return Some(Self::Max),
            _ => {}
        }

        let (number, days_per_unit) = if let Some(number) = value.strip_suffix("mo") {
            (number, 30)
        } else if let Some(number) = value.strip_suffix('y') {
            (number, 365)
        } else if let Some(number) = value.strip_suffix('w') {
            (number, 7)
        } else if let Some(number) = value.strip_suffix('d') {
            (number, 1)
        } else {
            return None;
        };

        let count: i64 = number.parse().ok()?;
        if count <= 0 {
            return None;
        }
        let days = count.checked_mul(days_per_unit)?;
        Duration::try_days(days).map(Self::Lookback)
    }

    /// Resolve into an absolute `[start, end]` window ending at `now`.
    /// `None` when the lookback reaches past the earliest representable time.
    pub fn window_ending(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = match self {
            Self::Lookback(span) => now.checked_sub_signed(*span)?,
            Self::YearToDate => Utc
                .with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(now),
            Self::Max => now.checked_sub_signed(Duration::try_days(20 * 365)?)?,
        };
        Some((start, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_parse_supported_units() {
        assert_eq!(interval_duration("1m"), Some(Duration::minutes(1)));
        assert_eq!(interval_duration("15m"), Some(Duration::minutes(15)));
        assert_eq!(interval_duration("4h"), Some(Duration::hours(4)));
        assert_eq!(interval_duration("1d"), Some(Duration::days(1)));
        assert_eq!(interval_duration("2w"), Some(Duration::weeks(2)));
    }

    #[test]
    fn test_interval_parse_unsupported() {
        assert!(Interval::parse("1mo").is_none());
        assert!(Interval::parse("1M").is_none());
        assert!(Interval::parse("m").is_none());
        assert!(Interval::parse("0h").is_none());
        assert!(Interval::parse("").is_none());
        assert!(Interval::parse("1é").is_none());
    }

    #[test]
    fn test_oversized_interval_is_rejected_not_panicking() {
        assert!(Interval::parse("99999999999999w").is_none());
        assert!(interval_duration("9223372036854775807m").is_none());
        assert!(Interval::new(i64::MAX, IntervalUnit::Day).duration().is_none());
    }

    #[test]
    fn test_oversized_period_is_rejected_not_panicking() {
        assert!(Period::parse("99999999999999999y").is_none());
        assert!(Period::parse("9223372036854775807d").is_none());

        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let period = Period::parse("9999999y").unwrap();
        assert!(period.window_ending(now).is_none());
    }

    #[test]
    fn test_interval_display_roundtrip() {
        let interval = Interval::parse("30m").unwrap();
        assert_eq!(interval.to_string(), "30m");
        assert_eq!(interval.magnitude(), 30);
        assert_eq!(interval.unit(), IntervalUnit::Minute);
    }

    #[test]
    fn test_period_parse() {
        assert_eq!(Period::parse("5d"), Some(Period::Lookback(Duration::days(5))));
        assert_eq!(Period::parse("1mo"), Some(Period::Lookback(Duration::days(30))));
        assert_eq!(Period::parse("1y"), Some(Period::Lookback(Duration::days(365))));
        assert_eq!(Period::parse("YTD"), Some(Period::YearToDate));
        assert_eq!(Period::parse("max"), Some(Period::Max));
        assert!(Period::parse("5x").is_none());
        assert!(Period::parse("-1d").is_none());
    }

    #[test]
    fn test_period_window_ending() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let (start, end) = Period::parse("5d").unwrap().window_ending(now).unwrap();
        assert_eq!(end, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap());

        let (start, _) = Period::YearToDate.window_ending(now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }
}
