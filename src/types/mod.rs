pub mod bar;
pub mod interval;
pub mod range;

pub use bar::{Bar, CachedRow, RawBar, RawTimestamp};
pub use interval::{interval_duration, Interval, IntervalUnit, Period};
pub use range::CacheRange;
