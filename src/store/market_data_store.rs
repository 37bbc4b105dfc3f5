use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::error::StoreError;
use super::snapshot::SnapshotStore;
use crate::config::StoreConfig;
use crate::types::{interval_duration, Bar, CacheRange, CachedRow};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS ohlcv_cache (
        symbol TEXT NOT NULL,
        interval TEXT NOT NULL,
        ts INTEGER NOT NULL,
        open REAL NOT NULL,
        high REAL NOT NULL,
        low REAL NOT NULL,
        close REAL NOT NULL,
        volume REAL NOT NULL,
        provider TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        PRIMARY KEY (symbol, interval, ts)
    );
"#;

const UPSERT: &str = r#"
    INSERT INTO ohlcv_cache (symbol, interval, ts, open, high, low, close, volume, provider, fetched_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
    ON CONFLICT(symbol, interval, ts) DO UPDATE SET
        open = excluded.open,
        high = excluded.high,
        low = excluded.low,
        close = excluded.close,
        volume = excluded.volume,
        provider = excluded.provider,
        fetched_at = excluded.fetched_at
"#;

/// Durable OHLCV cache keyed by `(symbol, interval, timestamp)`
///
/// Writes are single upsert statements inside one transaction, so concurrent
/// writers from several processes resolve to last-write-wins per key without
/// any application-level locking. Each `put` is also appended to the monthly
/// snapshot store when one is attached.
pub struct MarketDataStore {
    conn: Mutex<Connection>,
    location: String,
    snapshots: Option<SnapshotStore>,
}

impl MarketDataStore {
    /// Open the store described by `config`, attaching the snapshot store if configured
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut store = Self::open_path(
            &config.db_path,
            Duration::from_millis(config.busy_timeout_ms),
        )?;
        if let Some(dir) = &config.snapshot_dir {
            store.snapshots = Some(SnapshotStore::new(dir));
        }
        Ok(store)
    }

    pub fn open_path(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // Best-effort: some filesystems refuse WAL.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;");
        conn.execute_batch(SCHEMA)?;

        info!("Opened market data cache at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
            snapshots: None,
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
            snapshots: None,
        })
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Cached rows intersecting `[start, end]`, ascending by timestamp
    pub fn get(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CachedRow>, StoreError> {
        let raw = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(
                "SELECT ts, open, high, low, close, volume, provider, fetched_at
                 FROM ohlcv_cache
                 WHERE symbol = ?1 AND interval = ?2 AND ts >= ?3 AND ts <= ?4
                 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        symbol,
                        interval,
                        start.timestamp_millis(),
                        end.timestamp_millis()
                    ],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, f64>(1)?,
                            row.get::<_, f64>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, i64>(7)?,
                        ))
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        raw.into_iter()
            .map(|(ts, open, high, low, close, volume, provider, fetched_at)| {
                Ok(CachedRow {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    timestamp: millis_to_utc(symbol, interval, ts)?,
                    open,
                    high,
                    low,
                    close,
                    volume,
                    provider,
                    fetched_at: millis_to_utc(symbol, interval, fetched_at)?,
                })
            })
            .collect()
    }

    /// Upsert `bars` (last write wins per timestamp) and append them to the
    /// monthly snapshot partitions. Returns the number of rows written.
    pub fn put(
        &self,
        symbol: &str,
        interval: &str,
        bars: &[Bar],
        provider: &str,
    ) -> Result<usize, StoreError> {
        if bars.is_empty() {
            return Ok(0);
        }

        let fetched_at = Utc::now();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for bar in bars {
                    stmt.execute(params![
                        symbol,
                        interval,
                        bar.timestamp_millis(),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.volume,
                        provider,
                        fetched_at.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;
        }
        debug!(
            "Cached {} rows for {}/{} from {}",
            bars.len(),
            symbol,
            interval,
            provider
        );

        if let Some(snapshots) = &self.snapshots {
            // Snapshot failures are loud but never fail the cache write.
            if let Err(e) = snapshots.append(provider, symbol, interval, bars, fetched_at) {
                error!(
                    "Snapshot append failed for {}/{}/{}: {}",
                    provider, symbol, interval, e
                );
            }
        }

        Ok(bars.len())
    }

    /// Sub-ranges of `[start, end]` that are not cached yet
    pub fn missing_ranges(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CacheRange>, StoreError> {
        let existing = self.timestamps(symbol, interval, start, end)?;
        Ok(compute_missing_ranges(&existing, interval, start, end))
    }

    /// Latest cached timestamp for the key
    pub fn last_fetched(
        &self,
        symbol: &str,
        interval: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let max_ts: Option<i64> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT MAX(ts) FROM ohlcv_cache WHERE symbol = ?1 AND interval = ?2",
                params![symbol, interval],
                |row| row.get(0),
            )?
        };
        max_ts
            .map(|ms| millis_to_utc(symbol, interval, ms))
            .transpose()
    }

    pub fn row_count(&self, symbol: &str, interval: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ohlcv_cache WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Drop every cached row for the key. Snapshot partitions are left alone.
    pub fn purge(&self, symbol: &str, interval: &str) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM ohlcv_cache WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
        )?;
        info!("Purged {} cached rows for {}/{}", deleted, symbol, interval);
        Ok(deleted)
    }

    fn timestamps(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let raw = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare_cached(
                "SELECT ts FROM ohlcv_cache
                 WHERE symbol = ?1 AND interval = ?2 AND ts >= ?3 AND ts <= ?4
                 ORDER BY ts ASC",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        symbol,
                        interval,
                        start.timestamp_millis(),
                        end.timestamp_millis()
                    ],
                    |row| row.get::<_, i64>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        raw.into_iter()
            .map(|ms| millis_to_utc(symbol, interval, ms))
            .collect()
    }
}

fn millis_to_utc(symbol: &str, interval: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::InvalidTimestamp {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        millis,
    })
}

/// Gap scan over ascending `existing` timestamps.
///
/// With a parseable interval every hole of at least one step is reported as
/// `(expected, next - step)` plus a trailing `(expected, end)`. An unparseable
/// interval only checks the two boundaries.
pub fn compute_missing_ranges(
    existing: &[DateTime<Utc>],
    interval: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<CacheRange> {
    if start > end {
        return Vec::new();
    }
    let (first, last) = match (existing.first(), existing.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return vec![CacheRange::new(start, end)],
    };

    let step = match interval_duration(interval) {
        Some(step) => step,
        None => {
            debug!(
                "Interval '{}' has no fixed duration; boundary-only gap detection",
                interval
            );
            let mut missing = Vec::new();
            if first > start {
                missing.push(CacheRange::new(start, first));
            }
            if last < end {
                missing.push(CacheRange::new(last, end));
            }
            return missing;
        }
    };

    let mut missing = Vec::new();
    let mut expected = start;
    for &ts in existing {
        if ts - expected >= step {
            if let Some(gap_end) = ts.checked_sub_signed(step) {
                missing.push(CacheRange::new(expected, gap_end));
            }
        }
        match ts.checked_add_signed(step) {
            Some(next) if next > expected => expected = next,
            Some(_) => {}
            // nothing after `ts` is representable
            None => return missing,
        }
    }
    if expected <= end {
        missing.push(CacheRange::new(expected, end));
    }
    missing
}
