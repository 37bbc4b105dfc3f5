use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, Utc};
use log::{debug, warn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use super::error::SnapshotError;
use crate::types::Bar;

const BATCH_SIZE: usize = 4_096;

/// One row of an audit-grade monthly partition
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Parquet partitions laid out as
/// `<root>/provider=<p>/symbol=<s>/interval=<i>/<YYYY-MM>.parquet`.
///
/// Appending reads the whole partition, merges by timestamp (newest write
/// wins), sorts and rewrites it. The rewrite goes to a sibling temp file that
/// is renamed over the partition, so a crash leaves either the old or the new
/// file in place.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

fn timestamp_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )
}

fn snapshot_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        timestamp_field("timestamp"),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        timestamp_field("fetched_at"),
    ]))
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            other => other,
        })
        .collect()
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(
        &self,
        provider: &str,
        symbol: &str,
        interval: &str,
        year: i32,
        month: u32,
    ) -> PathBuf {
        self.root
            .join(format!("provider={}", sanitize(provider)))
            .join(format!("symbol={}", sanitize(symbol)))
            .join(format!("interval={}", sanitize(interval)))
            .join(format!("{:04}-{:02}.parquet", year, month))
    }

    /// Merge `bars` into their calendar-month partitions. Returns the number
    /// of partitions rewritten.
    pub fn append(
        &self,
        provider: &str,
        symbol: &str,
        interval: &str,
        bars: &[Bar],
        fetched_at: DateTime<Utc>,
    ) -> Result<usize, SnapshotError> {
        let mut by_month: BTreeMap<(i32, u32), Vec<SnapshotRow>> = BTreeMap::new();
        for bar in bars {
            by_month
                .entry((bar.timestamp.year(), bar.timestamp.month()))
                .or_default()
                .push(SnapshotRow {
                    timestamp: bar.timestamp,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                    fetched_at,
                });
        }

        for ((year, month), incoming) in &by_month {
            let path = self.partition_path(provider, symbol, interval, *year, *month);
            let mut merged: BTreeMap<i64, SnapshotRow> = BTreeMap::new();
            if path.exists() {
                for row in self.read_partition(&path)? {
                    merged.insert(row.timestamp.timestamp_millis(), row);
                }
            }
            for row in incoming {
                merged.insert(row.timestamp.timestamp_millis(), row.clone());
            }
            let rows: Vec<SnapshotRow> = merged.into_values().collect();
            write_partition(&path, &rows)?;
            debug!("Snapshot partition {} now holds {} rows", path.display(), rows.len());
        }

        Ok(by_month.len())
    }

    /// Every partition file under the store, sorted by path
    pub fn list_partitions(&self) -> Result<Vec<PathBuf>, SnapshotError> {
        let mut files = Vec::new();
        if self.root.exists() {
            collect_parquet_files(&self.root, &mut files)?;
        }
        files.sort();
        Ok(files)
    }

    pub fn read_partition(&self, path: &Path) -> Result<Vec<SnapshotRow>, SnapshotError> {
        let corrupt = |reason: String| SnapshotError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| corrupt(e.to_string()))?
            .with_batch_size(BATCH_SIZE)
            .build()
            .map_err(|e| corrupt(e.to_string()))?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|e| corrupt(e.to_string()))?;
            if batch.num_columns() != 7 {
                return Err(corrupt(format!("expected 7 columns, found {}", batch.num_columns())));
            }
            let timestamps = timestamp_column(&batch, 0).ok_or_else(|| corrupt("timestamp column".into()))?;
            let opens = float_column(&batch, 1).ok_or_else(|| corrupt("open column".into()))?;
            let highs = float_column(&batch, 2).ok_or_else(|| corrupt("high column".into()))?;
            let lows = float_column(&batch, 3).ok_or_else(|| corrupt("low column".into()))?;
            let closes = float_column(&batch, 4).ok_or_else(|| corrupt("close column".into()))?;
            let volumes = float_column(&batch, 5).ok_or_else(|| corrupt("volume column".into()))?;
            let fetched = timestamp_column(&batch, 6).ok_or_else(|| corrupt("fetched_at column".into()))?;

            for row in 0..batch.num_rows() {
                let timestamp = DateTime::from_timestamp_millis(timestamps.value(row))
                    .ok_or_else(|| corrupt(format!("timestamp out of range at row {row}")))?;
                let fetched_at = DateTime::from_timestamp_millis(fetched.value(row))
                    .ok_or_else(|| corrupt(format!("fetched_at out of range at row {row}")))?;
                rows.push(SnapshotRow {
                    timestamp,
                    open: opens.value(row),
                    high: highs.value(row),
                    low: lows.value(row),
                    close: closes.value(row),
                    volume: volumes.value(row),
                    fetched_at,
                });
            }
        }
        Ok(rows)
    }
}

fn timestamp_column(batch: &RecordBatch, index: usize) -> Option<&TimestampMillisecondArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
}

fn float_column(batch: &RecordBatch, index: usize) -> Option<&Float64Array> {
    batch.column(index).as_any().downcast_ref::<Float64Array>()
}

fn rows_to_batch(rows: &[SnapshotRow]) -> Result<RecordBatch, SnapshotError> {
    let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let fetched: Vec<i64> = rows.iter().map(|r| r.fetched_at.timestamp_millis()).collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMillisecondArray::from(timestamps).with_timezone("UTC")),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.open).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.high).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.low).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.close).collect::<Vec<_>>())),
        Arc::new(Float64Array::from(rows.iter().map(|r| r.volume).collect::<Vec<_>>())),
        Arc::new(TimestampMillisecondArray::from(fetched).with_timezone("UTC")),
    ];
    Ok(RecordBatch::try_new(snapshot_schema(), columns)?)
}

fn write_partition(path: &Path, rows: &[SnapshotRow]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let batch = rows_to_batch(rows)?;
    let tmp_path = path.with_extension("parquet.tmp");

    let write_result = (|| -> Result<(), SnapshotError> {
        let file = File::create(&tmp_path)?;
        let props = WriterProperties::builder().build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        if let Err(cleanup) = std::fs::remove_file(&tmp_path) {
            warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
        }
        return Err(e);
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn collect_parquet_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), SnapshotError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_parquet_files(&path, files)?;
        } else if path.extension().map(|ext| ext == "parquet").unwrap_or(false) {
            files.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn bar(ts: DateTime<Utc>, close: f64) -> Bar {
        Bar::new("BTC-USD", ts, close, close, close, close, 1.0)
    }

    #[test]
    fn test_partition_path_layout() {
        let store = SnapshotStore::new("/data/snapshots");
        let path = store.partition_path("polygon", "X:BTC/USD", "1d", 2024, 3);
        assert_eq!(
            path,
            PathBuf::from("/data/snapshots/provider=polygon/symbol=X_BTC_USD/interval=1d/2024-03.parquet")
        );
    }

    #[test]
    fn test_append_splits_by_month_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let fetched = day(2024, 3, 5);

        let written = store
            .append(
                "binance",
                "BTC-USD",
                "1d",
                &[bar(day(2024, 2, 28), 1.0), bar(day(2024, 3, 1), 2.0)],
                fetched,
            )
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.list_partitions().unwrap().len(), 2);

        // overlapping write to March keeps the newest value for 03-01
        store
            .append(
                "binance",
                "BTC-USD",
                "1d",
                &[bar(day(2024, 3, 2), 3.0), bar(day(2024, 3, 1), 20.0)],
                fetched + Duration::hours(1),
            )
            .unwrap();

        let march = store.partition_path("binance", "BTC-USD", "1d", 2024, 3);
        let rows = store.read_partition(&march).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, day(2024, 3, 1));
        assert_eq!(rows[0].close, 20.0);
        assert_eq!(rows[1].timestamp, day(2024, 3, 2));
        assert!(!march.with_extension("parquet.tmp").exists());
    }

    #[test]
    fn test_corrupt_partition_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let path = store.partition_path("binance", "BTC-USD", "1d", 2024, 3);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a parquet file").unwrap();

        let err = store
            .append("binance", "BTC-USD", "1d", &[bar(day(2024, 3, 1), 1.0)], day(2024, 3, 1))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt { .. }));
        // the damaged partition is left for an operator to inspect
        assert_eq!(std::fs::read(&path).unwrap(), b"not a parquet file");
    }
}
