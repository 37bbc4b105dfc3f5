use std::path::PathBuf;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

/// Errors from the SQLite-backed market data cache
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create store directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid timestamp {millis} in cache for {symbol}/{interval}")]
    InvalidTimestamp {
        symbol: String,
        interval: String,
        millis: i64,
    },
    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors from the partitioned columnar snapshot store
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("corrupt snapshot partition {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}
