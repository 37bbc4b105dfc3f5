pub mod error;
pub mod market_data_store;
pub mod snapshot;

pub use error::{SnapshotError, StoreError};
pub use market_data_store::{compute_missing_ranges, MarketDataStore};
pub use snapshot::{SnapshotRow, SnapshotStore};
