//! Persistent storage using RocksDB.
//!
//! This module is only available when the `rocksdb-storage` feature is enabled.

#[cfg(feature = "rocksdb-storage")]
pub mod rocks_state;

#[cfg(feature = "rocksdb-storage")]
pub use rocks_state::RocksStateStore;

#[cfg(feature = "rocksdb-storage")]
use rocksdb::{Options, DB};
#[cfg(feature = "rocksdb-storage")]
use std::path::Path;
#[cfg(feature = "rocksdb-storage")]
use std::sync::Arc;

#[cfg(feature = "rocksdb-storage")]
use crate::error::{VaultError, VaultResult};

/// Column family names
#[cfg(feature = "rocksdb-storage")]
pub const CF_VERSIONS: &str = "versions";
#[cfg(feature = "rocksdb-storage")]
pub const CF_PLUGIN_VERSIONS: &str = "plugin_versions";
#[cfg(feature = "rocksdb-storage")]
pub const CF_CURRENT: &str = "current";
#[cfg(feature = "rocksdb-storage")]
pub const CF_PAYLOADS: &str = "payloads";
#[cfg(feature = "rocksdb-storage")]
pub const CF_TAGS: &str = "tags";
#[cfg(feature = "rocksdb-storage")]
pub const CF_COMPARISONS: &str = "comparisons";

/// Opens a RocksDB instance with all required column families.
#[cfg(feature = "rocksdb-storage")]
pub fn open_db<P: AsRef<Path>>(path: P) -> VaultResult<Arc<DB>> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let column_families = vec![
        CF_VERSIONS,
        CF_PLUGIN_VERSIONS,
        CF_CURRENT,
        CF_PAYLOADS,
        CF_TAGS,
        CF_COMPARISONS,
    ];

    let db = DB::open_cf(&opts, path, &column_families)
        .map_err(|e| VaultError::Storage(format!("Failed to open RocksDB: {}", e)))?;

    Ok(Arc::new(db))
}
