pub mod persistent;
pub mod state_store;

use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{VaultError, VaultResult};

pub use state_store::{InMemoryStateStore, StateStore};

#[cfg(feature = "rocksdb-storage")]
pub use persistent::{open_db, RocksStateStore};

/// Build the state store selected by `config`.
pub fn open_store(config: &StorageConfig) -> VaultResult<Arc<dyn StateStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(InMemoryStateStore::new())),
        StorageBackend::Rocksdb => open_rocks(config),
    }
}

#[cfg(feature = "rocksdb-storage")]
fn open_rocks(config: &StorageConfig) -> VaultResult<Arc<dyn StateStore>> {
    let path = config.path.as_ref().ok_or_else(|| {
        VaultError::ConfigError("storage.path is required for the rocksdb backend".to_string())
    })?;
    let db = open_db(path)?;
    Ok(Arc::new(RocksStateStore::new(db)))
}

#[cfg(not(feature = "rocksdb-storage"))]
fn open_rocks(_config: &StorageConfig) -> VaultResult<Arc<dyn StateStore>> {
    Err(VaultError::ConfigError(
        "rocksdb backend requested but this build lacks the `rocksdb-storage` feature".to_string(),
    ))
}
