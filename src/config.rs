use crate::error::{VaultError, VaultResult};
use crate::model::version::VersionNumber;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Longest accepted comparison freshness window: ten years.
pub const MAX_COMPARISON_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub versioning: VersioningConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Knobs of the snapshot/patch engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Patch versions allowed since the last snapshot before the next commit
    /// is forced to be a snapshot.
    pub snapshot_threshold: u32,
    /// Number given to a plugin's first version.
    pub initial_version: String,
    /// Freshness window of cached comparisons, in seconds.
    pub comparison_ttl_secs: u64,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            snapshot_threshold: 9,
            initial_version: "1.0.0".to_string(),
            comparison_ttl_secs: 3600,
        }
    }
}

impl VersioningConfig {
    pub fn initial_version_number(&self) -> VaultResult<VersionNumber> {
        self.initial_version
            .parse()
            .map_err(|err: VaultError| VaultError::ConfigError(err.to_string()))
    }

    pub fn comparison_ttl(&self) -> VaultResult<chrono::Duration> {
        if self.comparison_ttl_secs > MAX_COMPARISON_TTL_SECS {
            return Err(VaultError::ConfigError(format!(
                "versioning.comparison_ttl_secs must be at most {}",
                MAX_COMPARISON_TTL_SECS
            )));
        }
        i64::try_from(self.comparison_ttl_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .ok_or_else(|| {
                VaultError::ConfigError("versioning.comparison_ttl_secs is out of range".to_string())
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database directory for the RocksDB backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> VaultResult<AppConfig> {
    let mut builder = Config::builder()
        .add_source(File::with_name("plugin-vault").required(false))
        .add_source(Environment::with_prefix("PLUGIN_VAULT").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .build()
        .map_err(|err| VaultError::ConfigError(err.to_string()))?;

    let parsed: AppConfig = config
        .try_deserialize()
        .map_err(|err| VaultError::ConfigError(err.to_string()))?;

    validate(&parsed)?;
    Ok(parsed)
}

fn validate(config: &AppConfig) -> VaultResult<()> {
    if config.versioning.snapshot_threshold == 0 {
        return Err(VaultError::ConfigError(
            "versioning.snapshot_threshold must be at least 1".to_string(),
        ));
    }
    config.versioning.initial_version_number()?;
    config.versioning.comparison_ttl()?;

    if config.storage.backend == StorageBackend::Rocksdb && config.storage.path.is_none() {
        return Err(VaultError::ConfigError(
            "storage.path is required for the rocksdb backend".to_string(),
        ));
    }
    Ok(())
}
