use thiserror::Error;

/// Central error type for plugin version-control operations.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Tag '{tag}' not found for plugin {plugin_id}")]
    TagNotFound { plugin_id: String, tag: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt patch for component '{key}': {reason}")]
    CorruptPatch { key: String, reason: String },

    #[error("Broken version chain at {version_id}: {reason}")]
    BrokenChain { version_id: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// True for the plugin/version/tag lookup misses.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VaultError::PluginNotFound(_)
                | VaultError::VersionNotFound(_)
                | VaultError::TagNotFound { .. }
        )
    }

    /// True when the chain data itself is damaged and reconstruction cannot
    /// be trusted.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            VaultError::CorruptPatch { .. } | VaultError::BrokenChain { .. }
        )
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::CorruptPatch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn broken(version_id: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::BrokenChain {
            version_id: version_id.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for plugin-vault results.
pub type VaultResult<T> = Result<T, VaultError>;
