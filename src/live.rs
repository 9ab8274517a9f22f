//! Collaborators that own the running plugin's code and config.
//!
//! The engine reads the live state when committing from it and writes a
//! reconstructed state back on restore. Real deployments back these with
//! whatever storage serves the running plugins; the in-memory registry is used
//! by the HTTP server, the demo and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{VaultError, VaultResult};
use crate::model::state::{PluginId, PluginState};

/// Provides the current live state of a plugin.
#[async_trait]
pub trait LiveStateProvider: Send + Sync {
    async fn current_state(&self, plugin_id: &str) -> VaultResult<PluginState>;
}

/// Overwrites the live state of a plugin.
#[async_trait]
pub trait LiveStateSink: Send + Sync {
    async fn apply_state(&self, plugin_id: &str, state: PluginState) -> VaultResult<()>;
}

/// Live plugin states held in memory.
#[derive(Default)]
pub struct InMemoryLiveRegistry {
    plugins: RwLock<HashMap<PluginId, PluginState>>,
}

impl InMemoryLiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a plugin's live state, as an editor save would.
    pub async fn set_state(&self, plugin_id: impl Into<PluginId>, state: PluginState) {
        self.plugins.write().await.insert(plugin_id.into(), state);
    }

    pub async fn plugin_ids(&self) -> Vec<PluginId> {
        let mut ids: Vec<PluginId> = self.plugins.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl LiveStateProvider for InMemoryLiveRegistry {
    async fn current_state(&self, plugin_id: &str) -> VaultResult<PluginState> {
        self.plugins
            .read()
            .await
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| VaultError::PluginNotFound(plugin_id.to_string()))
    }
}

#[async_trait]
impl LiveStateSink for InMemoryLiveRegistry {
    async fn apply_state(&self, plugin_id: &str, state: PluginState) -> VaultResult<()> {
        self.set_state(plugin_id, state).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = InMemoryLiveRegistry::new();
        assert!(registry.current_state("orders").await.unwrap_err().is_not_found());

        let state = PluginState::new().with_source("controller", "v1");
        registry.apply_state("orders", state.clone()).await.unwrap();
        assert_eq!(registry.current_state("orders").await.unwrap(), state);
        assert_eq!(registry.plugin_ids().await, vec!["orders".to_string()]);
    }
}
