use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{VaultError, VaultResult};
use crate::model::tag::Tag;
use crate::model::version::Version;
use crate::store::StateStore;

const MAX_TAG_LEN: usize = 100;

/// Named, movable pointers to versions. One tag name per plugin; tagging an
/// existing name moves it.
#[derive(Clone)]
pub struct TagStore {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl TagStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tag (or re-tag) a version of a plugin.
    pub async fn add(
        &self,
        plugin_id: &str,
        name: &str,
        version_id: &str,
        author: Option<String>,
    ) -> VaultResult<Tag> {
        let name = validate_tag_name(name)?;
        // Ownership check up front gives a clean NotFound before any write.
        self.store.get_version(plugin_id, version_id).await?;

        let mut tag = Tag::new(plugin_id, name, version_id).with_author(author);
        tag.created_at = self.clock.now();

        let previous = self.store.upsert_tag(tag.clone()).await?;
        match previous {
            Some(old) if old.version_id != tag.version_id => info!(
                plugin_id,
                tag = %tag.name,
                from = %old.version_id,
                to = %tag.version_id,
                "moved tag"
            ),
            _ => info!(plugin_id, tag = %tag.name, version_id, "tagged version"),
        }
        Ok(tag)
    }

    /// Remove a tag from the version it points at.
    pub async fn remove(&self, plugin_id: &str, name: &str, version_id: &str) -> VaultResult<Tag> {
        let tag = self.store.delete_tag(plugin_id, name, version_id).await?;
        info!(plugin_id, tag = %name, version_id, "removed tag");
        Ok(tag)
    }

    pub async fn list_for_version(&self, version_id: &str) -> VaultResult<Vec<Tag>> {
        self.store.list_tags(version_id).await
    }

    pub async fn list_for_plugin(&self, plugin_id: &str) -> VaultResult<Vec<Tag>> {
        self.store.list_plugin_tags(plugin_id).await
    }

    /// The version a tag currently points at.
    pub async fn resolve(&self, plugin_id: &str, name: &str) -> VaultResult<Version> {
        let tag = self
            .store
            .get_tag(plugin_id, name)
            .await?
            .ok_or_else(|| VaultError::TagNotFound {
                plugin_id: plugin_id.to_string(),
                tag: name.to_string(),
            })?;
        self.store.get_version(plugin_id, &tag.version_id).await
    }
}

/// Trimmed tag name, or `InvalidInput`.
pub fn validate_tag_name(name: &str) -> VaultResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VaultError::InvalidInput("tag name is empty".to_string()));
    }
    if name.chars().count() > MAX_TAG_LEN {
        return Err(VaultError::InvalidInput(format!(
            "tag name is longer than {} characters",
            MAX_TAG_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(VaultError::InvalidInput(
            "tag name contains control characters".to_string(),
        ));
    }
    Ok(name)
}
