use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{VaultError, VaultResult};
use crate::model::comparison::Comparison;
use crate::model::patch::{PatchSet, Snapshot, VersionPayload};
use crate::model::state::PluginId;
use crate::model::tag::Tag;
use crate::model::version::{Page, Version, VersionFilter, VersionId, VersionPage};

// ---------------------------------------------------------------------------
// StateStore trait: persistence façade for versions, payloads, tags, caches
// ---------------------------------------------------------------------------

/// Trait for storage backends holding version records, their snapshot or
/// patch payloads, tags and cached comparisons.
///
/// Backends hold no business logic beyond referential integrity and the
/// per-plugin current pointer, which is a dedicated cell updated by
/// compare-and-swap. `Version::is_current` is filled in from that cell on
/// every read.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a version and its payload and make it the plugin's current
    /// version, all in one atomic step.
    ///
    /// Fails with `Conflict` when the parent is missing or belongs to another
    /// plugin, when a parentless version is added to a plugin that already has
    /// history, when the id is taken, or when the plugin's current pointer is
    /// not `expected_current`.
    async fn put_version(
        &self,
        version: Version,
        payload: VersionPayload,
        expected_current: Option<VersionId>,
    ) -> VaultResult<VersionId>;

    /// Get a version of a plugin.
    async fn get_version(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version>;

    /// The version a plugin is currently running against.
    async fn get_current(&self, plugin_id: &str) -> VaultResult<Version>;

    /// List a plugin's versions, newest first.
    async fn list_versions(
        &self,
        plugin_id: &str,
        filter: VersionFilter,
        page: Page,
    ) -> VaultResult<VersionPage>;

    async fn get_snapshot(&self, version_id: &str) -> VaultResult<Option<Snapshot>>;

    async fn get_patch_set(&self, version_id: &str) -> VaultResult<Option<PatchSet>>;

    /// Move the current pointer to `target` if it still equals `expected`.
    async fn set_current(
        &self,
        plugin_id: &str,
        expected: Option<VersionId>,
        target: &str,
    ) -> VaultResult<()>;

    /// Flip the published flag of a version.
    async fn set_published(
        &self,
        plugin_id: &str,
        version_id: &str,
        published: bool,
    ) -> VaultResult<Version>;

    /// Create or move a tag. Returns the tag it replaced, if any.
    async fn upsert_tag(&self, tag: Tag) -> VaultResult<Option<Tag>>;

    async fn get_tag(&self, plugin_id: &str, name: &str) -> VaultResult<Option<Tag>>;

    /// Delete a tag, but only if it points at `version_id`.
    async fn delete_tag(&self, plugin_id: &str, name: &str, version_id: &str) -> VaultResult<Tag>;

    /// Tags pointing at a version.
    async fn list_tags(&self, version_id: &str) -> VaultResult<Vec<Tag>>;

    /// All tags of a plugin, sorted by name.
    async fn list_plugin_tags(&self, plugin_id: &str) -> VaultResult<Vec<Tag>>;

    /// A cached comparison computed after `fresh_since`, if any.
    async fn get_comparison_if_fresh(
        &self,
        from_id: &str,
        to_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> VaultResult<Option<Comparison>>;

    /// Insert or overwrite the cached comparison for `(from_id, to_id)`.
    async fn upsert_comparison(&self, comparison: Comparison) -> VaultResult<()>;
}

/// Checks shared by every backend before a version insert.
pub(crate) fn check_insert(
    version: &Version,
    payload: &VersionPayload,
    id_taken: bool,
    parent: Option<&Version>,
    plugin_has_history: bool,
    current: Option<&VersionId>,
    expected_current: Option<&VersionId>,
) -> VaultResult<()> {
    if payload.kind() != version.kind {
        return Err(VaultError::InvalidInput(format!(
            "version {} is a {} but its payload is a {}",
            version.id,
            version.kind,
            payload.kind()
        )));
    }
    if id_taken {
        return Err(VaultError::Conflict(format!(
            "version {} already exists",
            version.id
        )));
    }
    match (&version.parent_id, parent) {
        (Some(parent_id), None) => {
            return Err(VaultError::Conflict(format!(
                "parent version {} does not exist",
                parent_id
            )));
        }
        (Some(parent_id), Some(parent)) if parent.plugin_id != version.plugin_id => {
            return Err(VaultError::Conflict(format!(
                "parent version {} belongs to plugin {}, not {}",
                parent_id, parent.plugin_id, version.plugin_id
            )));
        }
        (None, _) if plugin_has_history => {
            return Err(VaultError::Conflict(format!(
                "plugin {} already has a root version",
                version.plugin_id
            )));
        }
        _ => {}
    }
    if current != expected_current {
        return Err(VaultError::Conflict(format!(
            "current version of plugin {} is {:?}, expected {:?}",
            version.plugin_id, current, expected_current
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// InMemoryStateStore: for testing and single-process deployments
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    versions: HashMap<VersionId, Version>,
    /// Version ids per plugin in insertion order.
    plugin_versions: HashMap<PluginId, Vec<VersionId>>,
    current: HashMap<PluginId, VersionId>,
    snapshots: HashMap<VersionId, Snapshot>,
    patches: HashMap<VersionId, PatchSet>,
    tags: HashMap<(PluginId, String), Tag>,
    comparisons: HashMap<(VersionId, VersionId), Comparison>,
}

impl Inner {
    /// Clone a record with `is_current` derived from the pointer cell.
    fn read(&self, version: &Version) -> Version {
        let mut out = version.clone();
        out.is_current = self.current.get(&version.plugin_id) == Some(&version.id);
        out
    }

    fn owned_version(&self, plugin_id: &str, version_id: &str) -> VaultResult<&Version> {
        self.versions
            .get(version_id)
            .filter(|v| v.plugin_id == plugin_id)
            .ok_or_else(|| VaultError::VersionNotFound(version_id.to_string()))
    }
}

/// In-memory state store. A single lock guards all maps, so every write is
/// one critical section and readers never see a half-applied commit.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: RwLock<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of version records across all plugins.
    pub async fn version_count(&self) -> usize {
        self.inner.read().await.versions.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_version(
        &self,
        version: Version,
        payload: VersionPayload,
        expected_current: Option<VersionId>,
    ) -> VaultResult<VersionId> {
        let mut inner = self.inner.write().await;

        let parent = version
            .parent_id
            .as_ref()
            .and_then(|id| inner.versions.get(id));
        let has_history = inner
            .plugin_versions
            .get(&version.plugin_id)
            .is_some_and(|ids| !ids.is_empty());
        check_insert(
            &version,
            &payload,
            inner.versions.contains_key(&version.id),
            parent,
            has_history,
            inner.current.get(&version.plugin_id),
            expected_current.as_ref(),
        )?;

        let version_id = version.id.clone();
        let plugin_id = version.plugin_id.clone();

        match payload {
            VersionPayload::Snapshot(snapshot) => {
                inner.snapshots.insert(version_id.clone(), snapshot);
            }
            VersionPayload::Patch(patch) => {
                inner.patches.insert(version_id.clone(), patch);
            }
        }
        let mut record = version;
        record.is_current = false;
        inner.versions.insert(version_id.clone(), record);
        inner
            .plugin_versions
            .entry(plugin_id.clone())
            .or_default()
            .push(version_id.clone());
        inner.current.insert(plugin_id, version_id.clone());

        Ok(version_id)
    }

    async fn get_version(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version> {
        let inner = self.inner.read().await;
        let version = inner.owned_version(plugin_id, version_id)?;
        Ok(inner.read(version))
    }

    async fn get_current(&self, plugin_id: &str) -> VaultResult<Version> {
        let inner = self.inner.read().await;
        let current_id = inner
            .current
            .get(plugin_id)
            .ok_or_else(|| VaultError::PluginNotFound(plugin_id.to_string()))?;
        let version = inner
            .versions
            .get(current_id)
            .ok_or_else(|| VaultError::VersionNotFound(current_id.clone()))?;
        Ok(inner.read(version))
    }

    async fn list_versions(
        &self,
        plugin_id: &str,
        filter: VersionFilter,
        page: Page,
    ) -> VaultResult<VersionPage> {
        let inner = self.inner.read().await;
        let ids = inner.plugin_versions.get(plugin_id).cloned().unwrap_or_default();

        let matching: Vec<Version> = ids
            .iter()
            .rev()
            .filter_map(|id| inner.versions.get(id))
            .filter(|v| filter.matches(v))
            .map(|v| inner.read(v))
            .collect();

        let total = matching.len();
        Ok(VersionPage {
            versions: page.slice(matching),
            total,
        })
    }

    async fn get_snapshot(&self, version_id: &str) -> VaultResult<Option<Snapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.snapshots.get(version_id).cloned())
    }

    async fn get_patch_set(&self, version_id: &str) -> VaultResult<Option<PatchSet>> {
        let inner = self.inner.read().await;
        Ok(inner.patches.get(version_id).cloned())
    }

    async fn set_current(
        &self,
        plugin_id: &str,
        expected: Option<VersionId>,
        target: &str,
    ) -> VaultResult<()> {
        let mut inner = self.inner.write().await;
        inner.owned_version(plugin_id, target)?;

        let current = inner.current.get(plugin_id);
        if current != expected.as_ref() {
            return Err(VaultError::Conflict(format!(
                "current version of plugin {} is {:?}, expected {:?}",
                plugin_id, current, expected
            )));
        }
        inner.current.insert(plugin_id.to_string(), target.to_string());
        Ok(())
    }

    async fn set_published(
        &self,
        plugin_id: &str,
        version_id: &str,
        published: bool,
    ) -> VaultResult<Version> {
        let mut inner = self.inner.write().await;
        inner.owned_version(plugin_id, version_id)?;
        if let Some(version) = inner.versions.get_mut(version_id) {
            version.is_published = published;
        }
        let version = inner.owned_version(plugin_id, version_id)?;
        Ok(inner.read(version))
    }

    async fn upsert_tag(&self, tag: Tag) -> VaultResult<Option<Tag>> {
        let mut inner = self.inner.write().await;
        inner.owned_version(&tag.plugin_id, &tag.version_id)?;
        let key = (tag.plugin_id.clone(), tag.name.clone());
        Ok(inner.tags.insert(key, tag))
    }

    async fn get_tag(&self, plugin_id: &str, name: &str) -> VaultResult<Option<Tag>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tags
            .get(&(plugin_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_tag(&self, plugin_id: &str, name: &str, version_id: &str) -> VaultResult<Tag> {
        let mut inner = self.inner.write().await;
        let key = (plugin_id.to_string(), name.to_string());
        match inner.tags.get(&key) {
            Some(tag) if tag.version_id == version_id => {}
            _ => {
                return Err(VaultError::TagNotFound {
                    plugin_id: plugin_id.to_string(),
                    tag: name.to_string(),
                })
            }
        }
        inner.tags.remove(&key).ok_or_else(|| VaultError::TagNotFound {
            plugin_id: plugin_id.to_string(),
            tag: name.to_string(),
        })
    }

    async fn list_tags(&self, version_id: &str) -> VaultResult<Vec<Tag>> {
        let inner = self.inner.read().await;
        let mut tags: Vec<Tag> = inner
            .tags
            .values()
            .filter(|t| t.version_id == version_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn list_plugin_tags(&self, plugin_id: &str) -> VaultResult<Vec<Tag>> {
        let inner = self.inner.read().await;
        let mut tags: Vec<Tag> = inner
            .tags
            .values()
            .filter(|t| t.plugin_id == plugin_id)
            .cloned()
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags)
    }

    async fn get_comparison_if_fresh(
        &self,
        from_id: &str,
        to_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> VaultResult<Option<Comparison>> {
        let inner = self.inner.read().await;
        Ok(inner
            .comparisons
            .get(&(from_id.to_string(), to_id.to_string()))
            .filter(|c| c.computed_at > fresh_since)
            .cloned())
    }

    async fn upsert_comparison(&self, comparison: Comparison) -> VaultResult<()> {
        let mut inner = self.inner.write().await;
        let key = (comparison.from_id.clone(), comparison.to_id.clone());
        inner.comparisons.insert(key, comparison);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
