use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::VersioningConfig;
use crate::diff::{apply_patch, diff, stats_of};
use crate::error::{VaultError, VaultResult};
use crate::live::{LiveStateProvider, LiveStateSink};
use crate::model::patch::{PatchSet, Snapshot, VersionPayload};
use crate::model::state::{PluginId, PluginState};
use crate::model::tag::{Tag, BACKUP_TAG};
use crate::model::version::{
    Page, Version, VersionFilter, VersionKind, VersionNumber, VersionPage,
};
use crate::store::StateStore;
use crate::tags::{validate_tag_name, TagStore};

// ---------------------------------------------------------------------------
// VersionChain: commit, reconstruct and restore over a StateStore
// ---------------------------------------------------------------------------

/// Tunables of the commit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSettings {
    /// A commit becomes a snapshot once the current version is this many
    /// patches away from its nearest snapshot.
    pub snapshot_threshold: u32,
    /// Number of a plugin's first version.
    pub initial_version: VersionNumber,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            snapshot_threshold: 9,
            initial_version: VersionNumber::default(),
        }
    }
}

impl ChainSettings {
    pub fn from_config(config: &VersioningConfig) -> VaultResult<Self> {
        Ok(Self {
            snapshot_threshold: config.snapshot_threshold,
            initial_version: config.initial_version_number()?,
        })
    }
}

/// Input of a commit.
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub plugin_id: PluginId,
    pub state: PluginState,
    pub message: Option<String>,
    pub author: Option<String>,
    pub force_snapshot: bool,
    /// Tagging a commit also forces it to be a snapshot.
    pub tag: Option<String>,
}

impl CommitRequest {
    pub fn new(plugin_id: impl Into<PluginId>, state: PluginState) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            state,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn force_snapshot(mut self) -> Self {
        self.force_snapshot = true;
        self
    }
}

/// Result of a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub version: Version,
    pub kind: VersionKind,
    pub tag: Option<Tag>,
}

/// Input of a restore.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub plugin_id: PluginId,
    pub target: String,
    pub create_backup: bool,
    pub author: Option<String>,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The version that is now current.
    pub restored: Version,
    /// The safety snapshot taken before restoring, if requested.
    pub backup: Option<CommitOutcome>,
}

/// A version with its tags and stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDetail {
    pub version: Version,
    pub tags: Vec<Tag>,
    pub payload: VersionPayload,
}

/// Orchestrates commits, reconstruction and restores for all plugins.
///
/// Writers are serialized per plugin. The store's compare-and-swap on the
/// current pointer remains the final guard against writers in other
/// processes sharing the same store; those surface as `Conflict`.
pub struct VersionChain {
    store: Arc<dyn StateStore>,
    provider: Arc<dyn LiveStateProvider>,
    sink: Arc<dyn LiveStateSink>,
    tags: TagStore,
    clock: Arc<dyn Clock>,
    settings: ChainSettings,
    writers: Mutex<HashMap<PluginId, Arc<tokio::sync::Mutex<()>>>>,
}

impl VersionChain {
    pub fn new(
        store: Arc<dyn StateStore>,
        provider: Arc<dyn LiveStateProvider>,
        sink: Arc<dyn LiveStateSink>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            tags: TagStore::new(store.clone()),
            store,
            provider,
            sink,
            clock: Arc::new(SystemClock),
            settings,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.tags = self.tags.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn tags(&self) -> &TagStore {
        &self.tags
    }

    fn writer(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writers
            .entry(plugin_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Forget the plugin's writer once no other task holds or awaits it.
    fn release_writer(&self, plugin_id: &str, writer: Arc<tokio::sync::Mutex<()>>) {
        let mut writers = self
            .writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = writers
            .get(plugin_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &writer) && Arc::strong_count(&writer) == 2);
        if idle {
            writers.remove(plugin_id);
        }
    }

    #[cfg(test)]
    fn tracked_writers(&self) -> usize {
        self.writers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// The plugin's current version, or None before its first commit.
    async fn current_or_none(&self, plugin_id: &str) -> VaultResult<Option<Version>> {
        match self.store.get_current(plugin_id).await {
            Ok(version) => Ok(Some(version)),
            Err(VaultError::PluginNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Snapshot when forced, tagged, first, or far enough from the last
    /// snapshot; patch otherwise.
    fn decide_kind(&self, current: Option<&Version>, force: bool, tagged: bool) -> VersionKind {
        match current {
            None => VersionKind::Snapshot,
            Some(_) if force || tagged => VersionKind::Snapshot,
            Some(parent) if parent.snapshot_distance >= self.settings.snapshot_threshold => {
                VersionKind::Snapshot
            }
            Some(_) => VersionKind::Patch,
        }
    }

    /// Highest number the plugin has used, patch component bumped. Numbers
    /// stay unique when a restore forks the tree.
    async fn next_number(&self, plugin_id: &str) -> VaultResult<VersionNumber> {
        let page = self
            .store
            .list_versions(plugin_id, VersionFilter::All, Page::unbounded())
            .await?;
        Ok(page
            .versions
            .iter()
            .map(|v| v.number)
            .max()
            .map(VersionNumber::bump_patch)
            .unwrap_or(self.settings.initial_version))
    }

    /// Record `request.state` as the plugin's new current version.
    pub async fn commit(&self, request: CommitRequest) -> VaultResult<CommitOutcome> {
        let tag_name = match &request.tag {
            Some(name) => Some(validate_tag_name(name)?.to_string()),
            None => None,
        };

        let plugin_id = request.plugin_id.clone();
        let writer = self.writer(&plugin_id);
        let result = {
            let _guard = writer.lock().await;
            self.commit_locked(request, tag_name).await
        };
        self.release_writer(&plugin_id, writer);
        result
    }

    /// Body of `commit`; the caller holds the plugin's writer lock and has
    /// validated `tag_name`.
    async fn commit_locked(
        &self,
        request: CommitRequest,
        tag_name: Option<String>,
    ) -> VaultResult<CommitOutcome> {
        let plugin_id = request.plugin_id.as_str();
        let current = self.current_or_none(plugin_id).await?;
        let kind = self.decide_kind(current.as_ref(), request.force_snapshot, tag_name.is_some());

        let (version, payload) = match &current {
            None => {
                let stats = stats_of(&diff(&PluginState::new(), &request.state));
                let version = Version::root(plugin_id, self.settings.initial_version).with_stats(stats);
                let payload = VersionPayload::Snapshot(Snapshot {
                    state: request.state,
                });
                (version, payload)
            }
            Some(parent) => {
                let number = self.next_number(plugin_id).await?;
                let parent_state = self.reconstruct_version(parent).await?;
                let patch = diff(&parent_state, &request.state);
                let stats = stats_of(&patch);
                if patch.is_empty() {
                    debug!(plugin_id, parent = %parent.id, "committing without changes");
                }
                let version = Version::child_of(parent, number, kind).with_stats(stats);
                let payload = match kind {
                    VersionKind::Snapshot => VersionPayload::Snapshot(Snapshot {
                        state: request.state,
                    }),
                    VersionKind::Patch => VersionPayload::Patch(patch),
                };
                (version, payload)
            }
        };

        let mut version = version
            .with_message(request.message)
            .with_author(request.author.clone())
            .with_created_at(self.clock.now());

        let expected = current.as_ref().map(|v| v.id.clone());
        if let Err(e) = self
            .store
            .put_version(version.clone(), payload, expected)
            .await
        {
            if matches!(e, VaultError::Conflict(_)) {
                warn!(plugin_id, error = %e, "commit lost a race for the current version");
            }
            return Err(e);
        }
        version.is_current = true;

        info!(
            plugin_id,
            version_id = %version.id,
            number = %version.number,
            kind = %kind,
            files_changed = version.stats.files_changed,
            "committed version"
        );

        let tag = match tag_name {
            Some(name) => Some(
                self.tags
                    .add(plugin_id, &name, &version.id, request.author)
                    .await?,
            ),
            None => None,
        };

        Ok(CommitOutcome { version, kind, tag })
    }

    /// Commit whatever the live plugin currently holds.
    pub async fn commit_live(
        &self,
        plugin_id: &str,
        message: Option<String>,
        author: Option<String>,
        force_snapshot: bool,
        tag: Option<String>,
    ) -> VaultResult<CommitOutcome> {
        let state = self.provider.current_state(plugin_id).await?;
        self.commit(CommitRequest {
            plugin_id: plugin_id.to_string(),
            state,
            message,
            author,
            force_snapshot,
            tag,
        })
        .await
    }

    /// The full plugin state at `version_id`.
    pub async fn reconstruct(&self, plugin_id: &str, version_id: &str) -> VaultResult<PluginState> {
        let target = self.store.get_version(plugin_id, version_id).await?;
        self.reconstruct_version(&target).await
    }

    /// Walk parents collecting patch sets until a snapshot, then replay them
    /// oldest first.
    async fn reconstruct_version(&self, target: &Version) -> VaultResult<PluginState> {
        let result = self.replay_chain(target).await;
        if let Err(e) = &result {
            if e.is_integrity_failure() {
                error!(
                    plugin_id = %target.plugin_id,
                    version_id = %target.id,
                    error = %e,
                    "version chain integrity failure"
                );
            }
        }
        result
    }

    async fn replay_chain(&self, target: &Version) -> VaultResult<PluginState> {
        let mut patches: Vec<PatchSet> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor = target.clone();

        let base = loop {
            if !visited.insert(cursor.id.clone()) {
                return Err(VaultError::broken(&cursor.id, "parent chain contains a cycle"));
            }
            match cursor.kind {
                VersionKind::Snapshot => {
                    let snapshot = self
                        .store
                        .get_snapshot(&cursor.id)
                        .await?
                        .ok_or_else(|| VaultError::broken(&cursor.id, "snapshot payload missing"))?;
                    break snapshot.state;
                }
                VersionKind::Patch => {
                    let patch = self
                        .store
                        .get_patch_set(&cursor.id)
                        .await?
                        .ok_or_else(|| VaultError::broken(&cursor.id, "patch payload missing"))?;
                    patches.push(patch);

                    let parent_id = cursor.parent_id.clone().ok_or_else(|| {
                        VaultError::broken(&cursor.id, "patch chain reached a root without a snapshot")
                    })?;
                    cursor = match self.store.get_version(&target.plugin_id, &parent_id).await {
                        Ok(parent) => parent,
                        Err(e) if e.is_not_found() => {
                            return Err(VaultError::broken(
                                &cursor.id,
                                format!("ancestor {} is missing", parent_id),
                            ))
                        }
                        Err(e) => return Err(e),
                    };
                }
            }
        };

        debug!(
            version_id = %target.id,
            snapshot = %cursor.id,
            patches = patches.len(),
            "reconstructing version"
        );

        let mut state = base;
        for patch in patches.iter().rev() {
            state = apply_patch(&state, patch)?;
        }
        Ok(state)
    }

    /// Rewind the plugin to `request.target`, optionally taking a backup
    /// snapshot of the live state first. No version is created for the
    /// restore itself; later commits fork from the target.
    ///
    /// The backup and the pointer move happen under the plugin's writer lock,
    /// so no commit can land between them. The live sink is written before
    /// the current pointer moves: if that final step fails, the live plugin
    /// already runs the target state while `current` still names the old
    /// version. That divergence is logged at error level and the error is
    /// returned; retrying the restore converges both.
    pub async fn restore(&self, request: RestoreRequest) -> VaultResult<RestoreOutcome> {
        let writer = self.writer(&request.plugin_id);
        let result = {
            let _guard = writer.lock().await;
            self.restore_locked(&request).await
        };
        self.release_writer(&request.plugin_id, writer);
        result
    }

    async fn restore_locked(&self, request: &RestoreRequest) -> VaultResult<RestoreOutcome> {
        let plugin_id = request.plugin_id.as_str();
        let target = self.store.get_version(plugin_id, &request.target).await?;

        let backup = if request.create_backup {
            let outcome = self
                .backup_live(plugin_id, request, &target)
                .await
                .map_err(|e| {
                    error!(plugin_id, error = %e, "backup failed, restore aborted");
                    e
                })?;
            Some(outcome)
        } else {
            None
        };

        let state = self.reconstruct_version(&target).await?;
        let current = self.store.get_current(plugin_id).await?;
        self.sink.apply_state(plugin_id, state).await?;

        if let Err(e) = self
            .store
            .set_current(plugin_id, Some(current.id.clone()), &target.id)
            .await
        {
            error!(
                plugin_id,
                live = %target.id,
                current = %current.id,
                error = %e,
                "live state restored but current pointer not moved"
            );
            return Err(e);
        }

        info!(
            plugin_id,
            from = %current.id,
            to = %target.id,
            backup = backup.is_some(),
            "restored version"
        );

        let restored = self.store.get_version(plugin_id, &target.id).await?;
        Ok(RestoreOutcome { restored, backup })
    }

    /// Forced snapshot of the live state tagged `backup`. Runs under the
    /// writer lock held by `restore`.
    async fn backup_live(
        &self,
        plugin_id: &str,
        request: &RestoreRequest,
        target: &Version,
    ) -> VaultResult<CommitOutcome> {
        let state = self.provider.current_state(plugin_id).await?;
        self.commit_locked(
            CommitRequest {
                plugin_id: plugin_id.to_string(),
                state,
                message: Some(format!("Backup before restoring to {}", target.number)),
                author: request.author.clone(),
                force_snapshot: true,
                tag: None,
            },
            Some(BACKUP_TAG.to_string()),
        )
        .await
    }

    pub async fn list_versions(
        &self,
        plugin_id: &str,
        filter: VersionFilter,
        page: Page,
    ) -> VaultResult<VersionPage> {
        self.store.list_versions(plugin_id, filter, page).await
    }

    pub async fn current(&self, plugin_id: &str) -> VaultResult<Version> {
        self.store.get_current(plugin_id).await
    }

    pub async fn version_detail(&self, plugin_id: &str, version_id: &str) -> VaultResult<VersionDetail> {
        let version = self.store.get_version(plugin_id, version_id).await?;
        let payload = match version.kind {
            VersionKind::Snapshot => self
                .store
                .get_snapshot(version_id)
                .await?
                .map(VersionPayload::Snapshot),
            VersionKind::Patch => self
                .store
                .get_patch_set(version_id)
                .await?
                .map(VersionPayload::Patch),
        }
        .ok_or_else(|| VaultError::broken(version_id, "payload missing"))?;
        let tags = self.tags.list_for_version(version_id).await?;
        Ok(VersionDetail {
            version,
            tags,
            payload,
        })
    }

    /// Versions from `version_id` back to the plugin's root.
    pub async fn ancestry(&self, plugin_id: &str, version_id: &str) -> VaultResult<Vec<Version>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(version_id.to_string());

        while let Some(id) = next {
            if !visited.insert(id.clone()) {
                return Err(VaultError::broken(&id, "parent chain contains a cycle"));
            }
            let version = self.store.get_version(plugin_id, &id).await?;
            next = version.parent_id.clone();
            chain.push(version);
        }
        Ok(chain)
    }

    pub async fn publish(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version> {
        let version = self.store.set_published(plugin_id, version_id, true).await?;
        info!(plugin_id, version_id, "published version");
        Ok(version)
    }

    pub async fn unpublish(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version> {
        let version = self.store.set_published(plugin_id, version_id, false).await?;
        info!(plugin_id, version_id, "unpublished version");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::InMemoryLiveRegistry;
    use crate::model::patch::{ComponentDelta, PatchOp, PatchOpKind};
    use crate::model::state::ComponentValue;
    use crate::store::InMemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    struct Fixture {
        chain: VersionChain,
        store: Arc<InMemoryStateStore>,
        live: Arc<InMemoryLiveRegistry>,
    }

    fn fixture(settings: ChainSettings) -> Fixture {
        let store = Arc::new(InMemoryStateStore::new());
        let live = Arc::new(InMemoryLiveRegistry::new());
        let chain = VersionChain::new(store.clone(), live.clone(), live.clone(), settings);
        Fixture { chain, store, live }
    }

    fn controller(body: &str) -> PluginState {
        PluginState::new().with_source("controller", body)
    }

    #[tokio::test]
    async fn test_first_commit_is_root_snapshot() {
        let f = fixture(ChainSettings::default());
        let outcome = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")).with_message("init"))
            .await
            .unwrap();

        assert_eq!(outcome.kind, VersionKind::Snapshot);
        assert!(outcome.version.is_root());
        assert!(outcome.version.is_current);
        assert_eq!(outcome.version.number, VersionNumber::new(1, 0, 0));
        assert_eq!(outcome.version.stats.files_changed, 1);
        assert_eq!(outcome.version.message.as_deref(), Some("init"));
    }

    #[tokio::test]
    async fn test_second_commit_is_patch() {
        let f = fixture(ChainSettings::default());
        let first = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let second = f
            .chain
            .commit(CommitRequest::new("orders", controller("v2")))
            .await
            .unwrap();

        assert_eq!(second.kind, VersionKind::Patch);
        assert_eq!(second.version.number, VersionNumber::new(1, 0, 1));
        assert_eq!(second.version.parent_id.as_deref(), Some(first.version.id.as_str()));

        let patch = f.store.get_patch_set(&second.version.id).await.unwrap().unwrap();
        assert_eq!(patch.len(), 1);
        assert_eq!(patch.ops[0].key(), "controller");
        assert_eq!(patch.ops[0].kind(), PatchOpKind::Modify);

        assert_eq!(
            f.chain.reconstruct("orders", &second.version.id).await.unwrap(),
            controller("v2")
        );
    }

    #[tokio::test]
    async fn test_every_commit_reconstructs() {
        let f = fixture(ChainSettings {
            snapshot_threshold: 3,
            ..Default::default()
        });
        let mut committed = Vec::new();
        for i in 0..12 {
            let mut state = controller(&format!("line a\nline {}\nline c\n", i));
            if i % 3 == 0 {
                state.insert(format!("route:r{}", i), crate::model::ComponentValue::config(json!({"n": i})));
            }
            if i > 4 {
                state.insert("manifest:name", crate::model::ComponentValue::config(json!("orders")));
            }
            let outcome = f
                .chain
                .commit(CommitRequest::new("orders", state.clone()))
                .await
                .unwrap();
            committed.push((outcome.version.id, state));
        }

        for (id, state) in &committed {
            assert_eq!(&f.chain.reconstruct("orders", id).await.unwrap(), state);
        }
    }

    #[tokio::test]
    async fn test_snapshot_cadence() {
        let f = fixture(ChainSettings::default());
        f.chain
            .commit(CommitRequest::new("orders", controller("0")))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for i in 1..=10 {
            let outcome = f
                .chain
                .commit(CommitRequest::new("orders", controller(&i.to_string())))
                .await
                .unwrap();
            kinds.push(outcome.kind);
        }

        assert!(kinds[..9].iter().all(|k| *k == VersionKind::Patch));
        assert_eq!(kinds[9], VersionKind::Snapshot);
    }

    #[tokio::test]
    async fn test_forced_and_tagged_commits_snapshot() {
        let f = fixture(ChainSettings::default());
        f.chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let forced = f
            .chain
            .commit(CommitRequest::new("orders", controller("v2")).force_snapshot())
            .await
            .unwrap();
        assert_eq!(forced.kind, VersionKind::Snapshot);

        let tagged = f
            .chain
            .commit(CommitRequest::new("orders", controller("v3")).with_tag("v1.0.3"))
            .await
            .unwrap();
        assert_eq!(tagged.kind, VersionKind::Snapshot);
        assert_eq!(tagged.tag.unwrap().version_id, tagged.version.id);
    }

    #[tokio::test]
    async fn test_empty_commit_is_allowed() {
        let f = fixture(ChainSettings::default());
        f.chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let empty = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")).with_message("audit"))
            .await
            .unwrap();
        assert_eq!(empty.kind, VersionKind::Patch);
        assert!(empty.version.stats.is_empty());
        assert!(f
            .store
            .get_patch_set(&empty.version.id)
            .await
            .unwrap()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_restore_with_backup() {
        let f = fixture(ChainSettings::default());
        let c1 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        f.chain
            .commit(CommitRequest::new("orders", controller("v2")))
            .await
            .unwrap();
        f.live.set_state("orders", controller("v2")).await;

        let outcome = f
            .chain
            .restore(RestoreRequest {
                plugin_id: "orders".to_string(),
                target: c1.version.id.clone(),
                create_backup: true,
                author: Some("dana".to_string()),
            })
            .await
            .unwrap();

        let backup = outcome.backup.unwrap();
        assert_eq!(backup.kind, VersionKind::Snapshot);
        assert_eq!(
            f.chain.reconstruct("orders", &backup.version.id).await.unwrap(),
            controller("v2")
        );
        assert_eq!(backup.tag.unwrap().name, BACKUP_TAG);

        assert_eq!(f.live.current_state("orders").await.unwrap(), controller("v1"));
        assert_eq!(f.chain.current("orders").await.unwrap().id, c1.version.id);
        assert!(outcome.restored.is_current);
    }

    #[tokio::test]
    async fn test_restore_backup_failure_aborts() {
        let f = fixture(ChainSettings::default());
        let c1 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let c2 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v2")))
            .await
            .unwrap();

        // No live state registered: the backup cannot be taken.
        let err = f
            .chain
            .restore(RestoreRequest {
                plugin_id: "orders".to_string(),
                target: c1.version.id.clone(),
                create_backup: true,
                author: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.chain.current("orders").await.unwrap().id, c2.version.id);
    }

    #[tokio::test]
    async fn test_commit_after_restore_forks_with_unique_number() {
        let f = fixture(ChainSettings::default());
        let c1 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let c2 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v2")))
            .await
            .unwrap();
        f.chain
            .restore(RestoreRequest {
                plugin_id: "orders".to_string(),
                target: c1.version.id.clone(),
                create_backup: false,
                author: None,
            })
            .await
            .unwrap();

        let fork = f
            .chain
            .commit(CommitRequest::new("orders", controller("v3")))
            .await
            .unwrap();
        assert_eq!(fork.version.parent_id.as_deref(), Some(c1.version.id.as_str()));
        assert_eq!(fork.version.number, VersionNumber::new(1, 0, 2));
        assert_ne!(fork.version.number, c2.version.number);

        // The orphaned branch is still intact.
        assert_eq!(
            f.chain.reconstruct("orders", &c2.version.id).await.unwrap(),
            controller("v2")
        );

        let page = f
            .chain
            .list_versions("orders", VersionFilter::All, Page::unbounded())
            .await
            .unwrap();
        assert_eq!(page.versions.iter().filter(|v| v.is_current).count(), 1);
    }

    #[tokio::test]
    async fn test_reconstruct_detects_root_patch() {
        let f = fixture(ChainSettings::default());
        let mut root = Version::root("orders", VersionNumber::default());
        root.kind = VersionKind::Patch;
        f.store
            .put_version(root.clone(), VersionPayload::Patch(PatchSet::default()), None)
            .await
            .unwrap();

        let err = f.chain.reconstruct("orders", &root.id).await.unwrap_err();
        assert!(matches!(err, VaultError::BrokenChain { .. }));
    }

    #[tokio::test]
    async fn test_reconstruct_unknown_version() {
        let f = fixture(ChainSettings::default());
        let err = f.chain.reconstruct("orders", "v-missing").await.unwrap_err();
        assert!(matches!(err, VaultError::VersionNotFound(_)));
    }

    #[tokio::test]
    async fn test_publish_and_detail() {
        let f = fixture(ChainSettings::default());
        let c1 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")).with_tag("first"))
            .await
            .unwrap();
        let published = f.chain.publish("orders", &c1.version.id).await.unwrap();
        assert!(published.is_published);

        let detail = f.chain.version_detail("orders", &c1.version.id).await.unwrap();
        assert_eq!(detail.tags.len(), 1);
        assert!(matches!(detail.payload, VersionPayload::Snapshot(_)));

        let page = f
            .chain
            .list_versions("orders", VersionFilter::Published, Page::unbounded())
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        assert!(!f.chain.unpublish("orders", &c1.version.id).await.unwrap().is_published);
    }

    #[tokio::test]
    async fn test_ancestry_walks_to_root() {
        let f = fixture(ChainSettings::default());
        let mut ids = Vec::new();
        for body in ["a", "b", "c"] {
            ids.push(
                f.chain
                    .commit(CommitRequest::new("orders", controller(body)))
                    .await
                    .unwrap()
                    .version
                    .id,
            );
        }
        let ancestry = f.chain.ancestry("orders", &ids[2]).await.unwrap();
        let walked: Vec<&str> = ancestry.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(walked, vec![ids[2].as_str(), ids[1].as_str(), ids[0].as_str()]);
    }

    #[tokio::test]
    async fn test_concurrent_commits_keep_one_current() {
        let f = Arc::new(fixture(ChainSettings::default()));
        f.chain
            .commit(CommitRequest::new("orders", controller("base")))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let f = f.clone();
            handles.push(tokio::spawn(async move {
                f.chain
                    .commit(CommitRequest::new("orders", controller(&format!("v{}", i))))
                    .await
                    .map(|o| o.version.number)
            }));
        }
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap());
        }
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), 8);

        let page = f
            .chain
            .list_versions("orders", VersionFilter::All, Page::unbounded())
            .await
            .unwrap();
        assert_eq!(page.total, 9);
        assert_eq!(page.versions.iter().filter(|v| v.is_current).count(), 1);
        assert_eq!(f.chain.tracked_writers(), 0);
    }

    #[tokio::test]
    async fn test_writer_entries_are_released() {
        let f = fixture(ChainSettings::default());
        let c1 = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        f.chain
            .commit(CommitRequest::new("billing", controller("v1")))
            .await
            .unwrap();
        f.chain
            .restore(RestoreRequest {
                plugin_id: "orders".to_string(),
                target: c1.version.id,
                create_backup: false,
                author: None,
            })
            .await
            .unwrap();
        assert_eq!(f.chain.tracked_writers(), 0);
    }

    #[tokio::test]
    async fn test_reconstruct_reports_hash_mismatch() {
        let f = fixture(ChainSettings::default());
        let root = f
            .chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap()
            .version;

        let child = Version::child_of(&root, root.number.bump_patch(), VersionKind::Patch);
        let patch = PatchSet::new(vec![PatchOp::Modify {
            key: "controller".to_string(),
            old_hash: ComponentValue::source("something else").content_hash(),
            delta: ComponentDelta::Replace {
                value: ComponentValue::source("v2"),
            },
            lines_added: 1,
            lines_deleted: 1,
        }]);
        f.store
            .put_version(child.clone(), VersionPayload::Patch(patch), Some(root.id.clone()))
            .await
            .unwrap();

        let err = f.chain.reconstruct("orders", &child.id).await.unwrap_err();
        assert!(matches!(err, VaultError::CorruptPatch { ref key, .. } if key == "controller"));
    }

    /// Live provider that parks inside `current_state` until released.
    struct GatedProvider {
        state: PluginState,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl LiveStateProvider for GatedProvider {
        async fn current_state(&self, _plugin_id: &str) -> VaultResult<PluginState> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.state.clone())
        }
    }

    #[tokio::test]
    async fn test_restore_backup_blocks_concurrent_commits() {
        let store = Arc::new(InMemoryStateStore::new());
        let live = Arc::new(InMemoryLiveRegistry::new());
        let provider = Arc::new(GatedProvider {
            state: controller("v2"),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let chain = Arc::new(VersionChain::new(
            store,
            provider.clone(),
            live.clone(),
            ChainSettings::default(),
        ));

        let c1 = chain
            .commit(CommitRequest::new("orders", controller("v1")))
            .await
            .unwrap();
        let c2 = chain
            .commit(CommitRequest::new("orders", controller("v2")))
            .await
            .unwrap();

        let restore = tokio::spawn({
            let chain = chain.clone();
            let target = c1.version.id.clone();
            async move {
                chain
                    .restore(RestoreRequest {
                        plugin_id: "orders".to_string(),
                        target,
                        create_backup: true,
                        author: None,
                    })
                    .await
            }
        });
        provider.entered.notified().await;

        let commit = tokio::spawn({
            let chain = chain.clone();
            async move {
                chain
                    .commit(CommitRequest::new("orders", controller("v3")))
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!commit.is_finished());

        provider.release.notify_one();
        let outcome = restore.await.unwrap().unwrap();
        let late = commit.await.unwrap().unwrap();

        let backup = outcome.backup.unwrap();
        assert_eq!(backup.version.parent_id.as_deref(), Some(c2.version.id.as_str()));
        assert_eq!(late.version.parent_id.as_deref(), Some(c1.version.id.as_str()));
        assert_eq!(live.current_state("orders").await.unwrap(), controller("v1"));
        assert_eq!(chain.tracked_writers(), 0);
    }
}
