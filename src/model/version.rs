use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VaultError;
use crate::model::state::PluginId;

// ---------------------------------------------------------------------------
// Version: immutable commit records with snapshot/patch payloads
// ---------------------------------------------------------------------------

/// A version identifier, unique within the state store.
pub type VersionId = String;

/// Generate a new version ID.
pub fn new_version_id() -> VersionId {
    format!("v-{}", Uuid::new_v4().as_simple())
}

/// Semantic version number `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionNumber {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionNumber {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Next number in the patch series. Major and minor never move here.
    pub fn bump_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl Default for VersionNumber {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionNumber {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            return Err(VaultError::InvalidInput(format!(
                "version number '{}' is not major.minor.patch",
                s
            )));
        }
        let parse = |part: &str| {
            part.parse::<u64>().map_err(|_| {
                VaultError::InvalidInput(format!("version number '{}' has a non-numeric part", s))
            })
        };
        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

/// How a version stores its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    /// Full copy of the plugin state.
    Snapshot,
    /// Delta against the parent version.
    Patch,
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKind::Snapshot => f.write_str("snapshot"),
            VersionKind::Patch => f.write_str("patch"),
        }
    }
}

/// Aggregate change statistics of a patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: usize,
    pub lines_added: usize,
    pub lines_deleted: usize,
}

impl ChangeStats {
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

/// A single commit in a plugin's version tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    /// Unique version identifier.
    pub id: VersionId,
    /// The plugin this version belongs to.
    pub plugin_id: PluginId,
    /// Semantic version number.
    pub number: VersionNumber,
    pub kind: VersionKind,
    /// Previous version (None only for the first version of a plugin).
    pub parent_id: Option<VersionId>,
    pub message: Option<String>,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Derived from the store's current pointer on every read; never persisted
    /// as authoritative state.
    #[serde(default)]
    pub is_current: bool,
    pub is_published: bool,
    pub stats: ChangeStats,
    /// Patch versions since the nearest snapshot ancestor (0 for snapshots).
    pub snapshot_distance: u32,
}

impl Version {
    /// Create the root snapshot of a plugin.
    pub fn root(plugin_id: impl Into<PluginId>, number: VersionNumber) -> Self {
        Self {
            id: new_version_id(),
            plugin_id: plugin_id.into(),
            number,
            kind: VersionKind::Snapshot,
            parent_id: None,
            message: None,
            author: None,
            created_at: Utc::now(),
            is_current: false,
            is_published: false,
            stats: ChangeStats::default(),
            snapshot_distance: 0,
        }
    }

    /// Create a child of `parent` with the given kind.
    pub fn child_of(parent: &Version, number: VersionNumber, kind: VersionKind) -> Self {
        let snapshot_distance = match kind {
            VersionKind::Snapshot => 0,
            VersionKind::Patch => parent.snapshot_distance + 1,
        };
        Self {
            id: new_version_id(),
            plugin_id: parent.plugin_id.clone(),
            number,
            kind,
            parent_id: Some(parent.id.clone()),
            message: None,
            author: None,
            created_at: Utc::now(),
            is_current: false,
            is_published: false,
            stats: ChangeStats::default(),
            snapshot_distance,
        }
    }

    /// Set the author for this version.
    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author;
        self
    }

    /// Set the message for this version.
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }

    pub fn with_stats(mut self, stats: ChangeStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn is_snapshot(&self) -> bool {
        self.kind == VersionKind::Snapshot
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Which versions a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionFilter {
    #[default]
    All,
    Snapshots,
    Patches,
    Published,
}

impl VersionFilter {
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionFilter::All => true,
            VersionFilter::Snapshots => version.kind == VersionKind::Snapshot,
            VersionFilter::Patches => version.kind == VersionKind::Patch,
            VersionFilter::Published => version.is_published,
        }
    }
}

/// Offset/limit window over a listing. `limit = None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Apply the window to an already ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// One page of versions plus the total matching the filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionPage {
    pub versions: Vec<Version>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_number_parse_and_display() {
        let number: VersionNumber = "1.4.2".parse().unwrap();
        assert_eq!(number, VersionNumber::new(1, 4, 2));
        assert_eq!(number.to_string(), "1.4.2");
        assert_eq!("v2.0.9".parse::<VersionNumber>().unwrap().patch, 9);
        assert!("1.4".parse::<VersionNumber>().is_err());
        assert!("1.x.0".parse::<VersionNumber>().is_err());
    }

    #[test]
    fn test_bump_patch_keeps_major_minor() {
        let next = VersionNumber::new(1, 4, 2).bump_patch();
        assert_eq!(next, VersionNumber::new(1, 4, 3));
    }

    #[test]
    fn test_child_snapshot_distance() {
        let root = Version::root("orders", VersionNumber::default());
        let patch = Version::child_of(&root, root.number.bump_patch(), VersionKind::Patch);
        let patch2 = Version::child_of(&patch, patch.number.bump_patch(), VersionKind::Patch);
        let snap = Version::child_of(&patch2, patch2.number.bump_patch(), VersionKind::Snapshot);

        assert_eq!(root.snapshot_distance, 0);
        assert_eq!(patch.snapshot_distance, 1);
        assert_eq!(patch2.snapshot_distance, 2);
        assert_eq!(snap.snapshot_distance, 0);
        assert_eq!(snap.parent_id.as_deref(), Some(patch2.id.as_str()));
    }

    #[test]
    fn test_page_slice() {
        let items = vec![1, 2, 3, 4, 5];
        assert_eq!(Page::new(1, 2).slice(items.clone()), vec![2, 3]);
        assert_eq!(Page::unbounded().slice(items.clone()), items);
        assert!(Page::new(10, 2).slice(items).is_empty());
    }
}
