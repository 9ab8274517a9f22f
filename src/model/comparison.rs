use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::patch::{PatchOpKind, PatchSet};
use crate::model::version::{ChangeStats, VersionId};

/// A memoized directional diff between two reconstructed versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub from_id: VersionId,
    pub to_id: VersionId,
    pub patch: PatchSet,
    pub stats: ChangeStats,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl Comparison {
    /// Classify a computed patch into the component lists.
    pub fn from_patch(
        from_id: impl Into<VersionId>,
        to_id: impl Into<VersionId>,
        patch: PatchSet,
        stats: ChangeStats,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            added: patch.keys_with(PatchOpKind::Add),
            modified: patch.keys_with(PatchOpKind::Modify),
            deleted: patch.keys_with(PatchOpKind::Remove),
            patch,
            stats,
            computed_at,
        }
    }
}

/// A comparison plus whether it came from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    #[serde(flatten)]
    pub comparison: Comparison,
    pub cached: bool,
}
