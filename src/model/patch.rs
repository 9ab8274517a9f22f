use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::state::{ComponentValue, PluginState};
use crate::model::version::VersionKind;

// ---------------------------------------------------------------------------
// Patch payloads: typed operations instead of schemaless JSON blobs
// ---------------------------------------------------------------------------

/// One step of a line-level edit script, applied against the base text from
/// top to bottom. Lines keep their terminators so text round-trips exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEdit {
    /// Copy the next `n` base lines unchanged.
    Keep(usize),
    /// Skip the next `n` base lines.
    Delete(usize),
    /// Emit new lines.
    Insert(Vec<String>),
}

/// How a modified component gets from its base value to its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ComponentDelta {
    /// Line edit script over source text.
    Lines { edits: Vec<LineEdit> },
    /// Top-level key changes of a JSON object config.
    Fields {
        set: BTreeMap<String, serde_json::Value>,
        unset: Vec<String>,
    },
    /// Whole-value replacement (type changes, non-object configs).
    Replace { value: ComponentValue },
}

/// A single component change inside a patch set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    Add {
        key: String,
        value: ComponentValue,
    },
    Modify {
        key: String,
        /// Content hash of the base value this delta was computed against.
        old_hash: String,
        delta: ComponentDelta,
        lines_added: usize,
        lines_deleted: usize,
    },
    Remove {
        key: String,
        old_hash: String,
        lines_deleted: usize,
    },
}

/// Operation name, as reported in comparisons and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOpKind {
    Add,
    Modify,
    Remove,
}

impl PatchOp {
    pub fn key(&self) -> &str {
        match self {
            PatchOp::Add { key, .. } | PatchOp::Modify { key, .. } | PatchOp::Remove { key, .. } => {
                key
            }
        }
    }

    pub fn kind(&self) -> PatchOpKind {
        match self {
            PatchOp::Add { .. } => PatchOpKind::Add,
            PatchOp::Modify { .. } => PatchOpKind::Modify,
            PatchOp::Remove { .. } => PatchOpKind::Remove,
        }
    }

    /// Lines added by this operation.
    pub fn lines_added(&self) -> usize {
        match self {
            PatchOp::Add { value, .. } => value.line_count(),
            PatchOp::Modify { lines_added, .. } => *lines_added,
            PatchOp::Remove { .. } => 0,
        }
    }

    /// Lines deleted by this operation.
    pub fn lines_deleted(&self) -> usize {
        match self {
            PatchOp::Add { .. } => 0,
            PatchOp::Modify { lines_deleted, .. } | PatchOp::Remove { lines_deleted, .. } => {
                *lines_deleted
            }
        }
    }
}

/// The ordered set of component changes turning a parent state into a child
/// state. Ops are sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    pub ops: Vec<PatchOp>,
}

impl PatchSet {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn keys_with(&self, kind: PatchOpKind) -> Vec<String> {
        self.ops
            .iter()
            .filter(|op| op.kind() == kind)
            .map(|op| op.key().to_string())
            .collect()
    }
}

/// Full copy of a plugin state, attached to a snapshot version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: PluginState,
}

/// The payload persisted atomically with a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionPayload {
    Snapshot(Snapshot),
    Patch(PatchSet),
}

impl VersionPayload {
    pub fn kind(&self) -> VersionKind {
        match self {
            VersionPayload::Snapshot(_) => VersionKind::Snapshot,
            VersionPayload::Patch(_) => VersionKind::Patch,
        }
    }
}
