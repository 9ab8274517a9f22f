use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::state::PluginId;
use crate::model::version::VersionId;

/// Tag name created automatically before a restore.
pub const BACKUP_TAG: &str = "backup";

/// Tag kinds. Reserved kinds are created by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Custom,
    Backup,
}

impl TagKind {
    /// Reserved names map to their reserved kind; everything else is custom.
    pub fn for_name(name: &str) -> Self {
        if name == BACKUP_TAG {
            TagKind::Backup
        } else {
            TagKind::Custom
        }
    }
}

/// A named, movable pointer to a version. Names are unique per plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub plugin_id: PluginId,
    pub name: String,
    pub version_id: VersionId,
    pub kind: TagKind,
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(
        plugin_id: impl Into<PluginId>,
        name: impl Into<String>,
        version_id: impl Into<VersionId>,
    ) -> Self {
        let name = name.into();
        Self {
            plugin_id: plugin_id.into(),
            kind: TagKind::for_name(&name),
            name,
            version_id: version_id.into(),
            author: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = author;
        self
    }
}
