//! RocksDB-backed state store.
//!
//! Version and tag records are bincode-encoded. Snapshot, patch and
//! comparison payloads carry `serde_json::Value` config components, which
//! bincode cannot decode, so they are stored as JSON.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, WriteBatch, DB};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{VaultError, VaultResult};
use crate::model::comparison::Comparison;
use crate::model::patch::{PatchSet, Snapshot, VersionPayload};
use crate::model::tag::Tag;
use crate::model::version::{Page, Version, VersionFilter, VersionId, VersionPage};
use crate::store::state_store::{check_insert, StateStore};

use super::{CF_COMPARISONS, CF_CURRENT, CF_PAYLOADS, CF_PLUGIN_VERSIONS, CF_TAGS, CF_VERSIONS};

/// RocksDB-backed state store.
///
/// Multi-key writes go through a `WriteBatch`; the write mutex serializes the
/// read-check-write sequences that implement compare-and-swap on the current
/// pointer.
#[derive(Clone)]
pub struct RocksStateStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

/// `<plugin>\0`: prefix shared by a plugin's index and tag keys.
fn plugin_prefix(plugin_id: &str) -> Vec<u8> {
    let mut key = plugin_id.as_bytes().to_vec();
    key.push(0);
    key
}

/// `<plugin>\0<seq be>`: insertion-ordered version index key.
fn index_key(plugin_id: &str, seq: u64) -> Vec<u8> {
    let mut key = plugin_prefix(plugin_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn tag_key(plugin_id: &str, name: &str) -> Vec<u8> {
    let mut key = plugin_prefix(plugin_id);
    key.extend_from_slice(name.as_bytes());
    key
}

fn comparison_key(from_id: &str, to_id: &str) -> Vec<u8> {
    let mut key = from_id.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(to_id.as_bytes());
    key
}

fn storage_err(context: &str, e: rocksdb::Error) -> VaultError {
    VaultError::Storage(format!("{}: {}", context, e))
}

impl RocksStateStore {
    /// Create a new RocksDB state store over a database opened with
    /// [`super::open_db`].
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn cf(&self, name: &str) -> VaultResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| VaultError::Storage(format!("Missing {} column family", name)))
    }

    fn encode_record<T: serde::Serialize>(&self, value: &T) -> VaultResult<Vec<u8>> {
        bincode::serialize(value)
            .map_err(|e| VaultError::Storage(format!("Failed to serialize record: {}", e)))
    }

    fn decode_record<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> VaultResult<T> {
        bincode::deserialize(bytes)
            .map_err(|e| VaultError::Storage(format!("Failed to deserialize record: {}", e)))
    }

    fn get_raw(&self, cf_name: &str, key: &[u8]) -> VaultResult<Option<Vec<u8>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| storage_err("Failed to read", e))
    }

    fn read_record(&self, version_id: &str) -> VaultResult<Option<Version>> {
        match self.get_raw(CF_VERSIONS, version_id.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn current_id(&self, plugin_id: &str) -> VaultResult<Option<VersionId>> {
        match self.get_raw(CF_CURRENT, plugin_id.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| VaultError::Storage(format!("Invalid current pointer: {}", e))),
            None => Ok(None),
        }
    }

    /// Fill in `is_current` from the pointer cell.
    fn with_current_flag(&self, mut version: Version) -> VaultResult<Version> {
        version.is_current = self.current_id(&version.plugin_id)?.as_deref() == Some(version.id.as_str());
        Ok(version)
    }

    fn owned_version(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version> {
        self.read_record(version_id)?
            .filter(|v| v.plugin_id == plugin_id)
            .ok_or_else(|| VaultError::VersionNotFound(version_id.to_string()))
    }

    /// Scan `cf_name` for all entries under `prefix`, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> VaultResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| storage_err("Failed to iterate", e))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// A plugin's version ids in insertion order.
    fn plugin_version_ids(&self, plugin_id: &str) -> VaultResult<Vec<VersionId>> {
        self.scan_prefix(CF_PLUGIN_VERSIONS, &plugin_prefix(plugin_id))?
            .into_iter()
            .map(|(_, value)| {
                String::from_utf8(value)
                    .map_err(|e| VaultError::Storage(format!("Invalid version index entry: {}", e)))
            })
            .collect()
    }

    fn read_payload(&self, version_id: &str) -> VaultResult<Option<VersionPayload>> {
        match self.get_raw(CF_PAYLOADS, version_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> VaultResult<()> {
        self.db
            .write(batch)
            .map_err(|e| storage_err("Failed to write batch", e))
    }
}

#[async_trait]
impl StateStore for RocksStateStore {
    async fn put_version(
        &self,
        version: Version,
        payload: VersionPayload,
        expected_current: Option<VersionId>,
    ) -> VaultResult<VersionId> {
        let _guard = self.write_lock.lock().await;

        let parent = match &version.parent_id {
            Some(parent_id) => self.read_record(parent_id)?,
            None => None,
        };
        let existing = self.plugin_version_ids(&version.plugin_id)?;
        let current = self.current_id(&version.plugin_id)?;
        check_insert(
            &version,
            &payload,
            self.read_record(&version.id)?.is_some(),
            parent.as_ref(),
            !existing.is_empty(),
            current.as_ref(),
            expected_current.as_ref(),
        )?;

        let version_id = version.id.clone();
        let mut record = version;
        record.is_current = false;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_VERSIONS)?,
            version_id.as_bytes(),
            self.encode_record(&record)?,
        );
        batch.put_cf(
            self.cf(CF_PAYLOADS)?,
            version_id.as_bytes(),
            serde_json::to_vec(&payload)?,
        );
        batch.put_cf(
            self.cf(CF_PLUGIN_VERSIONS)?,
            index_key(&record.plugin_id, existing.len() as u64),
            version_id.as_bytes(),
        );
        batch.put_cf(
            self.cf(CF_CURRENT)?,
            record.plugin_id.as_bytes(),
            version_id.as_bytes(),
        );
        self.write(batch)?;

        Ok(version_id)
    }

    async fn get_version(&self, plugin_id: &str, version_id: &str) -> VaultResult<Version> {
        let version = self.owned_version(plugin_id, version_id)?;
        self.with_current_flag(version)
    }

    async fn get_current(&self, plugin_id: &str) -> VaultResult<Version> {
        let current_id = self
            .current_id(plugin_id)?
            .ok_or_else(|| VaultError::PluginNotFound(plugin_id.to_string()))?;
        let mut version = self.owned_version(plugin_id, &current_id)?;
        version.is_current = true;
        Ok(version)
    }

    async fn list_versions(
        &self,
        plugin_id: &str,
        filter: VersionFilter,
        page: Page,
    ) -> VaultResult<VersionPage> {
        let current = self.current_id(plugin_id)?;
        let mut matching = Vec::new();

        for id in self.plugin_version_ids(plugin_id)?.iter().rev() {
            if let Some(mut version) = self.read_record(id)? {
                if filter.matches(&version) {
                    version.is_current = current.as_deref() == Some(id.as_str());
                    matching.push(version);
                }
            }
        }

        let total = matching.len();
        Ok(VersionPage {
            versions: page.slice(matching),
            total,
        })
    }

    async fn get_snapshot(&self, version_id: &str) -> VaultResult<Option<Snapshot>> {
        Ok(match self.read_payload(version_id)? {
            Some(VersionPayload::Snapshot(snapshot)) => Some(snapshot),
            _ => None,
        })
    }

    async fn get_patch_set(&self, version_id: &str) -> VaultResult<Option<PatchSet>> {
        Ok(match self.read_payload(version_id)? {
            Some(VersionPayload::Patch(patch)) => Some(patch),
            _ => None,
        })
    }

    async fn set_current(
        &self,
        plugin_id: &str,
        expected: Option<VersionId>,
        target: &str,
    ) -> VaultResult<()> {
        let _guard = self.write_lock.lock().await;
        self.owned_version(plugin_id, target)?;

        let current = self.current_id(plugin_id)?;
        if current != expected {
            return Err(VaultError::Conflict(format!(
                "current version of plugin {} is {:?}, expected {:?}",
                plugin_id, current, expected
            )));
        }
        self.db
            .put_cf(self.cf(CF_CURRENT)?, plugin_id.as_bytes(), target.as_bytes())
            .map_err(|e| storage_err("Failed to move current pointer", e))
    }

    async fn set_published(
        &self,
        plugin_id: &str,
        version_id: &str,
        published: bool,
    ) -> VaultResult<Version> {
        let _guard = self.write_lock.lock().await;
        let mut version = self.owned_version(plugin_id, version_id)?;
        version.is_published = published;
        self.db
            .put_cf(
                self.cf(CF_VERSIONS)?,
                version_id.as_bytes(),
                self.encode_record(&version)?,
            )
            .map_err(|e| storage_err("Failed to update version", e))?;
        self.with_current_flag(version)
    }

    async fn upsert_tag(&self, tag: Tag) -> VaultResult<Option<Tag>> {
        let _guard = self.write_lock.lock().await;
        self.owned_version(&tag.plugin_id, &tag.version_id)?;

        let key = tag_key(&tag.plugin_id, &tag.name);
        let previous = match self.get_raw(CF_TAGS, &key)? {
            Some(bytes) => Some(self.decode_record::<Tag>(&bytes)?),
            None => None,
        };
        self.db
            .put_cf(self.cf(CF_TAGS)?, key, self.encode_record(&tag)?)
            .map_err(|e| storage_err("Failed to write tag", e))?;
        Ok(previous)
    }

    async fn get_tag(&self, plugin_id: &str, name: &str) -> VaultResult<Option<Tag>> {
        match self.get_raw(CF_TAGS, &tag_key(plugin_id, name))? {
            Some(bytes) => Ok(Some(self.decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_tag(&self, plugin_id: &str, name: &str, version_id: &str) -> VaultResult<Tag> {
        let _guard = self.write_lock.lock().await;
        let key = tag_key(plugin_id, name);
        let tag = match self.get_raw(CF_TAGS, &key)? {
            Some(bytes) => self.decode_record::<Tag>(&bytes)?,
            None => {
                return Err(VaultError::TagNotFound {
                    plugin_id: plugin_id.to_string(),
                    tag: name.to_string(),
                })
            }
        };
        if tag.version_id != version_id {
            return Err(VaultError::TagNotFound {
                plugin_id: plugin_id.to_string(),
                tag: name.to_string(),
            });
        }
        self.db
            .delete_cf(self.cf(CF_TAGS)?, key)
            .map_err(|e| storage_err("Failed to delete tag", e))?;
        Ok(tag)
    }

    async fn list_tags(&self, version_id: &str) -> VaultResult<Vec<Tag>> {
        let version = match self.read_record(version_id)? {
            Some(version) => version,
            None => return Ok(Vec::new()),
        };
        let tags = self.list_plugin_tags(&version.plugin_id).await?;
        Ok(tags
            .into_iter()
            .filter(|t| t.version_id == version_id)
            .collect())
    }

    async fn list_plugin_tags(&self, plugin_id: &str) -> VaultResult<Vec<Tag>> {
        self.scan_prefix(CF_TAGS, &plugin_prefix(plugin_id))?
            .into_iter()
            .map(|(_, value)| self.decode_record::<Tag>(&value))
            .collect()
    }

    async fn get_comparison_if_fresh(
        &self,
        from_id: &str,
        to_id: &str,
        fresh_since: DateTime<Utc>,
    ) -> VaultResult<Option<Comparison>> {
        match self.get_raw(CF_COMPARISONS, &comparison_key(from_id, to_id))? {
            Some(bytes) => {
                let comparison: Comparison = serde_json::from_slice(&bytes)?;
                Ok(Some(comparison).filter(|c| c.computed_at > fresh_since))
            }
            None => Ok(None),
        }
    }

    async fn upsert_comparison(&self, comparison: Comparison) -> VaultResult<()> {
        let key = comparison_key(&comparison.from_id, &comparison.to_id);
        self.db
            .put_cf(
                self.cf(CF_COMPARISONS)?,
                key,
                serde_json::to_vec(&comparison)?,
            )
            .map_err(|e| storage_err("Failed to write comparison", e))
    }
}
