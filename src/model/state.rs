use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// PluginState: the reconstructable unit under version control
// ---------------------------------------------------------------------------

/// Identifier of a plugin under version control.
pub type PluginId = String;

/// Component kind used for manifest fields (`manifest:name`, `manifest:version`).
pub const MANIFEST_KIND: &str = "manifest";

/// Content of a single plugin component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ComponentValue {
    /// Source text (controllers, models, hooks). Diffed line by line.
    Source(String),
    /// Structured configuration (routes, manifest fields). Diffed by key
    /// when both sides are JSON objects.
    Config(serde_json::Value),
}

impl ComponentValue {
    pub fn source(text: impl Into<String>) -> Self {
        ComponentValue::Source(text.into())
    }

    pub fn config(value: serde_json::Value) -> Self {
        ComponentValue::Config(value)
    }

    /// The text the line-level diff and the line statistics operate on.
    /// Config values use pretty-printed JSON; serde_json keeps object keys
    /// sorted, so the rendering is canonical.
    pub fn as_text(&self) -> String {
        match self {
            ComponentValue::Source(text) => text.clone(),
            ComponentValue::Config(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }

    /// Number of lines this value contributes to line statistics.
    pub fn line_count(&self) -> usize {
        match self {
            ComponentValue::Source(text) => text.lines().count(),
            ComponentValue::Config(_) => self.as_text().lines().count(),
        }
    }

    /// SHA-256 (hex) over a canonical, type-tagged encoding. Patches record it
    /// so apply can verify it is transforming the value it was computed from.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            ComponentValue::Source(text) => {
                hasher.update(b"source\0");
                hasher.update(text.as_bytes());
            }
            ComponentValue::Config(value) => {
                hasher.update(b"config\0");
                hasher.update(value.to_string().as_bytes());
            }
        }
        let digest: [u8; 32] = hasher.finalize().into();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// The full set of named components of a plugin at one point in time.
///
/// Keys follow `<kind>:<name>`, e.g. `controller:OrderController` or
/// `route:GET /orders`. Manifest fields are components of kind `manifest`.
/// The map is ordered so every traversal is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub components: BTreeMap<String, ComponentValue>,
}

impl PluginState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with_component(mut self, key: impl Into<String>, value: ComponentValue) -> Self {
        self.components.insert(key.into(), value);
        self
    }

    /// Builder-style insert of a source component.
    pub fn with_source(self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_component(key, ComponentValue::source(text))
    }

    /// Builder-style insert of a manifest field.
    pub fn with_manifest_field(self, field: &str, value: serde_json::Value) -> Self {
        self.with_component(manifest_key(field), ComponentValue::config(value))
    }

    pub fn get(&self, key: &str) -> Option<&ComponentValue> {
        self.components.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ComponentValue) -> Option<ComponentValue> {
        self.components.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<ComponentValue> {
        self.components.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.components.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.components.keys()
    }

    /// Look up a manifest field by its bare name.
    pub fn manifest_field(&self, field: &str) -> Option<&serde_json::Value> {
        match self.components.get(&manifest_key(field)) {
            Some(ComponentValue::Config(value)) => Some(value),
            _ => None,
        }
    }

    /// Components of one kind, in key order.
    pub fn components_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ComponentValue)> + 'a {
        self.components
            .iter()
            .filter(move |(key, _)| component_kind(key) == kind)
    }
}

/// Kind prefix of a component key. A key without `:` is its own kind.
pub fn component_kind(key: &str) -> &str {
    key.split_once(':').map(|(kind, _)| kind).unwrap_or(key)
}

/// Component key of a manifest field.
pub fn manifest_key(field: &str) -> String {
    format!("{}:{}", MANIFEST_KIND, field)
}
