pub mod lines;

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{VaultError, VaultResult};
use crate::model::patch::{ComponentDelta, LineEdit, PatchOp, PatchSet};
use crate::model::state::{ComponentValue, PluginState};
use crate::model::version::ChangeStats;

pub use lines::{apply_edits, diff_lines, LineDiff};

// ---------------------------------------------------------------------------
// Diff Engine: pure functions over plugin states
// ---------------------------------------------------------------------------

/// Compute the patch turning `base` into `target`.
///
/// Keys are visited in sorted order, so equal inputs always produce an
/// identical patch. Components with identical content produce no entry.
pub fn diff(base: &PluginState, target: &PluginState) -> PatchSet {
    let keys: BTreeSet<&String> = base.keys().chain(target.keys()).collect();
    let mut ops = Vec::new();

    for key in keys {
        match (base.get(key), target.get(key)) {
            (None, Some(value)) => ops.push(PatchOp::Add {
                key: key.clone(),
                value: value.clone(),
            }),
            (Some(old), None) => ops.push(PatchOp::Remove {
                key: key.clone(),
                old_hash: old.content_hash(),
                lines_deleted: old.line_count(),
            }),
            (Some(old), Some(new)) if old != new => {
                let (delta, lines_added, lines_deleted) = component_delta(old, new);
                ops.push(PatchOp::Modify {
                    key: key.clone(),
                    old_hash: old.content_hash(),
                    delta,
                    lines_added,
                    lines_deleted,
                });
            }
            _ => {}
        }
    }

    PatchSet::new(ops)
}

/// Pick the delta strategy for a modified component and count its lines.
fn component_delta(old: &ComponentValue, new: &ComponentValue) -> (ComponentDelta, usize, usize) {
    match (old, new) {
        (ComponentValue::Source(a), ComponentValue::Source(b)) => {
            let LineDiff {
                edits,
                added,
                deleted,
            } = diff_lines(a, b);
            (ComponentDelta::Lines { edits }, added, deleted)
        }
        (
            ComponentValue::Config(serde_json::Value::Object(a)),
            ComponentValue::Config(serde_json::Value::Object(b)),
        ) => {
            let set: BTreeMap<String, serde_json::Value> = b
                .iter()
                .filter(|(field, value)| a.get(field.as_str()) != Some(*value))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect();
            let unset: Vec<String> = a
                .keys()
                .filter(|field| !b.contains_key(field.as_str()))
                .cloned()
                .collect();
            let counts = diff_lines(&old.as_text(), &new.as_text());
            (
                ComponentDelta::Fields { set, unset },
                counts.added,
                counts.deleted,
            )
        }
        _ => {
            let counts = diff_lines(&old.as_text(), &new.as_text());
            (
                ComponentDelta::Replace { value: new.clone() },
                counts.added,
                counts.deleted,
            )
        }
    }
}

/// Apply a patch to `base`, producing the target state.
///
/// Any mismatch between the patch and the base it claims to apply to is a
/// `CorruptPatch` error: a missing key for modify/remove, an existing key for
/// add, a content hash mismatch, or an edit script that does not fit.
pub fn apply_patch(base: &PluginState, patch: &PatchSet) -> VaultResult<PluginState> {
    let mut state = base.clone();

    for op in &patch.ops {
        match op {
            PatchOp::Add { key, value } => {
                if state.contains(key) {
                    return Err(VaultError::corrupt(key, "add targets an existing component"));
                }
                state.insert(key.clone(), value.clone());
            }
            PatchOp::Remove { key, old_hash, .. } => {
                let old = state
                    .get(key)
                    .ok_or_else(|| VaultError::corrupt(key, "remove targets a missing component"))?;
                verify_hash(key, old, old_hash)?;
                state.remove(key);
            }
            PatchOp::Modify {
                key,
                old_hash,
                delta,
                ..
            } => {
                let old = state
                    .get(key)
                    .ok_or_else(|| VaultError::corrupt(key, "modify targets a missing component"))?;
                verify_hash(key, old, old_hash)?;
                let new = apply_delta(key, old, delta)?;
                state.insert(key.clone(), new);
            }
        }
    }

    Ok(state)
}

fn verify_hash(key: &str, value: &ComponentValue, expected: &str) -> VaultResult<()> {
    if value.content_hash() != expected {
        return Err(VaultError::corrupt(
            key,
            "base content does not match the patch's recorded hash",
        ));
    }
    Ok(())
}

fn apply_delta(key: &str, old: &ComponentValue, delta: &ComponentDelta) -> VaultResult<ComponentValue> {
    match delta {
        ComponentDelta::Lines { edits } => match old {
            ComponentValue::Source(text) => apply_line_edits(key, text, edits),
            ComponentValue::Config(_) => Err(VaultError::corrupt(
                key,
                "line delta applied to a config component",
            )),
        },
        ComponentDelta::Fields { set, unset } => match old {
            ComponentValue::Config(serde_json::Value::Object(fields)) => {
                let mut fields = fields.clone();
                for field in unset {
                    fields.remove(field);
                }
                for (field, value) in set {
                    fields.insert(field.clone(), value.clone());
                }
                Ok(ComponentValue::Config(serde_json::Value::Object(fields)))
            }
            _ => Err(VaultError::corrupt(
                key,
                "field delta applied to a non-object component",
            )),
        },
        ComponentDelta::Replace { value } => Ok(value.clone()),
    }
}

fn apply_line_edits(key: &str, text: &str, edits: &[LineEdit]) -> VaultResult<ComponentValue> {
    apply_edits(text, edits)
        .map(ComponentValue::Source)
        .map_err(|reason| VaultError::corrupt(key, reason))
}

/// Aggregate statistics of a patch.
pub fn stats_of(patch: &PatchSet) -> ChangeStats {
    patch.ops.iter().fold(ChangeStats::default(), |mut stats, op| {
        stats.files_changed += 1;
        stats.lines_added += op.lines_added();
        stats.lines_deleted += op.lines_deleted();
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::patch::PatchOpKind;
    use serde_json::json;

    fn order_plugin() -> PluginState {
        PluginState::new()
            .with_manifest_field("name", json!("orders"))
            .with_source(
                "controller:OrderController",
                "class OrderController {\n  list() {}\n}\n",
            )
            .with_component(
                "route:GET /orders",
                ComponentValue::config(json!({"handler": "list", "auth": true})),
            )
            .with_source("hook:afterSave", "notify();\n")
    }

    fn order_plugin_v2() -> PluginState {
        PluginState::new()
            .with_manifest_field("name", json!("orders"))
            .with_source(
                "controller:OrderController",
                "class OrderController {\n  list() {}\n  show() {}\n}\n",
            )
            .with_component(
                "route:GET /orders",
                ComponentValue::config(json!({"handler": "index", "cache": 60})),
            )
            .with_source("model:Order", "class Order {}\n")
    }

    #[test]
    fn test_diff_of_identical_states_is_empty() {
        let state = order_plugin();
        let patch = diff(&state, &state);
        assert!(patch.is_empty());
        assert_eq!(apply_patch(&state, &patch).unwrap(), state);
        assert!(stats_of(&patch).is_empty());
    }

    #[test]
    fn test_diff_classifies_and_sorts() {
        let patch = diff(&order_plugin(), &order_plugin_v2());
        let summary: Vec<(&str, PatchOpKind)> =
            patch.ops.iter().map(|op| (op.key(), op.kind())).collect();
        assert_eq!(
            summary,
            vec![
                ("controller:OrderController", PatchOpKind::Modify),
                ("hook:afterSave", PatchOpKind::Remove),
                ("model:Order", PatchOpKind::Add),
                ("route:GET /orders", PatchOpKind::Modify),
            ]
        );
    }

    #[test]
    fn test_apply_reconstructs_target() {
        let base = order_plugin();
        let target = order_plugin_v2();
        let patch = diff(&base, &target);
        assert_eq!(apply_patch(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_config_objects_use_field_deltas() {
        let patch = diff(&order_plugin(), &order_plugin_v2());
        let route = patch
            .ops
            .iter()
            .find(|op| op.key() == "route:GET /orders")
            .unwrap();
        match route {
            PatchOp::Modify {
                delta: ComponentDelta::Fields { set, unset },
                ..
            } => {
                assert_eq!(set.get("handler"), Some(&json!("index")));
                assert_eq!(set.get("cache"), Some(&json!(60)));
                assert_eq!(unset, &vec!["auth".to_string()]);
            }
            other => panic!("expected a field delta, got {:?}", other),
        }
    }

    #[test]
    fn test_type_change_replaces_value() {
        let base = PluginState::new().with_source("config:limits", "max=5\n");
        let target = PluginState::new()
            .with_component("config:limits", ComponentValue::config(json!({"max": 5})));
        let patch = diff(&base, &target);
        assert!(matches!(
            patch.ops[0],
            PatchOp::Modify {
                delta: ComponentDelta::Replace { .. },
                ..
            }
        ));
        assert_eq!(apply_patch(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_diff_is_deterministic() {
        let a = diff(&order_plugin(), &order_plugin_v2());
        let b = diff(&order_plugin(), &order_plugin_v2());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_diff_directionality() {
        let forward = diff(&order_plugin(), &order_plugin_v2());
        let backward = diff(&order_plugin_v2(), &order_plugin());

        assert_eq!(
            forward.keys_with(PatchOpKind::Add),
            backward.keys_with(PatchOpKind::Remove)
        );
        assert_eq!(
            forward.keys_with(PatchOpKind::Remove),
            backward.keys_with(PatchOpKind::Add)
        );
        assert_eq!(
            forward.keys_with(PatchOpKind::Modify),
            backward.keys_with(PatchOpKind::Modify)
        );

        let f = stats_of(&forward);
        let b = stats_of(&backward);
        assert_eq!(f.files_changed, b.files_changed);
        assert_eq!(f.lines_added, b.lines_deleted);
        assert_eq!(f.lines_deleted, b.lines_added);
    }

    #[test]
    fn test_stats_of() {
        let base = PluginState::new()
            .with_source("controller:A", "a\nb\n")
            .with_source("hook:gone", "x\ny\nz\n");
        let target = PluginState::new()
            .with_source("controller:A", "a\nc\n")
            .with_source("model:New", "n\n");
        let stats = stats_of(&diff(&base, &target));
        assert_eq!(stats.files_changed, 3);
        // modify: +1 -1, add: +1, remove: -3
        assert_eq!(stats.lines_added, 2);
        assert_eq!(stats.lines_deleted, 4);
    }

    #[test]
    fn test_apply_rejects_add_of_existing_key() {
        let base = PluginState::new().with_source("controller", "v1");
        let patch = PatchSet::new(vec![PatchOp::Add {
            key: "controller".to_string(),
            value: ComponentValue::source("v2"),
        }]);
        let err = apply_patch(&base, &patch).unwrap_err();
        assert!(matches!(err, VaultError::CorruptPatch { ref key, .. } if key == "controller"));
    }

    #[test]
    fn test_apply_rejects_missing_keys() {
        let patch = diff(
            &PluginState::new().with_source("controller", "v1"),
            &PluginState::new(),
        );
        let err = apply_patch(&PluginState::new(), &patch).unwrap_err();
        assert!(err.is_integrity_failure());

        let patch = diff(
            &PluginState::new().with_source("controller", "v1"),
            &PluginState::new().with_source("controller", "v2"),
        );
        assert!(apply_patch(&PluginState::new(), &patch).is_err());
    }

    #[test]
    fn test_apply_rejects_hash_mismatch() {
        let patch = diff(
            &PluginState::new().with_source("controller", "v1"),
            &PluginState::new().with_source("controller", "v2"),
        );
        let other_base = PluginState::new().with_source("controller", "something else");
        let err = apply_patch(&other_base, &patch).unwrap_err();
        assert!(matches!(err, VaultError::CorruptPatch { .. }));
    }
}
