//! Diff and merge of state trees
//!
//! A diff tree mirrors the state tree. A key mapped to `Null` is a tombstone
//! (delete at that path); any other key sets or, for maps, merges. Lists are
//! never diffed element-wise: a changed list is carried whole.

use std::sync::Arc;

use super::value::{Map, Value};

/// How a partial update is folded into the tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Recursive merge of nested maps
    #[default]
    Deep,
    /// Top-level keys are replaced wholesale
    Shallow,
}

/// Compute the changes that turn `old` into `new`.
///
/// An empty result means the trees are equal and nothing should be sent.
pub fn diff(old: &Map, new: &Map) -> Map {
    let mut changes = Map::new();

    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone(), Value::Null);
        }
    }

    for (key, new_value) in new {
        match old.get(key) {
            None => {
                changes.insert(key.clone(), new_value.clone());
            }
            Some(old_value) => {
                if let Some(change) = diff_value(old_value, new_value) {
                    changes.insert(key.clone(), change);
                }
            }
        }
    }

    changes
}

fn diff_value(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Map(a), Value::Map(b)) => {
            if Arc::ptr_eq(a, b) {
                return None;
            }
            let nested = diff(a, b);
            if nested.is_empty() {
                None
            } else {
                Some(Value::map(nested))
            }
        }
        _ if old.same_as(new) => None,
        _ => Some(new.clone()),
    }
}

/// Apply a diff tree onto `dest`.
///
/// Tombstones delete (absent keys are fine), maps recurse into the matching
/// map of `dest` (created or replacing a non-map value), and everything else
/// replaces wholesale.
pub fn merge(dest: &mut Map, changes: &Map) {
    for (key, change) in changes {
        match change {
            Value::Null => {
                dest.remove(key);
            }
            Value::Map(nested) => {
                let slot = dest
                    .entry(key.clone())
                    .or_insert_with(|| Value::Map(Arc::default()));
                if !matches!(slot, Value::Map(_)) {
                    *slot = Value::Map(Arc::default());
                }
                if let Value::Map(target) = slot {
                    merge(Arc::make_mut(target), nested);
                }
            }
            other => {
                dest.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Replace top-level keys of `dest` with those of `partial`.
///
/// A `Null` still deletes, so the tree never stores tombstones.
pub fn shallow_merge(dest: &mut Map, partial: &Map) {
    for (key, value) in partial {
        if value.is_null() {
            dest.remove(key);
        } else {
            dest.insert(key.clone(), value.clone());
        }
    }
}

/// Fold `partial` into `dest` using `mode`
pub fn merge_with(dest: &mut Map, partial: &Map, mode: MergeMode) {
    match mode {
        MergeMode::Deep => merge(dest, partial),
        MergeMode::Shallow => shallow_merge(dest, partial),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::value::map_from_json;
    use serde_json::json;

    fn tree(json: serde_json::Value) -> Map {
        map_from_json(json)
    }

    fn assert_roundtrip(a: serde_json::Value, b: serde_json::Value) {
        let old = tree(a);
        let new = tree(b);
        let changes = diff(&old, &new);
        let mut merged = old.clone();
        merge(&mut merged, &changes);
        assert_eq!(merged, new, "diff was {:?}", changes);
    }

    #[test]
    fn test_diff_of_equal_trees_is_empty() {
        let a = tree(json!({"counter": 1, "clients": {"1": {"name": "ada"}}, "list": [1, 2]}));
        assert!(diff(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_nan_leaves_diff_empty() {
        let mut a = Map::new();
        a.insert("ratio".to_string(), Value::Float(f64::NAN));
        a.insert("samples".to_string(), Value::list(vec![Value::Float(f64::NAN)]));
        let mut b = Map::new();
        b.insert("ratio".to_string(), Value::Float(f64::NAN));
        b.insert("samples".to_string(), Value::list(vec![Value::Float(f64::NAN)]));
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn test_diff_records_tombstones_and_changes() {
        let old = tree(json!({"a": 1, "b": {"c": 2, "d": 3}, "gone": true}));
        let new = tree(json!({"a": 2, "b": {"c": 2}, "added": "x"}));
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            tree(json!({"a": 2, "b": {"d": null}, "gone": null, "added": "x"}))
        );
    }

    #[test]
    fn test_list_difference_emits_whole_list() {
        let old = tree(json!({"list": [1, 2, 3]}));
        let new = tree(json!({"list": [1, 2, 4]}));
        assert_eq!(diff(&old, &new), tree(json!({"list": [1, 2, 4]})));
    }

    #[test]
    fn test_tombstone_deletion() {
        let mut dest = tree(json!({"a": {"b": 1, "c": 2}}));
        merge(&mut dest, &tree(json!({"a": {"b": null}})));
        assert_eq!(dest, tree(json!({"a": {"c": 2}})));
    }

    #[test]
    fn test_tombstone_for_missing_key_is_noop() {
        let mut dest = tree(json!({"a": 1}));
        merge(&mut dest, &tree(json!({"missing": null, "x": {"y": null}})));
        assert_eq!(dest, tree(json!({"a": 1, "x": {}})));
    }

    #[test]
    fn test_array_replacement() {
        let mut dest = tree(json!({"list": [1, 2]}));
        merge(&mut dest, &tree(json!({"list": [3]})));
        assert_eq!(dest, tree(json!({"list": [3]})));
    }

    #[test]
    fn test_merge_map_over_scalar() {
        let mut dest = tree(json!({"slot": 5}));
        merge(&mut dest, &tree(json!({"slot": {"inner": 1}})));
        assert_eq!(dest, tree(json!({"slot": {"inner": 1}})));
    }

    #[test]
    fn test_roundtrip_law() {
        assert_roundtrip(json!({}), json!({"a": {"b": {"c": [1, {"d": 2}]}}}));
        assert_roundtrip(json!({"a": {"b": 1}}), json!({}));
        assert_roundtrip(json!({"a": {"b": 1}}), json!({"a": {}}));
        assert_roundtrip(json!({"a": 1}), json!({"a": {"b": {"c": 1}}}));
        assert_roundtrip(json!({"a": {"b": 1}}), json!({"a": [1, 2]}));
        assert_roundtrip(json!({"a": [null, 1]}), json!({"a": [null]}));
        assert_roundtrip(
            json!({"counter": 1, "clients": {"1": {"name": "ada"}, "2": {"name": "bob"}}}),
            json!({"counter": 2, "clients": {"2": {"name": "bob", "score": 10}, "3": {}}}),
        );
    }

    #[test]
    fn test_shallow_merge_replaces_top_level() {
        let mut dest = tree(json!({"a": {"x": 1, "y": 2}, "b": 1}));
        shallow_merge(&mut dest, &tree(json!({"a": {"x": 5}, "b": null})));
        assert_eq!(dest, tree(json!({"a": {"x": 5}})));
    }

    #[test]
    fn test_merge_keeps_untouched_subtrees_shared() {
        let before = tree(json!({"big": {"k": [1, 2, 3]}, "n": 1}));
        let mut after = before.clone();
        merge(&mut after, &tree(json!({"n": 2})));
        match (before.get("big"), after.get("big")) {
            (Some(Value::Map(a)), Some(Value::Map(b))) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected shared subtree"),
        }
    }
}
