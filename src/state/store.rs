//! The authoritative state tree
//!
//! The tree lives behind a tokio mutex and is only ever handed out as an
//! immutable `Arc<Map>` snapshot. Writers hold the lock for the whole
//! read-merge-diff sequence.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use super::diff::{diff, merge_with, MergeMode};
use super::value::Map;

/// Exclusive access to the live tree
pub type StateGuard<'a> = MutexGuard<'a, Arc<Map>>;

/// Owner of one state tree
#[derive(Debug)]
pub struct StateStore {
    tree: Mutex<Arc<Map>>,
}

impl StateStore {
    pub fn new(initial: Map) -> Self {
        Self {
            tree: Mutex::new(Arc::new(initial)),
        }
    }

    /// A snapshot of the current tree
    pub async fn snapshot(&self) -> Arc<Map> {
        Arc::clone(&*self.tree.lock().await)
    }

    /// Lock the tree for a read-modify-write
    pub async fn lock(&self) -> StateGuard<'_> {
        self.tree.lock().await
    }
}

/// Fold `partial` into `tree` and return what actually changed.
///
/// Only the top-level map and the nodes along modified paths are copied;
/// snapshots taken earlier keep pointing at the old nodes.
pub fn apply_update(tree: &mut Arc<Map>, partial: &Map, mode: MergeMode) -> Map {
    let before = Arc::clone(tree);
    merge_with(Arc::make_mut(tree), partial, mode);
    let changes = diff(&before, tree);

    if changes.is_empty() {
        // keep the old allocation so unchanged snapshots stay pointer-equal
        *tree = before;
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::value::map_from_json;
    use serde_json::json;

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_updates() {
        let store = StateStore::new(map_from_json(json!({"counter": 0})));
        let before = store.snapshot().await;

        {
            let mut tree = store.lock().await;
            let changes = apply_update(&mut tree, &map_from_json(json!({"counter": 1})), MergeMode::Deep);
            assert_eq!(changes, map_from_json(json!({"counter": 1})));
        }

        assert_eq!(before.get("counter").and_then(|v| v.as_i64()), Some(0));
        let after = store.snapshot().await;
        assert_eq!(after.get("counter").and_then(|v| v.as_i64()), Some(1));
    }

    #[tokio::test]
    async fn test_noop_update_keeps_tree() {
        let store = StateStore::new(map_from_json(json!({"a": {"b": 1}})));
        let before = store.snapshot().await;

        let mut tree = store.lock().await;
        let changes = apply_update(&mut tree, &map_from_json(json!({"a": {"b": 1}})), MergeMode::Deep);
        assert!(changes.is_empty());
        assert!(Arc::ptr_eq(&before, &*tree));
    }

    #[test]
    fn test_shallow_update() {
        let mut tree = Arc::new(map_from_json(json!({"a": {"x": 1, "y": 2}})));
        let changes = apply_update(&mut tree, &map_from_json(json!({"a": {"x": 1}})), MergeMode::Shallow);
        assert_eq!(changes, map_from_json(json!({"a": {"y": null}})));
    }
}
