//! The graph store: a concurrent table from key to node.

use crate::key::Key;
use crate::node::{Lifecycle, NodeEntry, NodeState, Version};
use crate::value::Value;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use std::hash::BuildHasherDefault;
use std::sync::Arc;

/// Storage for graph nodes.
///
/// Reads and creates may happen from many evaluation threads at once.  A
/// node's fields are only touched under that node's own lock, and no caller
/// holds two node locks at the same time.
pub trait Graph: Send + Sync {
    fn get(&self, key: &Key) -> Option<Arc<NodeEntry>>;

    fn get_or_create(&self, key: &Key) -> Arc<NodeEntry>;

    /// Looks up many keys at once; keys not in the graph are omitted.
    fn batch_get(&self, keys: &[Key]) -> FxHashMap<Key, Arc<NodeEntry>> {
        keys.iter()
            .filter_map(|key| self.get(key).map(|entry| (key.clone(), entry)))
            .collect()
    }

    /// Deletes every node matching the predicate, plus all of their
    /// transitive reverse deps.  Returns the number of nodes removed.
    fn delete(&self, pred: &dyn Fn(&Key, &NodeState) -> bool) -> usize;

    /// Deletes dirty nodes whose last good version is more than `window`
    /// versions behind `current`.
    fn delete_dirty_older_than(&self, window: u64, current: Version) -> usize {
        self.delete(&|_, state| {
            state.lifecycle() == Lifecycle::Dirty
                && state.version().0.saturating_add(window) < current.0
        })
    }

    fn keys(&self) -> Vec<Key>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every node currently in the graph.
    fn entries(&self) -> Vec<(Key, Arc<NodeEntry>)>;

    /// Snapshot of every done node and its value; None for nodes that hold
    /// an error.
    fn done_entries(&self) -> Vec<(Key, Option<Value>)> {
        self.entries()
            .into_iter()
            .filter_map(|(key, entry)| {
                let state = entry.lock();
                if state.is_done() {
                    let value = state.value().cloned();
                    Some((key, value))
                } else {
                    None
                }
            })
            .collect()
    }

    fn clear(&self);
}

#[derive(Default)]
pub struct InMemoryGraph {
    nodes: DashMap<Key, Arc<NodeEntry>, BuildHasherDefault<FxHasher>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        InMemoryGraph::default()
    }

    /// Removes `roots` and everything that transitively depends on them.
    fn delete_transitively(&self, roots: Vec<Key>) -> usize {
        let mut deleted = FxHashSet::default();
        let mut stack = roots;
        while let Some(key) = stack.pop() {
            if deleted.contains(&key) {
                continue;
            }
            let entry = match self.nodes.remove(&key) {
                Some((_, entry)) => entry,
                None => continue,
            };
            let (deps, rdeps) = {
                let mut state = entry.lock();
                (
                    std::mem::take(&mut state.direct_deps),
                    std::mem::take(&mut state.reverse_deps),
                )
            };
            for dep in deps {
                if let Some(dep_entry) = self.get(&dep) {
                    dep_entry.lock().reverse_deps.remove(&key);
                }
            }
            stack.extend(rdeps);
            deleted.insert(key);
        }
        deleted.len()
    }
}

impl Graph for InMemoryGraph {
    fn get(&self, key: &Key) -> Option<Arc<NodeEntry>> {
        self.nodes.get(key).map(|entry| entry.value().clone())
    }

    fn get_or_create(&self, key: &Key) -> Arc<NodeEntry> {
        if let Some(entry) = self.get(key) {
            return entry;
        }
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| Arc::new(NodeEntry::new()))
            .value()
            .clone()
    }

    fn delete(&self, pred: &dyn Fn(&Key, &NodeState) -> bool) -> usize {
        let roots: Vec<Key> = self
            .entries()
            .into_iter()
            .filter(|(key, entry)| pred(key, &entry.lock()))
            .map(|(key, _)| key)
            .collect();
        if roots.is_empty() {
            return 0;
        }
        self.delete_transitively(roots)
    }

    fn keys(&self) -> Vec<Key> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn entries(&self) -> Vec<(Key, Arc<NodeEntry>)> {
        self.nodes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn clear(&self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionName;
    use crate::node::DirtyKind;
    use crate::value::Value;

    const F: FunctionName = FunctionName::new("F");

    fn key(s: &str) -> Key {
        Key::new(F, s)
    }

    /// Builds a done node with the given deps, wiring reverse edges.
    fn add(graph: &InMemoryGraph, name: &str, deps: &[&str], version: u64) {
        let k = key(name);
        {
            let entry = graph.get_or_create(&k);
            let mut state = entry.lock();
            state.inject(Value::str(name), Version(version));
            state.direct_deps = deps.iter().map(|d| key(d)).collect();
        }
        for d in deps {
            graph.get_or_create(&key(d)).lock().reverse_deps.insert(k.clone());
        }
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let graph = InMemoryGraph::new();
        let a = graph.get_or_create(&key("a"));
        let b = graph.get_or_create(&key("a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(graph.len(), 1);
        assert!(graph.get(&key("b")).is_none());
    }

    #[test]
    fn batch_get_omits_missing() {
        let graph = InMemoryGraph::new();
        graph.get_or_create(&key("a"));
        let got = graph.batch_get(&[key("a"), key("b")]);
        assert_eq!(got.len(), 1);
        assert!(got.contains_key(&key("a")));
    }

    #[test]
    fn delete_removes_reverse_deps_transitively() {
        let graph = InMemoryGraph::new();
        add(&graph, "leaf", &[], 1);
        add(&graph, "other", &[], 1);
        add(&graph, "mid", &["leaf", "other"], 1);
        add(&graph, "top", &["mid"], 1);
        let n = graph.delete(&|k, _| k == &key("leaf"));
        assert_eq!(n, 3);
        assert!(graph.get(&key("top")).is_none());
        assert!(graph.get(&key("mid")).is_none());
        let other = graph.get(&key("other")).unwrap();
        assert!(other.lock().reverse_deps().is_empty());
    }

    #[test]
    fn delete_dirty_older_than_window() {
        let graph = InMemoryGraph::new();
        add(&graph, "old", &[], 1);
        add(&graph, "recent", &[], 9);
        add(&graph, "clean", &[], 1);
        for name in ["old", "recent"] {
            graph.get(&key(name)).unwrap().lock().mark_dirty(DirtyKind::Changed);
        }
        assert_eq!(graph.delete_dirty_older_than(5, Version(10)), 1);
        assert!(graph.get(&key("old")).is_none());
        assert!(graph.get(&key("recent")).is_some());
        assert!(graph.get(&key("clean")).is_some());
    }

    #[test]
    fn unbounded_window_keeps_everything() {
        let graph = InMemoryGraph::new();
        add(&graph, "old", &[], 1);
        graph.get(&key("old")).unwrap().lock().mark_dirty(DirtyKind::Changed);
        assert_eq!(graph.delete_dirty_older_than(u64::MAX, Version(10)), 0);
        assert!(graph.get(&key("old")).is_some());
    }
}
