//! Applies a `Diff` to the graph.

use crate::differencer::Diff;
use crate::graph::Graph;
use crate::key::Key;
use crate::node::{DirtyKind, Version};

/// Counts of what one diff did to the graph.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationStats {
    /// Nodes dirtied as `Changed`.
    pub changed: usize,
    /// Nodes dirtied as `Check` because something below them changed.
    pub checked: usize,
    /// Injections that replaced a value.
    pub injected: usize,
    /// Injections dropped because the value was unchanged.
    pub unchanged: usize,
}

/// Marks the reverse deps of `keys`, transitively, as needing a check.
fn dirty_rdeps(graph: &dyn Graph, keys: Vec<Key>, stats: &mut InvalidationStats) {
    let mut stack = keys;
    while let Some(key) = stack.pop() {
        let entry = match graph.get(&key) {
            Some(entry) => entry,
            None => continue,
        };
        let rdeps: Vec<Key> = {
            let mut state = entry.lock();
            if !state.mark_dirty(DirtyKind::Check) {
                continue;
            }
            state.reverse_deps.iter().cloned().collect()
        };
        stats.checked += 1;
        stack.extend(rdeps);
    }
}

fn unlink_deps(graph: &dyn Graph, key: &Key, deps: Vec<Key>) {
    for dep in deps {
        if let Some(entry) = graph.get(&dep) {
            entry.lock().reverse_deps.remove(key);
        }
    }
}

/// Applies `diff` at `version`.  Must not run concurrently with an
/// evaluation.
pub(crate) fn apply_diff(graph: &dyn Graph, diff: Diff, version: Version) -> InvalidationStats {
    let mut stats = InvalidationStats::default();
    let mut to_check = Vec::new();

    for key in diff.invalidated {
        let entry = match graph.get(&key) {
            Some(entry) => entry,
            None => continue,
        };
        let mut state = entry.lock();
        if state.mark_dirty(DirtyKind::Changed) {
            stats.changed += 1;
            to_check.extend(state.reverse_deps.iter().cloned());
        }
    }

    for (key, value) in diff.injected {
        let entry = graph.get_or_create(&key);
        let (old_deps, rdeps) = {
            let mut state = entry.lock();
            let unchanged =
                state.is_done() && state.error.is_none() && state.value.as_ref() == Some(&value);
            if unchanged {
                stats.unchanged += 1;
                continue;
            }
            let old_deps = std::mem::take(&mut state.direct_deps);
            let rdeps: Vec<Key> = if state.inject(value, version) {
                state.reverse_deps.iter().cloned().collect()
            } else {
                Vec::new()
            };
            (old_deps, rdeps)
        };
        stats.injected += 1;
        unlink_deps(graph, &key, old_deps);
        to_check.extend(rdeps);
    }

    if diff.invalidate_transient_errors {
        for (_, entry) in graph.entries() {
            let mut state = entry.lock();
            let transient = state.error.as_ref().map_or(false, |err| err.transient);
            if transient && state.mark_dirty(DirtyKind::Changed) {
                stats.changed += 1;
                to_check.extend(state.reverse_deps.iter().cloned());
            }
        }
    }

    dirty_rdeps(graph, to_check, &mut stats);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorInfo;
    use crate::graph::InMemoryGraph;
    use crate::key::FunctionName;
    use crate::node::Lifecycle;
    use crate::value::Value;

    fn key(s: &str) -> Key {
        Key::new(FunctionName::new("I"), s)
    }

    fn add(graph: &InMemoryGraph, name: &str, deps: &[&str]) {
        let k = key(name);
        {
            let entry = graph.get_or_create(&k);
            let mut state = entry.lock();
            state.inject(Value::str(name), Version(1));
            state.direct_deps = deps.iter().map(|d| key(d)).collect();
        }
        for d in deps {
            graph.get_or_create(&key(d)).lock().reverse_deps.insert(k.clone());
        }
    }

    fn lifecycle(graph: &InMemoryGraph, name: &str) -> (Lifecycle, Option<DirtyKind>) {
        let entry = graph.get(&key(name)).unwrap();
        let state = entry.lock();
        (state.lifecycle(), state.dirty_kind())
    }

    #[test]
    fn invalidation_dirties_rdeps_transitively() {
        let graph = InMemoryGraph::new();
        add(&graph, "leaf", &[]);
        add(&graph, "mid", &["leaf"]);
        add(&graph, "top", &["mid"]);
        add(&graph, "other", &[]);
        let diff = Diff {
            invalidated: vec![key("leaf")],
            ..Diff::default()
        };
        let stats = apply_diff(&graph, diff, Version(2));
        assert_eq!(stats.changed, 1);
        assert_eq!(stats.checked, 2);
        assert_eq!(
            lifecycle(&graph, "leaf"),
            (Lifecycle::Dirty, Some(DirtyKind::Changed))
        );
        assert_eq!(
            lifecycle(&graph, "top"),
            (Lifecycle::Dirty, Some(DirtyKind::Check))
        );
        assert_eq!(lifecycle(&graph, "other"), (Lifecycle::Done, None));
    }

    #[test]
    fn equal_injection_is_dropped() {
        let graph = InMemoryGraph::new();
        add(&graph, "leaf", &[]);
        add(&graph, "top", &["leaf"]);
        let diff = Diff {
            injected: vec![(key("leaf"), Value::str("leaf"))],
            ..Diff::default()
        };
        let stats = apply_diff(&graph, diff, Version(2));
        assert_eq!(stats.unchanged, 1);
        assert_eq!(lifecycle(&graph, "top"), (Lifecycle::Done, None));
    }

    #[test]
    fn injection_replaces_deps() {
        let graph = InMemoryGraph::new();
        add(&graph, "leaf", &[]);
        add(&graph, "mid", &["leaf"]);
        add(&graph, "top", &["mid"]);
        let diff = Diff {
            injected: vec![(key("mid"), Value::Int(7))],
            ..Diff::default()
        };
        apply_diff(&graph, diff, Version(2));
        let mid = graph.get(&key("mid")).unwrap();
        assert!(mid.lock().direct_deps().is_empty());
        assert_eq!(mid.lock().last_changed(), Version(2));
        assert!(graph.get(&key("leaf")).unwrap().lock().reverse_deps().is_empty());
        assert_eq!(
            lifecycle(&graph, "top"),
            (Lifecycle::Dirty, Some(DirtyKind::Check))
        );
    }

    #[test]
    fn transient_errors() {
        let graph = InMemoryGraph::new();
        for (name, transient) in [("flaky", true), ("broken", false)] {
            let entry = graph.get_or_create(&key(name));
            let mut state = entry.lock();
            state.lifecycle = Lifecycle::Done;
            state.error = Some(ErrorInfo::computation(&key(name), "oops", transient));
        }
        let diff = Diff {
            invalidate_transient_errors: true,
            ..Diff::default()
        };
        apply_diff(&graph, diff, Version(2));
        assert_eq!(
            lifecycle(&graph, "flaky"),
            (Lifecycle::Dirty, Some(DirtyKind::Changed))
        );
        assert_eq!(lifecycle(&graph, "broken"), (Lifecycle::Done, None));
    }
}
