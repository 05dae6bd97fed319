//! Cycle detection over the "waiting on" edges left behind when an
//! evaluation stalls.

use crate::key::Key;
use rustc_hash::FxHashSet;
use std::fmt;

/// A dependency cycle as seen from some requesting key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleInfo {
    /// Keys leading from the requester up to (not including) the cycle.
    pub path_to_cycle: Vec<Key>,
    /// The cycle itself, starting at the key where the path entered it.
    pub cycle: Vec<Key>,
}

impl CycleInfo {
    /// Prepends a dependent to the path, unless it is itself in the cycle.
    pub fn with_dependent(&self, key: &Key) -> CycleInfo {
        if self.cycle.contains(key) || self.path_to_cycle.first() == Some(key) {
            return self.clone();
        }
        let mut path_to_cycle = Vec::with_capacity(self.path_to_cycle.len() + 1);
        path_to_cycle.push(key.clone());
        path_to_cycle.extend(self.path_to_cycle.iter().cloned());
        CycleInfo {
            path_to_cycle,
            cycle: self.cycle.clone(),
        }
    }
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle: ")?;
        for key in &self.path_to_cycle {
            write!(f, "{} -> ", key)?;
        }
        write!(f, "[")?;
        for (i, key) in self.cycle.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, "]")
    }
}

/// Walks "waiting on" edges depth first.  `visited` is shared across calls
/// so a node explored from one root is not explored again from another.
pub(crate) struct CycleFinder<F> {
    edges: F,
    visited: FxHashSet<Key>,
}

impl<F: Fn(&Key) -> Vec<Key>> CycleFinder<F> {
    pub fn new(edges: F) -> Self {
        CycleFinder {
            edges,
            visited: FxHashSet::default(),
        }
    }

    /// Returns the first cycle reachable from `start`, if any.
    pub fn find(&mut self, start: &Key) -> Option<CycleInfo> {
        if self.visited.contains(start) {
            return None;
        }
        // Each frame is a key plus the edges not yet explored from it.
        let mut stack: Vec<(Key, Vec<Key>)> = Vec::new();
        let mut on_stack: FxHashSet<Key> = FxHashSet::default();
        self.visited.insert(start.clone());
        on_stack.insert(start.clone());
        stack.push((start.clone(), (self.edges)(start)));

        while let Some((_, pending)) = stack.last_mut() {
            let next = match pending.pop() {
                Some(next) => next,
                None => {
                    if let Some((key, _)) = stack.pop() {
                        on_stack.remove(&key);
                    }
                    continue;
                }
            };
            if on_stack.contains(&next) {
                let pos = stack
                    .iter()
                    .position(|(key, _)| *key == next)
                    .unwrap_or(0);
                let keys: Vec<Key> = stack.into_iter().map(|(key, _)| key).collect();
                return Some(CycleInfo {
                    path_to_cycle: keys[..pos].to_vec(),
                    cycle: keys[pos..].to_vec(),
                });
            }
            if !self.visited.insert(next.clone()) {
                continue;
            }
            on_stack.insert(next.clone());
            let edges = (self.edges)(&next);
            stack.push((next, edges));
        }
        None
    }
}

/// Whether `target` is reachable from `start` along `edges`.
pub(crate) fn reaches(start: &Key, target: &Key, edges: impl Fn(&Key) -> Vec<Key>) -> bool {
    let mut visited = FxHashSet::default();
    let mut stack = vec![start.clone()];
    while let Some(key) = stack.pop() {
        if key == *target {
            return true;
        }
        if !visited.insert(key.clone()) {
            continue;
        }
        stack.extend(edges(&key));
    }
    false
}
