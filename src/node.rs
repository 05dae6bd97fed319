//! Per-key graph entries and their lifecycle.

use crate::error::ErrorInfo;
use crate::key::Key;
use crate::value::Value;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;

/// Build-sequence number.  Incremented once per evaluation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Lifecycle {
    Unbuilt,
    Building,
    Done,
    Dirty,
    CheckingDeps,
}

/// Why a node was dirtied.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DirtyKind {
    /// A dependency may have changed; re-verify deps before rebuilding.
    Check,
    /// The node itself was invalidated; it must be rebuilt.
    Changed,
}

/// Scratch state of a node while an evaluation is working on it.
#[derive(Debug, Default)]
pub(crate) struct BuildingState {
    /// Deps requested so far, across all restarts, in first-request order.
    pub temp_deps: Vec<Key>,
    pub temp_dep_set: FxHashSet<Key>,
    /// Keys this node is currently blocked on.
    pub waiting_on: Vec<Key>,
    /// Outstanding dep signals plus one while deps are being requested.
    pub pending: usize,
    /// Nodes to signal once this node is done.
    pub waiters: Vec<Key>,
    /// Position in the old direct deps while checking them.
    pub check_cursor: usize,
    pub restarts: u32,
}

impl BuildingState {
    pub fn add_temp_dep(&mut self, key: &Key) -> bool {
        if self.temp_dep_set.insert(key.clone()) {
            self.temp_deps.push(key.clone());
            true
        } else {
            false
        }
    }

    pub fn add_waiter(&mut self, key: &Key) {
        if !self.waiters.contains(key) {
            self.waiters.push(key.clone());
        }
    }
}

/// The mutable fields of a node.  Always accessed through `NodeEntry::lock`.
#[derive(Debug)]
pub struct NodeState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) value: Option<Value>,
    pub(crate) error: Option<ErrorInfo>,
    pub(crate) direct_deps: Vec<Key>,
    pub(crate) reverse_deps: FxHashSet<Key>,
    pub(crate) version: Version,
    pub(crate) last_changed: Version,
    pub(crate) dirty: Option<DirtyKind>,
    pub(crate) building: Option<Box<BuildingState>>,
}

impl NodeState {
    fn new() -> Self {
        NodeState {
            lifecycle: Lifecycle::Unbuilt,
            value: None,
            error: None,
            direct_deps: Vec::new(),
            reverse_deps: FxHashSet::default(),
            version: Version::default(),
            last_changed: Version::default(),
            dirty: None,
            building: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_done(&self) -> bool {
        self.lifecycle == Lifecycle::Done
    }

    pub fn is_dirty(&self) -> bool {
        self.lifecycle == Lifecycle::Dirty
    }

    /// Whether the node holds a result from some earlier evaluation.
    pub fn has_result(&self) -> bool {
        self.value.is_some() || self.error.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn direct_deps(&self) -> &[Key] {
        &self.direct_deps
    }

    pub fn reverse_deps(&self) -> &FxHashSet<Key> {
        &self.reverse_deps
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn last_changed(&self) -> Version {
        self.last_changed
    }

    pub fn dirty_kind(&self) -> Option<DirtyKind> {
        self.dirty
    }

    /// Marks a done node dirty.  Returns true if the node was done before, in
    /// which case its reverse deps need a `Check` dirtying too.
    pub(crate) fn mark_dirty(&mut self, kind: DirtyKind) -> bool {
        match self.lifecycle {
            Lifecycle::Done => {
                self.lifecycle = Lifecycle::Dirty;
                self.dirty = Some(kind);
                true
            }
            Lifecycle::Dirty => {
                if kind == DirtyKind::Changed {
                    self.dirty = Some(DirtyKind::Changed);
                }
                false
            }
            // Never built, nothing to invalidate.
            Lifecycle::Unbuilt => false,
            Lifecycle::Building | Lifecycle::CheckingDeps => {
                debug_assert!(false, "dirtied while evaluating: {:?}", self.lifecycle);
                false
            }
        }
    }

    /// Sets a directly supplied value.  Returns whether dependents must be
    /// invalidated, i.e. whether the value differs from the previous one.
    pub(crate) fn inject(&mut self, value: Value, version: Version) -> bool {
        let same = self.error.is_none() && self.value.as_ref() == Some(&value);
        if same && self.lifecycle == Lifecycle::Done {
            return false;
        }
        self.value = Some(value);
        self.error = None;
        self.lifecycle = Lifecycle::Done;
        self.dirty = None;
        self.version = version;
        if !same {
            self.last_changed = version;
        }
        !same
    }

    /// Returns a node abandoned mid-evaluation to a state from which the next
    /// evaluation can retry it.
    pub(crate) fn reset_in_flight(&mut self) {
        let kind = match self.lifecycle {
            Lifecycle::Building => DirtyKind::Changed,
            Lifecycle::CheckingDeps => DirtyKind::Check,
            _ => return,
        };
        self.building = None;
        if self.has_result() {
            self.lifecycle = Lifecycle::Dirty;
            self.dirty = Some(kind);
        } else {
            self.lifecycle = Lifecycle::Unbuilt;
            self.dirty = None;
        }
    }
}

/// A graph entry: one per key, created lazily.
#[derive(Debug)]
pub struct NodeEntry {
    state: Mutex<NodeState>,
}

impl NodeEntry {
    pub(crate) fn new() -> Self {
        NodeEntry {
            state: Mutex::new(NodeState::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }
}

/// A point-in-time copy of a node, for inspection.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub lifecycle: Lifecycle,
    pub value: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub direct_deps: Vec<Key>,
    pub reverse_deps: Vec<Key>,
    pub version: Version,
    pub last_changed: Version,
    pub dirty: Option<DirtyKind>,
}

impl From<&NodeState> for NodeSnapshot {
    fn from(state: &NodeState) -> Self {
        let mut reverse_deps: Vec<Key> = state.reverse_deps.iter().cloned().collect();
        reverse_deps.sort();
        NodeSnapshot {
            lifecycle: state.lifecycle,
            value: state.value.clone(),
            error: state.error.clone(),
            direct_deps: state.direct_deps.clone(),
            reverse_deps,
            version: state.version,
            last_changed: state.last_changed,
            dirty: state.dirty,
        }
    }
}
