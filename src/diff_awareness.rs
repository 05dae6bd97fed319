//! Per-root knowledge of which files changed between two builds.
//!
//! A `DiffAwareness` hands out opaque views of its root; diffing two views
//! yields the files modified in between.  The manager keeps one awareness
//! and one baseline view per root.

use crate::error::SyncError;
use crate::key::Root;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

/// A snapshot token.  Only the awareness that produced it can interpret it.
pub type View = Arc<dyn Any + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DiffAwarenessError {
    /// The awareness can no longer report changes; its state is discarded.
    #[error("broken: {0}")]
    Broken(String),
    /// The views cannot be compared, e.g. they came from different
    /// awareness kinds.
    #[error("incompatible views: {0}")]
    Incompatible(String),
}

/// Files modified under a root, relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModifiedFileSet {
    EverythingModified,
    Modified(Vec<PathBuf>),
}

impl ModifiedFileSet {
    pub fn nothing() -> Self {
        ModifiedFileSet::Modified(Vec::new())
    }

    pub fn is_everything(&self) -> bool {
        matches!(self, ModifiedFileSet::EverythingModified)
    }
}

pub trait DiffAwareness: Send + Sync {
    fn name(&self) -> &'static str;

    fn current_view(&self) -> Result<View, DiffAwarenessError>;

    fn diff(&self, old: &View, new: &View) -> Result<ModifiedFileSet, DiffAwarenessError>;
}

pub trait DiffAwarenessFactory: Send + Sync {
    /// An awareness for `root`, or None if this factory cannot watch it.
    fn maybe_create(&self, root: &Root) -> Option<Box<dyn DiffAwareness>>;
}

struct RootState {
    awareness: Box<dyn DiffAwareness>,
    baseline: Option<View>,
}

/// A modified file set not yet applied.  Dropping it without
/// `mark_processed` means the next `get_diff` reports the same changes
/// again.
#[must_use]
pub struct ProcessableModifiedFileSet {
    root: Root,
    set: ModifiedFileSet,
    view: Option<View>,
}

impl ProcessableModifiedFileSet {
    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn modified(&self) -> &ModifiedFileSet {
        &self.set
    }

    /// Makes the view this set was computed against the new baseline.
    pub fn mark_processed(self, manager: &mut DiffAwarenessManager) {
        if let (Some(view), Some(state)) = (self.view, manager.states.get_mut(&self.root)) {
            state.baseline = Some(view);
        }
    }
}

pub struct DiffAwarenessManager {
    factories: Vec<Arc<dyn DiffAwarenessFactory>>,
    states: FxHashMap<Root, RootState>,
}

impl DiffAwarenessManager {
    pub fn new(factories: Vec<Arc<dyn DiffAwarenessFactory>>) -> Self {
        DiffAwarenessManager {
            factories,
            states: FxHashMap::default(),
        }
    }

    fn everything(root: &Root) -> ProcessableModifiedFileSet {
        ProcessableModifiedFileSet {
            root: root.clone(),
            set: ModifiedFileSet::EverythingModified,
            view: None,
        }
    }

    fn broken(&mut self, root: &Root, name: &str, msg: &str) -> ProcessableModifiedFileSet {
        tracing::warn!("{} diff awareness for {} is broken: {}", name, root, msg);
        self.states.remove(root);
        Self::everything(root)
    }

    /// What changed under `root` since the last processed diff.
    pub fn get_diff(&mut self, root: &Root) -> Result<ProcessableModifiedFileSet, SyncError> {
        if !self.states.contains_key(root) {
            let awareness = self
                .factories
                .iter()
                .find_map(|factory| factory.maybe_create(root));
            match awareness {
                Some(awareness) => {
                    tracing::debug!("using {} diff awareness for {}", awareness.name(), root);
                    self.states.insert(
                        root.clone(),
                        RootState {
                            awareness,
                            baseline: None,
                        },
                    );
                }
                None => return Ok(Self::everything(root)),
            }
        }
        let state = match self.states.get_mut(root) {
            Some(state) => state,
            None => return Ok(Self::everything(root)),
        };
        let name = state.awareness.name();

        let view = match state.awareness.current_view() {
            Ok(view) => view,
            Err(DiffAwarenessError::Broken(msg)) => return Ok(self.broken(root, name, &msg)),
            Err(DiffAwarenessError::Incompatible(msg)) => {
                return Err(SyncError::InvalidEnvironment(msg))
            }
        };
        let baseline = match &state.baseline {
            Some(baseline) => baseline.clone(),
            None => {
                tracing::debug!("initial {} view for {}", name, root);
                state.baseline = Some(view);
                return Ok(Self::everything(root));
            }
        };
        match state.awareness.diff(&baseline, &view) {
            Ok(set) => Ok(ProcessableModifiedFileSet {
                root: root.clone(),
                set,
                view: Some(view),
            }),
            Err(DiffAwarenessError::Broken(msg)) => Ok(self.broken(root, name, &msg)),
            Err(DiffAwarenessError::Incompatible(msg)) => Err(SyncError::InvalidEnvironment(msg)),
        }
    }

    /// Forgets every awareness and baseline.
    pub fn reset(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Views are counters; the diff between two counters names one file
    /// per step.
    struct Counting {
        now: Arc<Mutex<u32>>,
        broken: Arc<Mutex<bool>>,
    }

    impl DiffAwareness for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn current_view(&self) -> Result<View, DiffAwarenessError> {
            if *self.broken.lock() {
                return Err(DiffAwarenessError::Broken("gone".into()));
            }
            Ok(Arc::new(*self.now.lock()))
        }

        fn diff(&self, old: &View, new: &View) -> Result<ModifiedFileSet, DiffAwarenessError> {
            let old = *old
                .downcast_ref::<u32>()
                .ok_or_else(|| DiffAwarenessError::Incompatible("old".into()))?;
            let new = *new
                .downcast_ref::<u32>()
                .ok_or_else(|| DiffAwarenessError::Incompatible("new".into()))?;
            Ok(ModifiedFileSet::Modified(
                (old..new).map(|n| PathBuf::from(format!("f{}", n))).collect(),
            ))
        }
    }

    struct Factory {
        now: Arc<Mutex<u32>>,
        broken: Arc<Mutex<bool>>,
    }

    impl DiffAwarenessFactory for Factory {
        fn maybe_create(&self, root: &Root) -> Option<Box<dyn DiffAwareness>> {
            if root.path().starts_with("/watched") {
                Some(Box::new(Counting {
                    now: self.now.clone(),
                    broken: self.broken.clone(),
                }))
            } else {
                None
            }
        }
    }

    fn manager() -> (DiffAwarenessManager, Arc<Mutex<u32>>, Arc<Mutex<bool>>) {
        let now = Arc::new(Mutex::new(0));
        let broken = Arc::new(Mutex::new(false));
        let factory = Factory {
            now: now.clone(),
            broken: broken.clone(),
        };
        (DiffAwarenessManager::new(vec![Arc::new(factory)]), now, broken)
    }

    #[test]
    fn unhandled_root_is_everything() {
        let (mut m, _, _) = manager();
        let set = m.get_diff(&Root::new("/elsewhere")).unwrap();
        assert!(set.modified().is_everything());
    }

    #[test]
    fn baseline_then_precise() {
        let (mut m, now, _) = manager();
        let root = Root::new("/watched");
        assert!(m.get_diff(&root).unwrap().modified().is_everything());

        *now.lock() = 2;
        let set = m.get_diff(&root).unwrap();
        assert_eq!(
            set.modified(),
            &ModifiedFileSet::Modified(vec!["f0".into(), "f1".into()])
        );
        // Not processed: replayed.
        drop(set);
        let set = m.get_diff(&root).unwrap();
        assert_eq!(
            set.modified(),
            &ModifiedFileSet::Modified(vec!["f0".into(), "f1".into()])
        );
        set.mark_processed(&mut m);
        assert_eq!(m.get_diff(&root).unwrap().modified(), &ModifiedFileSet::nothing());
    }

    #[test]
    fn broken_awareness_falls_back() {
        let (mut m, _, broken) = manager();
        let root = Root::new("/watched");
        m.get_diff(&root).unwrap().mark_processed(&mut m);
        *broken.lock() = true;
        assert!(m.get_diff(&root).unwrap().modified().is_everything());
        *broken.lock() = false;
        // A fresh awareness starts over with a new baseline.
        assert!(m.get_diff(&root).unwrap().modified().is_everything());
        assert_eq!(m.get_diff(&root).unwrap().modified(), &ModifiedFileSet::nothing());
    }
}
