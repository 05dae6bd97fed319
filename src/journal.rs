//! An in-process change journal, and the diff awareness built on it.
//!
//! A file watcher (or the host embedding the engine) records every path it
//! sees change.  The journal is bounded: once it drops entries, any view
//! older than the dropped entries can no longer be diffed precisely.

use crate::diff_awareness::{
    DiffAwareness, DiffAwarenessError, DiffAwarenessFactory, ModifiedFileSet, View,
};
use crate::key::Root;
use crate::tsgm::Clock;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const DEFAULT_CAPACITY: usize = 64 * 1024;

struct JournalState {
    /// Bumped whenever continuity is lost for good, e.g. on restart.
    epoch: u64,
    entries: VecDeque<(u64, PathBuf)>,
    next_seq: u64,
    /// Changes with sequence numbers below this were not retained.
    lost_before: u64,
    closed: bool,
    capacity: usize,
}

pub struct ChangeJournal {
    state: Mutex<JournalState>,
}

impl Default for ChangeJournal {
    fn default() -> Self {
        ChangeJournal::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ChangeJournal {
    pub fn new() -> Self {
        ChangeJournal::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ChangeJournal {
            state: Mutex::new(JournalState {
                epoch: 0,
                entries: VecDeque::new(),
                next_seq: 0,
                lost_before: 0,
                closed: false,
                capacity: capacity.max(1),
            }),
        }
    }

    /// Records a change to an absolute path.
    pub fn record(&self, path: impl Into<PathBuf>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back((seq, path.into()));
        while state.entries.len() > state.capacity {
            if let Some((dropped, _)) = state.entries.pop_front() {
                state.lost_before = dropped + 1;
            }
        }
    }

    /// Notes that the producer missed changes, e.g. a watcher queue
    /// overflow.
    pub fn record_overflow(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        // The overflow takes a sequence number so that a view taken just
        // before it cannot diff cleanly against one taken just after.
        state.next_seq += 1;
        state.lost_before = state.next_seq;
    }

    /// Stops the journal; views can no longer be taken.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Starts a new epoch after a close.  Views from the previous epoch are
    /// not comparable with new ones.
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.clear();
        state.lost_before = state.next_seq;
        state.closed = false;
    }

    fn view(&self, taken_at: SystemTime) -> Option<JournalView> {
        let state = self.state.lock();
        if state.closed {
            return None;
        }
        Some(JournalView {
            epoch: state.epoch,
            seq: state.next_seq,
            taken_at,
        })
    }

    /// The paths under `root` changed in `[from, to)`, relative to `root`.
    /// None if some of those changes were dropped.
    fn changes(&self, root: &Path, from: u64, to: u64) -> Option<Vec<PathBuf>> {
        let state = self.state.lock();
        if from < state.lost_before {
            return None;
        }
        let mut paths: Vec<PathBuf> = state
            .entries
            .iter()
            .filter(|(seq, _)| *seq >= from && *seq < to)
            .filter_map(|(_, path)| path.strip_prefix(root).ok().map(Path::to_path_buf))
            .collect();
        paths.sort();
        paths.dedup();
        Some(paths)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JournalView {
    epoch: u64,
    seq: u64,
    taken_at: SystemTime,
}

pub struct JournalDiffAwareness {
    journal: Arc<ChangeJournal>,
    root: Root,
    clock: Arc<dyn Clock>,
    max_age: Option<Duration>,
}

fn as_journal_view(view: &View) -> Result<&JournalView, DiffAwarenessError> {
    view.downcast_ref::<JournalView>()
        .ok_or_else(|| DiffAwarenessError::Incompatible("not a journal view".into()))
}

impl DiffAwareness for JournalDiffAwareness {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn current_view(&self) -> Result<View, DiffAwarenessError> {
        match self.journal.view(self.clock.now()) {
            Some(view) => Ok(Arc::new(view)),
            None => Err(DiffAwarenessError::Broken("journal closed".into())),
        }
    }

    fn diff(&self, old: &View, new: &View) -> Result<ModifiedFileSet, DiffAwarenessError> {
        let old = as_journal_view(old)?;
        let new = as_journal_view(new)?;
        if old.epoch != new.epoch {
            return Ok(ModifiedFileSet::EverythingModified);
        }
        if let Some(max_age) = self.max_age {
            let age = new.taken_at.duration_since(old.taken_at).unwrap_or_default();
            if age > max_age {
                tracing::info!("journal view for {} is {:?} old", self.root, age);
                return Ok(ModifiedFileSet::EverythingModified);
            }
        }
        match self.journal.changes(self.root.path(), old.seq, new.seq) {
            Some(paths) => Ok(ModifiedFileSet::Modified(paths)),
            None => Ok(ModifiedFileSet::EverythingModified),
        }
    }
}

/// Hands out journal-backed awareness for every root.
pub struct JournalDiffAwarenessFactory {
    journal: Arc<ChangeJournal>,
    clock: Arc<dyn Clock>,
    max_age: Option<Duration>,
}

impl JournalDiffAwarenessFactory {
    pub fn new(journal: Arc<ChangeJournal>, clock: Arc<dyn Clock>) -> Self {
        JournalDiffAwarenessFactory {
            journal,
            clock,
            max_age: None,
        }
    }

    /// Views further apart than `max_age` diff as everything modified.
    pub fn max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }
}

impl DiffAwarenessFactory for JournalDiffAwarenessFactory {
    fn maybe_create(&self, root: &Root) -> Option<Box<dyn DiffAwareness>> {
        Some(Box::new(JournalDiffAwareness {
            journal: self.journal.clone(),
            root: root.clone(),
            clock: self.clock.clone(),
            max_age: self.max_age,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsgm::ManualClock;

    fn setup(capacity: usize) -> (Arc<ChangeJournal>, Arc<ManualClock>, Box<dyn DiffAwareness>) {
        let journal = Arc::new(ChangeJournal::with_capacity(capacity));
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let factory = JournalDiffAwarenessFactory::new(journal.clone(), clock.clone())
            .max_age(Some(Duration::from_secs(60)));
        let awareness = factory.maybe_create(&Root::new("/src")).unwrap();
        (journal, clock, awareness)
    }

    #[test]
    fn reports_paths_under_root() -> Result<(), DiffAwarenessError> {
        let (journal, _, awareness) = setup(16);
        let before = awareness.current_view()?;
        journal.record("/src/b");
        journal.record("/src/a");
        journal.record("/elsewhere/c");
        journal.record("/src/a");
        let after = awareness.current_view()?;
        assert_eq!(
            awareness.diff(&before, &after)?,
            ModifiedFileSet::Modified(vec!["a".into(), "b".into()])
        );
        Ok(())
    }

    #[test]
    fn overflow_and_capacity_lose_precision() -> Result<(), DiffAwarenessError> {
        let (journal, _, awareness) = setup(2);
        let v0 = awareness.current_view()?;
        journal.record("/src/a");
        journal.record("/src/b");
        journal.record("/src/c");
        let v1 = awareness.current_view()?;
        assert!(awareness.diff(&v0, &v1)?.is_everything());

        journal.record_overflow();
        let v2 = awareness.current_view()?;
        assert!(awareness.diff(&v1, &v2)?.is_everything());
        journal.record("/src/d");
        let v3 = awareness.current_view()?;
        assert_eq!(
            awareness.diff(&v2, &v3)?,
            ModifiedFileSet::Modified(vec!["d".into()])
        );
        Ok(())
    }

    #[test]
    fn old_views_and_epochs() -> Result<(), DiffAwarenessError> {
        let (journal, clock, awareness) = setup(16);
        let v0 = awareness.current_view()?;
        clock.advance(Duration::from_secs(61));
        let v1 = awareness.current_view()?;
        assert!(awareness.diff(&v0, &v1)?.is_everything());

        journal.close();
        assert!(matches!(
            awareness.current_view(),
            Err(DiffAwarenessError::Broken(_))
        ));
        journal.reopen();
        let v2 = awareness.current_view()?;
        assert!(awareness.diff(&v1, &v2)?.is_everything());

        let foreign: View = Arc::new(7u32);
        assert!(matches!(
            awareness.diff(&foreign, &v2),
            Err(DiffAwarenessError::Incompatible(_))
        ));
        Ok(())
    }
}
