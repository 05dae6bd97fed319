//! Scans graph nodes against the outside world and turns what changed into
//! a `Diff`.

use crate::differencer::Diff;
use crate::dirtiness::{DirtinessChecker, DirtyResult};
use crate::error::SyncError;
use crate::graph::Graph;
use crate::interrupt::Interrupt;
use crate::key::Key;
use crate::tsgm::TimestampGranularityMonitor;
use crate::value::Value;
use rayon::prelude::*;

pub struct FilesystemValueChecker<'a> {
    tsgm: &'a TimestampGranularityMonitor,
    interrupt: &'a Interrupt,
}

impl<'a> FilesystemValueChecker<'a> {
    pub fn new(tsgm: &'a TimestampGranularityMonitor, interrupt: &'a Interrupt) -> Self {
        FilesystemValueChecker { tsgm, interrupt }
    }

    fn check_one(
        &self,
        checker: &dyn DirtinessChecker,
        key: Key,
        old: Option<Value>,
    ) -> Result<Option<(Key, Option<Value>)>, SyncError> {
        if self.interrupt.is_triggered() {
            return Err(SyncError::Interrupted);
        }
        match checker.check(&key, old.as_ref(), self.tsgm) {
            Ok(DirtyResult::Clean) => Ok(None),
            Ok(DirtyResult::Dirty(new)) => Ok(Some((key, new))),
            Err(err) => Err(SyncError::DirtinessCheck {
                key,
                source: err.into(),
            }),
        }
    }

    /// Checks every done node that `checker` applies to.
    pub fn get_dirty_keys(
        &self,
        graph: &dyn Graph,
        checker: &dyn DirtinessChecker,
    ) -> Result<Diff, SyncError> {
        let candidates: Vec<(Key, Option<Value>)> = graph
            .done_entries()
            .into_iter()
            .filter(|(key, _)| checker.applies(key))
            .collect();
        tracing::debug!("checking {} nodes for changes", candidates.len());
        let dirty = candidates
            .into_par_iter()
            .map(|(key, old)| self.check_one(checker, key, old))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(into_diff(dirty.into_iter().flatten()))
    }

    /// Checks an explicit set of keys, e.g. the files a diff awareness
    /// reported as modified.  Keys not in the graph are skipped; keys the
    /// checker cannot handle, or that are not done, are invalidated.
    pub fn get_new_and_old_values(
        &self,
        graph: &dyn Graph,
        keys: &[Key],
        checker: &dyn DirtinessChecker,
    ) -> Result<Diff, SyncError> {
        let entries = graph.batch_get(keys);
        let mut candidates = Vec::new();
        let mut invalidated = Vec::new();
        for key in keys {
            let entry = match entries.get(key) {
                Some(entry) => entry,
                None => continue,
            };
            let state = entry.lock();
            if state.is_done() && checker.applies(key) {
                candidates.push((key.clone(), state.value().cloned()));
            } else {
                invalidated.push((key.clone(), None));
            }
        }
        let dirty = candidates
            .into_par_iter()
            .map(|(key, old)| self.check_one(checker, key, old))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(into_diff(
            invalidated.into_iter().chain(dirty.into_iter().flatten()),
        ))
    }
}

fn into_diff(dirty: impl Iterator<Item = (Key, Option<Value>)>) -> Diff {
    let mut diff = Diff::default();
    for (key, new) in dirty {
        match new {
            Some(value) => diff.injected.push((key, value)),
            None => diff.invalidated.push(key),
        }
    }
    diff.invalidated.sort();
    diff.injected.sort_by(|(a, _), (b, _)| a.cmp(b));
    diff
}
