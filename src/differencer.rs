//! Queues changes to the graph between evaluations.

use crate::key::Key;
use crate::value::Value;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// A batch of changes to apply to the graph.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Keys to recompute; their old values are dropped.
    pub invalidated: Vec<Key>,
    /// Keys with directly supplied replacement values.
    pub injected: Vec<(Key, Value)>,
    /// Also dirty every node that holds a transient error.
    pub invalidate_transient_errors: bool,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty() && self.injected.is_empty() && !self.invalidate_transient_errors
    }

    /// Number of keys the diff touches.
    pub fn len(&self) -> usize {
        self.invalidated.len() + self.injected.len()
    }

    /// Every key touched, invalidated first.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.invalidated
            .iter()
            .chain(self.injected.iter().map(|(key, _)| key))
    }
}

/// Source of pending changes, drained once at the start of each evaluation.
pub trait Differencer: Send + Sync {
    fn apply_pending(&self) -> Diff;
}

/// Something changes can be queued on.
pub trait Injectable {
    fn invalidate(&self, keys: &mut dyn Iterator<Item = Key>);
    fn inject(&self, values: &mut dyn Iterator<Item = (Key, Value)>);
}

#[derive(Debug)]
enum Change {
    Invalidate,
    Inject(Value),
}

#[derive(Debug, Default)]
struct Pending {
    changes: FxHashMap<Key, Change>,
    transient: bool,
}

/// Records changes until the evaluator asks for them.  When a key is both
/// invalidated and injected, the later call wins.
#[derive(Debug, Default)]
pub struct RecordingDifferencer {
    pending: Mutex<Pending>,
}

impl RecordingDifferencer {
    pub fn new() -> Self {
        RecordingDifferencer::default()
    }

    pub fn invalidate<I: IntoIterator<Item = Key>>(&self, keys: I) {
        let mut pending = self.pending.lock();
        for key in keys {
            pending.changes.insert(key, Change::Invalidate);
        }
    }

    pub fn inject<I: IntoIterator<Item = (Key, Value)>>(&self, values: I) {
        let mut pending = self.pending.lock();
        for (key, value) in values {
            pending.changes.insert(key, Change::Inject(value));
        }
    }

    pub fn invalidate_transient_errors(&self) {
        self.pending.lock().transient = true;
    }

    /// Queues a whole diff, e.g. one produced by a dirtiness scan.
    pub fn record(&self, diff: Diff) {
        self.invalidate(diff.invalidated);
        self.inject(diff.injected);
        if diff.invalidate_transient_errors {
            self.invalidate_transient_errors();
        }
    }

    pub fn has_pending(&self) -> bool {
        let pending = self.pending.lock();
        !pending.changes.is_empty() || pending.transient
    }
}

impl Differencer for RecordingDifferencer {
    fn apply_pending(&self) -> Diff {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut changes: Vec<(Key, Change)> = pending.changes.into_iter().collect();
        changes.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut diff = Diff {
            invalidate_transient_errors: pending.transient,
            ..Diff::default()
        };
        for (key, change) in changes {
            match change {
                Change::Invalidate => diff.invalidated.push(key),
                Change::Inject(value) => diff.injected.push((key, value)),
            }
        }
        diff
    }
}

impl Injectable for RecordingDifferencer {
    fn invalidate(&self, keys: &mut dyn Iterator<Item = Key>) {
        RecordingDifferencer::invalidate(self, keys)
    }

    fn inject(&self, values: &mut dyn Iterator<Item = (Key, Value)>) {
        RecordingDifferencer::inject(self, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionName;

    fn key(s: &str) -> Key {
        Key::new(FunctionName::new("D"), s)
    }

    #[test]
    fn later_call_wins() {
        let d = RecordingDifferencer::new();
        d.invalidate([key("a"), key("b")]);
        d.inject([(key("a"), Value::Int(1))]);
        d.inject([(key("c"), Value::Int(2))]);
        d.invalidate([key("c")]);
        let diff = d.apply_pending();
        assert_eq!(diff.invalidated, vec![key("b"), key("c")]);
        assert_eq!(diff.injected, vec![(key("a"), Value::Int(1))]);
        assert!(!diff.invalidate_transient_errors);
    }

    #[test]
    fn apply_pending_drains() {
        let d = RecordingDifferencer::new();
        d.invalidate_transient_errors();
        assert!(d.has_pending());
        let diff = d.apply_pending();
        assert!(diff.invalidate_transient_errors);
        assert!(!diff.is_empty());
        assert!(!d.has_pending());
        assert!(d.apply_pending().is_empty());
    }

    #[test]
    fn record_merges_a_diff() {
        let d = RecordingDifferencer::new();
        d.record(Diff {
            invalidated: vec![key("x")],
            injected: vec![(key("y"), Value::Unit)],
            invalidate_transient_errors: false,
        });
        let diff = d.apply_pending();
        assert_eq!(diff.len(), 2);
        assert_eq!(diff.keys().cloned().collect::<Vec<_>>(), vec![key("x"), key("y")]);
    }
}
