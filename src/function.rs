//! The interface between the evaluator and the computations it runs.

use crate::error::{ErrorInfo, FunctionError};
use crate::evaluator::{DepState, Run};
use crate::key::Key;
use crate::node::NodeEntry;
use crate::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// What a computation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Computed {
    Done(Value),
    /// Some requested dep was not ready; run me again once it is.
    Restart,
}

/// Result of requesting a dep's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Ready(Value),
    NotReady,
}

impl Lookup {
    pub fn ready(self) -> Option<Value> {
        match self {
            Lookup::Ready(value) => Some(value),
            Lookup::NotReady => None,
        }
    }
}

/// Result of requesting a dep's value while tolerating its failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepLookup {
    Ready(Value),
    Failed(ErrorInfo),
    NotReady,
}

/// A computation for one `FunctionName`.
///
/// Computations may run several times for one key within an evaluation:
/// whenever a requested dep is not ready, the attempt returns `Restart` and
/// is run again from scratch once the dep is done.  They must therefore be
/// pure in the deps they observe through `Env`.
pub trait SkyFunction: Send + Sync {
    fn compute(&self, key: &Key, env: &mut Env<'_>) -> Result<Computed, FunctionError>;
}

struct FnFunction<F>(F);

impl<F> SkyFunction for FnFunction<F>
where
    F: Fn(&Key, &mut Env<'_>) -> Result<Computed, FunctionError> + Send + Sync,
{
    fn compute(&self, key: &Key, env: &mut Env<'_>) -> Result<Computed, FunctionError> {
        (self.0)(key, env)
    }
}

/// Wraps a closure as a `SkyFunction`.
pub fn from_fn<F>(f: F) -> Arc<dyn SkyFunction>
where
    F: Fn(&Key, &mut Env<'_>) -> Result<Computed, FunctionError> + Send + Sync + 'static,
{
    Arc::new(FnFunction(f))
}

/// Everything an attempt observed, handed back to the scheduler.
pub(crate) struct Observed {
    /// Deps requested during the attempt, in first-request order.
    pub requested: Vec<Key>,
    pub missing: bool,
    pub child_error: Option<ErrorInfo>,
    /// Deps this attempt moved into an in-flight state and that still need
    /// to be scheduled.
    pub to_spawn: Vec<Key>,
}

/// A computation's window onto its deps.
pub struct Env<'a> {
    run: &'a Run<'a>,
    key: &'a Key,
    entry: &'a NodeEntry,
    requested: Vec<Key>,
    requested_set: FxHashSet<Key>,
    missing: FxHashSet<Key>,
    child_error: Option<ErrorInfo>,
    to_spawn: Vec<Key>,
}

impl<'a> Env<'a> {
    pub(crate) fn new(run: &'a Run<'a>, key: &'a Key, entry: &'a NodeEntry) -> Self {
        Env {
            run,
            key,
            entry,
            requested: Vec::new(),
            requested_set: FxHashSet::default(),
            missing: FxHashSet::default(),
            child_error: None,
            to_spawn: Vec::new(),
        }
    }

    /// Requests a dep.  A failed dep reads as `NotReady`; the failure is
    /// recorded and becomes this computation's error once it returns.
    pub fn get_value(&mut self, key: &Key) -> Lookup {
        match self.get_value_or_error(key) {
            DepLookup::Ready(value) => Lookup::Ready(value),
            DepLookup::Failed(err) => {
                if self.child_error.is_none() {
                    self.child_error = Some(err);
                }
                Lookup::NotReady
            }
            DepLookup::NotReady => Lookup::NotReady,
        }
    }

    /// Requests a dep, handing its error to the computation if it failed.
    pub fn get_value_or_error(&mut self, key: &Key) -> DepLookup {
        if self.requested_set.insert(key.clone()) {
            self.requested.push(key.clone());
        }
        if self.missing.contains(key) {
            return DepLookup::NotReady;
        }
        match self
            .run
            .lookup(self.key, self.entry, key, &mut self.to_spawn)
        {
            DepState::Value(value) => DepLookup::Ready(value),
            DepState::Error(err) => DepLookup::Failed(err),
            DepState::Pending => {
                self.missing.insert(key.clone());
                DepLookup::NotReady
            }
        }
    }

    /// Requests many deps at once.  The result holds only the ready ones.
    pub fn get_values(&mut self, keys: &[Key]) -> FxHashMap<Key, Value> {
        let mut values = FxHashMap::default();
        for key in keys {
            if let Lookup::Ready(value) = self.get_value(key) {
                values.insert(key.clone(), value);
            }
        }
        values
    }

    /// Whether some requested dep was not ready or failed.  A computation
    /// that sees this should return `Computed::Restart`.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || self.child_error.is_some()
    }

    pub fn interrupted(&self) -> bool {
        self.run.is_interrupted()
    }

    pub fn check_interrupted(&self) -> Result<(), FunctionError> {
        if self.interrupted() {
            Err(FunctionError::Interrupted)
        } else {
            Ok(())
        }
    }

    pub(crate) fn into_observed(self) -> Observed {
        Observed {
            requested: self.requested,
            missing: !self.missing.is_empty(),
            child_error: self.child_error,
            to_spawn: self.to_spawn,
        }
    }
}
