//! The memoizing evaluator: applies pending changes, then brings requested
//! keys up to date, recomputing only what the changes reached.
//!
//! Scheduling is demand driven.  Requesting a key that is not done moves it
//! into an in-flight state and schedules it on the worker pool; the requester
//! registers as a waiter and, if its computation asked for anything that was
//! not ready, its attempt is discarded and re-run once every missing dep has
//! signalled.  Each in-flight node counts the signals it still expects in
//! `BuildingState::pending`; while an attempt runs, the count carries one
//! extra "hold" so that deps finishing mid-attempt cannot re-schedule it
//! early.

use crate::cycle::{reaches, CycleFinder, CycleInfo};
use crate::differencer::Differencer;
use crate::error::{ErrorInfo, EvaluationFailure, FailedEvaluation, FunctionError};
use crate::function::{Computed, Env, SkyFunction};
use crate::graph::{Graph, InMemoryGraph};
use crate::interrupt::Interrupt;
use crate::invalidator;
use crate::key::{FunctionName, Key};
use crate::node::{BuildingState, DirtyKind, Lifecycle, NodeEntry, NodeSnapshot, NodeState, Version};
use crate::progress::{EvaluationProgress, NullProgress};
use crate::trace;
use crate::value::Value;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-evaluation settings.
#[derive(Clone)]
pub struct EvaluationContext {
    /// Number of worker threads.
    pub parallelism: usize,
    /// Keep evaluating independent keys after a failure.
    pub keep_going: bool,
    pub progress: Arc<dyn EvaluationProgress>,
    pub interrupt: Interrupt,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        EvaluationContext {
            parallelism: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            keep_going: false,
            progress: Arc::new(NullProgress),
            interrupt: Interrupt::new(),
        }
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        EvaluationContext::default()
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn EvaluationProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }
}

/// Counts of what one evaluation did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Computations that finished with a value.
    pub built: usize,
    /// Dirty nodes verified clean without recomputing.
    pub confirmed: usize,
    /// Computation attempts discarded for missing deps.
    pub restarts: usize,
    pub failed: usize,
}

/// The values of all requested keys.
#[derive(Debug)]
pub struct EvaluationResult {
    values: Vec<(Key, Value)>,
    pub stats: EvaluationStats,
}

impl EvaluationResult {
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Values in the order their keys were requested.
    pub fn values(&self) -> &[(Key, Value)] {
        &self.values
    }

    pub fn into_values(self) -> Vec<(Key, Value)> {
        self.values
    }
}

/// What a requester sees of a dep.
pub(crate) enum DepState {
    Value(Value),
    Error(ErrorInfo),
    Pending,
}

type DeletePredicate = Box<dyn Fn(&Key, &NodeState) -> bool + Send + Sync>;

struct EvaluatorState {
    version: Version,
    pending_deletions: Vec<DeletePredicate>,
    last_stats: EvaluationStats,
    pool: Option<(usize, rayon::ThreadPool)>,
}

pub struct MemoizingEvaluator {
    graph: Arc<dyn Graph>,
    functions: FxHashMap<FunctionName, Arc<dyn SkyFunction>>,
    differencer: Arc<dyn Differencer>,
    /// Held for the whole of an evaluation, which also serializes applying
    /// the differencer's changes.
    state: Mutex<EvaluatorState>,
}

impl MemoizingEvaluator {
    pub fn new(
        functions: FxHashMap<FunctionName, Arc<dyn SkyFunction>>,
        differencer: Arc<dyn Differencer>,
    ) -> Self {
        MemoizingEvaluator::with_graph(Arc::new(InMemoryGraph::new()), functions, differencer)
    }

    pub fn with_graph(
        graph: Arc<dyn Graph>,
        functions: FxHashMap<FunctionName, Arc<dyn SkyFunction>>,
        differencer: Arc<dyn Differencer>,
    ) -> Self {
        MemoizingEvaluator {
            graph,
            functions,
            differencer,
            state: Mutex::new(EvaluatorState {
                version: Version::default(),
                pending_deletions: Vec::new(),
                last_stats: EvaluationStats::default(),
                pool: None,
            }),
        }
    }

    pub fn graph(&self) -> &Arc<dyn Graph> {
        &self.graph
    }

    /// The version of the most recent evaluation.
    pub fn version(&self) -> Version {
        self.state.lock().version
    }

    pub fn last_stats(&self) -> EvaluationStats {
        self.state.lock().last_stats
    }

    /// Queues deletion of matching nodes and their transitive reverse deps.
    /// Applied at the start of the next evaluation.
    pub fn delete<F>(&self, pred: F)
    where
        F: Fn(&Key, &NodeState) -> bool + Send + Sync + 'static,
    {
        self.state.lock().pending_deletions.push(Box::new(pred));
    }

    /// Deletes dirty nodes that have not been rebuilt for more than `window`
    /// versions.
    pub fn delete_dirty(&self, window: u64) -> usize {
        let state = self.state.lock();
        self.graph.delete_dirty_older_than(window, state.version)
    }

    /// Discards every node and every pending change.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending_deletions.clear();
        self.differencer.apply_pending();
        self.graph.clear();
    }

    pub fn get_existing_value(&self, key: &Key) -> Option<Value> {
        let entry = self.graph.get(key)?;
        let state = entry.lock();
        state.value().cloned()
    }

    pub fn get_existing_error(&self, key: &Key) -> Option<ErrorInfo> {
        let entry = self.graph.get(key)?;
        let state = entry.lock();
        state.error().cloned()
    }

    pub fn snapshot(&self, key: &Key) -> Option<NodeSnapshot> {
        let entry = self.graph.get(key)?;
        let state = entry.lock();
        Some(NodeSnapshot::from(&*state))
    }

    /// Applies pending changes, then evaluates `roots`.
    pub fn evaluate(
        &self,
        roots: &[Key],
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult, EvaluationFailure> {
        let mut state = self.state.lock();
        state.version = state.version.next();
        let version = state.version;

        trace::scope("evaluate.invalidate", || {
            for pred in state.pending_deletions.drain(..) {
                let n = self.graph.delete(&*pred);
                tracing::debug!("deleted {} nodes", n);
            }
            let diff = self.differencer.apply_pending();
            if !diff.is_empty() {
                let stats = invalidator::apply_diff(&*self.graph, diff, version);
                tracing::debug!(?stats, "applied diff at {:?}", version);
            }
        });

        let parallelism = ctx.parallelism.max(1);
        if state.pool.as_ref().map_or(true, |(n, _)| *n != parallelism) {
            state.pool = match rayon::ThreadPoolBuilder::new()
                .num_threads(parallelism)
                .thread_name(|i| format!("skein-eval-{}", i))
                .build()
            {
                Ok(pool) => Some((parallelism, pool)),
                Err(err) => {
                    tracing::warn!("falling back to the global thread pool: {}", err);
                    None
                }
            };
        }
        let pool = state.pool.as_ref().map(|(_, pool)| pool);

        let run = Run {
            graph: &*self.graph,
            functions: &self.functions,
            version,
            keep_going: ctx.keep_going,
            interrupt: &ctx.interrupt,
            progress: &*ctx.progress,
            abort: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            first_error: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            built: AtomicUsize::new(0),
            confirmed: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        };
        ctx.progress.evaluation_started(roots);
        trace::scope("evaluate.run", || run.drive(pool, roots));

        let stats = run.stats();
        state.last_stats = stats;
        ctx.progress.evaluation_finished(&stats);

        if run.is_interrupted() {
            run.reset_in_flight();
            return Err(EvaluationFailure::Interrupted);
        }
        let (values, errors) = run.collect(roots);
        // Under keep-going, a root can finish while deps it started are
        // still stuck behind a cycle that no root waits on.
        run.reset_in_flight();
        if errors.is_empty() {
            Ok(EvaluationResult { values, stats })
        } else {
            Err(EvaluationFailure::Failed(Box::new(FailedEvaluation {
                errors,
                values,
            })))
        }
    }
}

/// The state of one evaluation.
pub(crate) struct Run<'a> {
    graph: &'a dyn Graph,
    functions: &'a FxHashMap<FunctionName, Arc<dyn SkyFunction>>,
    version: Version,
    keep_going: bool,
    interrupt: &'a Interrupt,
    progress: &'a dyn EvaluationProgress,
    /// Set once no new work should start.
    abort: AtomicBool,
    /// Set when a computation reported an interrupt.
    interrupted: AtomicBool,
    first_error: Mutex<Option<(Key, ErrorInfo)>>,
    /// Every node this run moved into flight.
    started: Mutex<Vec<Key>>,
    built: AtomicUsize,
    confirmed: AtomicUsize,
    restarts: AtomicUsize,
    failed: AtomicUsize,
}

fn in_scope<'s, F>(pool: Option<&rayon::ThreadPool>, f: F)
where
    F: FnOnce(&rayon::Scope<'s>) + Send,
{
    match pool {
        Some(pool) => pool.scope(f),
        None => rayon::scope(f),
    }
}

fn done_state(state: &NodeState) -> Option<DepState> {
    if !state.is_done() {
        return None;
    }
    match (state.error(), state.value()) {
        (Some(err), _) => Some(DepState::Error(err.clone())),
        (None, Some(value)) => Some(DepState::Value(value.clone())),
        (None, None) => None,
    }
}

fn done_last_changed(state: &NodeState) -> Option<Version> {
    if state.is_done() {
        Some(state.last_changed())
    } else {
        None
    }
}

/// Moves a node that is not done into an in-flight state.  Returns whether
/// the caller must schedule it.
fn start(state: &mut NodeState) -> bool {
    let lifecycle = match state.lifecycle {
        Lifecycle::Unbuilt => Lifecycle::Building,
        Lifecycle::Dirty => match state.dirty {
            Some(DirtyKind::Check) => Lifecycle::CheckingDeps,
            _ => Lifecycle::Building,
        },
        Lifecycle::Done | Lifecycle::Building | Lifecycle::CheckingDeps => return false,
    };
    state.lifecycle = lifecycle;
    state.building = Some(Box::default());
    true
}

/// Takes a slot in the requester's pending count before it registers with
/// `dep`, so a dep finishing in between cannot drive the count to zero.
fn hold(requester: &NodeEntry, dep: &Key) {
    let mut state = requester.lock();
    if let Some(building) = state.building.as_mut() {
        building.pending += 1;
        building.waiting_on.push(dep.clone());
    }
}

fn unhold(requester: &NodeEntry, dep: &Key) {
    let mut state = requester.lock();
    if let Some(building) = state.building.as_mut() {
        building.pending = building.pending.saturating_sub(1);
        if let Some(pos) = building.waiting_on.iter().position(|k| k == dep) {
            building.waiting_on.swap_remove(pos);
        }
    }
}

/// Rotates a cycle so that it starts at index `i`.
fn rotated(cycle: &[Key], i: usize) -> Vec<Key> {
    cycle[i..].iter().chain(cycle[..i].iter()).cloned().collect()
}

impl<'a> Run<'a> {
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.is_triggered() || self.interrupted.load(Ordering::Relaxed)
    }

    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::Relaxed) || self.is_interrupted()
    }

    fn start(&self, key: &Key, state: &mut NodeState) -> bool {
        let started = start(state);
        if started {
            self.started.lock().push(key.clone());
        }
        started
    }

    fn stats(&self) -> EvaluationStats {
        EvaluationStats {
            built: self.built.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Requests `dep` on behalf of an in-flight `requester`.  Returns what
    /// `read` extracts from the dep once it is done, or None after
    /// registering the requester as a waiter.
    fn request<T>(
        &self,
        requester: &Key,
        requester_entry: &NodeEntry,
        dep: &Key,
        to_spawn: &mut Vec<Key>,
        read: impl Fn(&NodeState) -> Option<T>,
    ) -> Option<T> {
        let dep_entry = self.graph.get_or_create(dep);
        if let Some(t) = read(&*dep_entry.lock()) {
            return Some(t);
        }
        hold(requester_entry, dep);
        let mut state = dep_entry.lock();
        if let Some(t) = read(&*state) {
            drop(state);
            unhold(requester_entry, dep);
            return Some(t);
        }
        if self.start(dep, &mut state) {
            to_spawn.push(dep.clone());
        }
        if let Some(building) = state.building.as_mut() {
            building.add_waiter(requester);
        }
        None
    }

    pub(crate) fn lookup(
        &self,
        requester: &Key,
        requester_entry: &NodeEntry,
        dep: &Key,
        to_spawn: &mut Vec<Key>,
    ) -> DepState {
        self.request(requester, requester_entry, dep, to_spawn, done_state)
            .unwrap_or(DepState::Pending)
    }

    fn spawn<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key) {
        scope.spawn(move |scope| self.process(scope, key));
    }

    fn spawn_all<'s>(&'s self, scope: &rayon::Scope<'s>, keys: Vec<Key>) {
        for key in keys {
            self.spawn(scope, key);
        }
    }

    /// Delivers one dep-finished signal to `waiter`.
    fn signal<'s>(&'s self, scope: &rayon::Scope<'s>, waiter: Key) {
        let entry = match self.graph.get(&waiter) {
            Some(entry) => entry,
            None => return,
        };
        let ready = {
            let mut state = entry.lock();
            match state.building.as_mut() {
                Some(building) if building.pending > 0 => {
                    building.pending -= 1;
                    building.pending == 0
                }
                _ => false,
            }
        };
        if ready {
            self.spawn(scope, waiter);
        }
    }

    /// Drops the hold an attempt carries, re-scheduling the node if nothing
    /// else is outstanding.
    fn release<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key, entry: &NodeEntry) {
        let ready = {
            let mut state = entry.lock();
            match state.building.as_mut() {
                Some(building) => {
                    building.pending = building.pending.saturating_sub(1);
                    building.pending == 0
                }
                None => false,
            }
        };
        if ready {
            self.spawn(scope, key);
        }
    }

    fn process<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key) {
        if self.should_stop() {
            return;
        }
        let entry = self.graph.get_or_create(&key);
        let lifecycle = {
            let mut state = entry.lock();
            match state.building.as_mut() {
                Some(building) => {
                    building.pending = 1;
                    building.waiting_on.clear();
                }
                None => return,
            }
            state.lifecycle
        };
        match lifecycle {
            Lifecycle::CheckingDeps => self.check_deps(scope, key, &entry),
            Lifecycle::Building => self.build(scope, key, &entry),
            _ => {}
        }
    }

    /// Re-verifies a `Check`-dirty node's old deps in their remembered
    /// order, rebuilding at the first one that changed since this node's
    /// version.
    fn check_deps<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key, entry: &NodeEntry) {
        loop {
            let (dep, version) = {
                let state = entry.lock();
                let cursor = state.building.as_ref().map_or(0, |b| b.check_cursor);
                match state.direct_deps.get(cursor) {
                    Some(dep) => (dep.clone(), state.version),
                    None => break,
                }
            };
            let mut to_spawn = Vec::new();
            let last_changed = self.request(&key, entry, &dep, &mut to_spawn, done_last_changed);
            self.spawn_all(scope, to_spawn);
            match last_changed {
                None => return self.release(scope, key, entry),
                Some(changed) if changed > version => {
                    tracing::trace!("{} changed, rebuilding {}", dep, key);
                    let mut state = entry.lock();
                    state.lifecycle = Lifecycle::Building;
                    if let Some(building) = state.building.as_mut() {
                        building.waiting_on.clear();
                    }
                    drop(state);
                    return self.build(scope, key, entry);
                }
                Some(_) => {
                    let mut state = entry.lock();
                    if let Some(building) = state.building.as_mut() {
                        building.check_cursor += 1;
                    }
                }
            }
        }
        self.confirm(scope, key, entry);
    }

    /// Finishes a node whose deps were all unchanged, keeping its result.
    fn confirm<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key, entry: &NodeEntry) {
        let (waiters, error) = {
            let mut state = entry.lock();
            let building = state.building.take();
            state.lifecycle = Lifecycle::Done;
            state.dirty = None;
            state.version = self.version;
            (
                building.map(|b| b.waiters).unwrap_or_default(),
                state.error.clone(),
            )
        };
        self.confirmed.fetch_add(1, Ordering::Relaxed);
        self.progress.node_confirmed(&key);
        if let Some(err) = error {
            self.note_error(&key, &err);
        }
        for waiter in waiters {
            self.signal(scope, waiter);
        }
    }

    fn build<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key, entry: &NodeEntry) {
        let function = match self.functions.get(&key.function()) {
            Some(function) => function,
            None => {
                let msg = format!("no function registered for {}", key.function());
                let err = ErrorInfo::computation(&key, msg, false);
                return self.finish(scope, key, entry, Err(err));
            }
        };

        let mut env = Env::new(self, &key, entry);
        let result = function.compute(&key, &mut env);
        let observed = env.into_observed();

        {
            let mut state = entry.lock();
            if let Some(building) = state.building.as_mut() {
                for dep in &observed.requested {
                    building.add_temp_dep(dep);
                }
            }
        }
        self.spawn_all(scope, observed.to_spawn);

        let outcome = match result {
            Err(FunctionError::Interrupted) => {
                // Left in flight; reset once the evaluation winds down.
                self.interrupted.store(true, Ordering::SeqCst);
                return;
            }
            Err(FunctionError::Failed { message, transient }) => {
                Err(ErrorInfo::computation(&key, message, transient))
            }
            Ok(computed) => match (observed.child_error, computed) {
                (Some(child), _) => Err(ErrorInfo::from_child(&child, &key)),
                (None, Computed::Done(value)) if !observed.missing => Ok(value),
                (None, _) if observed.missing => return self.restart(scope, key, entry),
                (None, _) => Err(ErrorInfo::computation(
                    &key,
                    "computation asked for a restart with no missing deps",
                    false,
                )),
            },
        };
        self.finish(scope, key, entry, outcome);
    }

    fn restart<'s>(&'s self, scope: &rayon::Scope<'s>, key: Key, entry: &NodeEntry) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("restarting {}", key);
        self.progress.node_restarted(&key);
        {
            let mut state = entry.lock();
            if let Some(building) = state.building.as_mut() {
                building.restarts += 1;
            }
        }
        self.release(scope, key, entry);
    }

    /// Stores a final result on a node.  Returns the waiters to signal, or
    /// None if the node was already done.
    fn complete(
        &self,
        key: &Key,
        entry: &NodeEntry,
        outcome: Result<Value, ErrorInfo>,
    ) -> Option<Vec<Key>> {
        let (waiters, old_deps, new_deps, error) = {
            let mut state = entry.lock();
            if state.lifecycle == Lifecycle::Done {
                return None;
            }
            let BuildingState {
                temp_deps, waiters, ..
            } = *state.building.take().unwrap_or_default();
            let changed = match &outcome {
                Ok(value) => state.error.is_some() || state.value.as_ref() != Some(value),
                Err(err) => state.value.is_some() || state.error.as_ref() != Some(err),
            };
            let old_deps = std::mem::replace(&mut state.direct_deps, temp_deps.clone());
            let error = match outcome {
                Ok(value) => {
                    state.value = Some(value);
                    state.error = None;
                    None
                }
                Err(err) => {
                    state.value = None;
                    state.error = Some(err.clone());
                    Some(err)
                }
            };
            state.version = self.version;
            if changed {
                state.last_changed = self.version;
            }
            state.lifecycle = Lifecycle::Done;
            state.dirty = None;
            (waiters, old_deps, temp_deps, error)
        };

        self.update_reverse_deps(key, &old_deps, &new_deps);
        match &error {
            Some(err) => {
                self.progress.node_failed(key, err);
                self.note_error(key, err);
            }
            None => {
                self.built.fetch_add(1, Ordering::Relaxed);
                self.progress.node_built(key);
            }
        }
        Some(waiters)
    }

    fn finish<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        key: Key,
        entry: &NodeEntry,
        outcome: Result<Value, ErrorInfo>,
    ) {
        if let Some(waiters) = self.complete(&key, entry, outcome) {
            for waiter in waiters {
                self.signal(scope, waiter);
            }
        }
    }

    fn update_reverse_deps(&self, key: &Key, old_deps: &[Key], new_deps: &[Key]) {
        let old: FxHashSet<&Key> = old_deps.iter().collect();
        let new: FxHashSet<&Key> = new_deps.iter().collect();
        for dep in new_deps.iter().filter(|dep| !old.contains(dep)) {
            self.graph
                .get_or_create(dep)
                .lock()
                .reverse_deps
                .insert(key.clone());
        }
        for dep in old_deps.iter().filter(|dep| !new.contains(dep)) {
            if let Some(entry) = self.graph.get(dep) {
                entry.lock().reverse_deps.remove(key);
            }
        }
    }

    fn note_error(&self, key: &Key, err: &ErrorInfo) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if !self.keep_going {
            self.abort.store(true, Ordering::SeqCst);
        }
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some((key.clone(), err.clone()));
        }
    }

    fn is_done(&self, key: &Key) -> bool {
        match self.graph.get(key) {
            Some(entry) => {
                let state = entry.lock();
                state.is_done()
            }
            None => false,
        }
    }

    fn waiting_on(&self, key: &Key) -> Vec<Key> {
        match self.graph.get(key) {
            Some(entry) => {
                let state = entry.lock();
                state
                    .building
                    .as_ref()
                    .map(|b| b.waiting_on.clone())
                    .unwrap_or_default()
            }
            None => Vec::new(),
        }
    }

    /// Runs the roots to completion, breaking any cycles that stall them.
    fn drive(&self, pool: Option<&rayon::ThreadPool>, roots: &[Key]) {
        in_scope(pool, |scope| {
            for root in roots {
                let entry = self.graph.get_or_create(root);
                let started = self.start(root, &mut entry.lock());
                if started {
                    self.spawn(scope, root.clone());
                }
            }
        });

        loop {
            if self.should_stop() {
                return;
            }
            let incomplete: Vec<&Key> = roots.iter().filter(|k| !self.is_done(k)).collect();
            if incomplete.is_empty() {
                return;
            }
            let cycles = self.find_cycles(&incomplete);
            if cycles.is_empty() {
                tracing::warn!("{} roots stalled without a dependency cycle", incomplete.len());
                return;
            }
            in_scope(pool, |scope| {
                // Complete every member before waking anyone, so each member
                // reports its own view of the cycle.
                let mut waiters = Vec::new();
                for (key, info) in cycles {
                    let entry = self.graph.get_or_create(&key);
                    if let Some(w) = self.complete(&key, &entry, Err(ErrorInfo::cycle(info))) {
                        waiters.extend(w);
                    }
                }
                for waiter in waiters {
                    self.signal(scope, waiter);
                }
            });
        }
    }

    /// Finds cycles reachable from the incomplete roots along "waiting on"
    /// edges, returning each member with the cycle as seen from it.
    fn find_cycles(&self, incomplete: &[&Key]) -> Vec<(Key, CycleInfo)> {
        let mut finder = CycleFinder::new(|k: &Key| self.waiting_on(k));
        let mut members = Vec::new();
        let mut seen = FxHashSet::default();
        for root in incomplete {
            let info = match finder.find(root) {
                Some(info) => info,
                None => continue,
            };
            tracing::debug!("found {}", info);
            for (i, key) in info.cycle.iter().enumerate() {
                if seen.insert(key.clone()) {
                    let member = CycleInfo {
                        path_to_cycle: Vec::new(),
                        cycle: rotated(&info.cycle, i),
                    };
                    members.push((key.clone(), member));
                }
            }
        }
        members
    }

    /// Gathers per-root results.  Incomplete roots get the failure that
    /// stopped the evaluation.
    fn collect(&self, roots: &[Key]) -> (Vec<(Key, Value)>, Vec<(Key, ErrorInfo)>) {
        let mut values = Vec::new();
        let mut errors = Vec::new();
        let mut incomplete = Vec::new();
        for root in roots {
            let done = match self.graph.get(root) {
                Some(entry) => {
                    let state = entry.lock();
                    done_state(&state)
                }
                None => None,
            };
            match done {
                Some(DepState::Value(value)) => values.push((root.clone(), value)),
                Some(DepState::Error(err)) => errors.push((root.clone(), err)),
                Some(DepState::Pending) | None => incomplete.push(root),
            }
        }
        if incomplete.is_empty() {
            return (values, errors);
        }
        let first_error = self.first_error.lock().clone();
        let (failed_key, err) = match first_error {
            Some(first) => first,
            None => {
                for root in incomplete {
                    let err = ErrorInfo::computation(root, "evaluation did not complete", false);
                    errors.push((root.clone(), err));
                }
                return (values, errors);
            }
        };
        let waiting: Vec<&Key> = incomplete
            .iter()
            .copied()
            .filter(|root| reaches(root, &failed_key, |k| self.waiting_on(k)))
            .collect();
        let blamed = if waiting.is_empty() { incomplete } else { waiting };
        for root in blamed {
            errors.push((root.clone(), ErrorInfo::from_child(&err, root)));
        }
        (values, errors)
    }

    /// Returns every node this run left in flight to a retryable state.
    fn reset_in_flight(&self) {
        let started = std::mem::take(&mut *self.started.lock());
        for key in started {
            if let Some(entry) = self.graph.get(&key) {
                entry.lock().reset_in_flight();
            }
        }
    }
}
