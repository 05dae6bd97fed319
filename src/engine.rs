//! The per-process handle a build tool drives: sync the graph with the
//! outside world at the start of each command, then evaluate.

use crate::client_env::{ClientEnv, ClientEnvironment, ClientEnvironmentFunction};
use crate::diff_awareness::{
    DiffAwarenessFactory, DiffAwarenessManager, ModifiedFileSet, ProcessableModifiedFileSet,
};
use crate::differencer::{Diff, Differencer, RecordingDifferencer};
use crate::dirtiness::{
    BasicFilesystemDirtinessChecker, DirtinessChecker, ExternalDirtinessChecker,
    MissingDiffDirtinessChecker, UnionDirtinessChecker,
};
use crate::error::{EvaluationFailure, SyncError};
use crate::evaluator::{EvaluationContext, EvaluationResult, MemoizingEvaluator};
use crate::external_files::{ExternalFileAction, ExternalFilesHelper, FileType};
use crate::file_state::{DirectoryListingStateFunction, FileStateFunction};
use crate::fs::{FileSystem, RealFileSystem};
use crate::fs_checker::FilesystemValueChecker;
use crate::function::SkyFunction;
use crate::interrupt::Interrupt;
use crate::journal::{ChangeJournal, JournalDiffAwarenessFactory};
use crate::key::{FunctionName, Key, Root, RootedPath};
use crate::tsgm::{Clock, SystemClock, TimestampGranularityMonitor};
use crate::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How many modified keys a diff summary names.
const LOGGED_KEYS: usize = 10;

/// What one `sync` found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Keys invalidated or injected from file changes.
    pub modified_keys: usize,
    /// Roots for which only a full scan could tell what changed.
    pub roots_without_diff: usize,
    pub full_scan: bool,
    pub diff_duration: Duration,
}

pub struct EngineBuilder {
    fs: Arc<dyn FileSystem>,
    functions: FxHashMap<FunctionName, Arc<dyn SkyFunction>>,
    factories: Vec<Arc<dyn DiffAwarenessFactory>>,
    checkers: Vec<Arc<dyn DirtinessChecker>>,
    output_base: Option<PathBuf>,
    ignored_prefixes: Vec<PathBuf>,
    external_file_action: ExternalFileAction,
    check_output_files: bool,
    clock: Arc<dyn Clock>,
    interrupt: Interrupt,
    journal: Option<(Arc<ChangeJournal>, Option<Duration>)>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        EngineBuilder {
            fs: Arc::new(RealFileSystem::new()),
            functions: FxHashMap::default(),
            factories: Vec::new(),
            checkers: Vec::new(),
            output_base: None,
            ignored_prefixes: Vec::new(),
            external_file_action: ExternalFileAction::default(),
            check_output_files: false,
            clock: Arc::new(SystemClock),
            interrupt: Interrupt::new(),
            journal: None,
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        EngineBuilder::default()
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Registers the computation for `name`.  Registering one of the
    /// built-in names replaces the built-in computation.
    pub fn function(mut self, name: FunctionName, function: Arc<dyn SkyFunction>) -> Self {
        self.functions.insert(name, function);
        self
    }

    pub fn diff_awareness_factory(mut self, factory: Arc<dyn DiffAwarenessFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Watches package roots through `journal`.  Views further apart than
    /// `max_age` are treated as having lost track of changes.
    pub fn journal(mut self, journal: Arc<ChangeJournal>, max_age: Option<Duration>) -> Self {
        self.journal = Some((journal, max_age));
        self
    }

    /// A custom checker forces a full scan on every sync.
    pub fn dirtiness_checker(mut self, checker: Arc<dyn DirtinessChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    pub fn output_base(mut self, output_base: impl Into<PathBuf>) -> Self {
        self.output_base = Some(output_base.into());
        self
    }

    pub fn ignored_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.ignored_prefixes.push(prefix.into());
        self
    }

    pub fn external_file_action(mut self, action: ExternalFileAction) -> Self {
        self.external_file_action = action;
        self
    }

    /// Re-check files under the output base on every full scan.
    pub fn check_output_files(mut self, check: bool) -> Self {
        self.check_output_files = check;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn build(self) -> Engine {
        let tsgm = Arc::new(TimestampGranularityMonitor::new(self.clock.clone()));
        let external_files = Arc::new(ExternalFilesHelper::new(
            self.output_base,
            self.ignored_prefixes,
            self.external_file_action,
        ));
        let client_env = ClientEnvironment::new();

        let mut functions = self.functions;
        functions.entry(FunctionName::FILE_STATE).or_insert_with(|| {
            Arc::new(FileStateFunction::new(
                self.fs.clone(),
                external_files.clone(),
                tsgm.clone(),
            ))
        });
        functions
            .entry(FunctionName::DIRECTORY_LISTING_STATE)
            .or_insert_with(|| {
                Arc::new(DirectoryListingStateFunction::new(
                    self.fs.clone(),
                    external_files.clone(),
                ))
            });
        functions
            .entry(FunctionName::CLIENT_ENVIRONMENT_VARIABLE)
            .or_insert_with(|| Arc::new(ClientEnvironmentFunction::new(client_env.clone())));

        let mut factories = self.factories;
        if let Some((journal, max_age)) = self.journal {
            factories.push(Arc::new(
                JournalDiffAwarenessFactory::new(journal, self.clock.clone()).max_age(max_age),
            ));
        }

        let differencer = Arc::new(RecordingDifferencer::new());
        let evaluator = MemoizingEvaluator::new(functions, differencer.clone());
        Engine {
            evaluator,
            differencer,
            diff_awareness: DiffAwarenessManager::new(factories),
            checkers: self.checkers,
            fs: self.fs,
            external_files,
            check_output_files: self.check_output_files,
            tsgm,
            interrupt: self.interrupt,
            client_env,
            client_env_tracker: ClientEnv::new(),
            package_roots: Vec::new(),
            track_incremental_state: true,
            reset_needed: false,
            full_scans: 0,
        }
    }
}

pub struct Engine {
    evaluator: MemoizingEvaluator,
    differencer: Arc<RecordingDifferencer>,
    diff_awareness: DiffAwarenessManager,
    checkers: Vec<Arc<dyn DirtinessChecker>>,
    fs: Arc<dyn FileSystem>,
    external_files: Arc<ExternalFilesHelper>,
    check_output_files: bool,
    tsgm: Arc<TimestampGranularityMonitor>,
    interrupt: Interrupt,
    client_env: ClientEnvironment,
    client_env_tracker: ClientEnv,
    package_roots: Vec<Root>,
    track_incremental_state: bool,
    reset_needed: bool,
    full_scans: usize,
}

fn is_file_key(key: &Key) -> bool {
    key.function() == FunctionName::FILE_STATE
        || key.function() == FunctionName::DIRECTORY_LISTING_STATE
}

/// The keys a precise change to `paths` under `root` may affect: the file
/// itself and the listing of its directory.
fn keys_for_paths(root: &Root, paths: &[PathBuf]) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut seen = FxHashSet::default();
    for path in paths {
        let rooted = RootedPath::new(root.clone(), path);
        let parent = rooted.parent();
        for key in std::iter::once(Key::file_state(rooted))
            .chain(parent.map(Key::directory_listing_state))
        {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
    }
    keys
}

fn log_diff(what: &str, diff: &Diff) {
    if diff.is_empty() {
        return;
    }
    let names: Vec<String> = diff.keys().take(LOGGED_KEYS).map(Key::to_string).collect();
    let more = diff.len().saturating_sub(LOGGED_KEYS);
    if more > 0 {
        tracing::info!(
            "{}: {} modified keys: {} and {} more",
            what,
            diff.len(),
            names.join(", "),
            more
        );
    } else {
        tracing::info!("{}: {} modified keys: {}", what, diff.len(), names.join(", "));
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn evaluator(&self) -> &MemoizingEvaluator {
        &self.evaluator
    }

    pub fn differencer(&self) -> &RecordingDifferencer {
        &self.differencer
    }

    pub fn external_files(&self) -> &ExternalFilesHelper {
        &self.external_files
    }

    pub fn tsgm(&self) -> &TimestampGranularityMonitor {
        &self.tsgm
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn package_roots(&self) -> &[Root] {
        &self.package_roots
    }

    /// Full scans run since the engine was built.
    pub fn full_scans(&self) -> usize {
        self.full_scans
    }

    pub fn get_existing_value(&self, key: &Key) -> Option<Value> {
        self.evaluator.get_existing_value(key)
    }

    /// Brings the graph's view of the outside world up to date.  Changes
    /// are queued on the differencer and applied by the next evaluation.
    pub fn sync(
        &mut self,
        package_roots: &[Root],
        client_env: BTreeMap<String, String>,
    ) -> Result<SyncStats, SyncError> {
        if self.reset_needed {
            tracing::info!("discarding incremental state");
            self.reset_evaluator();
            self.reset_needed = false;
        }
        self.tsgm.set_command_start_time();

        if package_roots != self.package_roots.as_slice() {
            if !self.package_roots.is_empty() {
                tracing::info!("package roots changed, invalidating all file state");
                let keys: Vec<Key> = self
                    .evaluator
                    .graph()
                    .keys()
                    .into_iter()
                    .filter(is_file_key)
                    .collect();
                self.differencer.invalidate(keys);
            }
            self.package_roots = package_roots.to_vec();
            self.external_files.set_package_roots(package_roots);
        }

        let stats = self.handle_diffs()?;

        self.client_env.set(client_env.clone());
        self.client_env_tracker
            .handle_changes(&client_env, &*self.differencer);
        Ok(stats)
    }

    fn handle_diffs(&mut self) -> Result<SyncStats, SyncError> {
        let start = Instant::now();
        let mut stats = SyncStats::default();

        let mut precise = Vec::new();
        let mut without_diff: Vec<ProcessableModifiedFileSet> = Vec::new();
        for root in self.package_roots.clone() {
            let set = self.diff_awareness.get_diff(&root)?;
            if set.modified().is_everything() {
                without_diff.push(set);
            } else {
                precise.push(set);
            }
        }

        for set in precise {
            if let ModifiedFileSet::Modified(paths) = set.modified() {
                if !paths.is_empty() {
                    let keys = keys_for_paths(set.root(), paths);
                    let checker = BasicFilesystemDirtinessChecker::new(self.fs.clone());
                    let diff = FilesystemValueChecker::new(&self.tsgm, &self.interrupt)
                        .get_new_and_old_values(&**self.evaluator.graph(), &keys, &checker)?;
                    log_diff(&set.root().to_string(), &diff);
                    stats.modified_keys += diff.len();
                    self.differencer.record(diff);
                }
            }
            set.mark_processed(&mut self.diff_awareness);
        }

        stats.roots_without_diff = without_diff.len();
        let roots: FxHashSet<Root> = without_diff.iter().map(|set| set.root().clone()).collect();
        if let Some(reason) = self.full_scan_reason(&roots) {
            tracing::info!("checking the whole graph for changes: {}", reason);
            stats.modified_keys += self.full_scan(roots)?;
            stats.full_scan = true;
        } else {
            tracing::debug!("all roots have precise diffs, skipping full scan");
        }
        for set in without_diff {
            set.mark_processed(&mut self.diff_awareness);
        }

        stats.diff_duration = start.elapsed();
        Ok(stats)
    }

    fn full_scan_reason(&self, roots_without_diff: &FxHashSet<Root>) -> Option<&'static str> {
        let knowledge = self.external_files.knowledge();
        if !roots_without_diff.is_empty() {
            Some("some roots have no diff")
        } else if !self.checkers.is_empty() {
            Some("custom dirtiness checkers registered")
        } else if knowledge.any_non_output_external_files_seen {
            Some("external files seen")
        } else if knowledge.any_output_files_seen && self.check_output_files {
            Some("output files seen")
        } else {
            None
        }
    }

    fn full_scan(&mut self, roots_without_diff: FxHashSet<Root>) -> Result<usize, SyncError> {
        // Apply everything queued so far, so the scan sees current nodes.
        let flush = EvaluationContext::new().interrupt(self.interrupt.clone());
        if let Err(EvaluationFailure::Interrupted) = self.evaluator.evaluate(&[], &flush) {
            return Err(SyncError::Interrupted);
        }

        let fresh = Arc::new(self.external_files.clone_with_fresh_knowledge());
        let mut types = FxHashSet::default();
        types.insert(FileType::ExternalRepo);
        if self.external_files.action() == ExternalFileAction::DependOnExternalPaths {
            types.insert(FileType::External);
        }
        if self.check_output_files {
            types.insert(FileType::Output);
        }
        let mut checkers: Vec<Arc<dyn DirtinessChecker>> = vec![
            Arc::new(MissingDiffDirtinessChecker::new(
                roots_without_diff,
                self.fs.clone(),
            )),
            Arc::new(ExternalDirtinessChecker::new(
                fresh.clone(),
                types,
                self.fs.clone(),
            )),
        ];
        checkers.extend(self.checkers.iter().cloned());
        let union = UnionDirtinessChecker::new(checkers);

        let diff = FilesystemValueChecker::new(&self.tsgm, &self.interrupt)
            .get_dirty_keys(&**self.evaluator.graph(), &union)?;
        self.full_scans += 1;
        self.external_files.set_knowledge(fresh.knowledge());
        log_diff("full scan", &diff);
        let n = diff.len();
        self.differencer.record(diff);
        Ok(n)
    }

    pub fn evaluate(
        &self,
        roots: &[Key],
        ctx: &EvaluationContext,
    ) -> Result<EvaluationResult, EvaluationFailure> {
        self.evaluator.evaluate(roots, ctx)
    }

    /// Invalidates every node whose key matches.
    pub fn invalidate<F: Fn(&Key) -> bool>(&self, pred: F) {
        let keys: Vec<Key> = self
            .evaluator
            .graph()
            .keys()
            .into_iter()
            .filter(|key| pred(key))
            .collect();
        self.differencer.invalidate(keys);
    }

    /// Deletes every node whose key matches, and everything depending on
    /// it, at the start of the next evaluation.
    pub fn delete<F>(&self, pred: F)
    where
        F: Fn(&Key) -> bool + Send + Sync + 'static,
    {
        self.evaluator.delete(move |key, _| pred(key));
    }

    /// Deletes dirty nodes not rebuilt within the last `window` evaluations.
    pub fn delete_old_nodes(&self, window: u64) -> usize {
        self.evaluator.delete_dirty(window)
    }

    pub fn invalidate_transient_errors(&self) {
        self.differencer.invalidate_transient_errors();
    }

    /// Applies a modified file set for `root` obtained outside of diff
    /// awareness.
    pub fn invalidate_files_under_path(
        &self,
        set: &ModifiedFileSet,
        root: &Root,
    ) -> Result<(), SyncError> {
        match set {
            ModifiedFileSet::EverythingModified => self.invalidate(|key| {
                is_file_key(key) && key.path().map_or(false, |path| path.root() == root)
            }),
            ModifiedFileSet::Modified(paths) => {
                let keys = keys_for_paths(root, paths);
                let checker = BasicFilesystemDirtinessChecker::new(self.fs.clone());
                let diff = FilesystemValueChecker::new(&self.tsgm, &self.interrupt)
                    .get_new_and_old_values(&**self.evaluator.graph(), &keys, &checker)?;
                log_diff(&root.to_string(), &diff);
                self.differencer.record(diff);
            }
        }
        Ok(())
    }

    /// Switching incremental tracking on or off, or keeping it off, makes
    /// the next sync start from an empty graph.
    pub fn decide_keep_incremental_state(&mut self, track: bool) {
        if track != self.track_incremental_state || !track {
            self.reset_needed = true;
        }
        self.track_incremental_state = track;
    }

    /// Discards all incremental state.
    pub fn reset_evaluator(&mut self) {
        self.evaluator.reset();
        self.diff_awareness.reset();
        self.external_files.set_knowledge(Default::default());
        self.client_env_tracker.reset();
        self.package_roots.clear();
        self.external_files.set_package_roots(&[]);
    }

    /// Ends a command.  Waits until files modified from now on are
    /// guaranteed to get an mtime distinct from the files this command read.
    pub fn finish_command(&mut self) {
        self.tsgm.wait_for_timestamp_granularity();
        if !self.track_incremental_state {
            self.reset_evaluator();
        }
    }

    pub fn shutdown(mut self) {
        self.reset_evaluator();
        // Drain anything queued after the last evaluation.
        self.differencer.apply_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_for_paths_dedups_listings() {
        let root = Root::new("/src");
        let keys = keys_for_paths(&root, &["a/x".into(), "a/y".into(), "b".into()]);
        assert_eq!(
            keys,
            vec![
                Key::file_state(RootedPath::new(root.clone(), "a/x")),
                Key::directory_listing_state(RootedPath::new(root.clone(), "a")),
                Key::file_state(RootedPath::new(root.clone(), "a/y")),
                Key::file_state(RootedPath::new(root.clone(), "b")),
                Key::directory_listing_state(RootedPath::new(root, "")),
            ]
        );
    }

    #[test]
    fn scan_reasons() {
        let engine = Engine::builder()
            .output_base("/out")
            .check_output_files(false)
            .build();
        let mut roots = FxHashSet::default();
        assert_eq!(engine.full_scan_reason(&roots), None);

        engine
            .external_files()
            .note_file_type(&RootedPath::absolute("/out/bin/x"));
        assert_eq!(engine.full_scan_reason(&roots), None);
        engine
            .external_files()
            .note_file_type(&RootedPath::absolute("/usr/include/x.h"));
        assert!(engine.full_scan_reason(&roots).is_some());

        engine.external_files().set_knowledge(Default::default());
        roots.insert(Root::new("/src"));
        assert!(engine.full_scan_reason(&roots).is_some());
    }

    #[test]
    fn incremental_state_decisions() {
        let mut engine = Engine::builder().build();
        engine.decide_keep_incremental_state(true);
        assert!(!engine.reset_needed);
        engine.decide_keep_incremental_state(false);
        assert!(engine.reset_needed);
    }
}
