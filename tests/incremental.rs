//! Engine tests against real files in a temporary directory.

use filetime::FileTime;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use skein::diff_awareness::ModifiedFileSet;
use skein::dirtiness::DirtinessChecker;
use skein::error::SyncError;
use skein::external_files::ExternalFileAction;
use skein::file_state::FileStateValue;
use skein::function::from_fn;
use skein::journal::ChangeJournal;
use skein::tsgm::TimestampGranularityMonitor;
use skein::*;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::Arc;

const GREETING: FunctionName = FunctionName::new("GREETING");
const SHOUT: FunctionName = FunctionName::new("SHOUT");
const ENV: FunctionName = FunctionName::new("ENV");

#[derive(Default)]
struct Runs(Mutex<FxHashMap<Key, usize>>);

impl Runs {
    fn bump(&self, key: &Key) {
        *self.0.lock().entry(key.clone()).or_default() += 1;
    }

    fn get(&self, key: &Key) -> usize {
        self.0.lock().get(key).copied().unwrap_or(0)
    }
}

/// A temporary directory whose files get distinct, stable mtimes.
struct TestSpace {
    dir: tempfile::TempDir,
    next_mtime: Cell<i64>,
}

impl TestSpace {
    fn new() -> anyhow::Result<Self> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
            next_mtime: Cell::new(1_600_000_000),
        })
    }

    fn root(&self) -> Root {
        Root::new(self.dir.path())
    }

    fn path(&self, rel: &str) -> RootedPath {
        RootedPath::new(self.root(), rel)
    }

    fn write(&self, rel: &str, content: &str) -> anyhow::Result<()> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        let mtime = self.next_mtime.get();
        self.next_mtime.set(mtime + 1);
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime, 0))?;
        Ok(())
    }
}

fn greeting(path: &RootedPath) -> Key {
    Key::new(GREETING, path.clone())
}

fn shout(path: &RootedPath) -> Key {
    Key::new(SHOUT, path.clone())
}

/// An engine with `GREETING(path)`, the trimmed file contents, `SHOUT(path)`,
/// the greeting upper-cased, and `ENV(name)`, a client variable.
fn builder(runs: &Arc<Runs>) -> EngineBuilder {
    let r = runs.clone();
    let greeting_fn = from_fn(move |key, env| {
        r.bump(key);
        let path = match key.path() {
            Some(path) => path.clone(),
            None => return Err(FunctionError::failed("not a path")),
        };
        let state = match env.get_value(&Key::file_state(path.clone())) {
            Lookup::Ready(v) => v,
            Lookup::NotReady => return Ok(Computed::Restart),
        };
        if !state.as_file_state().map_or(false, FileStateValue::exists) {
            return Err(FunctionError::failed(format!("{}: missing", path)));
        }
        let text = std::fs::read_to_string(path.as_path())?;
        Ok(Computed::Done(Value::from(text.trim())))
    });

    let r = runs.clone();
    let shout_fn = from_fn(move |key, env| {
        r.bump(key);
        let path = match key.path() {
            Some(path) => path.clone(),
            None => return Err(FunctionError::failed("not a path")),
        };
        match env.get_value(&Key::new(GREETING, path)) {
            Lookup::Ready(v) => Ok(Computed::Done(Value::from(
                v.as_str().unwrap_or_default().to_uppercase(),
            ))),
            Lookup::NotReady => Ok(Computed::Restart),
        }
    });

    let r = runs.clone();
    let env_fn = from_fn(move |key, env| {
        r.bump(key);
        let name = match key.arg() {
            Arg::Str(name) => name.clone(),
            _ => return Err(FunctionError::failed("not a name")),
        };
        match env.get_value(&Key::client_environment_variable(&name)) {
            Lookup::Ready(v) => Ok(Computed::Done(v)),
            Lookup::NotReady => Ok(Computed::Restart),
        }
    });

    Engine::builder()
        .function(GREETING, greeting_fn)
        .function(SHOUT, shout_fn)
        .function(ENV, env_fn)
}

fn ctx() -> EvaluationContext {
    EvaluationContext::new().parallelism(2)
}

fn no_env() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn value_of(engine: &Engine, key: &Key) -> anyhow::Result<Value> {
    let result = engine.evaluate(&[key.clone()], &ctx())?;
    Ok(result.get(key).cloned().unwrap_or(Value::Unit))
}

#[test]
fn journal_diffs_are_precise() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs).journal(journal.clone(), None).build();
    let roots = [space.root()];
    let f = space.path("f");

    // The first sync only establishes the baseline view.
    let stats = engine.sync(&roots, no_env())?;
    assert!(stats.full_scan);
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("hello"));

    let stats = engine.sync(&roots, no_env())?;
    assert!(!stats.full_scan);
    assert_eq!(stats.modified_keys, 0);
    let result = engine.evaluate(&[greeting(&f)], &ctx())?;
    assert_eq!(result.stats.built, 0);

    space.write("f", "world")?;
    journal.record(f.as_path());
    let stats = engine.sync(&roots, no_env())?;
    assert!(!stats.full_scan);
    assert_eq!(stats.modified_keys, 1);
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("world"));
    assert_eq!(runs.get(&greeting(&f)), 2);
    assert_eq!(engine.full_scans(), 1);
    Ok(())
}

#[test]
fn unjournaled_changes_are_invisible() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs).journal(journal, None).build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;
    space.write("f", "world")?;
    engine.sync(&roots, no_env())?;
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("hello"));
    Ok(())
}

#[test]
fn roots_without_awareness_are_scanned() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("g", "hello")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let g = space.path("g");

    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&g))?;

    let stats = engine.sync(&roots, no_env())?;
    assert!(stats.full_scan);
    assert_eq!(stats.roots_without_diff, 1);
    assert_eq!(stats.modified_keys, 0);
    let result = engine.evaluate(&[greeting(&g)], &ctx())?;
    assert_eq!(result.stats.built, 0);
    assert_eq!(runs.get(&greeting(&g)), 1);

    space.write("g", "again")?;
    let stats = engine.sync(&roots, no_env())?;
    assert_eq!(stats.modified_keys, 1);
    assert_eq!(value_of(&engine, &greeting(&g))?, Value::from("again"));
    assert_eq!(engine.full_scans(), 3);
    Ok(())
}

#[test]
fn equal_contents_prune_dependents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    assert_eq!(value_of(&engine, &shout(&f))?, Value::from("HELLO"));

    // New mtime, same text.
    space.write("f", "hello\n")?;
    engine.sync(&roots, no_env())?;
    let result = engine.evaluate(&[shout(&f)], &ctx())?;
    assert_eq!(result.get(&shout(&f)), Some(&Value::from("HELLO")));
    assert_eq!(runs.get(&greeting(&f)), 2);
    assert_eq!(runs.get(&shout(&f)), 1);
    assert_eq!(result.stats.confirmed, 1);
    Ok(())
}

#[test]
fn removed_variables_read_as_unset() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let reader = Key::new(ENV, "ENV_X");

    let mut env = BTreeMap::new();
    env.insert("ENV_X".to_string(), "1".to_string());
    engine.sync(&roots, env.clone())?;
    assert_eq!(value_of(&engine, &reader)?, Value::ClientEnv(Some(Arc::from("1"))));

    engine.sync(&roots, env)?;
    value_of(&engine, &reader)?;
    assert_eq!(runs.get(&reader), 1);

    engine.sync(&roots, no_env())?;
    assert_eq!(value_of(&engine, &reader)?, Value::ClientEnv(None));
    assert_eq!(runs.get(&reader), 2);
    Ok(())
}

#[test]
fn broken_journal_falls_back_to_scanning() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs).journal(journal.clone(), None).build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;

    journal.close();
    space.write("f", "closed")?;
    let stats = engine.sync(&roots, no_env())?;
    assert!(stats.full_scan);
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("closed"));

    // A reopened journal needs a new baseline first.
    journal.reopen();
    assert!(engine.sync(&roots, no_env())?.full_scan);
    assert!(!engine.sync(&roots, no_env())?.full_scan);

    journal.record_overflow();
    space.write("f", "overflowed")?;
    let stats = engine.sync(&roots, no_env())?;
    assert!(stats.full_scan);
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("overflowed"));
    Ok(())
}

#[test]
fn external_files_force_scans() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("src/f", "hello")?;
    space.write("ext/h", "header")?;
    let external = Key::file_state(RootedPath::absolute(space.dir.path().join("ext/h")));
    let roots = [Root::new(space.dir.path().join("src"))];

    let runs = Arc::new(Runs::default());
    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs).journal(journal, None).build();
    engine.sync(&roots, no_env())?;
    let state = value_of(&engine, &external)?;
    assert!(state.as_file_state().map_or(false, FileStateValue::exists));
    assert!(engine.external_files().knowledge().any_non_output_external_files_seen);
    assert!(engine.sync(&roots, no_env())?.full_scan);

    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs)
        .journal(journal, None)
        .external_file_action(ExternalFileAction::AssumeNonExistentAndImmutable)
        .build();
    engine.sync(&roots, no_env())?;
    let state = value_of(&engine, &external)?;
    assert_eq!(state, Value::FileState(FileStateValue::NonExistent));
    assert!(!engine.external_files().knowledge().any_non_output_external_files_seen);
    assert!(!engine.sync(&roots, no_env())?.full_scan);
    Ok(())
}

#[test]
fn package_root_change_rechecks_files() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a/f", "hello")?;
    space.write("b/g", "other")?;
    let root_a = Root::new(space.dir.path().join("a"));
    let root_b = Root::new(space.dir.path().join("b"));
    let f = RootedPath::new(root_a.clone(), "f");
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();

    engine.sync(&[root_a.clone()], no_env())?;
    value_of(&engine, &greeting(&f))?;

    engine.sync(&[root_a, root_b], no_env())?;
    assert_eq!(engine.package_roots().len(), 2);
    let result = engine.evaluate(&[greeting(&f)], &ctx())?;
    assert_eq!(result.stats.built, 1);
    assert_eq!(result.stats.confirmed, 1);
    assert_eq!(runs.get(&greeting(&f)), 1);
    Ok(())
}

#[test]
fn incremental_state_can_be_dropped() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;
    engine.decide_keep_incremental_state(false);
    engine.finish_command();
    assert!(engine.get_existing_value(&greeting(&f)).is_none());

    engine.decide_keep_incremental_state(true);
    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;
    assert_eq!(runs.get(&greeting(&f)), 2);

    engine.decide_keep_incremental_state(true);
    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;
    assert_eq!(runs.get(&greeting(&f)), 2);
    engine.shutdown();
    Ok(())
}

#[test]
fn modified_sets_from_the_host() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let root = space.root();
    let f = space.path("f");

    engine.sync(&[root.clone()], no_env())?;
    value_of(&engine, &greeting(&f))?;

    space.write("f", "precise")?;
    engine.invalidate_files_under_path(&ModifiedFileSet::Modified(vec!["f".into()]), &root)?;
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("precise"));

    engine.invalidate_files_under_path(&ModifiedFileSet::EverythingModified, &root)?;
    let result = engine.evaluate(&[greeting(&f)], &ctx())?;
    assert_eq!(result.stats.confirmed, 1);
    Ok(())
}

#[test]
fn interrupted_sync_is_retryable() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    value_of(&engine, &greeting(&f))?;

    engine.interrupt().trigger();
    assert!(matches!(
        engine.sync(&roots, no_env()),
        Err(SyncError::Interrupted)
    ));
    engine.interrupt().clear();
    engine.sync(&roots, no_env())?;
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("hello"));
    assert_eq!(runs.get(&greeting(&f)), 1);
    Ok(())
}

/// Reports a fixed value for every greeting.
struct Patched;

impl DirtinessChecker for Patched {
    fn applies(&self, key: &Key) -> bool {
        key.function() == GREETING
    }

    fn create_new_value(
        &self,
        _key: &Key,
        _tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>> {
        Ok(Some(Value::from("patched")))
    }
}

#[test]
fn custom_checkers_inject_values() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    let runs = Arc::new(Runs::default());
    let journal = Arc::new(ChangeJournal::new());
    let mut engine = builder(&runs)
        .journal(journal, None)
        .dirtiness_checker(Arc::new(Patched))
        .build();
    let roots = [space.root()];
    let f = space.path("f");

    engine.sync(&roots, no_env())?;
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("hello"));

    let stats = engine.sync(&roots, no_env())?;
    assert!(stats.full_scan);
    assert_eq!(stats.modified_keys, 1);
    assert_eq!(value_of(&engine, &greeting(&f))?, Value::from("patched"));
    assert_eq!(runs.get(&greeting(&f)), 1);
    Ok(())
}

#[test]
fn deleted_nodes_are_recomputed() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("f", "hello")?;
    space.write("g", "other")?;
    let runs = Arc::new(Runs::default());
    let mut engine = builder(&runs).build();
    let roots = [space.root()];
    let (f, g) = (space.path("f"), space.path("g"));

    engine.sync(&roots, no_env())?;
    engine.evaluate(&[shout(&f), shout(&g)], &ctx())?;

    let doomed = Key::file_state(f.clone());
    engine.delete(move |key| *key == doomed);
    engine.evaluate(&[], &ctx())?;
    assert!(engine.get_existing_value(&shout(&f)).is_none());
    assert!(engine.get_existing_value(&greeting(&g)).is_some());

    // Dirty but never demanded again.
    engine.invalidate(|key| key.function() == GREETING);
    engine.evaluate(&[], &ctx())?;
    assert_eq!(engine.delete_old_nodes(10), 0);
    assert_eq!(engine.delete_old_nodes(0), 2);
    assert!(engine.get_existing_value(&shout(&g)).is_none());
    Ok(())
}
