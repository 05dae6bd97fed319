//! The `skein` demo binary: counts lines in files, recomputing only what
//! changed.  With `--watch`, reads changed paths from stdin and rebuilds after
//! each blank line.

use crate::engine::{Engine, EngineBuilder};
use crate::error::{EvaluationFailure, FunctionError};
use crate::evaluator::EvaluationContext;
use crate::fs::{FileSystem, RealFileSystem};
use crate::function::{from_fn, Computed, Lookup, SkyFunction};
use crate::journal::ChangeJournal;
use crate::key::{Arg, FunctionName, Key, Root, RootedPath};
use crate::progress::{self, ConsoleProgress, EvaluationProgress};
use crate::value::Value;
use crate::{signal, trace};
use anyhow::anyhow;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

pub const LINE_COUNT: FunctionName = FunctionName::new("LINE_COUNT");
pub const TOTAL: FunctionName = FunctionName::new("TOTAL");

pub fn line_count_key(path: RootedPath) -> Key {
    Key::new(LINE_COUNT, path)
}

pub fn total_key(paths: impl IntoIterator<Item = RootedPath>) -> Key {
    let args: Vec<Arg> = paths.into_iter().map(Arg::Path).collect();
    Key::new(TOTAL, Arg::Tuple(Arc::from(args)))
}

/// `LINE_COUNT(path)`: the number of newlines in a file.
pub fn line_count_function(fs: Arc<dyn FileSystem>) -> Arc<dyn SkyFunction> {
    from_fn(move |key, env| {
        let path = match key.path() {
            Some(path) => path.clone(),
            None => return Err(FunctionError::failed(format!("{}: not a path", key))),
        };
        let state = match env.get_value(&Key::file_state(path.clone())) {
            Lookup::Ready(value) => value,
            Lookup::NotReady => return Ok(Computed::Restart),
        };
        match state.as_file_state() {
            Some(state) if state.exists() => {}
            _ => return Err(FunctionError::failed(format!("{}: no such file", path))),
        }
        let content = fs.read(&path.as_path())?;
        let lines = content.iter().filter(|&&b| b == b'\n').count();
        Ok(Computed::Done(Value::Int(lines as i64)))
    })
}

/// `TOTAL((path, ...))`: the sum of the line counts of the paths.
pub fn total_function() -> Arc<dyn SkyFunction> {
    from_fn(|key, env| {
        let args = match key.arg() {
            Arg::Tuple(args) => args.clone(),
            arg => return Err(FunctionError::failed(format!("{}: not a tuple", arg))),
        };
        let deps: Vec<Key> = args
            .iter()
            .filter_map(|arg| match arg {
                Arg::Path(path) => Some(line_count_key(path.clone())),
                _ => None,
            })
            .collect();
        let values = env.get_values(&deps);
        if env.values_missing() {
            return Ok(Computed::Restart);
        }
        let total: i64 = values.values().filter_map(Value::as_int).sum();
        Ok(Computed::Done(Value::Int(total)))
    })
}

/// An engine builder with the demo computations registered.
pub fn demo_builder(fs: Arc<dyn FileSystem>) -> EngineBuilder {
    Engine::builder()
        .file_system(fs.clone())
        .function(LINE_COUNT, line_count_function(fs))
        .function(TOTAL, total_function())
}

#[derive(argh::FromArgs)]
/// skein: count lines in files, incrementally.
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    dir: Option<String>,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// keep going after a file fails
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// write a chrome trace of the run to FILE
    #[argh(option)]
    trace: Option<String>,

    /// read changed paths from stdin, one per line, rebuilding after each
    /// blank line
    #[argh(switch)]
    watch: bool,

    /// print every computation
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// files to count
    #[argh(positional)]
    files: Vec<String>,
}

struct Build<'a> {
    engine: &'a mut Engine,
    root: Root,
    files: &'a [String],
    ctx: EvaluationContext,
}

impl<'a> Build<'a> {
    /// Syncs and evaluates once.  Returns whether every file was counted.
    fn once(&mut self) -> anyhow::Result<bool> {
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let roots = [self.root.clone()];
        let sync = trace::scope("engine.sync", || self.engine.sync(&roots, env))?;
        tracing::debug!(?sync, "synced");

        let paths: Vec<RootedPath> = self
            .files
            .iter()
            .map(|file| RootedPath::new(self.root.clone(), file))
            .collect();
        let total = total_key(paths.iter().cloned());
        let mut keys: Vec<Key> = paths.iter().cloned().map(line_count_key).collect();
        keys.push(total.clone());

        let result = trace::scope("engine.evaluate", || self.engine.evaluate(&keys, &self.ctx));
        self.engine.finish_command();
        let (values, ok, stats) = match result {
            Ok(result) => {
                let stats = result.stats;
                (result.into_values(), true, stats)
            }
            Err(EvaluationFailure::Interrupted) => anyhow::bail!("interrupted"),
            Err(EvaluationFailure::Failed(failed)) => {
                for (key, err) in &failed.errors {
                    if key.function() == LINE_COUNT {
                        println!("skein: error: {}", err);
                    }
                }
                let stats = self.engine.evaluator().last_stats();
                (failed.values, false, stats)
            }
        };

        let value_of = |key: &Key| {
            values
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| v.as_int())
        };
        for (file, path) in self.files.iter().zip(&paths) {
            if let Some(n) = value_of(&line_count_key(path.clone())) {
                println!("{:>8} {}", n, file);
            }
        }
        if let Some(n) = value_of(&total) {
            println!("{:>8} total", n);
        }
        println!(
            "skein: {} computed, {} up to date",
            stats.built, stats.confirmed
        );
        Ok(ok)
    }
}

fn run_impl() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();

    if let Some(path) = &args.trace {
        trace::open(path)?;
    }
    if let Some(dir) = &args.dir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    if args.files.is_empty() {
        anyhow::bail!("no files specified");
    }

    let cwd = std::env::current_dir()?;
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
    let journal = Arc::new(ChangeJournal::new());
    let mut builder = demo_builder(fs);
    if args.watch {
        builder = builder.journal(journal.clone(), None);
    }
    let mut engine = builder.build();
    signal::register_sigint(engine.interrupt());

    let progress: Arc<dyn EvaluationProgress> =
        Arc::new(ConsoleProgress::new(args.verbose, progress::use_fancy()));
    let mut ctx = EvaluationContext::new()
        .keep_going(args.keep_going)
        .progress(progress)
        .interrupt(engine.interrupt().clone());
    if let Some(jobs) = args.jobs {
        ctx = ctx.parallelism(jobs);
    }

    let mut build = Build {
        engine: &mut engine,
        root: Root::new(&cwd),
        files: &args.files,
        ctx,
    };
    let mut ok = build.once()?;
    if args.watch {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                ok = build.once()?;
            } else {
                journal.record(cwd.join(line));
            }
        }
    }
    engine.shutdown();

    Ok(if ok { 0 } else { 1 })
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_lines_incrementally() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a"), "1\n2\n")?;
        std::fs::write(dir.path().join("b"), "1\n")?;
        let root = Root::new(dir.path());
        let mut engine = demo_builder(Arc::new(RealFileSystem::new())).build();
        let total = total_key(vec![
            RootedPath::new(root.clone(), "a"),
            RootedPath::new(root.clone(), "b"),
        ]);
        let ctx = EvaluationContext::new().parallelism(2);

        engine.sync(&[root.clone()], BTreeMap::new())?;
        let result = engine.evaluate(&[total.clone()], &ctx)?;
        assert_eq!(result.get(&total), Some(&Value::Int(3)));
        // TOTAL, two LINE_COUNTs and two FILE_STATEs.
        assert_eq!(result.stats.built, 5);

        engine.sync(&[root], BTreeMap::new())?;
        let result = engine.evaluate(&[total.clone()], &ctx)?;
        assert_eq!(result.get(&total), Some(&Value::Int(3)));
        assert_eq!(result.stats.built, 0);
        Ok(())
    }
}
