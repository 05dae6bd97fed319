pub mod client_env;
pub mod cycle;
pub mod diff_awareness;
pub mod differencer;
pub mod dirtiness;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod external_files;
pub mod file_state;
pub mod fs;
pub mod fs_checker;
pub mod function;
pub mod graph;
pub mod interrupt;
mod invalidator;
pub mod journal;
pub mod key;
pub mod node;
pub mod progress;
pub mod run;
mod signal;
pub mod trace;
pub mod tsgm;
pub mod value;

pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorInfo, EvaluationFailure, FunctionError, SyncError};
pub use evaluator::{EvaluationContext, EvaluationResult, MemoizingEvaluator};
pub use function::{Computed, DepLookup, Env, Lookup, SkyFunction};
pub use key::{Arg, FunctionName, Key, Root, RootedPath};
pub use value::Value;
