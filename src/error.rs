//! Error types.
//!
//! `ErrorInfo` is the only error stored in the graph.  Interrupts and
//! invalidation-pipeline failures are reported to the caller and never
//! recorded on nodes.

use crate::cycle::CycleInfo;
use crate::key::Key;
use crate::value::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A computation failed deterministically.
    Computation(String),
    /// The key is part of, or depends on, a dependency cycle.
    Cycle(CycleInfo),
}

/// A node-level failure, stored on the node that failed and on every
/// dependent that did not tolerate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// The keys whose own computations failed.
    pub root_causes: Vec<Key>,
    pub kind: ErrorKind,
    /// Whether the failure may go away without any input change.  Transient
    /// errors are re-dirtied by `invalidate_transient_errors`.
    pub transient: bool,
}

impl ErrorInfo {
    pub fn computation(key: &Key, message: impl Into<String>, transient: bool) -> Self {
        ErrorInfo {
            root_causes: vec![key.clone()],
            kind: ErrorKind::Computation(message.into()),
            transient,
        }
    }

    pub fn cycle(info: CycleInfo) -> Self {
        ErrorInfo {
            root_causes: info.cycle.clone(),
            kind: ErrorKind::Cycle(info),
            transient: false,
        }
    }

    /// The error `parent` records when it does not tolerate a failed dep.
    /// Root causes carry over; cycle paths grow by the parent.
    pub fn from_child(child: &ErrorInfo, parent: &Key) -> Self {
        let kind = match &child.kind {
            ErrorKind::Cycle(info) => ErrorKind::Cycle(info.with_dependent(parent)),
            kind => kind.clone(),
        };
        ErrorInfo {
            root_causes: child.root_causes.clone(),
            kind,
            transient: child.transient,
        }
    }

    pub fn cycle_info(&self) -> Option<&CycleInfo> {
        match &self.kind {
            ErrorKind::Cycle(info) => Some(info),
            ErrorKind::Computation(_) => None,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Computation(msg) => write!(f, "{}", msg)?,
            ErrorKind::Cycle(info) => write!(f, "{}", info)?,
        }
        if let Some(cause) = self.root_causes.first() {
            write!(f, " (in {}", cause)?;
            if self.root_causes.len() > 1 {
                write!(f, " and {} more", self.root_causes.len() - 1)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// The error half of a computation's result.
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("{message}")]
    Failed { message: String, transient: bool },
    #[error("interrupted")]
    Interrupted,
}

impl FunctionError {
    pub fn failed(message: impl Into<String>) -> Self {
        FunctionError::Failed {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        FunctionError::Failed {
            message: message.into(),
            transient: true,
        }
    }
}

impl From<std::io::Error> for FunctionError {
    fn from(err: std::io::Error) -> Self {
        // I/O failures may resolve on their own, e.g. a file being rewritten.
        FunctionError::transient(err.to_string())
    }
}

/// An evaluation that completed but where at least one root failed.
#[derive(Debug)]
pub struct FailedEvaluation {
    /// Failing roots, in the order they were requested.
    pub errors: Vec<(Key, ErrorInfo)>,
    /// Roots that evaluated successfully.  Only populated in keep-going mode
    /// or when some roots had finished before a fail-fast abort.
    pub values: Vec<(Key, Value)>,
}

impl fmt::Display for FailedEvaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.first() {
            None => write!(f, "evaluation failed"),
            Some((key, err)) => {
                write!(f, "{}: {}", key, err)?;
                if self.errors.len() > 1 {
                    write!(f, " ({} more failing roots)", self.errors.len() - 1)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationFailure {
    #[error("interrupted")]
    Interrupted,
    #[error("{0}")]
    Failed(Box<FailedEvaluation>),
}

impl EvaluationFailure {
    pub fn failed(&self) -> Option<&FailedEvaluation> {
        match self {
            EvaluationFailure::Failed(f) => Some(f),
            EvaluationFailure::Interrupted => None,
        }
    }

    /// The stored error for a failing root, if any.
    pub fn error_for(&self, key: &Key) -> Option<&ErrorInfo> {
        self.failed()?
            .errors
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, e)| e)
    }
}

/// Errors in the invalidation pipeline.  These are fatal to the current
/// build but leave the stored graph untouched.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),
    #[error("checking {key} for changes: {source}")]
    DirtinessCheck {
        key: Key,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("interrupted")]
    Interrupted,
}
