//! Values stored in graph nodes.
//!
//! Equality matters: an injected or recomputed value that compares equal to
//! the previous one does not invalidate dependents.  Every variant compares
//! structurally except `Opaque`, which compares by identity.

use crate::file_state::{DirectoryListingStateValue, FileStateValue};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value whose contents the engine cannot compare.  Two opaque values are
/// equal only if they share the same allocation, so replacing an opaque value
/// always counts as a change.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(val: T) -> Self {
        Opaque(Arc::new(val))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Opaque {}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:p})", Arc::as_ptr(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    List(Arc<[Value]>),
    FileState(FileStateValue),
    DirectoryListing(DirectoryListingStateValue),
    /// A client environment variable; None if unset.
    ClientEnv(Option<Arc<str>>),
    Opaque(Opaque),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_file_state(&self) -> Option<&FileStateValue> {
        match self {
            Value::FileState(fs) => Some(fs),
            _ => None,
        }
    }

    pub fn as_client_env(&self) -> Option<Option<&str>> {
        match self {
            Value::ClientEnv(v) => Some(v.as_deref()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Arc::from(b))
    }
}
