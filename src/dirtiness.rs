//! Dirtiness checkers decide, during a full scan, whether a done node's
//! value still matches the outside world.

use crate::external_files::{ExternalFilesHelper, FileType};
use crate::file_state::{DirectoryListingStateValue, FileStateValue};
use crate::fs::FileSystem;
use crate::key::{FunctionName, Key, Root};
use crate::tsgm::TimestampGranularityMonitor;
use crate::value::Value;
use rustc_hash::FxHashSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyResult {
    Clean,
    /// The node must change; the new value is attached if the checker could
    /// compute it, in which case it is injected instead of recomputed.
    Dirty(Option<Value>),
}

pub trait DirtinessChecker: Send + Sync {
    /// Whether this checker knows how to check `key`.
    fn applies(&self, key: &Key) -> bool;

    /// Computes the up-to-date value for `key`, or None if it cannot.
    fn create_new_value(
        &self,
        key: &Key,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>>;

    /// Compares `old` (None for a node holding an error) against a fresh
    /// value.
    fn check(
        &self,
        key: &Key,
        old: Option<&Value>,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<DirtyResult> {
        let new = self.create_new_value(key, tsgm)?;
        Ok(match (old, new) {
            (Some(old), Some(new)) if *old == new => DirtyResult::Clean,
            (_, new) => DirtyResult::Dirty(new),
        })
    }
}

/// Delegates each key to the first checker that applies to it.
pub struct UnionDirtinessChecker {
    checkers: Vec<Arc<dyn DirtinessChecker>>,
}

impl UnionDirtinessChecker {
    pub fn new(checkers: Vec<Arc<dyn DirtinessChecker>>) -> Self {
        UnionDirtinessChecker { checkers }
    }

    fn checker_for(&self, key: &Key) -> Option<&Arc<dyn DirtinessChecker>> {
        self.checkers.iter().find(|c| c.applies(key))
    }
}

impl DirtinessChecker for UnionDirtinessChecker {
    fn applies(&self, key: &Key) -> bool {
        self.checker_for(key).is_some()
    }

    fn create_new_value(
        &self,
        key: &Key,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>> {
        match self.checker_for(key) {
            Some(checker) => checker.create_new_value(key, tsgm),
            None => Ok(None),
        }
    }

    fn check(
        &self,
        key: &Key,
        old: Option<&Value>,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<DirtyResult> {
        match self.checker_for(key) {
            Some(checker) => checker.check(key, old, tsgm),
            None => Ok(DirtyResult::Clean),
        }
    }
}

/// Re-stats `FILE_STATE` and re-lists `DIRECTORY_LISTING_STATE` keys.
pub struct BasicFilesystemDirtinessChecker {
    fs: Arc<dyn FileSystem>,
}

impl BasicFilesystemDirtinessChecker {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        BasicFilesystemDirtinessChecker { fs }
    }
}

impl DirtinessChecker for BasicFilesystemDirtinessChecker {
    fn applies(&self, key: &Key) -> bool {
        key.path().is_some()
            && (key.function() == FunctionName::FILE_STATE
                || key.function() == FunctionName::DIRECTORY_LISTING_STATE)
    }

    fn create_new_value(
        &self,
        key: &Key,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>> {
        let path = match key.path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if key.function() == FunctionName::FILE_STATE {
            let state = FileStateValue::create(&*self.fs, path, Some(tsgm))?;
            Ok(Some(Value::FileState(state)))
        } else if key.function() == FunctionName::DIRECTORY_LISTING_STATE {
            match DirectoryListingStateValue::create(&*self.fs, path) {
                Ok(listing) => Ok(Some(Value::DirectoryListing(listing))),
                // The directory is gone or unreadable; let the computation
                // decide what that means.
                Err(_) => Ok(None),
            }
        } else {
            Ok(None)
        }
    }
}

/// The basic checker, limited to roots whose diff awareness could not say
/// what changed.
pub struct MissingDiffDirtinessChecker {
    roots: FxHashSet<Root>,
    inner: BasicFilesystemDirtinessChecker,
}

impl MissingDiffDirtinessChecker {
    pub fn new(roots: FxHashSet<Root>, fs: Arc<dyn FileSystem>) -> Self {
        MissingDiffDirtinessChecker {
            roots,
            inner: BasicFilesystemDirtinessChecker::new(fs),
        }
    }
}

impl DirtinessChecker for MissingDiffDirtinessChecker {
    fn applies(&self, key: &Key) -> bool {
        self.inner.applies(key)
            && key
                .path()
                .map_or(false, |path| self.roots.contains(path.root()))
    }

    fn create_new_value(
        &self,
        key: &Key,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>> {
        self.inner.create_new_value(key, tsgm)
    }
}

/// The basic checker, limited to files outside the package roots whose type
/// is in `types`.  Classifying notes knowledge on `helper`.
pub struct ExternalDirtinessChecker {
    helper: Arc<ExternalFilesHelper>,
    types: FxHashSet<FileType>,
    inner: BasicFilesystemDirtinessChecker,
}

impl ExternalDirtinessChecker {
    pub fn new(
        helper: Arc<ExternalFilesHelper>,
        types: FxHashSet<FileType>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        ExternalDirtinessChecker {
            helper,
            types,
            inner: BasicFilesystemDirtinessChecker::new(fs),
        }
    }
}

impl DirtinessChecker for ExternalDirtinessChecker {
    fn applies(&self, key: &Key) -> bool {
        if !self.inner.applies(key) {
            return false;
        }
        match key.path() {
            Some(path) => self.types.contains(&self.helper.note_file_type(path)),
            None => false,
        }
    }

    fn create_new_value(
        &self,
        key: &Key,
        tsgm: &TimestampGranularityMonitor,
    ) -> anyhow::Result<Option<Value>> {
        self.inner.create_new_value(key, tsgm)
    }
}
