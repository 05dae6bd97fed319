//! Values and computations describing on-disk state: `FILE_STATE` and
//! `DIRECTORY_LISTING_STATE`.

use crate::error::FunctionError;
use crate::external_files::{ExternalFileAction, ExternalFilesHelper, FileType};
use crate::fs::{Dirent, FileKind, FileSystem};
use crate::function::{Computed, Env, SkyFunction};
use crate::key::{Key, RootedPath};
use crate::tsgm::TimestampGranularityMonitor;
use crate::value::Value;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// What a stat() of one path found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStateValue {
    NonExistent,
    Regular {
        size: u64,
        /// Absent when a digest identifies the contents.
        mtime: Option<SystemTime>,
        digest: Option<u64>,
    },
    Directory,
    Symlink(PathBuf),
    Special,
}

impl FileStateValue {
    pub fn create(
        fs: &dyn FileSystem,
        path: &RootedPath,
        tsgm: Option<&TimestampGranularityMonitor>,
    ) -> io::Result<FileStateValue> {
        let abs = path.as_path();
        let status = match fs.stat(&abs)? {
            None => return Ok(FileStateValue::NonExistent),
            Some(status) => status,
        };
        Ok(match status.kind {
            FileKind::Directory => FileStateValue::Directory,
            FileKind::Symlink => FileStateValue::Symlink(fs.read_link(&abs)?),
            FileKind::Special => FileStateValue::Special,
            FileKind::File => match fs.fast_digest(&abs)? {
                Some(digest) => FileStateValue::Regular {
                    size: status.size,
                    mtime: None,
                    digest: Some(digest),
                },
                None => {
                    if let Some(tsgm) = tsgm {
                        tsgm.notify_dependence_on_file_time(status.mtime);
                    }
                    FileStateValue::Regular {
                        size: status.size,
                        mtime: Some(status.mtime),
                        digest: None,
                    }
                }
            },
        })
    }

    pub fn exists(&self) -> bool {
        !matches!(self, FileStateValue::NonExistent)
    }
}

/// The sorted entries of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryListingStateValue(Arc<[Dirent]>);

impl DirectoryListingStateValue {
    pub fn new(mut dirents: Vec<Dirent>) -> Self {
        dirents.sort();
        DirectoryListingStateValue(Arc::from(dirents))
    }

    pub fn create(fs: &dyn FileSystem, path: &RootedPath) -> io::Result<Self> {
        Ok(DirectoryListingStateValue::new(fs.read_dir(&path.as_path())?))
    }

    pub fn dirents(&self) -> &[Dirent] {
        &self.0
    }
}

fn rooted_path(key: &Key) -> Result<&RootedPath, FunctionError> {
    key.path()
        .ok_or_else(|| FunctionError::failed(format!("{} does not name a path", key)))
}

/// External paths the host promised never change read as nonexistent.
/// They are not noted as seen, since no scan ever needs to re-check them.
fn assumed_immutable(helper: &ExternalFilesHelper, path: &RootedPath) -> bool {
    helper.action() == ExternalFileAction::AssumeNonExistentAndImmutable
        && helper.file_type(path) == FileType::External
}

/// Computes `FILE_STATE(path)` by stat()ing the path.
pub struct FileStateFunction {
    fs: Arc<dyn FileSystem>,
    external_files: Arc<ExternalFilesHelper>,
    tsgm: Arc<TimestampGranularityMonitor>,
}

impl FileStateFunction {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        external_files: Arc<ExternalFilesHelper>,
        tsgm: Arc<TimestampGranularityMonitor>,
    ) -> Self {
        FileStateFunction {
            fs,
            external_files,
            tsgm,
        }
    }
}

impl SkyFunction for FileStateFunction {
    fn compute(&self, key: &Key, _env: &mut Env<'_>) -> Result<Computed, FunctionError> {
        let path = rooted_path(key)?;
        if assumed_immutable(&self.external_files, path) {
            return Ok(Computed::Done(Value::FileState(FileStateValue::NonExistent)));
        }
        self.external_files.note_file_type(path);
        let state = FileStateValue::create(&*self.fs, path, Some(&self.tsgm))?;
        Ok(Computed::Done(Value::FileState(state)))
    }
}

/// Computes `DIRECTORY_LISTING_STATE(path)` by listing the directory.
pub struct DirectoryListingStateFunction {
    fs: Arc<dyn FileSystem>,
    external_files: Arc<ExternalFilesHelper>,
}

impl DirectoryListingStateFunction {
    pub fn new(fs: Arc<dyn FileSystem>, external_files: Arc<ExternalFilesHelper>) -> Self {
        DirectoryListingStateFunction { fs, external_files }
    }
}

impl SkyFunction for DirectoryListingStateFunction {
    fn compute(&self, key: &Key, _env: &mut Env<'_>) -> Result<Computed, FunctionError> {
        let path = rooted_path(key)?;
        if assumed_immutable(&self.external_files, path) {
            return Ok(Computed::Done(Value::DirectoryListing(
                DirectoryListingStateValue::new(Vec::new()),
            )));
        }
        self.external_files.note_file_type(path);
        let listing = DirectoryListingStateValue::create(&*self.fs, path)?;
        Ok(Computed::Done(Value::DirectoryListing(listing)))
    }
}
