//! File system access, behind a trait so hosts and tests can substitute it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Sockets, fifos, devices.
    Special,
}

/// Metadata gathered by a stat() that does not follow symlinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub kind: FileKind,
    pub size: u64,
    pub mtime: SystemTime,
}

/// One entry of a directory listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dirent {
    pub name: String,
    pub kind: FileKind,
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// stat() an on-disk path without following symlinks.  A missing file is
    /// Ok(None) rather than an error.
    fn stat(&self, path: &Path) -> io::Result<Option<FileStatus>>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<Dirent>>;

    /// A content digest, if the file system can produce one without reading
    /// the whole file.
    fn fast_digest(&self, _path: &Path) -> io::Result<Option<u64>> {
        Ok(None)
    }
}

fn kind_of(file_type: std::fs::FileType) -> FileKind {
    if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Special
    }
}

#[derive(Default)]
pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStatus>> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                return if err.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                };
            }
        };
        Ok(Some(FileStatus {
            kind: kind_of(meta.file_type()),
            size: meta.len(),
            mtime: meta.modified()?,
        }))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<Dirent>> {
        let mut dirents = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            dirents.push(Dirent {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(entry.file_type()?),
            });
        }
        Ok(dirents)
    }
}
