//! Classification of paths that live outside the package roots.
//!
//! Files under package roots are covered by diff awareness.  Everything else
//! (system headers, downloaded repositories, build outputs) can only be
//! checked by a full scan, so the helper remembers whether the graph ever saw
//! such a file.

use crate::key::{Root, RootedPath};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Under a package root.
    Internal,
    /// Outside the package roots and the output base.
    External,
    /// Under `<output_base>/external`, i.e. a fetched repository.
    ExternalRepo,
    /// Under the output base.
    Output,
    /// Under a prefix the host asked to ignore.
    Ignored,
}

/// What file-state computations do with external paths.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ExternalFileAction {
    /// Stat them like any other file, and re-check them on every build.
    #[default]
    DependOnExternalPaths,
    /// Treat them as nonexistent; they never change.
    AssumeNonExistentAndImmutable,
}

/// What kinds of special files the graph has seen.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ExternalFilesKnowledge {
    pub any_output_files_seen: bool,
    pub any_non_output_external_files_seen: bool,
}

#[derive(Debug, Default)]
struct Config {
    package_roots: Vec<Root>,
    output_base: Option<PathBuf>,
    ignored_prefixes: Vec<PathBuf>,
    action: ExternalFileAction,
}

#[derive(Debug)]
pub struct ExternalFilesHelper {
    config: Arc<RwLock<Config>>,
    output_files_seen: AtomicBool,
    external_files_seen: AtomicBool,
}

impl ExternalFilesHelper {
    pub fn new(
        output_base: Option<PathBuf>,
        ignored_prefixes: Vec<PathBuf>,
        action: ExternalFileAction,
    ) -> Self {
        ExternalFilesHelper {
            config: Arc::new(RwLock::new(Config {
                package_roots: Vec::new(),
                output_base,
                ignored_prefixes,
                action,
            })),
            output_files_seen: AtomicBool::new(false),
            external_files_seen: AtomicBool::new(false),
        }
    }

    pub fn set_package_roots(&self, roots: &[Root]) {
        self.config.write().package_roots = roots.to_vec();
    }

    pub fn action(&self) -> ExternalFileAction {
        self.config.read().action
    }

    /// A helper sharing this one's configuration but none of its knowledge.
    pub fn clone_with_fresh_knowledge(&self) -> ExternalFilesHelper {
        ExternalFilesHelper {
            config: self.config.clone(),
            output_files_seen: AtomicBool::new(false),
            external_files_seen: AtomicBool::new(false),
        }
    }

    pub fn knowledge(&self) -> ExternalFilesKnowledge {
        ExternalFilesKnowledge {
            any_output_files_seen: self.output_files_seen.load(Ordering::Relaxed),
            any_non_output_external_files_seen: self.external_files_seen.load(Ordering::Relaxed),
        }
    }

    pub fn set_knowledge(&self, knowledge: ExternalFilesKnowledge) {
        self.output_files_seen
            .store(knowledge.any_output_files_seen, Ordering::Relaxed);
        self.external_files_seen
            .store(knowledge.any_non_output_external_files_seen, Ordering::Relaxed);
    }

    /// Classifies a path without noting anything.
    pub fn file_type(&self, path: &RootedPath) -> FileType {
        let config = self.config.read();
        let abs = path.as_path();
        if config
            .ignored_prefixes
            .iter()
            .any(|prefix| abs.starts_with(prefix))
        {
            return FileType::Ignored;
        }
        if config.package_roots.contains(path.root()) {
            return FileType::Internal;
        }
        let output_base: &Path = match &config.output_base {
            None => return FileType::External,
            Some(base) => base,
        };
        if abs.starts_with(output_base.join("external")) {
            FileType::ExternalRepo
        } else if abs.starts_with(output_base) {
            FileType::Output
        } else {
            FileType::External
        }
    }

    /// Classifies a path and records what kind of file was seen.
    pub fn note_file_type(&self, path: &RootedPath) -> FileType {
        let file_type = self.file_type(path);
        match file_type {
            FileType::Output => self.output_files_seen.store(true, Ordering::Relaxed),
            FileType::External | FileType::ExternalRepo => {
                self.external_files_seen.store(true, Ordering::Relaxed)
            }
            FileType::Internal | FileType::Ignored => {}
        }
        file_type
    }
}
