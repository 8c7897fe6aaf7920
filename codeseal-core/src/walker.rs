//! File tree enumeration with the exclusion rules used for hashing
//!
//! Two kinds of exclusion apply while walking:
//! - generic files that never belong to a release (OS artifacts, VCS metadata,
//!   editor backups), matched by name at any depth
//! - folders excluded by path, relative to a reference root (the platform root),
//!   plus any absolute paths supplied by the caller

use crate::error::IntegrityError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::trace;
use walkdir::{DirEntry, WalkDir};

/// File names that are excluded wherever they appear
const EXCLUDED_FILENAMES: &[&str] = &[
    ".DS_Store",  // macOS
    "Thumbs.db",  // Windows
    ".directory", // Dolphin (KDE)
    ".webapp",    // Gentoo/Funtoo webapp-config
];

/// Names of version control metadata, as directories or pointer files
const EXCLUDED_DIRECTORIES: &[&str] = &[".git", ".svn", ".hg"];

/// Folders below the reference root that are never part of a release
pub const DEFAULT_EXCLUDED_FOLDERS: &[&str] = &[
    "data",
    "themes",
    "config",
    "apps",
    "assets",
    "lost+found",
    // replaced by the updater after the integrity check has run
    "updater",
    "_oc_upgrade",
];

static EXCLUDED_FILENAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^\.webapp-[A-Za-z0-9_]+-(\d+\.){2}\d+(-r\d+)?$",
        r"~$",
        r"^\..+\.sw[op]$",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// A file found during the walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute path of the file
    pub path: PathBuf,
    /// Path relative to the walk root, always `/` separated
    pub relative: String,
}

impl FileEntry {
    /// Read the file contents
    pub fn read(&self) -> Result<Vec<u8>, IntegrityError> {
        std::fs::read(&self.path).map_err(|source| IntegrityError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Depth-first walker over an artifact tree
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    excluded_paths: Vec<PathBuf>,
}

impl TreeWalker {
    /// Walk `root`, excluding the default folders relative to `root` itself
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = absolute_path(&root.into());
        let excluded_paths = default_excluded_paths(&root);
        TreeWalker {
            root,
            excluded_paths,
        }
    }

    /// Resolve the default excluded folders against `reference_root` instead
    /// of the walk root
    pub fn reference_root(mut self, reference_root: &Path) -> Self {
        let extra: Vec<PathBuf> = self
            .excluded_paths
            .split_off(DEFAULT_EXCLUDED_FOLDERS.len());
        self.excluded_paths = default_excluded_paths(&absolute_path(reference_root));
        self.excluded_paths.extend(extra);
        self
    }

    /// Exclude additional absolute paths (app roots, custom data directory)
    pub fn exclude_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.excluded_paths
            .extend(paths.into_iter().map(|p| absolute_path(&p.into())));
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily enumerate every non-excluded file below the root
    pub fn walk(&self) -> impl Iterator<Item = Result<FileEntry, IntegrityError>> + '_ {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(move |entry| self.accept(entry))
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if entry.file_type().is_dir() || entry.path().is_dir() {
                        return None;
                    }
                    let relative = relative_path(entry.path(), &self.root)?;
                    Some(Ok(FileEntry {
                        path: entry.path().to_path_buf(),
                        relative,
                    }))
                }
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    let message = err.to_string();
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other(message));
                    Some(Err(IntegrityError::Io { path, source }))
                }
            })
    }

    fn accept(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }

        let name = entry.file_name().to_string_lossy();
        // a `.git` file is a submodule or worktree pointer
        if EXCLUDED_DIRECTORIES.contains(&name.as_ref()) {
            trace!("Skipping VCS metadata: {:?}", entry.path());
            return false;
        }
        if entry.file_type().is_dir() {
            if self.excluded_paths.iter().any(|p| p == entry.path()) {
                trace!("Skipping excluded folder: {:?}", entry.path());
                return false;
            }
            return true;
        }

        if is_excluded_filename(&name) {
            trace!("Skipping excluded file: {:?}", entry.path());
            return false;
        }
        !self.excluded_paths.iter().any(|p| p == entry.path())
    }
}

/// Whether a file name is one of the generic non-release files
pub fn is_excluded_filename(name: &str) -> bool {
    EXCLUDED_FILENAMES.contains(&name)
        || EXCLUDED_FILENAME_PATTERNS.iter().any(|re| re.is_match(name))
}

/// Path of `path` relative to `root` with `/` separators and no leading slash
pub fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = stripped
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let joined = parts.join("/");
    let trimmed = joined.trim_start_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_excluded_paths(reference_root: &Path) -> Vec<PathBuf> {
    DEFAULT_EXCLUDED_FOLDERS
        .iter()
        .map(|folder| reference_root.join(folder))
        .collect()
}

/// Absolute form of `path` used for every path comparison of the walk
///
/// Relative paths resolve against the working directory. The parent is
/// canonicalized when it exists; the last component is kept as given so a
/// symlinked folder still matches the entry the walk yields for it.
pub fn absolute_path(path: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
            Ok(parent) => parent.join(name),
            Err(_) => path.components().collect(),
        },
        _ => std::fs::canonicalize(&path).unwrap_or(path),
    }
}
