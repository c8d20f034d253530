//! Directory traversal of the storage root

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{CatalogError, CatalogErrorKind};

/// A regular file found under the storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub absolute: PathBuf,
    /// Path relative to the storage root, `/`-separated
    pub relative: String,
}

/// Files found by one walk plus the errors hit along the way
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub entries: Vec<WalkEntry>,
    pub errors: Vec<CatalogError>,
}

/// Enumerates regular files under a root, skipping the thumbnail subtree
#[derive(Debug, Clone)]
pub struct DirectoryWalker {
    root: PathBuf,
    excluded: PathBuf,
}

impl DirectoryWalker {
    /// Walk `root`, never descending into `excluded`
    pub fn new(root: PathBuf, excluded: PathBuf) -> Self {
        Self { root, excluded }
    }

    /// Collect every regular file. Symlinks and special files are skipped;
    /// unreadable directories are reported and skipped.
    pub fn walk(&self) -> WalkOutcome {
        let mut outcome = WalkOutcome::default();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() != self.excluded);

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        if entry.file_type().is_symlink() {
                            log::debug!("Skipping symlink {:?}", entry.path());
                        }
                        continue;
                    }
                    match relative_path(&self.root, entry.path()) {
                        Some(relative) => outcome.entries.push(WalkEntry {
                            absolute: entry.path().to_path_buf(),
                            relative,
                        }),
                        None => {
                            log::warn!("Skipping path with invalid encoding: {:?}", entry.path());
                            outcome.errors.push(CatalogError::new(
                                CatalogErrorKind::IoError,
                                Some(entry.path().to_path_buf()),
                                "path is not valid UTF-8",
                            ));
                        }
                    }
                }
                Err(e) => {
                    let path = e.path().map(|p| p.to_path_buf());
                    let kind = if e.io_error().map(|e| e.kind())
                        == Some(std::io::ErrorKind::PermissionDenied)
                    {
                        CatalogErrorKind::PermissionDenied
                    } else {
                        CatalogErrorKind::IoError
                    };
                    log::warn!("Walk error under {:?}: {}", self.root, e);
                    outcome.errors.push(CatalogError::new(kind, path, e.to_string()));
                }
            }
        }
        outcome
    }
}

/// Root-relative path with `/` separators, or `None` for non-UTF-8 paths
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Absolute path for a root-relative `/`-separated path
pub fn absolute_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|p| !p.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}
