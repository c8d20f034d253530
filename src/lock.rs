//! Cross-process pass lock
//!
//! A pass holds an exclusive advisory lock on `<thumbnail root>/.lock` for
//! its whole duration, so two processes (or two reconcilers in one process)
//! never reconcile the same storage root at once.
//!
//! Uses `fs2` for the lock itself; the lock is released when the file handle
//! is closed.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{CatalogError, CatalogResult};

/// Name of the lock file inside the thumbnail directory
pub const LOCK_FILE_NAME: &str = ".lock";

/// Held for the duration of one pass
#[derive(Debug)]
pub struct RootLock {
    _file: File,
    path: PathBuf,
}

impl RootLock {
    /// Take the lock in `dir` for `root` without waiting
    ///
    /// Fails with `PassInProgress` when another handle holds it.
    pub fn try_acquire(dir: &Path, root: &Path) -> CatalogResult<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| CatalogError::from_io(&path, e))?;

        // Fully qualified: newer std has inherent File locking methods
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                log::debug!("Acquired pass lock {:?}", path);
                Ok(Self { _file: file, path })
            }
            Err(e) if is_contended(&e) => {
                log::debug!("Pass lock {:?} is held elsewhere", path);
                Err(CatalogError::pass_in_progress(root.to_path_buf()))
            }
            Err(e) => Err(CatalogError::from_io(&path, e)),
        }
    }

    /// Location of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        log::debug!("Releasing pass lock {:?}", self.path);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || (err.raw_os_error().is_some() && err.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}
