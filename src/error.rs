//! Error types for the media catalog

use std::path::PathBuf;
use thiserror::Error;

/// Error kinds that can occur while reconciling the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogErrorKind {
    /// Permission denied when accessing a file or directory
    PermissionDenied,
    /// File or directory not found
    NotFound,
    /// I/O error during file operations
    IoError,
    /// Catalog store operation failed
    DatabaseError,
    /// Content hash computation failed
    HashError,
    /// Embedded metadata could not be read
    MetadataError,
    /// Thumbnail could not be generated or removed
    ThumbnailError,
    /// Image tagging failed
    ClassifierError,
    /// Storage root is missing or unreadable
    RootUnavailable,
    /// Another pass is already running for this storage root
    PassInProgress,
    /// Invalid configuration or settings file
    ConfigError,
}

/// Represents an error that occurred during a reconciliation pass
#[derive(Debug, Error)]
#[error("{kind:?}: {message} (path: {path:?})")]
pub struct CatalogError {
    /// The kind of error
    pub kind: CatalogErrorKind,
    /// The path where the error occurred
    pub path: Option<PathBuf>,
    /// Human-readable error message
    pub message: String,
}

/// Result alias used across the crate
pub type CatalogResult<T> = Result<T, CatalogError>;

impl CatalogError {
    /// Create a new catalog error
    pub fn new(kind: CatalogErrorKind, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path,
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::IoError, path, message)
    }

    /// Wrap a `std::io::Error` and attach the offending path
    pub fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        let mut error = Self::from(err);
        error.path = Some(path.to_path_buf());
        error
    }

    /// Create a database error
    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::DatabaseError, None, message)
    }

    /// Create a hash computation error
    pub fn hash_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::HashError, Some(path), message)
    }

    /// Create a metadata extraction error
    pub fn metadata_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::MetadataError, Some(path), message)
    }

    /// Create a thumbnail error
    pub fn thumbnail_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::ThumbnailError, path, message)
    }

    /// Create a classifier error
    pub fn classifier_error(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::ClassifierError, Some(path), message)
    }

    /// Create a storage root error
    pub fn root_unavailable(path: PathBuf, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::RootUnavailable, Some(path), message)
    }

    /// Create a reentrancy error
    pub fn pass_in_progress(root: PathBuf) -> Self {
        Self::new(
            CatalogErrorKind::PassInProgress,
            Some(root.clone()),
            format!("A reconciliation pass is already running for {:?}", root),
        )
    }

    /// Create a configuration error
    pub fn config_error(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self::new(CatalogErrorKind::ConfigError, path, message)
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::PermissionDenied => CatalogErrorKind::PermissionDenied,
            std::io::ErrorKind::NotFound => CatalogErrorKind::NotFound,
            _ => CatalogErrorKind::IoError,
        };
        Self::new(kind, None, err.to_string())
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        Self::database_error(err.to_string())
    }
}

impl From<image::ImageError> for CatalogError {
    fn from(err: image::ImageError) -> Self {
        Self::thumbnail_error(None, err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::config_error(None, err.to_string())
    }
}

impl From<csv::Error> for CatalogError {
    fn from(err: csv::Error) -> Self {
        Self::config_error(None, err.to_string())
    }
}
