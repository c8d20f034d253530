//! Core data models for the media catalog

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CatalogError;

/// Coarse media type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// `image/*` MIME types
    Image,
    /// `video/*` MIME types
    Video,
    /// Everything else; never hashed or cataloged
    Ignored,
}

/// Result of classifying a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub media_type: MediaType,
    /// Guessed MIME type, if the extension is known at all
    pub mime_type: Option<String>,
}

impl MediaType {
    /// Classify a path by sniffing its MIME type from the file name
    pub fn classify(path: &Path) -> Classification {
        let guess = mime_guess::from_path(path).first();
        let media_type = match guess.as_ref().map(|m| m.type_()) {
            Some(t) if t == mime_guess::mime::IMAGE => MediaType::Image,
            Some(t) if t == mime_guess::mime::VIDEO => MediaType::Video,
            _ => MediaType::Ignored,
        };
        Classification {
            media_type,
            mime_type: guess.map(|m| m.essence_str().to_string()),
        }
    }

    /// Media type of a stored MIME string
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MediaType::Image
        } else if mime.starts_with("video/") {
            MediaType::Video
        } else {
            MediaType::Ignored
        }
    }

    /// Whether files of this type are cataloged
    pub fn is_media(&self) -> bool {
        !matches!(self, MediaType::Ignored)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tag produced by the classifier with its confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagScore {
    pub tag: String,
    pub confidence: f32,
}

/// One catalog entry per distinct file content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Lowercase hex SHA-256 of the file bytes (primary key)
    pub content_hash: String,
    /// Path relative to the storage root, `/`-separated
    pub relative_path: String,
    /// Current file name on disk
    pub display_filename: String,
    /// File name when the content was first cataloged
    pub original_filename: String,
    /// Filesystem modification time, nanoseconds since the Unix epoch
    pub last_modified: i64,
    /// Capture time as a Unix timestamp (seconds)
    pub capture_timestamp: i64,
    /// Thumbnail path relative to the thumbnail store root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<TagScore>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tagging_model: Option<String>,
}

impl MediaRecord {
    /// Media type derived from the stored MIME type
    pub fn media_type(&self) -> MediaType {
        MediaType::from_mime(&self.mime_type)
    }

    /// Whether this record should carry a thumbnail
    pub fn wants_thumbnail(&self) -> bool {
        self.media_type() == MediaType::Image
    }
}

/// Reconciliation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PassMode {
    /// Walk and ingest plus orphan cleanup; no validation or deletion sweep
    Initial,
    /// Full diff including validation of known records and deletions
    #[default]
    Incremental,
}

impl PassMode {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PassMode::Initial => "initial",
            PassMode::Incremental => "incremental",
        }
    }
}

/// Result of a reconciliation pass
#[derive(Debug, Default, Serialize)]
pub struct PassReport {
    pub mode: PassMode,
    /// Media files seen by the walker
    pub files_seen: u64,
    /// Records confirmed unchanged by a stat alone
    pub unchanged: u64,
    pub records_created: u64,
    /// Records refreshed in place (same content, new mtime)
    pub records_updated: u64,
    pub records_renamed: u64,
    /// Records replaced because their path now holds different content
    pub records_replaced: u64,
    pub records_deleted: u64,
    /// Files whose content is already tracked under another path
    pub duplicates_skipped: u64,
    pub thumbnails_generated: u64,
    pub thumbnails_deleted: u64,
    /// Legacy flat thumbnails moved into their shard
    pub thumbnails_migrated: u64,
    /// Total catalog mutations (upserts and deletes)
    pub catalog_writes: u64,
    /// Whether the pass stopped early on cancellation
    pub cancelled: bool,
    /// Per-file errors; the pass continued past each of them
    #[serde(skip)]
    pub errors: Vec<CatalogError>,
    /// Catalog writes that were not applied
    #[serde(skip)]
    pub warnings: Vec<CatalogError>,
    /// Total pass duration in milliseconds
    pub duration_ms: u64,
}

impl PassReport {
    /// Create an empty report for the given mode
    pub fn new(mode: PassMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Whether the pass touched neither the catalog nor the thumbnail store
    pub fn is_noop(&self) -> bool {
        self.catalog_writes == 0
            && self.thumbnails_generated == 0
            && self.thumbnails_deleted == 0
            && self.thumbnails_migrated == 0
    }

    /// Check if the pass completed without errors or warnings
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty() && !self.cancelled
    }
}

/// Convert a `SystemTime` to nanoseconds since the Unix epoch
pub fn system_time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Convert a `SystemTime` to whole seconds since the Unix epoch
pub fn system_time_to_secs(time: SystemTime) -> i64 {
    system_time_to_nanos(time).div_euclid(1_000_000_000)
}
