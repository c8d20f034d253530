//! Configuration for the media catalog

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::TaggingModel;
use crate::error::{CatalogError, CatalogResult};

/// Reserved thumbnail directory under the storage root
pub const DEFAULT_THUMBNAIL_DIR: &str = ".thumbnails";

/// Thumbnails are this many pixels square
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Catalog database file name when no explicit path is given
pub const DEFAULT_DATABASE_NAME: &str = "media_catalog.sqlite3";

/// Block size used when streaming files through the hasher (64 KB)
pub const DEFAULT_HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Default background rescan interval in seconds
pub const DEFAULT_RESCAN_INTERVAL_SECS: u64 = 600;

/// Configuration for a catalog over one storage root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory tree to index
    pub storage_root: PathBuf,

    /// Name of the thumbnail directory inside the storage root
    pub thumbnail_dir_name: String,

    /// Edge length of the square thumbnail canvas
    pub thumbnail_size: u32,

    /// Catalog database path
    /// Defaults to `<storage_root>/media_catalog.sqlite3`
    pub db_path: Option<PathBuf>,

    /// Number of worker threads for per-file work
    /// 0 means auto-detect (CPU cores × 2)
    pub num_threads: usize,

    /// Read block size for content hashing
    pub hash_block_size: usize,

    /// Tagging strategy applied to newly cataloged images
    pub tagging_model: TaggingModel,

    /// Optional CSV of known cities (`city,lat,lng,country`)
    /// The built-in city list is used when unset
    pub cities_csv: Option<PathBuf>,

    /// Emit JSON progress lines on stderr
    pub show_progress: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::new(),
            thumbnail_dir_name: DEFAULT_THUMBNAIL_DIR.to_string(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            db_path: None,
            num_threads: 0,
            hash_block_size: DEFAULT_HASH_BLOCK_SIZE,
            tagging_model: TaggingModel::Off,
            cities_csv: None,
            show_progress: false,
        }
    }
}

impl CatalogConfig {
    /// Create a new config for the given storage root
    pub fn new(storage_root: PathBuf) -> Self {
        Self {
            storage_root,
            ..Default::default()
        }
    }

    /// Create a config builder
    pub fn builder() -> CatalogConfigBuilder {
        CatalogConfigBuilder::new()
    }

    /// Absolute location of the thumbnail store
    pub fn thumbnail_root(&self) -> PathBuf {
        self.storage_root.join(&self.thumbnail_dir_name)
    }

    /// Effective catalog database path
    pub fn effective_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.storage_root.join(DEFAULT_DATABASE_NAME))
    }

    /// Get the effective number of threads
    pub fn effective_threads(&self) -> usize {
        if self.num_threads == 0 {
            // Auto-detect: CPU cores × 2
            std::thread::available_parallelism()
                .map(|p| p.get() * 2)
                .unwrap_or(4)
        } else {
            self.num_threads
        }
    }
}

/// Builder for CatalogConfig
#[derive(Debug, Default)]
pub struct CatalogConfigBuilder {
    config: CatalogConfig,
}

impl CatalogConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage root
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    /// Set the thumbnail directory name
    pub fn thumbnail_dir_name(mut self, name: impl Into<String>) -> Self {
        self.config.thumbnail_dir_name = name.into();
        self
    }

    /// Set the thumbnail edge length
    pub fn thumbnail_size(mut self, size: u32) -> Self {
        self.config.thumbnail_size = size;
        self
    }

    /// Set the database path
    pub fn db_path(mut self, path: PathBuf) -> Self {
        self.config.db_path = Some(path);
        self
    }

    /// Set the number of threads
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.num_threads = threads;
        self
    }

    /// Set the hashing block size
    pub fn hash_block_size(mut self, size: usize) -> Self {
        self.config.hash_block_size = size;
        self
    }

    /// Set the tagging strategy
    pub fn tagging_model(mut self, model: TaggingModel) -> Self {
        self.config.tagging_model = model;
        self
    }

    /// Load known cities from a CSV file
    pub fn cities_csv(mut self, path: PathBuf) -> Self {
        self.config.cities_csv = Some(path);
        self
    }

    /// Enable or disable stderr progress output
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.config.show_progress = enabled;
        self
    }

    /// Build the config
    pub fn build(self) -> CatalogConfig {
        self.config
    }
}

/// Runtime-adjustable settings persisted as JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Seconds between background rescans; 0 disables the timer
    pub rescan_interval_secs: u64,
    /// Tagging strategy
    pub tagging_model: TaggingModel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rescan_interval_secs: DEFAULT_RESCAN_INTERVAL_SECS,
            tagging_model: TaggingModel::Off,
        }
    }
}

/// Loads and stores `Settings` at a fixed path
#[derive(Debug)]
pub struct SettingsManager {
    path: PathBuf,
    settings: Settings,
}

impl SettingsManager {
    /// Read settings from `path`, falling back to defaults if the file is missing
    pub fn load(path: impl Into<PathBuf>) -> CatalogResult<Self> {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CatalogError::config_error(Some(path.clone()), format!("Invalid settings: {}", e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(CatalogError::from_io(&path, e)),
        };
        Ok(Self { path, settings })
    }

    /// Current settings
    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Settings file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the settings and write them to disk
    pub fn save(&mut self, settings: Settings) -> CatalogResult<()> {
        let json = serde_json::to_string_pretty(&settings)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::from_io(parent, e))?;
        }
        std::fs::write(&self.path, json).map_err(|e| CatalogError::from_io(&self.path, e))?;
        self.settings = settings;
        Ok(())
    }

    /// Apply `change` to a copy of the current settings and persist it
    ///
    /// The in-memory settings are left alone if the write fails.
    pub fn update(&mut self, change: impl FnOnce(&mut Settings)) -> CatalogResult<()> {
        let mut next = self.settings.clone();
        change(&mut next);
        self.save(next)
    }
}
