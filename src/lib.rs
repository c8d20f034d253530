//! Content-addressed media catalog with incremental reconciliation
//!
//! This library indexes a tree of images and videos into a persistent
//! catalog keyed by content hash. It keeps the catalog and a sharded
//! thumbnail cache consistent with the files on disk across repeated passes.

pub mod background;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod geo;
pub mod hasher;
pub mod lock;
pub mod metadata;
pub mod models;
pub mod progress;
pub mod reconciler;
pub mod thumbnail;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use background::BackgroundScanner;
pub use catalog::{CatalogStore, SqliteCatalog};
pub use classifier::{Classify, DominantColorClassifier, Tagger, TaggingModel};
pub use config::{CatalogConfig, Settings, SettingsManager};
pub use error::{CatalogError, CatalogErrorKind, CatalogResult};
pub use geo::{City, CityLookup, GeoLocator};
pub use lock::RootLock;
pub use models::{MediaRecord, MediaType, PassMode, PassReport, TagScore};
pub use progress::{PassPhase, ProgressReporter};
pub use reconciler::Reconciler;
pub use thumbnail::ThumbnailStore;
