//! Catalog reconciliation
//!
//! A pass brings the catalog, the thumbnail store and the storage root back
//! into agreement. Per-file work (hashing, metadata, tagging, thumbnails)
//! runs on a bounded rayon pool; every catalog mutation is committed from a
//! single thread in sorted path order, so the outcome of a pass does not
//! depend on scheduling.
//!
//! Phases:
//! 0. move legacy flat thumbnails into shards
//! 1. validate known records (incremental only)
//! 2. walk the tree and ingest new content
//! 3. delete records whose files were not observed (incremental only)
//! 4. delete orphan thumbnails

use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::catalog::{CatalogStore, SqliteCatalog};
use crate::classifier::Tagger;
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult};
use crate::geo::{CityLookup, GeoLocator};
use crate::hasher::ContentHasher;
use crate::lock::RootLock;
use crate::metadata::MetadataExtractor;
use crate::models::{system_time_to_nanos, MediaRecord, MediaType, PassMode, PassReport};
use crate::progress::{PassPhase, ProgressReporter};
use crate::thumbnail::{GeneratedThumbnail, ThumbnailStore};
use crate::walker::{absolute_path, DirectoryWalker, WalkEntry};

/// Progress message interval in milliseconds
const PROGRESS_INTERVAL_MS: u64 = 500;

/// Keeps one storage root's catalog and thumbnail store in sync with disk
pub struct Reconciler {
    config: CatalogConfig,
    catalog: Arc<dyn CatalogStore>,
    thumbnails: ThumbnailStore,
    extractor: MetadataExtractor,
    hasher: ContentHasher,
    tagger: Tagger,
    pool: rayon::ThreadPool,
    running: AtomicBool,
    cancel_requested: AtomicBool,
}

/// Clears the running flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PassGuard(flag))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bookkeeping for a single pass
#[derive(Default)]
struct PassState {
    /// Store-relative paths of thumbnail files known to exist
    thumbnails_present: HashSet<String>,
    /// Relative paths confirmed or ingested during this pass
    observed: HashSet<String>,
    /// Hashes held by a live record observed during this pass
    claimed: HashSet<String>,
    /// Hashes of records whose path no longer resolves to a file
    pending_removal: HashSet<String>,
    /// Paths already reported as unreadable during validation
    failed_paths: HashSet<String>,
    /// Hashes of records the sweep must keep although their path was not
    /// observed: their change could not be applied this pass
    protected: HashSet<String>,
    /// Observed image records whose thumbnail must be regenerated
    heal: Vec<MediaRecord>,
}

impl PassState {
    fn needs_thumbnail(&self, record: &MediaRecord) -> bool {
        record.wants_thumbnail()
            && record
                .thumbnail_path
                .as_ref()
                .map_or(true, |p| !self.thumbnails_present.contains(p))
    }

    /// Mark a live record as seen at its path, queueing a thumbnail repair
    fn observe(&mut self, record: &MediaRecord) {
        self.mark_observed(record);
        if self.needs_thumbnail(record) {
            self.heal.push(record.clone());
        }
    }

    /// Mark a record seen whose thumbnail was just (re)generated
    fn mark_observed(&mut self, record: &MediaRecord) {
        self.observed.insert(record.relative_path.clone());
        self.claimed.insert(record.content_hash.clone());
        self.pending_removal.remove(&record.content_hash);
    }
}

/// A media file found by the walker, stat'ed and hashed
struct Candidate {
    entry: WalkEntry,
    media_type: MediaType,
    mime_type: String,
    fs_meta: fs::Metadata,
    mtime: i64,
    hash: String,
}

/// Outcome of rehashing a record whose mtime moved
enum Revalidation {
    Refreshed(MediaRecord, Option<GeneratedThumbnail>),
    ContentChanged(MediaRecord),
    Failed(MediaRecord, CatalogError),
}

impl Reconciler {
    /// Create a reconciler over `config.storage_root`
    ///
    /// The storage root must already exist; the thumbnail directory is
    /// created inside it.
    pub fn new(
        config: CatalogConfig,
        catalog: Arc<dyn CatalogStore>,
        geo: Arc<dyn CityLookup>,
        tagger: Tagger,
    ) -> CatalogResult<Self> {
        if !config.storage_root.is_dir() {
            return Err(CatalogError::root_unavailable(
                config.storage_root.clone(),
                "Storage root does not exist or is not a directory",
            ));
        }
        let thumbnails = ThumbnailStore::with_size(config.thumbnail_root(), config.thumbnail_size)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.effective_threads())
            .thread_name(|i| format!("catalog-worker-{}", i))
            .build()
            .map_err(|e| CatalogError::config_error(None, format!("Cannot build worker pool: {}", e)))?;

        Ok(Self {
            hasher: ContentHasher::new(config.hash_block_size),
            extractor: MetadataExtractor::new(geo),
            config,
            catalog,
            thumbnails,
            tagger,
            pool,
            running: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Create a reconciler with the default collaborators for `config`:
    /// a SQLite catalog, the configured city list and tagger
    pub fn open(config: CatalogConfig) -> CatalogResult<Self> {
        if !config.storage_root.is_dir() {
            return Err(CatalogError::root_unavailable(
                config.storage_root.clone(),
                "Storage root does not exist or is not a directory",
            ));
        }
        let catalog = Arc::new(SqliteCatalog::open(&config.effective_db_path())?);
        let geo = match &config.cities_csv {
            Some(path) => GeoLocator::from_csv(path)?,
            None => GeoLocator::builtin(),
        };
        let tagger = Tagger::from_model(config.tagging_model);
        Self::new(config, catalog, Arc::new(geo), tagger)
    }

    /// Catalog handle shared with readers
    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn thumbnails(&self) -> &ThumbnailStore {
        &self.thumbnails
    }

    /// Whether a pass is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the running pass to stop at its next checkpoint
    ///
    /// When no pass is running, the next pass stops at its first checkpoint.
    /// The request is consumed when that pass ends.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Run one reconciliation pass
    ///
    /// Fails with `PassInProgress` if another pass is running over the same
    /// storage root, in this process or another, and with `RootUnavailable`
    /// if the storage root cannot be read. Neither case touches the catalog.
    pub fn run(&self, mode: PassMode) -> CatalogResult<PassReport> {
        let root = &self.config.storage_root;
        let _guard = PassGuard::acquire(&self.running)
            .ok_or_else(|| CatalogError::pass_in_progress(root.clone()))?;

        if let Err(e) = fs::read_dir(root) {
            self.cancel_requested.store(false, Ordering::Release);
            return Err(CatalogError::root_unavailable(root.clone(), e.to_string()));
        }
        let thumb_root = self.thumbnails.root();
        fs::create_dir_all(thumb_root).map_err(|e| CatalogError::from_io(thumb_root, e))?;
        let _lock = RootLock::try_acquire(thumb_root, root)?;

        let result = self.pool.install(|| self.execute(mode));
        self.cancel_requested.store(false, Ordering::Release);
        result
    }

    fn execute(&self, mode: PassMode) -> CatalogResult<PassReport> {
        let start = Instant::now();
        let root = &self.config.storage_root;
        let progress = ProgressReporter::new(self.config.show_progress, PROGRESS_INTERVAL_MS);
        let mut report = PassReport::new(mode);
        let mut state = PassState::default();

        log::info!("Starting {} pass over {:?}", mode.as_str(), root);
        progress.report_start(root, mode);

        self.migrate_thumbnails(&mut report, &progress);

        state.thumbnails_present = self
            .thumbnails
            .inventory()?
            .into_iter()
            .map(|t| t.relative_path)
            .collect();

        if mode == PassMode::Incremental {
            self.validate_records(&mut state, &mut report, &progress)?;
        }

        if !self.is_cancelled() {
            self.ingest(&mut state, &mut report, &progress);
        }

        if self.is_cancelled() {
            report.cancelled = true;
            log::warn!("Pass over {:?} cancelled; sweep and cleanup skipped", root);
        } else {
            let heal = std::mem::take(&mut state.heal);
            self.heal_thumbnails(heal, &mut state, &mut report);

            if mode == PassMode::Incremental {
                self.sweep(&state, &mut report, &progress)?;
            }
            self.cleanup_thumbnails(&mut report, &progress)?;
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        progress.report_progress(PassPhase::Done, 1, 1);
        progress.report_done(&report);
        log::info!(
            "Pass over {:?} finished in {}ms: {} created, {} updated, {} renamed, {} replaced, {} deleted, {} duplicates, {} errors",
            root,
            report.duration_ms,
            report.records_created,
            report.records_updated,
            report.records_renamed,
            report.records_replaced,
            report.records_deleted,
            report.duplicates_skipped,
            report.error_count()
        );
        Ok(report)
    }

    /// Phase 0: move legacy flat thumbnails and repoint their records
    fn migrate_thumbnails(&self, report: &mut PassReport, progress: &ProgressReporter) {
        let migrated = match self.thumbnails.migrate_flat_layout() {
            Ok(migrated) => migrated,
            Err(e) => {
                log::warn!("Thumbnail migration failed: {}", e);
                progress.report_error(&e);
                report.errors.push(e);
                return;
            }
        };
        let total = migrated.len() as u64;
        for (i, moved) in migrated.into_iter().enumerate() {
            report.thumbnails_migrated += 1;
            match self.catalog.get_by_hash(&moved.hash) {
                Ok(Some(mut record))
                    if record.wants_thumbnail()
                        && record.thumbnail_path.as_deref() != Some(moved.new_relative_path.as_str()) =>
                {
                    record.thumbnail_path = Some(moved.new_relative_path);
                    self.write(&record, report);
                }
                Ok(_) => {}
                Err(e) => report.warnings.push(e),
            }
            progress.report_progress(PassPhase::Migrate, i as u64 + 1, total);
        }
    }

    /// Phase 1: stat every known record and rehash those whose mtime moved
    fn validate_records(
        &self,
        state: &mut PassState,
        report: &mut PassReport,
        progress: &ProgressReporter,
    ) -> CatalogResult<()> {
        let mut records = self.catalog.list_all()?;
        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let total = records.len() as u64;
        let root = &self.config.storage_root;

        let mut changed = Vec::new();
        for (i, record) in records.into_iter().enumerate() {
            if self.is_cancelled() {
                return Ok(());
            }
            progress.report_progress(PassPhase::Validate, i as u64 + 1, total);

            let path = absolute_path(root, &record.relative_path);
            let mtime = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta.modified().ok().map(system_time_to_nanos),
                Ok(_) => None,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Cannot stat {:?}: {}", path, e);
                    }
                    None
                }
            };

            match mtime {
                None => {
                    log::debug!("{} is gone; pending removal", record.relative_path);
                    state.pending_removal.insert(record.content_hash.clone());
                }
                Some(mtime) if mtime == record.last_modified => {
                    report.unchanged += 1;
                    state.observe(&record);
                }
                Some(_) => changed.push((record, path)),
            }
        }

        if changed.is_empty() {
            return Ok(());
        }

        let present = &state.thumbnails_present;
        let revalidated: Vec<Revalidation> = changed
            .into_par_iter()
            .map(|(record, path)| self.revalidate(record, &path, present))
            .collect();

        for outcome in revalidated {
            match outcome {
                Revalidation::Refreshed(record, thumbnail) => {
                    if let Some(t) = thumbnail {
                        if t.created {
                            report.thumbnails_generated += 1;
                        }
                        state.thumbnails_present.insert(t.relative_path);
                    }
                    if self.write(&record, report) {
                        report.records_updated += 1;
                    }
                    state.mark_observed(&record);
                }
                Revalidation::ContentChanged(record) => {
                    log::debug!("Content of {} changed; replacing record", record.relative_path);
                    if self.remove(&record, state, report) {
                        report.records_replaced += 1;
                    }
                }
                Revalidation::Failed(record, e) => {
                    log::warn!("Cannot rehash {}: {}", record.relative_path, e);
                    progress.report_error(&e);
                    report.errors.push(e);
                    state.failed_paths.insert(record.relative_path.clone());
                    state.protected.insert(record.content_hash);
                }
            }
        }
        Ok(())
    }

    fn revalidate(&self, mut record: MediaRecord, path: &Path, present: &HashSet<String>) -> Revalidation {
        let hash = match self.hasher.hash_file(path) {
            Ok(hash) => hash,
            Err(e) => return Revalidation::Failed(record, e),
        };
        if hash != record.content_hash {
            return Revalidation::ContentChanged(record);
        }
        let fs_meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) => return Revalidation::Failed(record, CatalogError::from_io(path, e)),
        };

        let metadata = self.extractor.extract(path, record.media_type(), &fs_meta);
        record.width = metadata.width;
        record.height = metadata.height;
        record.capture_timestamp = metadata.capture_timestamp;
        record.latitude = metadata.latitude;
        record.longitude = metadata.longitude;
        record.city = metadata.city;
        record.country = metadata.country;
        record.size_bytes = fs_meta.len();
        if let Ok(modified) = fs_meta.modified() {
            record.last_modified = system_time_to_nanos(modified);
        }

        let missing = record.wants_thumbnail()
            && record.thumbnail_path.as_ref().map_or(true, |p| !present.contains(p));
        let thumbnail = if missing {
            let generated = self.thumbnails.generate(path, &record.content_hash);
            record.thumbnail_path = generated.as_ref().map(|t| t.relative_path.clone());
            generated
        } else {
            None
        };
        Revalidation::Refreshed(record, thumbnail)
    }

    /// Phase 2: walk the tree, hash unseen files and decide what each one is
    fn ingest(&self, state: &mut PassState, report: &mut PassReport, progress: &ProgressReporter) {
        let root = &self.config.storage_root;
        let outcome = DirectoryWalker::new(root.clone(), self.thumbnails.root().to_path_buf()).walk();
        for e in outcome.errors {
            progress.report_error(&e);
            report.errors.push(e);
        }
        self.ingest_entries(outcome.entries, state, report, progress);
    }

    fn ingest_entries(
        &self,
        entries: Vec<WalkEntry>,
        state: &mut PassState,
        report: &mut PassReport,
        progress: &ProgressReporter,
    ) {
        let root = &self.config.storage_root;
        let mut pending: Vec<(WalkEntry, MediaType, String)> = Vec::new();
        for entry in entries {
            let classification = MediaType::classify(&entry.absolute);
            if !classification.media_type.is_media() {
                continue;
            }
            report.files_seen += 1;
            if state.observed.contains(&entry.relative) || state.failed_paths.contains(&entry.relative) {
                continue;
            }
            let mime = classification
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string());
            pending.push((entry, classification.media_type, mime));
        }
        pending.sort_by(|a, b| a.0.relative.cmp(&b.0.relative));

        let hashed: Vec<Option<CatalogResult<Candidate>>> = pending
            .into_par_iter()
            .map(|(entry, media_type, mime_type)| {
                if self.is_cancelled() {
                    return None;
                }
                Some(self.stat_and_hash(entry, media_type, mime_type))
            })
            .collect();

        // What each path holds right now, for telling a moved copy from a duplicate
        let hashed_at: HashMap<String, String> = hashed
            .iter()
            .filter_map(|c| match c {
                Some(Ok(c)) => Some((c.entry.relative.clone(), c.hash.clone())),
                _ => None,
            })
            .collect();

        let total = hashed.len() as u64;
        let mut new_files = Vec::new();
        for (i, candidate) in hashed.into_iter().enumerate() {
            progress.report_progress(PassPhase::Ingest, i as u64 + 1, total);
            let candidate = match candidate {
                None => continue,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    log::warn!("Skipping file: {}", e);
                    progress.report_error(&e);
                    report.errors.push(e);
                    continue;
                }
            };

            if state.claimed.contains(&candidate.hash) {
                log::debug!("{} duplicates content already cataloged", candidate.entry.relative);
                report.duplicates_skipped += 1;
                continue;
            }

            match self.catalog.get_by_hash(&candidate.hash) {
                Err(e) => {
                    log::warn!("Cannot look up {}: {}", candidate.entry.relative, e);
                    state.protected.insert(candidate.hash.clone());
                    report.warnings.push(e);
                }
                Ok(Some(record)) if record.relative_path == candidate.entry.relative => {
                    state.observe(&record);
                }
                Ok(Some(record)) => {
                    let moved = state.pending_removal.contains(&record.content_hash)
                        || hashed_at
                            .get(&record.relative_path)
                            .is_some_and(|h| *h != record.content_hash)
                        || !absolute_path(root, &record.relative_path).is_file();
                    if moved {
                        self.rename(record, &candidate, state, report);
                    } else {
                        log::debug!(
                            "{} duplicates {}; skipped",
                            candidate.entry.relative,
                            record.relative_path
                        );
                        report.duplicates_skipped += 1;
                    }
                }
                Ok(None) => {
                    state.claimed.insert(candidate.hash.clone());
                    new_files.push(candidate);
                }
            }
        }

        if new_files.is_empty() {
            return;
        }

        let prepared: Vec<Option<(MediaRecord, Option<GeneratedThumbnail>)>> = new_files
            .into_par_iter()
            .map(|candidate| {
                if self.is_cancelled() {
                    return None;
                }
                Some(self.prepare_record(candidate))
            })
            .collect();

        for (record, thumbnail) in prepared.into_iter().flatten() {
            if let Some(t) = &thumbnail {
                if t.created {
                    report.thumbnails_generated += 1;
                }
                state.thumbnails_present.insert(t.relative_path.clone());
            }
            if self.commit(&record, state, report) {
                log::debug!("Cataloged {} ({})", record.relative_path, record.content_hash);
                report.records_created += 1;
                state.mark_observed(&record);
            }
        }
    }

    fn stat_and_hash(&self, entry: WalkEntry, media_type: MediaType, mime_type: String) -> CatalogResult<Candidate> {
        let fs_meta = fs::metadata(&entry.absolute).map_err(|e| CatalogError::from_io(&entry.absolute, e))?;
        let mtime = fs_meta
            .modified()
            .map(system_time_to_nanos)
            .map_err(|e| CatalogError::from_io(&entry.absolute, e))?;
        let hash = self.hasher.hash_file(&entry.absolute)?;
        Ok(Candidate {
            entry,
            media_type,
            mime_type,
            fs_meta,
            mtime,
            hash,
        })
    }

    /// Move a live record to the path its content now lives at
    ///
    /// Metadata, tags and the thumbnail stay as they are. A failed write leaves
    /// the record at its old path for a later pass.
    fn rename(&self, mut record: MediaRecord, candidate: &Candidate, state: &mut PassState, report: &mut PassReport) {
        let from = std::mem::replace(&mut record.relative_path, candidate.entry.relative.clone());
        record.display_filename = file_name(&candidate.entry.relative);
        record.last_modified = candidate.mtime;
        record.size_bytes = candidate.fs_meta.len();

        if self.commit(&record, state, report) {
            log::info!("Renamed {} -> {}", from, record.relative_path);
            report.records_renamed += 1;
            state.observe(&record);
        } else {
            state.protected.insert(record.content_hash);
        }
    }

    fn prepare_record(&self, candidate: Candidate) -> (MediaRecord, Option<GeneratedThumbnail>) {
        let path = &candidate.entry.absolute;
        let metadata = self.extractor.extract(path, candidate.media_type, &candidate.fs_meta);

        let is_image = candidate.media_type == MediaType::Image;
        let (tags, tagging_model) = match is_image.then(|| self.tagger.tag(path)).flatten() {
            Some((tags, model)) => (Some(tags), Some(model)),
            None => (None, None),
        };
        let thumbnail = if is_image {
            self.thumbnails.generate(path, &candidate.hash)
        } else {
            None
        };

        let name = file_name(&candidate.entry.relative);
        let record = MediaRecord {
            content_hash: candidate.hash,
            relative_path: candidate.entry.relative,
            display_filename: name.clone(),
            original_filename: name,
            last_modified: candidate.mtime,
            capture_timestamp: metadata.capture_timestamp,
            thumbnail_path: thumbnail.as_ref().map(|t| t.relative_path.clone()),
            width: metadata.width,
            height: metadata.height,
            latitude: metadata.latitude,
            longitude: metadata.longitude,
            city: metadata.city,
            country: metadata.country,
            mime_type: candidate.mime_type,
            size_bytes: candidate.fs_meta.len(),
            tags,
            tagging_model,
        };
        (record, thumbnail)
    }

    /// Upsert `record`, then retire the record it displaced at its path
    ///
    /// The store drops the displaced row in the same transaction as the
    /// upsert; this removes its thumbnail and counts the replacement. When
    /// the write fails nothing is removed and the displaced record is kept
    /// through the sweep.
    fn commit(&self, record: &MediaRecord, state: &mut PassState, report: &mut PassReport) -> bool {
        let displaced = match self.catalog.get_by_path(&record.relative_path) {
            Ok(other) => other.filter(|o| o.content_hash != record.content_hash),
            Err(e) => {
                report.warnings.push(e);
                None
            }
        };

        if !self.write(record, report) {
            if let Some(other) = displaced {
                state.protected.insert(other.content_hash);
            }
            return false;
        }

        if let Some(other) = displaced {
            log::debug!(
                "{} now holds {}; replacing {}",
                record.relative_path,
                record.content_hash,
                other.content_hash
            );
            if self.remove(&other, state, report) {
                report.records_replaced += 1;
            }
        }
        true
    }

    /// Regenerate missing thumbnails for observed image records
    fn heal_thumbnails(&self, records: Vec<MediaRecord>, state: &mut PassState, report: &mut PassReport) {
        if records.is_empty() {
            return;
        }
        let root = &self.config.storage_root;
        let generated: Vec<(MediaRecord, Option<GeneratedThumbnail>)> = records
            .into_par_iter()
            .map(|record| {
                let source = absolute_path(root, &record.relative_path);
                let thumbnail = self.thumbnails.generate(&source, &record.content_hash);
                (record, thumbnail)
            })
            .collect();

        for (mut record, thumbnail) in generated {
            let relative_path = thumbnail.as_ref().map(|t| t.relative_path.clone());
            if let Some(t) = thumbnail {
                if t.created {
                    report.thumbnails_generated += 1;
                }
                state.thumbnails_present.insert(t.relative_path);
            }
            if record.thumbnail_path != relative_path {
                record.thumbnail_path = relative_path;
                self.write(&record, report);
            }
        }
    }

    /// Phase 3: delete every record whose path was not observed
    fn sweep(&self, state: &PassState, report: &mut PassReport, progress: &ProgressReporter) -> CatalogResult<()> {
        let mut stale: Vec<MediaRecord> = self
            .catalog
            .list_all()?
            .into_iter()
            .filter(|r| !state.observed.contains(&r.relative_path) && !state.protected.contains(&r.content_hash))
            .collect();
        stale.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let total = stale.len() as u64;
        let mut scratch = PassState::default();
        for (i, record) in stale.iter().enumerate() {
            log::info!("Removing {} from catalog; file is gone", record.relative_path);
            if self.remove(record, &mut scratch, report) {
                report.records_deleted += 1;
            }
            progress.report_progress(PassPhase::Sweep, i as u64 + 1, total);
        }
        Ok(())
    }

    /// Phase 4: remove thumbnails no live record points at
    fn cleanup_thumbnails(&self, report: &mut PassReport, progress: &ProgressReporter) -> CatalogResult<()> {
        let referenced = self.catalog.list_hashes_with_thumbnails()?;
        let inventory = self.thumbnails.inventory()?;
        let total = inventory.len() as u64;
        let mut remaining = HashSet::new();

        for (i, stored) in inventory.into_iter().enumerate() {
            progress.report_progress(PassPhase::Cleanup, i as u64 + 1, total);
            let live = stored
                .hash
                .as_ref()
                .and_then(|h| referenced.get(h))
                .is_some_and(|p| *p == stored.relative_path);
            if live {
                remaining.insert(stored.relative_path);
                continue;
            }

            let hash = stored.hash.as_deref().unwrap_or("unrecognized");
            match self.thumbnails.delete(hash, &stored.relative_path) {
                Ok(removed) => {
                    if removed {
                        log::debug!("Deleted orphan thumbnail {}", stored.relative_path);
                        report.thumbnails_deleted += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Cannot delete orphan thumbnail {}: {}", stored.relative_path, e);
                    report.errors.push(e);
                }
            }
        }

        if let Err(e) = self.thumbnails.remove_empty_shards() {
            log::warn!("Cannot remove empty shards: {}", e);
            report.errors.push(e);
        }

        let root = &self.config.storage_root;
        let mut dangling: Vec<_> = referenced
            .into_iter()
            .filter(|(_, path)| !remaining.contains(path))
            .collect();
        dangling.sort();
        for (hash, _) in dangling {
            let mut record = match self.catalog.get_by_hash(&hash) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    report.warnings.push(e);
                    continue;
                }
            };
            let source = absolute_path(root, &record.relative_path);
            let regenerated = if record.wants_thumbnail() && source.is_file() {
                self.thumbnails.generate(&source, &hash)
            } else {
                None
            };
            if let Some(t) = &regenerated {
                if t.created {
                    report.thumbnails_generated += 1;
                }
            }
            let relative_path = regenerated.map(|t| t.relative_path);
            if record.thumbnail_path != relative_path {
                log::debug!("Repointing thumbnail of {} to {:?}", record.relative_path, relative_path);
                record.thumbnail_path = relative_path;
                self.write(&record, report);
            }
        }
        Ok(())
    }

    /// Upsert one record; a failed write is recorded as a warning
    fn write(&self, record: &MediaRecord, report: &mut PassReport) -> bool {
        match self.catalog.upsert(record) {
            Ok(()) => {
                report.catalog_writes += 1;
                true
            }
            Err(e) => {
                log::warn!("Catalog write for {} not applied: {}", record.relative_path, e);
                report.warnings.push(e);
                false
            }
        }
    }

    /// Delete a record and its thumbnail
    fn remove(&self, record: &MediaRecord, state: &mut PassState, report: &mut PassReport) -> bool {
        if let Err(e) = self.catalog.delete_by_hash(&record.content_hash) {
            log::warn!("Catalog delete for {} not applied: {}", record.relative_path, e);
            report.warnings.push(e);
            return false;
        }
        report.catalog_writes += 1;
        state.pending_removal.remove(&record.content_hash);

        if let Some(thumb) = &record.thumbnail_path {
            match self.thumbnails.delete(&record.content_hash, thumb) {
                Ok(removed) => {
                    if removed {
                        report.thumbnails_deleted += 1;
                    }
                    state.thumbnails_present.remove(thumb);
                }
                Err(e) => {
                    log::warn!("Cannot delete thumbnail {}: {}", thumb, e);
                    report.errors.push(e);
                }
            }
        }
        true
    }
}

/// Last component of a `/`-separated relative path
fn file_name(relative: &str) -> String {
    relative.rsplit('/').next().unwrap_or(relative).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::classifier::TaggingModel;
    use crate::error::CatalogErrorKind;
    use crate::test_support::{
        mtime, shift_mtime, write_jpeg, write_jpeg_with_exif, write_png, BlockingClassifier, FailingCatalog, LA_LAT,
        LA_LON,
    };
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        catalog: Arc<dyn CatalogStore>,
        reconciler: Arc<Reconciler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_tagger(Tagger::Off)
        }

        fn with_tagger(tagger: Tagger) -> Self {
            Self::build(tagger, Arc::new(SqliteCatalog::open_memory().unwrap()))
        }

        fn build(tagger: Tagger, catalog: Arc<dyn CatalogStore>) -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().join("media");
            fs::create_dir(&root).unwrap();
            let reconciler = Reconciler::new(
                test_config(&root),
                catalog.clone(),
                Arc::new(GeoLocator::builtin()),
                tagger,
            )
            .unwrap();
            Self {
                _dir: dir,
                root,
                catalog,
                reconciler: Arc::new(reconciler),
            }
        }

        fn path(&self, relative: &str) -> PathBuf {
            absolute_path(&self.root, relative)
        }

        fn thumb_root(&self) -> PathBuf {
            self.root.join(".thumbnails")
        }

        fn run(&self, mode: PassMode) -> PassReport {
            self.reconciler.run(mode).unwrap()
        }

        fn record_at(&self, relative: &str) -> MediaRecord {
            self.catalog.get_by_path(relative).unwrap().unwrap()
        }

        fn thumbnail_of(&self, record: &MediaRecord) -> PathBuf {
            self.reconciler
                .thumbnails()
                .absolute_path(record.thumbnail_path.as_ref().unwrap())
        }
    }

    fn test_config(root: &Path) -> CatalogConfig {
        CatalogConfig::builder()
            .storage_root(root.to_path_buf())
            .num_threads(2)
            .build()
    }

    fn assert_noop(report: &PassReport) {
        assert!(report.is_noop(), "expected no writes: {:?}", report);
        assert!(report.is_success(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_empty_root() {
        let fx = Fixture::new();
        let report = fx.run(PassMode::Initial);

        assert!(fx.catalog.list_all().unwrap().is_empty());
        assert!(fx.thumb_root().is_dir());
        assert_eq!(report.files_seen, 0);
        assert_noop(&report);
    }

    #[test]
    fn test_image_with_gps_is_fully_cataloged() {
        let fx = Fixture::new();
        fs::create_dir(fx.path("trip")).unwrap();
        write_jpeg_with_exif(
            &fx.path("trip/la.jpg"),
            600,
            400,
            "2021:06:15 12:30:00",
            (LA_LAT, b'N'),
            (LA_LON, b'W'),
        );

        let report = fx.run(PassMode::Initial);
        assert_eq!(report.records_created, 1);
        assert_eq!(report.thumbnails_generated, 1);

        let record = fx.record_at("trip/la.jpg");
        assert_eq!(record.display_filename, "la.jpg");
        assert_eq!(record.original_filename, "la.jpg");
        assert_eq!((record.width, record.height), (Some(600), Some(400)));
        assert_eq!(record.city.as_deref(), Some("Los Angeles"));
        assert_eq!(record.country.as_deref(), Some("United States"));
        assert!((record.latitude.unwrap() - 34.08676).abs() < 1e-4);
        assert!((record.longitude.unwrap() + 118.51577).abs() < 1e-4);
        assert_eq!(
            record.capture_timestamp,
            chrono::NaiveDate::from_ymd_opt(2021, 6, 15)
                .unwrap()
                .and_hms_opt(12, 30, 0)
                .unwrap()
                .and_utc()
                .timestamp()
        );
        assert_eq!(record.mime_type, "image/jpeg");

        let hash = &record.content_hash;
        assert_eq!(
            record.thumbnail_path.as_deref(),
            Some(format!("{}/{}.png", &hash[..2], hash).as_str())
        );
        let thumb = image::open(fx.thumbnail_of(&record)).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (256, 256));
    }

    #[test]
    fn test_second_pass_is_idempotent() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.path("a/b")).unwrap();
        write_jpeg(&fx.path("one.jpg"), 64, 48, [200, 10, 10]);
        write_png(&fx.path("a/two.png"), 30, 40, [10, 200, 10, 255]);
        fs::write(fx.path("a/b/clip.mp4"), b"not really a video").unwrap();
        fs::write(fx.path("a/notes.txt"), b"ignored").unwrap();
        fs::write(fx.path("a/broken.jpg"), b"corrupt image bytes").unwrap();

        let first = fx.run(PassMode::Initial);
        assert_eq!(first.records_created, 4);
        assert_eq!(first.files_seen, 4);
        assert_eq!(first.thumbnails_generated, 2);

        let video = fx.record_at("a/b/clip.mp4");
        assert!(video.thumbnail_path.is_none());
        assert!(video.width.is_none());
        assert!(fx.record_at("a/broken.jpg").thumbnail_path.is_none());

        assert_noop(&fx.run(PassMode::Initial));
        let incremental = fx.run(PassMode::Incremental);
        assert_noop(&incremental);
        assert_eq!(incremental.unchanged, 4);
        assert_noop(&fx.run(PassMode::Incremental));
    }

    #[test]
    fn test_duplicates_keep_first_path() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("b.jpg"), 32, 32, [1, 2, 3]);
        fs::copy(fx.path("b.jpg"), fx.path("a.jpg")).unwrap();

        let report = fx.run(PassMode::Initial);
        assert_eq!(report.records_created, 1);
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg"]);

        let again = fx.run(PassMode::Incremental);
        assert_noop(&again);
        assert_eq!(again.duplicates_skipped, 1);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg"]);

        // Once the tracked copy is gone the remaining one takes over
        fs::remove_file(fx.path("a.jpg")).unwrap();
        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.records_renamed, 1);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["b.jpg"]);
    }

    #[test]
    fn test_rename_reuses_thumbnail() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 80, 60, [10, 10, 200]);
        fx.run(PassMode::Initial);
        let before = fx.record_at("a.jpg");
        let thumb = fx.thumbnail_of(&before);
        let thumb_mtime = mtime(&thumb);

        fs::create_dir(fx.path("sub")).unwrap();
        fs::rename(fx.path("a.jpg"), fx.path("sub/b.jpg")).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.records_renamed, 1);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.records_created, 0);
        assert_eq!(report.thumbnails_generated, 0);
        assert_eq!(report.thumbnails_deleted, 0);

        let after = fx.record_at("sub/b.jpg");
        assert_eq!(after.content_hash, before.content_hash);
        assert_eq!(after.display_filename, "b.jpg");
        assert_eq!(after.original_filename, "a.jpg");
        assert_eq!(after.thumbnail_path, before.thumbnail_path);
        assert_eq!(after.capture_timestamp, before.capture_timestamp);
        assert!(fx.catalog.get_by_path("a.jpg").unwrap().is_none());
        assert_eq!(mtime(&thumb), thumb_mtime);

        assert_noop(&fx.run(PassMode::Incremental));
    }

    #[test]
    fn test_content_change_replaces_record() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 40, 40, [255, 0, 0]);
        fx.run(PassMode::Initial);
        let old = fx.record_at("a.jpg");
        let old_thumb = fx.thumbnail_of(&old);

        write_jpeg(&fx.path("a.jpg"), 50, 30, [0, 0, 255]);
        shift_mtime(&fx.path("a.jpg"), 10);
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.records_replaced, 1);
        assert_eq!(report.records_created, 1);
        assert!(fx.catalog.get_by_hash(&old.content_hash).unwrap().is_none());
        assert!(!old_thumb.exists());

        let new = fx.record_at("a.jpg");
        assert_ne!(new.content_hash, old.content_hash);
        assert_eq!(new.width, Some(50));
        assert!(fx.thumbnail_of(&new).is_file());
        assert_eq!(fx.catalog.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_content_change_seen_by_initial_pass() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 40, 40, [255, 0, 0]);
        fx.run(PassMode::Initial);
        let old = fx.record_at("a.jpg");

        write_jpeg(&fx.path("a.jpg"), 40, 40, [0, 255, 0]);
        let report = fx.run(PassMode::Initial);

        assert_eq!(report.records_replaced, 1);
        assert_eq!(report.records_created, 1);
        assert!(!fx.thumbnail_of(&old).exists());
        assert_ne!(fx.record_at("a.jpg").content_hash, old.content_hash);
    }

    #[test]
    fn test_touch_refreshes_without_reencoding() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 40, 40, [9, 9, 9]);
        fx.run(PassMode::Initial);
        let before = fx.record_at("a.jpg");
        let thumb_mtime = mtime(&fx.thumbnail_of(&before));

        shift_mtime(&fx.path("a.jpg"), 5);
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.records_updated, 1);
        assert_eq!(report.catalog_writes, 1);
        assert_eq!(report.thumbnails_generated, 0);
        let after = fx.record_at("a.jpg");
        assert_eq!(after.content_hash, before.content_hash);
        assert!(after.last_modified > before.last_modified);
        assert_eq!(mtime(&fx.thumbnail_of(&after)), thumb_mtime);

        assert_noop(&fx.run(PassMode::Incremental));
    }

    #[test]
    fn test_deleted_file_is_swept() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("keep.jpg"), 20, 20, [1, 1, 1]);
        write_jpeg(&fx.path("gone.jpg"), 20, 20, [200, 200, 1]);
        fx.run(PassMode::Initial);
        let gone = fx.record_at("gone.jpg");
        let gone_thumb = fx.thumbnail_of(&gone);

        fs::remove_file(fx.path("gone.jpg")).unwrap();

        // Initial passes never delete
        let initial = fx.run(PassMode::Initial);
        assert_eq!(initial.records_deleted, 0);
        assert_eq!(fx.catalog.list_all().unwrap().len(), 2);

        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.records_deleted, 1);
        assert_eq!(report.thumbnails_deleted, 1);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["keep.jpg"]);
        assert!(!gone_thumb.exists());
        let shard = gone_thumb.parent().unwrap();
        let keep_shard = fx.thumbnail_of(&fx.record_at("keep.jpg"));
        if shard != keep_shard.parent().unwrap() {
            assert!(!shard.exists());
        }
    }

    #[test]
    fn test_orphan_thumbnails_are_removed() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [5, 100, 5]);
        fx.run(PassMode::Initial);
        let live = fx.record_at("a.jpg");
        let shard = if live.content_hash.starts_with("ff") { "ee" } else { "ff" };

        let orphan_hash = format!("{}{}", shard, "0".repeat(62));
        fs::create_dir_all(fx.thumb_root().join(shard)).unwrap();
        write_png(&fx.thumb_root().join(shard).join(format!("{}.png", orphan_hash)), 4, 4, [0, 0, 0, 255]);
        fs::create_dir_all(fx.thumb_root().join("zz")).unwrap();
        fs::write(fx.thumb_root().join("zz").join("notes.txt"), b"junk").unwrap();
        fs::write(fx.thumb_root().join(".tmp-abc123"), b"partial").unwrap();

        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.thumbnails_deleted, 3);
        assert_eq!(report.catalog_writes, 0);
        assert!(!fx.thumb_root().join(shard).exists());
        assert!(!fx.thumb_root().join("zz").exists());
        assert!(!fx.thumb_root().join(".tmp-abc123").exists());
        assert!(fx.thumbnail_of(&live).is_file());
        assert!(fx.thumb_root().is_dir());
        assert!(fx.thumb_root().join(crate::lock::LOCK_FILE_NAME).is_file());
    }

    #[test]
    fn test_missing_thumbnail_is_regenerated() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [5, 5, 100]);
        fx.run(PassMode::Initial);
        let record = fx.record_at("a.jpg");
        fs::remove_file(fx.thumbnail_of(&record)).unwrap();

        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.thumbnails_generated, 1);
        assert_eq!(report.catalog_writes, 0);
        assert!(fx.thumbnail_of(&record).is_file());
    }

    #[test]
    fn test_flat_thumbnail_layout_is_migrated() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [100, 5, 5]);
        fx.run(PassMode::Initial);
        let mut record = fx.record_at("a.jpg");
        let sharded = fx.thumbnail_of(&record);

        let flat_name = format!("{}.png", record.content_hash);
        fs::rename(&sharded, fx.thumb_root().join(&flat_name)).unwrap();
        fs::remove_dir(sharded.parent().unwrap()).unwrap();
        record.thumbnail_path = Some(flat_name.clone());
        fx.catalog.upsert(&record).unwrap();

        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.thumbnails_migrated, 1);
        assert_eq!(report.catalog_writes, 1);
        assert_eq!(report.thumbnails_generated, 0);
        assert!(sharded.is_file());
        assert!(!fx.thumb_root().join(&flat_name).exists());
        assert_eq!(
            fx.record_at("a.jpg").thumbnail_path,
            Some(ThumbnailStore::relative_path_for(&record.content_hash))
        );

        assert_noop(&fx.run(PassMode::Incremental));
    }

    #[test]
    fn test_tagging_when_enabled() {
        let fx = Fixture::with_tagger(Tagger::from_model(TaggingModel::DominantColor));
        write_jpeg(&fx.path("red.jpg"), 40, 40, [230, 20, 20]);
        fs::write(fx.path("clip.mp4"), b"video").unwrap();
        fx.run(PassMode::Initial);

        let record = fx.record_at("red.jpg");
        assert_eq!(record.tagging_model.as_deref(), Some("dominant-color"));
        assert_eq!(record.tags.unwrap()[0].tag, "red");
        assert!(fx.record_at("clip.mp4").tags.is_none());
    }

    #[test]
    fn test_overlapping_pass_is_rejected() {
        let (gate, entered_rx, release_tx) = BlockingClassifier::new();
        let fx = Fixture::with_tagger(Tagger::Custom(Arc::new(gate)));
        write_jpeg(&fx.path("a.jpg"), 20, 20, [1, 2, 3]);

        let reconciler = fx.reconciler.clone();
        let handle = std::thread::spawn(move || reconciler.run(PassMode::Initial));

        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(fx.reconciler.is_running());
        let err = fx.reconciler.run(PassMode::Incremental).unwrap_err();
        assert_eq!(err.kind, CatalogErrorKind::PassInProgress);

        release_tx.send(()).unwrap();
        let report = handle.join().unwrap().unwrap();
        assert_eq!(report.records_created, 1);
        assert!(!fx.reconciler.is_running());
    }

    #[test]
    fn test_missing_root_fails_before_mutation() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [1, 2, 3]);
        fx.run(PassMode::Initial);

        fs::remove_dir_all(&fx.root).unwrap();
        let err = fx.reconciler.run(PassMode::Incremental).unwrap_err();
        assert_eq!(err.kind, CatalogErrorKind::RootUnavailable);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg"]);
        assert!(!fx.reconciler.is_running());

        let config = CatalogConfig::new(fx.root.clone());
        let catalog = Arc::new(SqliteCatalog::open_memory().unwrap());
        let err = Reconciler::new(config, catalog, Arc::new(GeoLocator::empty()), Tagger::Off)
            .err()
            .unwrap();
        assert_eq!(err.kind, CatalogErrorKind::RootUnavailable);
    }

    #[test]
    fn test_cancelled_pass_skips_sweep() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [1, 2, 3]);
        fx.run(PassMode::Initial);
        fs::remove_file(fx.path("a.jpg")).unwrap();

        fx.reconciler.cancel();
        let report = fx.run(PassMode::Incremental);
        assert!(report.cancelled);
        assert!(!report.is_success());
        assert_eq!(report.records_deleted, 0);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg"]);

        // The request is consumed by the cancelled pass
        let report = fx.run(PassMode::Incremental);
        assert!(!report.cancelled);
        assert_eq!(report.records_deleted, 1);
        assert!(fx.catalog.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_pass_on_same_root_from_another_reconciler_is_rejected() {
        let (gate, entered_rx, release_tx) = BlockingClassifier::new();
        let fx = Fixture::with_tagger(Tagger::Custom(Arc::new(gate)));
        write_jpeg(&fx.path("a.jpg"), 20, 20, [1, 2, 3]);
        let other = Reconciler::new(
            test_config(&fx.root),
            fx.catalog.clone(),
            Arc::new(GeoLocator::empty()),
            Tagger::Off,
        )
        .unwrap();

        let reconciler = fx.reconciler.clone();
        let handle = std::thread::spawn(move || reconciler.run(PassMode::Initial));
        entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

        let err = other.run(PassMode::Incremental).unwrap_err();
        assert_eq!(err.kind, CatalogErrorKind::PassInProgress);
        assert!(!other.is_running());

        release_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap().unwrap().records_created, 1);

        // The lock is released with the pass
        assert_noop(&other.run(PassMode::Incremental).unwrap());
    }

    #[test]
    fn test_overwritten_tracked_copy_hands_over_to_duplicate() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("b.jpg"), 32, 32, [1, 2, 3]);
        fx.run(PassMode::Initial);
        fs::copy(fx.path("b.jpg"), fx.path("a.jpg")).unwrap();
        assert_eq!(fx.run(PassMode::Initial).duplicates_skipped, 1);
        let tracked = fx.record_at("b.jpg");

        write_jpeg(&fx.path("b.jpg"), 32, 32, [250, 120, 0]);
        let report = fx.run(PassMode::Initial);

        assert_eq!(report.records_renamed, 1);
        assert_eq!(report.records_created, 1);
        assert_eq!(report.duplicates_skipped, 0);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg", "b.jpg"]);
        let moved = fx.record_at("a.jpg");
        assert_eq!(moved.content_hash, tracked.content_hash);
        assert_eq!(moved.thumbnail_path, tracked.thumbnail_path);
        assert!(fx.thumbnail_of(&moved).is_file());
        assert_ne!(fx.record_at("b.jpg").content_hash, tracked.content_hash);

        assert_noop(&fx.run(PassMode::Incremental));
    }

    #[test]
    fn test_failed_rename_write_keeps_record() {
        let catalog = Arc::new(FailingCatalog::new());
        let fx = Fixture::build(Tagger::Off, catalog.clone());
        write_jpeg(&fx.path("a.jpg"), 20, 20, [30, 60, 90]);
        fx.run(PassMode::Initial);
        let before = fx.record_at("a.jpg");
        let thumb = fx.thumbnail_of(&before);

        fs::rename(fx.path("a.jpg"), fx.path("b.jpg")).unwrap();
        catalog.refuse_upserts_at("b.jpg");
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, CatalogErrorKind::DatabaseError);
        assert_eq!(report.records_renamed, 0);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.thumbnails_deleted, 0);
        assert_eq!(fx.record_at("a.jpg"), before);
        assert!(thumb.is_file());

        catalog.recover();
        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.records_renamed, 1);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["b.jpg"]);
        assert!(thumb.is_file());
    }

    #[test]
    fn test_failed_lookup_keeps_record() {
        let catalog = Arc::new(FailingCatalog::new());
        let fx = Fixture::build(Tagger::Off, catalog.clone());
        write_jpeg(&fx.path("a.jpg"), 20, 20, [30, 60, 90]);
        fx.run(PassMode::Initial);
        let before = fx.record_at("a.jpg");

        fs::rename(fx.path("a.jpg"), fx.path("b.jpg")).unwrap();
        catalog.refuse_hash_lookups();
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.records_created, 0);
        assert_eq!(fx.record_at("a.jpg"), before);
        assert!(fx.thumbnail_of(&before).is_file());
    }

    #[test]
    fn test_failed_create_write_leaves_catalog_untouched() {
        let catalog = Arc::new(FailingCatalog::new());
        let fx = Fixture::build(Tagger::Off, catalog.clone());
        write_jpeg(&fx.path("keep.jpg"), 20, 20, [5, 5, 5]);
        fx.run(PassMode::Initial);
        let keep = fx.record_at("keep.jpg");

        write_jpeg(&fx.path("new.jpg"), 20, 20, [250, 5, 5]);
        catalog.refuse_upserts_at("new.jpg");
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.warnings.len(), 1);
        assert!(report.errors.is_empty());
        assert_eq!(report.records_created, 0);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.catalog_writes, 0);
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["keep.jpg"]);
        assert_eq!(fx.record_at("keep.jpg"), keep);
        // The unreferenced preview does not outlive the pass
        assert_eq!(report.thumbnails_generated, report.thumbnails_deleted);

        catalog.recover();
        let report = fx.run(PassMode::Incremental);
        assert_eq!(report.records_created, 1);
        assert!(fx.thumbnail_of(&fx.record_at("new.jpg")).is_file());
    }

    #[test]
    fn test_file_vanishing_after_walk_is_skipped() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [1, 1, 200]);
        write_jpeg(&fx.path("b.jpg"), 20, 20, [200, 1, 1]);
        let entries = DirectoryWalker::new(fx.root.clone(), fx.thumb_root()).walk().entries;
        assert_eq!(entries.len(), 2);
        fs::remove_file(fx.path("b.jpg")).unwrap();

        let mut state = PassState::default();
        let mut report = PassReport::new(PassMode::Initial);
        let progress = ProgressReporter::new(false, PROGRESS_INTERVAL_MS);
        fx.reconciler.ingest_entries(entries, &mut state, &mut report, &progress);

        assert_eq!(report.files_seen, 2);
        assert_eq!(report.records_created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, CatalogErrorKind::NotFound);
        assert_eq!(report.errors[0].path, Some(fx.path("b.jpg")));
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["a.jpg"]);
    }

    /// Make `path` unreadable; false when the process can read it anyway
    #[cfg(unix)]
    fn lock_out(path: &Path) -> bool {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o000)).unwrap();
        fs::File::open(path).is_err()
    }

    #[cfg(unix)]
    fn let_in(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_new_file_is_skipped() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("ok.jpg"), 20, 20, [1, 200, 1]);
        write_jpeg(&fx.path("locked.jpg"), 20, 20, [200, 1, 200]);
        if !lock_out(&fx.path("locked.jpg")) {
            // Running with privileges that bypass file modes
            return;
        }

        let report = fx.run(PassMode::Initial);
        assert_eq!(report.files_seen, 2);
        assert_eq!(report.records_created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, CatalogErrorKind::HashError);
        assert_eq!(report.errors[0].path, Some(fx.path("locked.jpg")));
        assert_eq!(fx.catalog.list_paths().unwrap(), vec!["ok.jpg"]);

        let_in(&fx.path("locked.jpg"));
        let report = fx.run(PassMode::Initial);
        assert!(report.is_success());
        assert_eq!(report.records_created, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_rehash_failure_keeps_record() {
        let fx = Fixture::new();
        write_jpeg(&fx.path("a.jpg"), 20, 20, [90, 90, 9]);
        fx.run(PassMode::Initial);
        let before = fx.record_at("a.jpg");

        shift_mtime(&fx.path("a.jpg"), 7);
        if !lock_out(&fx.path("a.jpg")) {
            return;
        }
        let report = fx.run(PassMode::Incremental);

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, CatalogErrorKind::HashError);
        assert_eq!(report.records_deleted, 0);
        assert_eq!(report.records_created, 0);
        assert_eq!(report.thumbnails_deleted, 0);
        assert_eq!(fx.record_at("a.jpg"), before);

        let_in(&fx.path("a.jpg"));
        let report = fx.run(PassMode::Incremental);
        assert!(report.is_success());
        assert_eq!(report.records_updated, 1);
        assert_eq!(fx.record_at("a.jpg").content_hash, before.content_hash);
    }
}
