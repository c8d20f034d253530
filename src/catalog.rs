//! Catalog storage
//!
//! `CatalogStore` is the keyed-table interface the reconciler needs;
//! `SqliteCatalog` is the default implementation.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{CatalogError, CatalogResult};
use crate::models::{MediaRecord, TagScore};

/// Persistent hash → record table
///
/// Every mutation is atomic per record.
pub trait CatalogStore: Send + Sync {
    /// Insert or replace the record with this hash; any other record at the
    /// same path is removed in the same transaction
    fn upsert(&self, record: &MediaRecord) -> CatalogResult<()>;
    fn get_by_hash(&self, hash: &str) -> CatalogResult<Option<MediaRecord>>;
    fn get_by_path(&self, relative_path: &str) -> CatalogResult<Option<MediaRecord>>;
    /// Returns whether a record was removed
    fn delete_by_hash(&self, hash: &str) -> CatalogResult<bool>;
    fn list_all(&self) -> CatalogResult<Vec<MediaRecord>>;
    fn list_paths(&self) -> CatalogResult<Vec<String>>;
    /// hash → thumbnail path, for records that have one
    fn list_hashes_with_thumbnails(&self) -> CatalogResult<HashMap<String, String>>;
}

const COLUMNS: &str = "content_hash, relative_path, display_filename, original_filename, \
     last_modified, capture_timestamp, thumbnail_path, width, height, latitude, longitude, \
     city, country, mime_type, size_bytes, tags, tagging_model";

/// SQLite-backed catalog behind a single shared connection
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Open or create the catalog database
    pub fn open(path: &Path) -> CatalogResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::from_io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        log::info!("Opened catalog at {:?}", path);
        Ok(catalog)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> CatalogResult<Self> {
        let catalog = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn conn(&self) -> CatalogResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::database_error("catalog connection lock poisoned"))
    }

    /// Initialize database schema
    fn init_schema(&self) -> CatalogResult<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS media_records (
                content_hash TEXT PRIMARY KEY,
                relative_path TEXT NOT NULL UNIQUE,
                display_filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                capture_timestamp INTEGER NOT NULL,
                thumbnail_path TEXT,
                width INTEGER,
                height INTEGER,
                latitude REAL,
                longitude REAL,
                city TEXT,
                country TEXT,
                mime_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                tags TEXT,
                tagging_model TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_records_capture ON media_records(capture_timestamp);
            CREATE INDEX IF NOT EXISTS idx_records_location ON media_records(city, country);
            ",
        )?;
        Ok(())
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> CatalogResult<Vec<MediaRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Records captured on the given UTC calendar day
    pub fn list_by_capture_date(&self, date: NaiveDate) -> CatalogResult<Vec<MediaRecord>> {
        let start = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| CatalogError::database_error(format!("invalid date {}", date)))?;
        self.list_by_capture_range(start, start + 86_399)
    }

    /// Records captured within `[start, end]` (Unix seconds, inclusive)
    pub fn list_by_capture_range(&self, start: i64, end: i64) -> CatalogResult<Vec<MediaRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM media_records
                 WHERE capture_timestamp BETWEEN ?1 AND ?2
                 ORDER BY capture_timestamp DESC, display_filename ASC",
                COLUMNS
            ),
            params![start, end],
        )
    }

    /// Records resolved to `city`, optionally restricted to `country`
    pub fn list_by_location(&self, city: &str, country: Option<&str>) -> CatalogResult<Vec<MediaRecord>> {
        match country {
            Some(country) => self.query_records(
                &format!(
                    "SELECT {} FROM media_records WHERE city = ?1 AND country = ?2
                     ORDER BY capture_timestamp DESC, display_filename ASC",
                    COLUMNS
                ),
                params![city, country],
            ),
            None => self.query_records(
                &format!(
                    "SELECT {} FROM media_records WHERE city = ?1
                     ORDER BY capture_timestamp DESC, display_filename ASC",
                    COLUMNS
                ),
                params![city],
            ),
        }
    }

    /// Get record count
    pub fn count(&self) -> CatalogResult<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM media_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl CatalogStore for SqliteCatalog {
    fn upsert(&self, record: &MediaRecord) -> CatalogResult<()> {
        let tags = record
            .tags
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CatalogError::database_error(e.to_string()))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let displaced = tx.execute(
            "DELETE FROM media_records WHERE relative_path = ?1 AND content_hash != ?2",
            params![record.relative_path, record.content_hash],
        )?;
        if displaced > 0 {
            log::warn!(
                "Path {} was held by another record; replaced by {}",
                record.relative_path,
                record.content_hash
            );
        }
        tx.execute(
            &format!(
                "INSERT OR REPLACE INTO media_records ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                COLUMNS
            ),
            params![
                record.content_hash,
                record.relative_path,
                record.display_filename,
                record.original_filename,
                record.last_modified,
                record.capture_timestamp,
                record.thumbnail_path,
                record.width,
                record.height,
                record.latitude,
                record.longitude,
                record.city,
                record.country,
                record.mime_type,
                record.size_bytes as i64,
                tags,
                record.tagging_model,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_by_hash(&self, hash: &str) -> CatalogResult<Option<MediaRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE content_hash = ?1", COLUMNS),
                [hash],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_by_path(&self, relative_path: &str) -> CatalogResult<Option<MediaRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM media_records WHERE relative_path = ?1", COLUMNS),
                [relative_path],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn delete_by_hash(&self, hash: &str) -> CatalogResult<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM media_records WHERE content_hash = ?1", [hash])?;
        Ok(removed > 0)
    }

    fn list_all(&self) -> CatalogResult<Vec<MediaRecord>> {
        self.query_records(
            &format!(
                "SELECT {} FROM media_records ORDER BY capture_timestamp DESC, display_filename ASC",
                COLUMNS
            ),
            [],
        )
    }

    fn list_paths(&self) -> CatalogResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT relative_path FROM media_records ORDER BY relative_path")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }
        Ok(paths)
    }

    fn list_hashes_with_thumbnails(&self) -> CatalogResult<HashMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT content_hash, thumbnail_path FROM media_records WHERE thumbnail_path IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (hash, thumb) = row?;
            map.insert(hash, thumb);
        }
        Ok(map)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    let tags: Option<String> = row.get(15)?;
    let tags = tags.and_then(|json| match serde_json::from_str::<Vec<TagScore>>(&json) {
        Ok(tags) => Some(tags),
        Err(e) => {
            log::warn!("Ignoring unreadable tags column: {}", e);
            None
        }
    });
    Ok(MediaRecord {
        content_hash: row.get(0)?,
        relative_path: row.get(1)?,
        display_filename: row.get(2)?,
        original_filename: row.get(3)?,
        last_modified: row.get(4)?,
        capture_timestamp: row.get(5)?,
        thumbnail_path: row.get(6)?,
        width: row.get(7)?,
        height: row.get(8)?,
        latitude: row.get(9)?,
        longitude: row.get(10)?,
        city: row.get(11)?,
        country: row.get(12)?,
        mime_type: row.get(13)?,
        size_bytes: row.get::<_, i64>(14)? as u64,
        tags,
        tagging_model: row.get(16)?,
    })
}
