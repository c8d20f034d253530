//! Thumbnail store
//!
//! Content-addressed PNG previews sharded by the first two hex characters of
//! the content hash: `<root>/<hh>/<hash>.png`.

use image::{imageops, imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_THUMBNAIL_SIZE;
use crate::error::{CatalogError, CatalogResult};
use crate::lock::LOCK_FILE_NAME;

/// File extension of stored thumbnails
pub const THUMBNAIL_EXTENSION: &str = "png";

/// Outcome of a successful `generate` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedThumbnail {
    /// Path relative to the store root
    pub relative_path: String,
    /// False when an existing file was reused
    pub created: bool,
}

/// A file found in the store by `inventory`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredThumbnail {
    /// Path relative to the store root, `/`-separated
    pub relative_path: String,
    /// Hash parsed from the file name, if the name is well-formed
    pub hash: Option<String>,
    /// Whether the file sits at the store root (legacy flat layout)
    pub flat: bool,
}

/// A legacy flat thumbnail relocated into its shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratedThumbnail {
    pub hash: String,
    pub new_relative_path: String,
}

/// Sharded thumbnail cache rooted at one directory
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    root: PathBuf,
    size: u32,
}

impl ThumbnailStore {
    /// Open the store, creating its root directory if needed
    pub fn open(root: PathBuf) -> CatalogResult<Self> {
        Self::with_size(root, DEFAULT_THUMBNAIL_SIZE)
    }

    /// Open the store with a custom square bound
    pub fn with_size(root: PathBuf, size: u32) -> CatalogResult<Self> {
        if !root.is_dir() {
            fs::create_dir_all(&root).map_err(|e| CatalogError::from_io(&root, e))?;
            log::info!("Created thumbnail directory {:?}", root);
        }
        Ok(Self {
            root,
            size: size.max(1),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard-relative path for a hash
    pub fn relative_path_for(hash: &str) -> String {
        format!("{}/{}.{}", shard_of(hash), hash, THUMBNAIL_EXTENSION)
    }

    /// Absolute path of a store-relative path
    pub fn absolute_path(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    /// Whether the thumbnail for `hash` exists
    pub fn exists(&self, hash: &str) -> bool {
        self.absolute_path(&Self::relative_path_for(hash)).is_file()
    }

    /// Generate the thumbnail for `hash` from `source`
    ///
    /// An existing file is reused without re-encoding. Unreadable or corrupt
    /// sources yield `None`.
    pub fn generate(&self, source: &Path, hash: &str) -> Option<GeneratedThumbnail> {
        let relative_path = Self::relative_path_for(hash);
        let target = self.absolute_path(&relative_path);
        if target.is_file() {
            return Some(GeneratedThumbnail {
                relative_path,
                created: false,
            });
        }

        match self.render_to(source, &target) {
            Ok(()) => {
                log::debug!("Generated thumbnail {} for {:?}", relative_path, source);
                Some(GeneratedThumbnail {
                    relative_path,
                    created: true,
                })
            }
            Err(e) => {
                log::warn!("Could not generate thumbnail for {:?}: {}", source, e);
                None
            }
        }
    }

    fn render_to(&self, source: &Path, target: &Path) -> CatalogResult<()> {
        let img = image::open(source).map_err(|e| {
            CatalogError::thumbnail_error(Some(source.to_path_buf()), e.to_string())
        })?;
        let canvas = render_thumbnail(&img, self.size);

        let shard = target
            .parent()
            .ok_or_else(|| CatalogError::thumbnail_error(Some(target.to_path_buf()), "no shard directory"))?;
        fs::create_dir_all(shard).map_err(|e| CatalogError::from_io(shard, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(shard)
            .map_err(|e| CatalogError::from_io(shard, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            canvas.write_to(&mut writer, ImageFormat::Png)?;
            writer.flush().map_err(|e| CatalogError::from_io(target, e))?;
        }
        tmp.persist(target)
            .map_err(|e| CatalogError::from_io(target, e.error))?;
        Ok(())
    }

    /// Remove a thumbnail and its shard directory if that leaves it empty
    ///
    /// Returns whether a file was removed.
    pub fn delete(&self, hash: &str, relative_path: &str) -> CatalogResult<bool> {
        let path = self.absolute_path(relative_path);
        let removed = match fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(CatalogError::from_io(&path, e)),
        };
        if removed {
            log::debug!("Deleted thumbnail {} (hash {})", relative_path, hash);
        }
        if let Some(shard) = path.parent() {
            self.remove_shard_if_empty(shard);
        }
        Ok(removed)
    }

    fn remove_shard_if_empty(&self, shard: &Path) {
        if shard == self.root || !shard.starts_with(&self.root) {
            return;
        }
        let empty = fs::read_dir(shard)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            match fs::remove_dir(shard) {
                Ok(()) => log::debug!("Removed empty shard {:?}", shard),
                Err(e) => log::warn!("Could not remove empty shard {:?}: {}", shard, e),
            }
        }
    }

    /// List every file in the store, sharded and flat, except the pass lock
    pub fn inventory(&self) -> CatalogResult<Vec<StoredThumbnail>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| CatalogError::from_io(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::from_io(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().map_err(|e| CatalogError::from_io(&entry.path(), e))?;

            if file_type.is_dir() {
                let shard = entry.path();
                let files = fs::read_dir(&shard).map_err(|e| CatalogError::from_io(&shard, e))?;
                for file in files {
                    let file = file.map_err(|e| CatalogError::from_io(&shard, e))?;
                    let file_name = file.file_name().to_string_lossy().to_string();
                    let hash = parse_thumbnail_name(&file_name)
                        .filter(|h| shard_of(h) == name)
                        .map(str::to_string);
                    out.push(StoredThumbnail {
                        relative_path: format!("{}/{}", name, file_name),
                        hash,
                        flat: false,
                    });
                }
            } else if name != LOCK_FILE_NAME {
                out.push(StoredThumbnail {
                    hash: parse_thumbnail_name(&name).map(str::to_string),
                    relative_path: name,
                    flat: true,
                });
            }
        }
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    /// Move legacy `<root>/<hash>.png` files into their shard
    ///
    /// A flat file whose sharded copy already exists is dropped instead.
    pub fn migrate_flat_layout(&self) -> CatalogResult<Vec<MigratedThumbnail>> {
        let mut migrated = Vec::new();
        for stored in self.inventory()?.into_iter().filter(|s| s.flat) {
            let Some(hash) = stored.hash else {
                continue;
            };
            let old = self.absolute_path(&stored.relative_path);
            let new_relative_path = Self::relative_path_for(&hash);
            let new = self.absolute_path(&new_relative_path);

            if new.is_file() {
                fs::remove_file(&old).map_err(|e| CatalogError::from_io(&old, e))?;
            } else {
                if let Some(shard) = new.parent() {
                    fs::create_dir_all(shard).map_err(|e| CatalogError::from_io(shard, e))?;
                }
                fs::rename(&old, &new).map_err(|e| CatalogError::from_io(&old, e))?;
            }
            log::info!("Migrated flat thumbnail {} -> {}", stored.relative_path, new_relative_path);
            migrated.push(MigratedThumbnail {
                hash,
                new_relative_path,
            });
        }
        Ok(migrated)
    }

    /// Remove every empty shard directory; returns how many were removed
    pub fn remove_empty_shards(&self) -> CatalogResult<usize> {
        let mut removed = 0;
        let entries = fs::read_dir(&self.root).map_err(|e| CatalogError::from_io(&self.root, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && fs::read_dir(&path).map(|mut d| d.next().is_none()).unwrap_or(false) {
                fs::remove_dir(&path).map_err(|e| CatalogError::from_io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Shard directory name for a hash
pub fn shard_of(hash: &str) -> &str {
    hash.get(..2).unwrap_or(hash)
}

/// Extract the hash from `<hash>.png`, requiring a hex stem
fn parse_thumbnail_name(name: &str) -> Option<&str> {
    let stem = name.strip_suffix(&format!(".{}", THUMBNAIL_EXTENSION))?;
    (stem.len() >= 2 && stem.chars().all(|c| c.is_ascii_hexdigit())).then_some(stem)
}

/// Fit `img` within `size`×`size` and center it on a transparent square canvas
pub fn render_thumbnail(img: &DynamicImage, size: u32) -> RgbaImage {
    let scaled = img.resize(size, size, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::new(size, size);
    let x = (size - scaled.width().min(size)) / 2;
    let y = (size - scaled.height().min(size)) / 2;
    imageops::overlay(&mut canvas, &scaled, x as i64, y as i64);
    canvas
}
