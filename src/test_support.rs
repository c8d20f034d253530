//! Fixture helpers shared by unit tests

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::time::{Duration, SystemTime};

use crate::catalog::{CatalogStore, SqliteCatalog};
use crate::classifier::Classify;
use crate::error::{CatalogError, CatalogResult};
use crate::models::{MediaRecord, TagScore};

/// A degrees/minutes/seconds triple as EXIF rationals
pub type Dms = [(u32, u32); 3];

/// GPS fixture for (34°5′12.34″ N, 118°30′56.78″ W)
pub const LA_LAT: Dms = [(34, 1), (5, 1), (1234, 100)];
pub const LA_LON: Dms = [(118, 1), (30, 1), (5678, 100)];

/// Encode a solid-color JPEG
pub fn jpeg_bytes(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .unwrap();
    buf
}

/// Write a solid-color JPEG to `path`
pub fn write_jpeg(path: &Path, width: u32, height: u32, color: [u8; 3]) {
    std::fs::write(path, jpeg_bytes(width, height, color)).unwrap();
}

/// Write a solid-color PNG to `path`
pub fn write_png(path: &Path, width: u32, height: u32, color: [u8; 4]) {
    RgbaImage::from_pixel(width, height, Rgba(color))
        .save_with_format(path, ImageFormat::Png)
        .unwrap();
}

/// Write a JPEG carrying an EXIF capture date and GPS block
pub fn write_jpeg_with_exif(
    path: &Path,
    width: u32,
    height: u32,
    date: &str,
    lat: (Dms, u8),
    lon: (Dms, u8),
) {
    let jpeg = jpeg_bytes(width, height, [200, 120, 40]);
    let tiff = exif_tiff(date, lat, lon);

    let mut out = Vec::with_capacity(jpeg.len() + tiff.len() + 10);
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
    out.extend_from_slice(b"Exif\0\0");
    out.extend_from_slice(&tiff);
    out.extend_from_slice(&jpeg[2..]);
    std::fs::write(path, out).unwrap();
}

/// Little-endian TIFF block: IFD0 -> Exif IFD (DateTimeOriginal) and GPS IFD
fn exif_tiff(date: &str, lat: (Dms, u8), lon: (Dms, u8)) -> Vec<u8> {
    const IFD0: u32 = 8;
    const EXIF_IFD: u32 = IFD0 + 2 + 2 * 12 + 4;
    const GPS_IFD: u32 = EXIF_IFD + 2 + 12 + 4;
    const DATE: u32 = GPS_IFD + 2 + 4 * 12 + 4;
    const LAT: u32 = DATE + 20;
    const LON: u32 = LAT + 24;

    let mut date_bytes = date.as_bytes().to_vec();
    date_bytes.resize(19, b' ');
    date_bytes.push(0);

    let mut t = Vec::new();
    t.extend_from_slice(b"II");
    t.extend_from_slice(&42u16.to_le_bytes());
    t.extend_from_slice(&IFD0.to_le_bytes());

    let entry = |t: &mut Vec<u8>, tag: u16, typ: u16, count: u32, value: [u8; 4]| {
        t.extend_from_slice(&tag.to_le_bytes());
        t.extend_from_slice(&typ.to_le_bytes());
        t.extend_from_slice(&count.to_le_bytes());
        t.extend_from_slice(&value);
    };

    // IFD0
    t.extend_from_slice(&2u16.to_le_bytes());
    entry(&mut t, 0x8769, 4, 1, EXIF_IFD.to_le_bytes());
    entry(&mut t, 0x8825, 4, 1, GPS_IFD.to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());

    // Exif IFD
    t.extend_from_slice(&1u16.to_le_bytes());
    entry(&mut t, 0x9003, 2, 20, DATE.to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());

    // GPS IFD
    t.extend_from_slice(&4u16.to_le_bytes());
    entry(&mut t, 0x0001, 2, 2, [lat.1, 0, 0, 0]);
    entry(&mut t, 0x0002, 5, 3, LAT.to_le_bytes());
    entry(&mut t, 0x0003, 2, 2, [lon.1, 0, 0, 0]);
    entry(&mut t, 0x0004, 5, 3, LON.to_le_bytes());
    t.extend_from_slice(&0u32.to_le_bytes());

    assert_eq!(t.len() as u32, DATE);
    t.extend_from_slice(&date_bytes);
    for (num, denom) in lat.0.iter().chain(lon.0.iter()) {
        t.extend_from_slice(&num.to_le_bytes());
        t.extend_from_slice(&denom.to_le_bytes());
    }
    assert_eq!(t.len() as u32, LON + 24);
    t
}

/// Move a file's modification time by `secs` seconds
pub fn shift_mtime(path: &Path, secs: i64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    let current = file.metadata().unwrap().modified().unwrap();
    let shifted = if secs >= 0 {
        current + Duration::from_secs(secs as u64)
    } else {
        current - Duration::from_secs(secs.unsigned_abs())
    };
    file.set_modified(shifted).unwrap();
}

/// Modification time of a file
pub fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

/// Classifier that blocks each call until released, to hold a pass open
pub struct BlockingClassifier {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl BlockingClassifier {
    /// Returns the classifier, a receiver signalled on every call, and the
    /// sender that lets one call proceed
    pub fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let classifier = Self {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (classifier, entered_rx, release_tx)
    }
}

impl Classify for BlockingClassifier {
    fn model_id(&self) -> &str {
        "blocking"
    }

    fn classify(&self, _path: &Path) -> CatalogResult<Vec<TagScore>> {
        self.entered.lock().unwrap().send(()).ok();
        self.release.lock().unwrap().recv().ok();
        Ok(Vec::new())
    }
}

/// In-memory catalog that refuses selected operations
pub struct FailingCatalog {
    inner: SqliteCatalog,
    refused_paths: Mutex<HashSet<String>>,
    refuse_lookups: AtomicBool,
}

impl FailingCatalog {
    pub fn new() -> Self {
        Self {
            inner: SqliteCatalog::open_memory().unwrap(),
            refused_paths: Mutex::new(HashSet::new()),
            refuse_lookups: AtomicBool::new(false),
        }
    }

    /// Fail every upsert of a record at `relative_path`
    pub fn refuse_upserts_at(&self, relative_path: &str) {
        self.refused_paths.lock().unwrap().insert(relative_path.to_string());
    }

    /// Fail every `get_by_hash`
    pub fn refuse_hash_lookups(&self) {
        self.refuse_lookups.store(true, Ordering::SeqCst);
    }

    /// Accept everything again
    pub fn recover(&self) {
        self.refused_paths.lock().unwrap().clear();
        self.refuse_lookups.store(false, Ordering::SeqCst);
    }
}

impl CatalogStore for FailingCatalog {
    fn upsert(&self, record: &MediaRecord) -> CatalogResult<()> {
        if self.refused_paths.lock().unwrap().contains(&record.relative_path) {
            return Err(CatalogError::database_error(format!("disk full writing {}", record.relative_path)));
        }
        self.inner.upsert(record)
    }

    fn get_by_hash(&self, hash: &str) -> CatalogResult<Option<MediaRecord>> {
        if self.refuse_lookups.load(Ordering::SeqCst) {
            return Err(CatalogError::database_error("database is locked"));
        }
        self.inner.get_by_hash(hash)
    }

    fn get_by_path(&self, relative_path: &str) -> CatalogResult<Option<MediaRecord>> {
        self.inner.get_by_path(relative_path)
    }

    fn delete_by_hash(&self, hash: &str) -> CatalogResult<bool> {
        self.inner.delete_by_hash(hash)
    }

    fn list_all(&self) -> CatalogResult<Vec<MediaRecord>> {
        self.inner.list_all()
    }

    fn list_paths(&self) -> CatalogResult<Vec<String>> {
        self.inner.list_paths()
    }

    fn list_hashes_with_thumbnails(&self) -> CatalogResult<HashMap<String, String>> {
        self.inner.list_hashes_with_thumbnails()
    }
}
