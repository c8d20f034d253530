//! Metadata extraction
//!
//! Reads pixel dimensions, capture time and GPS position from image files.
//! Every failure degrades to a best-effort default; nothing here aborts the
//! processing of a file.

use chrono::NaiveDateTime;
use exif::{Exif, In, Tag, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::error::{CatalogError, CatalogResult};
use crate::geo::CityLookup;
use crate::models::{system_time_to_secs, MediaType};

/// Capture-time tags in order of preference
const CAPTURE_TIME_TAGS: [Tag; 3] = [Tag::DateTimeOriginal, Tag::DateTimeDigitized, Tag::DateTime];

/// Accepted layouts for EXIF date strings
const CAPTURE_TIME_FORMATS: [&str; 2] = ["%Y:%m:%d %H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Metadata derived for one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// EXIF capture time if present, else filesystem creation time
    pub capture_timestamp: i64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// Extracts dimensions, capture time and location
#[derive(Clone)]
pub struct MetadataExtractor {
    geo: Arc<dyn CityLookup>,
}

impl MetadataExtractor {
    /// Create an extractor resolving coordinates through `geo`
    pub fn new(geo: Arc<dyn CityLookup>) -> Self {
        Self { geo }
    }

    /// Extract metadata for a file of the given media type
    ///
    /// `fs_meta` supplies the fallback timestamp when no EXIF date parses.
    pub fn extract(
        &self,
        path: &Path,
        media_type: MediaType,
        fs_meta: &std::fs::Metadata,
    ) -> MediaMetadata {
        let mut metadata = MediaMetadata {
            capture_timestamp: filesystem_timestamp(fs_meta),
            ..Default::default()
        };

        if media_type != MediaType::Image {
            return metadata;
        }

        match image::image_dimensions(path) {
            Ok((w, h)) => {
                metadata.width = Some(w);
                metadata.height = Some(h);
            }
            Err(e) => log::warn!("Could not read dimensions of {:?}: {}", path, e),
        }

        let exif = match read_exif(path) {
            Ok(Some(exif)) => exif,
            Ok(None) => return metadata,
            Err(e) => {
                log::warn!("{}", e);
                return metadata;
            }
        };

        if let Some(ts) = capture_timestamp(&exif) {
            metadata.capture_timestamp = ts;
        }

        let latitude = gps_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, 90.0);
        let longitude = gps_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, 180.0);
        match (latitude, longitude) {
            (Ok(Some(lat)), Ok(Some(lon))) => {
                metadata.latitude = Some(lat);
                metadata.longitude = Some(lon);
                if let Some(city) = self.geo.nearest_city(lat, lon) {
                    metadata.city = Some(city.name);
                    metadata.country = Some(city.country);
                } else {
                    log::debug!("No known city near ({}, {}) for {:?}", lat, lon, path);
                }
            }
            (Ok(None), Ok(None)) => {}
            (lat, lon) => {
                log::warn!(
                    "Ignoring incomplete or malformed GPS data in {:?} (lat: {:?}, lon: {:?})",
                    path,
                    lat,
                    lon
                );
            }
        }

        metadata
    }
}

/// Creation time if the platform reports one, otherwise modification time
fn filesystem_timestamp(fs_meta: &std::fs::Metadata) -> i64 {
    fs_meta
        .created()
        .or_else(|_| fs_meta.modified())
        .map(system_time_to_secs)
        .unwrap_or(0)
}

/// EXIF block of an image; `Ok(None)` when the file carries none
fn read_exif(path: &Path) -> CatalogResult<Option<Exif>> {
    let file = File::open(path).map_err(|e| CatalogError::from_io(path, e))?;
    match exif::Reader::new().read_from_container(&mut BufReader::new(file)) {
        Ok(exif) => Ok(Some(exif)),
        Err(exif::Error::NotFound(_)) => Ok(None),
        Err(e) => Err(CatalogError::metadata_error(
            path.to_path_buf(),
            format!("Corrupt EXIF: {}", e),
        )),
    }
}

fn capture_timestamp(exif: &Exif) -> Option<i64> {
    CAPTURE_TIME_TAGS.iter().find_map(|&tag| {
        let field = exif.get_field(tag, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(parts) => parts
                .first()
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .and_then(parse_exif_datetime),
            _ => None,
        }
    })
}

/// Parse an EXIF date string into a Unix timestamp, interpreted as UTC
pub fn parse_exif_datetime(text: &str) -> Option<i64> {
    let text = text.trim_matches(|c: char| c == '"' || c == '\0' || c.is_whitespace());
    CAPTURE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.and_utc().timestamp())
}

/// Read one GPS axis
///
/// `Ok(None)` means the axis is absent; `Err` carries why present data was rejected.
fn gps_coordinate(exif: &Exif, coord_tag: Tag, ref_tag: Tag, limit: f64) -> Result<Option<f64>, String> {
    let coord = exif.get_field(coord_tag, In::PRIMARY);
    let reference = exif.get_field(ref_tag, In::PRIMARY);
    let (coord, reference) = match (coord, reference) {
        (None, None) => return Ok(None),
        (Some(c), Some(r)) => (c, r),
        _ => return Err(format!("{} present without its reference", coord_tag)),
    };

    let parts = match &coord.value {
        Value::Rational(v) if v.len() >= 3 => {
            let mut out = [0.0f64; 3];
            for (slot, r) in out.iter_mut().zip(v.iter()) {
                if r.denom == 0 {
                    return Err(format!("{} has a zero denominator", coord_tag));
                }
                *slot = r.num as f64 / r.denom as f64;
            }
            out
        }
        other => return Err(format!("{} has unexpected value {:?}", coord_tag, other)),
    };

    let reference = match &reference.value {
        Value::Ascii(v) => v.first().and_then(|s| s.first()).map(|&b| b as char),
        _ => None,
    }
    .ok_or_else(|| format!("{} is not a single character", ref_tag))?;

    let decimal = dms_to_decimal(parts[0], parts[1], parts[2], reference)
        .ok_or_else(|| format!("{} could not be converted", coord_tag))?;
    if decimal.abs() > limit {
        return Err(format!("{} out of range: {}", coord_tag, decimal));
    }
    Ok(Some(decimal))
}

/// Convert degrees/minutes/seconds plus hemisphere to signed decimal degrees
///
/// Returns `None` for non-finite or negative components and unknown references.
pub fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64, reference: char) -> Option<f64> {
    if [degrees, minutes, seconds]
        .iter()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return None;
    }
    let value = degrees + minutes / 60.0 + seconds / 3600.0;
    match reference.to_ascii_uppercase() {
        'N' | 'E' => Some(value),
        'S' | 'W' => Some(-value),
        _ => None,
    }
}
