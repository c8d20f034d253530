//! Nearest-city lookup for GPS coordinates

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CatalogError, CatalogResult};

/// Mean Earth radius in kilometres
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A known city
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Resolves coordinates to the closest known city
pub trait CityLookup: Send + Sync {
    fn nearest_city(&self, latitude: f64, longitude: f64) -> Option<City>;
}

/// (name, country, latitude, longitude)
const BUILTIN_CITIES: &[(&str, &str, f64, f64)] = &[
    ("London", "United Kingdom", 51.5074, -0.1278),
    ("Paris", "France", 48.8566, 2.3522),
    ("Berlin", "Germany", 52.5200, 13.4050),
    ("Madrid", "Spain", 40.4168, -3.7038),
    ("Rome", "Italy", 41.9028, 12.4964),
    ("Amsterdam", "Netherlands", 52.3676, 4.9041),
    ("Stockholm", "Sweden", 59.3293, 18.0686),
    ("Moscow", "Russia", 55.7558, 37.6173),
    ("Istanbul", "Turkey", 41.0082, 28.9784),
    ("Cairo", "Egypt", 30.0444, 31.2357),
    ("Lagos", "Nigeria", 6.5244, 3.3792),
    ("Nairobi", "Kenya", -1.2921, 36.8219),
    ("Johannesburg", "South Africa", -26.2041, 28.0473),
    ("Dubai", "United Arab Emirates", 25.2048, 55.2708),
    ("Mumbai", "India", 19.0760, 72.8777),
    ("Delhi", "India", 28.7041, 77.1025),
    ("Bangkok", "Thailand", 13.7563, 100.5018),
    ("Singapore", "Singapore", 1.3521, 103.8198),
    ("Beijing", "China", 39.9042, 116.4074),
    ("Shanghai", "China", 31.2304, 121.4737),
    ("Seoul", "South Korea", 37.5665, 126.9780),
    ("Tokyo", "Japan", 35.6895, 139.6917),
    ("Sydney", "Australia", -33.8688, 151.2093),
    ("Auckland", "New Zealand", -36.8485, 174.7633),
    ("Honolulu", "United States", 21.3069, -157.8583),
    ("Los Angeles", "United States", 34.0522, -118.2437),
    ("San Francisco", "United States", 37.7749, -122.4194),
    ("Seattle", "United States", 47.6062, -122.3321),
    ("Denver", "United States", 39.7392, -104.9903),
    ("Chicago", "United States", 41.8781, -87.6298),
    ("New York", "United States", 40.7128, -74.0060),
    ("Toronto", "Canada", 43.6532, -79.3832),
    ("Mexico City", "Mexico", 19.4326, -99.1332),
    ("Bogota", "Colombia", 4.7110, -74.0721),
    ("Lima", "Peru", -12.0464, -77.0428),
    ("Sao Paulo", "Brazil", -23.5505, -46.6333),
    ("Buenos Aires", "Argentina", -34.6037, -58.3816),
];

#[derive(Debug, Deserialize)]
struct CityRow {
    city: String,
    lat: f64,
    lng: f64,
    country: String,
}

/// Linear-scan geolocator over a static list of cities
#[derive(Debug, Clone, Default)]
pub struct GeoLocator {
    cities: Vec<City>,
}

impl GeoLocator {
    /// A locator with no cities; every lookup returns `None`
    pub fn empty() -> Self {
        Self::default()
    }

    /// A locator backed by the built-in list of major cities
    pub fn builtin() -> Self {
        let cities = BUILTIN_CITIES
            .iter()
            .map(|&(name, country, latitude, longitude)| City {
                name: name.to_string(),
                country: country.to_string(),
                latitude,
                longitude,
            })
            .collect();
        Self { cities }
    }

    /// Load cities from a CSV with a `city,lat,lng,country` header
    pub fn from_csv(path: &Path) -> CatalogResult<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            CatalogError::config_error(Some(path.to_path_buf()), format!("Cannot open city list: {}", e))
        })?;
        let mut cities = Vec::new();
        for row in reader.deserialize::<CityRow>() {
            let row = row.map_err(|e| {
                CatalogError::config_error(Some(path.to_path_buf()), format!("Bad city row: {}", e))
            })?;
            cities.push(City {
                name: row.city,
                country: row.country,
                latitude: row.lat,
                longitude: row.lng,
            });
        }
        log::info!("Loaded {} cities from {:?}", cities.len(), path);
        Ok(Self { cities })
    }

    /// Known cities
    pub fn cities(&self) -> &[City] {
        &self.cities
    }
}

impl CityLookup for GeoLocator {
    fn nearest_city(&self, latitude: f64, longitude: f64) -> Option<City> {
        self.cities
            .iter()
            .map(|city| (haversine_km(latitude, longitude, city.latitude, city.longitude), city))
            .filter(|(distance, _)| distance.is_finite())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, city)| city.clone())
    }
}

/// Great-circle distance between two points in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
