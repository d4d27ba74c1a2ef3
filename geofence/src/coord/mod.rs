//! Geographic coordinate primitives.
//!
//! Provides the [`GeoPoint`] type used for fence geometry and item positions,
//! plus great-circle distance helpers. Distances are computed with the
//! haversine formula from the `geo` crate and are always in meters.

use geo::{Destination, Distance, Haversine, Point};
use serde::{Deserialize, Serialize};

/// Minimum valid latitude in degrees.
pub const MIN_LAT: f64 = -90.0;
/// Maximum valid latitude in degrees.
pub const MAX_LAT: f64 = 90.0;
/// Minimum valid longitude in degrees.
pub const MIN_LON: f64 = -180.0;
/// Maximum valid longitude in degrees.
pub const MAX_LON: f64 = 180.0;

/// Meters per kilometer.
pub const METERS_PER_KM: f64 = 1000.0;

/// A WGS84 position with optional altitude.
///
/// Altitude is height above ellipsoid in meters. `None` means the altitude is
/// unknown, which is distinct from an altitude of zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Altitude in meters HAE, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl GeoPoint {
    /// Create a point without altitude.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            alt: None,
        }
    }

    /// Create a point with an altitude in meters HAE.
    pub fn with_alt(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            lat,
            lon,
            alt: Some(alt),
        }
    }

    /// Whether latitude and longitude are finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (MIN_LAT..=MAX_LAT).contains(&self.lat)
            && (MIN_LON..=MAX_LON).contains(&self.lon)
    }

    /// Great-circle distance to another point in meters.
    #[inline]
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        distance_m(self, other)
    }

    /// Convert to a `geo` point (x = longitude, y = latitude).
    #[inline]
    pub fn to_geo(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    /// Return a point displaced from this one by a bearing and distance,
    /// keeping the altitude.
    pub fn destination(&self, bearing_deg: f64, distance_m: f64) -> GeoPoint {
        let point = Haversine::destination(self.to_geo(), bearing_deg, distance_m);
        GeoPoint {
            lat: point.y(),
            lon: normalize_lon(point.x()),
            alt: self.alt,
        }
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.alt {
            Some(alt) => write!(f, "({:.6}, {:.6}, {:.1}m)", self.lat, self.lon, alt),
            None => write!(f, "({:.6}, {:.6})", self.lat, self.lon),
        }
    }
}

/// Great-circle distance between two points in meters.
#[inline]
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    Haversine::distance(a.to_geo(), b.to_geo())
}

/// Arithmetic mean of a set of points.
///
/// Good enough for fence-sized polygons that do not straddle the antimeridian.
/// Returns `None` for an empty slice.
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lat, lon) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.lat, lon + p.lon));
    Some(GeoPoint::new(lat / n, lon / n))
}

/// Largest distance in meters from `center` to any of `points`.
pub fn furthest_distance_m(center: &GeoPoint, points: &[GeoPoint]) -> f64 {
    points
        .iter()
        .map(|p| distance_m(center, p))
        .fold(0.0, f64::max)
}

fn normalize_lon(lon: f64) -> f64 {
    let mut lon = lon;
    while lon > MAX_LON {
        lon -= 360.0;
    }
    while lon < MIN_LON {
        lon += 360.0;
    }
    lon
}
