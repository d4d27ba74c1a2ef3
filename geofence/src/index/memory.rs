//! In-process spatial index backed by `geo` geometries.

use std::collections::HashMap;

use geo::{Contains, LineString, Point, Polygon};

use super::{GeometryHandle, GeometryKind, IndexError, SpatialIndex, MIN_POLYGON_VERTICES};
use crate::coord::GeoPoint;

#[derive(Debug, Clone)]
enum Stored {
    Point(Point<f64>),
    Polygon(Polygon<f64>),
}

impl Stored {
    fn kind(&self) -> GeometryKind {
        match self {
            Stored::Point(_) => GeometryKind::Point,
            Stored::Polygon(_) => GeometryKind::Polygon,
        }
    }
}

/// Heap-allocated spatial index keyed by monotonically increasing handles.
///
/// Handles are never reused, so a stale handle held by a disposed monitor
/// can never alias a newer geometry.
#[derive(Debug, Default)]
pub struct MemorySpatialIndex {
    geometries: HashMap<GeometryHandle, Stored>,
    next_handle: GeometryHandle,
}

impl MemorySpatialIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            geometries: HashMap::new(),
            next_handle: 1,
        }
    }

    fn insert(&mut self, geometry: Stored) -> GeometryHandle {
        if self.next_handle == 0 {
            self.next_handle = 1;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.geometries.insert(handle, geometry);
        handle
    }

    fn get(&self, handle: GeometryHandle) -> Result<&Stored, IndexError> {
        self.geometries
            .get(&handle)
            .ok_or(IndexError::UnknownHandle(handle))
    }

    fn get_mut(&mut self, handle: GeometryHandle) -> Result<&mut Stored, IndexError> {
        self.geometries
            .get_mut(&handle)
            .ok_or(IndexError::UnknownHandle(handle))
    }
}

fn to_point(point: &GeoPoint) -> Result<Point<f64>, IndexError> {
    if !point.is_valid() {
        return Err(IndexError::InvalidPoint(*point));
    }
    Ok(point.to_geo())
}

fn to_polygon(ring: &[GeoPoint]) -> Result<Polygon<f64>, IndexError> {
    if let Some(bad) = ring.iter().find(|p| !p.is_valid()) {
        return Err(IndexError::InvalidPolygon(format!("invalid vertex {}", bad)));
    }

    let mut coords: Vec<(f64, f64)> = ring.iter().map(|p| (p.lon, p.lat)).collect();
    // Drop an explicit closing vertex; `Polygon::new` closes the ring.
    if coords.len() > 1 && coords.first() == coords.last() {
        coords.pop();
    }
    coords.dedup();

    if coords.len() < MIN_POLYGON_VERTICES {
        return Err(IndexError::InvalidPolygon(format!(
            "{} distinct vertices (min: {})",
            coords.len(),
            MIN_POLYGON_VERTICES
        )));
    }

    Ok(Polygon::new(LineString::from(coords), vec![]))
}

impl SpatialIndex for MemorySpatialIndex {
    fn create_point(&mut self, point: &GeoPoint) -> Result<GeometryHandle, IndexError> {
        let point = to_point(point)?;
        Ok(self.insert(Stored::Point(point)))
    }

    fn update_point(&mut self, handle: GeometryHandle, point: &GeoPoint) -> Result<(), IndexError> {
        let new_point = to_point(point)?;
        match self.get_mut(handle)? {
            Stored::Point(p) => {
                *p = new_point;
                Ok(())
            }
            other => Err(IndexError::WrongKind {
                handle,
                expected: GeometryKind::Point,
                actual: other.kind(),
            }),
        }
    }

    fn create_polygon(&mut self, ring: &[GeoPoint]) -> Result<GeometryHandle, IndexError> {
        let polygon = to_polygon(ring)?;
        Ok(self.insert(Stored::Polygon(polygon)))
    }

    fn update_polygon(
        &mut self,
        handle: GeometryHandle,
        ring: &[GeoPoint],
    ) -> Result<(), IndexError> {
        let new_polygon = to_polygon(ring)?;
        match self.get_mut(handle)? {
            Stored::Polygon(p) => {
                *p = new_polygon;
                Ok(())
            }
            other => Err(IndexError::WrongKind {
                handle,
                expected: GeometryKind::Polygon,
                actual: other.kind(),
            }),
        }
    }

    fn delete(&mut self, handle: GeometryHandle) -> Result<(), IndexError> {
        self.geometries
            .remove(&handle)
            .map(|_| ())
            .ok_or(IndexError::UnknownHandle(handle))
    }

    fn contains(
        &self,
        polygon: GeometryHandle,
        point: GeometryHandle,
    ) -> Result<bool, IndexError> {
        let polygon_geom = match self.get(polygon)? {
            Stored::Polygon(p) => p,
            other => {
                return Err(IndexError::WrongKind {
                    handle: polygon,
                    expected: GeometryKind::Polygon,
                    actual: other.kind(),
                })
            }
        };
        let point_geom = match self.get(point)? {
            Stored::Point(p) => p,
            other => {
                return Err(IndexError::WrongKind {
                    handle: point,
                    expected: GeometryKind::Point,
                    actual: other.kind(),
                })
            }
        };
        Ok(polygon_geom.contains(point_geom))
    }

    fn len(&self) -> usize {
        self.geometries.len()
    }

    fn clear(&mut self) {
        self.geometries.clear();
    }
}
