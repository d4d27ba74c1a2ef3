//! Rectangle and closed-shape fences backed by the shared spatial index.
//!
//! The fence polygon is inserted once at construction and updated in place on
//! geometry changes, so its handle is stable for the monitor's lifetime. Each
//! tracked item gets a point handle that is only rewritten after the item has
//! moved further than the move threshold from its last indexed position.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::coord::{centroid, furthest_distance_m, GeoPoint};
use crate::error::{GeofenceError, GeofenceResult};
use crate::fence::Fence;
use crate::index::{GeometryHandle, IndexError, SharedSpatialIndex, MIN_POLYGON_VERTICES};
use crate::item::TrackedItem;
use crate::shape::{Shape, ShapeGeometry};

/// Default movement below which a point is not rewritten, in meters.
pub const DEFAULT_MOVE_THRESHOLD_M: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
struct IndexedPoint {
    handle: GeometryHandle,
    point: GeoPoint,
}

/// Geometry state for a polygon fence.
#[derive(Debug)]
pub struct PolygonMonitor {
    shape_id: String,
    index: SharedSpatialIndex,
    polygon: Option<GeometryHandle>,
    vertices: Vec<GeoPoint>,
    center: GeoPoint,
    points: HashMap<String, IndexedPoint>,
    move_threshold_m: f64,
}

fn polygon_vertices(shape: &Shape) -> GeofenceResult<(Vec<GeoPoint>, GeoPoint)> {
    let vertices = match &shape.geometry {
        ShapeGeometry::Rectangle { corners } => corners.to_vec(),
        ShapeGeometry::ClosedPolyline { points } => points.clone(),
        ShapeGeometry::Circle { .. } => {
            return Err(GeofenceError::invalid_shape(&shape.id, "not a polygon"));
        }
    };
    if vertices.len() < MIN_POLYGON_VERTICES {
        return Err(GeofenceError::invalid_shape(
            &shape.id,
            format!("{} vertices, need at least {}", vertices.len(), MIN_POLYGON_VERTICES),
        ));
    }
    let center = centroid(&vertices).ok_or_else(|| GeofenceError::invalid_shape(&shape.id, "no centroid"))?;
    Ok((vertices, center))
}

impl PolygonMonitor {
    /// Insert the shape's polygon into the index.
    pub fn new(shape: &Shape, index: SharedSpatialIndex, move_threshold_m: f64) -> GeofenceResult<Self> {
        let (vertices, center) = polygon_vertices(shape)?;
        let polygon = index
            .create_polygon(&vertices)
            .map_err(|e| GeofenceError::invalid_shape(&shape.id, e.to_string()))?;

        debug!(shape = %shape.id, handle = polygon, vertices = vertices.len(), "Indexed fence polygon");

        Ok(Self {
            shape_id: shape.id.clone(),
            index,
            polygon: Some(polygon),
            vertices,
            center,
            points: HashMap::new(),
            move_threshold_m: move_threshold_m.max(0.0),
        })
    }

    /// Update the indexed polygon in place. Leaves the monitor untouched on
    /// error.
    pub fn refresh(&mut self, shape: &Shape) -> GeofenceResult<()> {
        let polygon = self.polygon_handle()?;
        let (vertices, center) = polygon_vertices(shape)?;
        self.index
            .update_polygon(polygon, &vertices)
            .map_err(|e| GeofenceError::invalid_shape(&shape.id, e.to_string()))?;
        self.vertices = vertices;
        self.center = center;
        Ok(())
    }

    fn polygon_handle(&self) -> GeofenceResult<GeometryHandle> {
        self.polygon
            .ok_or_else(|| GeofenceError::StaleMonitor(self.shape_id.clone()))
    }

    pub fn center(&self) -> GeoPoint {
        self.center
    }

    pub fn vertices(&self) -> &[GeoPoint] {
        &self.vertices
    }

    /// Largest distance from the centroid to any vertex.
    pub fn furthest_point_range_m(&self) -> f64 {
        furthest_distance_m(&self.center, &self.vertices)
    }

    /// Whether the polygon handle is still held.
    pub fn is_valid(&self) -> bool {
        self.polygon.is_some()
    }

    /// Number of items with a cached point handle.
    pub fn indexed_points(&self) -> usize {
        self.points.len()
    }

    /// Strict point-in-polygon test plus the fence's altitude band.
    pub fn contains(&mut self, fence: &Fence, item: &TrackedItem, location: &GeoPoint) -> GeofenceResult<bool> {
        let polygon = self.polygon_handle()?;
        let point = self.sync_point(&item.uid, location)?;
        let inside = self.index.contains(polygon, point)?;
        Ok(inside && fence.elevation.contains(location.alt, item.elevation_valid))
    }

    /// Return the item's point handle, writing the index only when the item
    /// is new or has moved past the threshold.
    fn sync_point(&mut self, uid: &str, location: &GeoPoint) -> GeofenceResult<GeometryHandle> {
        if let Some(cached) = self.points.get_mut(uid) {
            if cached.point.distance_to(location) <= self.move_threshold_m {
                return Ok(cached.handle);
            }
            match self.index.update_point(cached.handle, location) {
                Ok(()) => {
                    cached.point = *location;
                    return Ok(cached.handle);
                }
                Err(IndexError::UnknownHandle(handle)) => {
                    warn!(shape = %self.shape_id, item = %uid, handle, "Point handle lost, re-inserting");
                    self.points.remove(uid);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let handle = self.index.create_point(location)?;
        self.points.insert(
            uid.to_string(),
            IndexedPoint {
                handle,
                point: *location,
            },
        );
        Ok(handle)
    }

    /// Release the point handle of an item no longer tracked.
    pub fn forget(&mut self, uid: &str) {
        if let Some(cached) = self.points.remove(uid) {
            if let Err(e) = self.index.delete(cached.handle) {
                warn!(shape = %self.shape_id, item = %uid, error = %e, "Failed to delete point");
            }
        }
    }

    /// Release every handle this monitor owns. Safe to call more than once.
    pub fn dispose(&mut self) {
        let uids: Vec<String> = self.points.keys().cloned().collect();
        for uid in uids {
            self.forget(&uid);
        }
        if let Some(polygon) = self.polygon.take() {
            if let Err(e) = self.index.delete(polygon) {
                warn!(shape = %self.shape_id, error = %e, "Failed to delete fence polygon");
            }
        }
    }
}

impl Drop for PolygonMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}
