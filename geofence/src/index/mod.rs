//! Spatial index contract and in-memory implementation.
//!
//! Polygon monitors keep their fence polygon and the last indexed position
//! of every tracked item as handles in a spatial index, so each containment
//! query is a handle-to-handle test instead of rebuilding geometry.
//!
//! # Thread Safety
//!
//! [`SpatialIndex`] implementations are not assumed to be thread-safe. All
//! access goes through [`SharedSpatialIndex`], which serializes every call
//! behind one lock scoped to that single call.

mod memory;
mod shared;

pub use memory::MemorySpatialIndex;
pub use shared::{IndexStats, SharedSpatialIndex};

use thiserror::Error;

use crate::coord::GeoPoint;

/// Opaque handle to a geometry stored in a spatial index.
pub type GeometryHandle = u64;

/// Kind of geometry a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    /// A single position.
    Point,
    /// A closed polygon without holes.
    Polygon,
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometryKind::Point => write!(f, "point"),
            GeometryKind::Polygon => write!(f, "polygon"),
        }
    }
}

/// Failure sentinel returned by index operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// The handle is not (or no longer) present in the index.
    #[error("unknown geometry handle {0}")]
    UnknownHandle(GeometryHandle),

    /// The handle refers to a different kind of geometry.
    #[error("handle {handle} is a {actual}, expected a {expected}")]
    WrongKind {
        handle: GeometryHandle,
        expected: GeometryKind,
        actual: GeometryKind,
    },

    /// Polygon ring is unusable (too few vertices or invalid coordinates).
    #[error("invalid polygon: {0}")]
    InvalidPolygon(String),

    /// Point has invalid coordinates.
    #[error("invalid point {0}")]
    InvalidPoint(GeoPoint),
}

/// Minimum number of distinct vertices for a polygon ring.
pub const MIN_POLYGON_VERTICES: usize = 3;

/// Geometry engine providing point/polygon primitives and containment.
pub trait SpatialIndex: Send {
    /// Insert a point and return its handle.
    fn create_point(&mut self, point: &GeoPoint) -> Result<GeometryHandle, IndexError>;

    /// Move an existing point in place.
    fn update_point(&mut self, handle: GeometryHandle, point: &GeoPoint) -> Result<(), IndexError>;

    /// Insert a polygon from its outer ring. The ring is closed implicitly.
    fn create_polygon(&mut self, ring: &[GeoPoint]) -> Result<GeometryHandle, IndexError>;

    /// Replace the ring of an existing polygon, keeping its handle.
    fn update_polygon(&mut self, handle: GeometryHandle, ring: &[GeoPoint])
        -> Result<(), IndexError>;

    /// Remove a geometry of any kind.
    fn delete(&mut self, handle: GeometryHandle) -> Result<(), IndexError>;

    /// Whether the polygon strictly contains the point.
    fn contains(
        &self,
        polygon: GeometryHandle,
        point: GeometryHandle,
    ) -> Result<bool, IndexError>;

    /// Number of geometries currently stored.
    fn len(&self) -> usize;

    /// Whether the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every stored geometry.
    fn clear(&mut self);
}
