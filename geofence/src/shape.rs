//! Fence geometry as provided by the drawing layer.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::coord::{centroid, furthest_distance_m, GeoPoint, METERS_PER_KM};

/// Shape kind, used for logging and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeKind {
    Circle,
    Rectangle,
    ClosedPolyline,
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeKind::Circle => write!(f, "circle"),
            ShapeKind::Rectangle => write!(f, "rectangle"),
            ShapeKind::ClosedPolyline => write!(f, "closed shape"),
        }
    }
}

/// Concrete geometry of a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeGeometry {
    /// Concentric range rings around a center.
    Circle {
        center: GeoPoint,
        /// Radius of the innermost ring in meters.
        radius_m: f64,
        /// Number of rings; the fence covers the outermost.
        #[serde(default = "default_rings")]
        rings: i32,
        /// Uids of the center and radius handle markers. These belong to the
        /// shape and are never monitored.
        #[serde(default)]
        anchors: Vec<String>,
    },
    /// Four corners in drawing order.
    Rectangle { corners: [GeoPoint; 4] },
    /// Freeform closed polygon.
    ClosedPolyline { points: Vec<GeoPoint> },
}

fn default_rings() -> i32 {
    1
}

impl ShapeGeometry {
    /// Kind discriminant.
    pub fn kind(&self) -> ShapeKind {
        match self {
            ShapeGeometry::Circle { .. } => ShapeKind::Circle,
            ShapeGeometry::Rectangle { .. } => ShapeKind::Rectangle,
            ShapeGeometry::ClosedPolyline { .. } => ShapeKind::ClosedPolyline,
        }
    }

    /// Geometric center. `None` for a polyline without points.
    pub fn center(&self) -> Option<GeoPoint> {
        match self {
            ShapeGeometry::Circle { center, .. } => Some(*center),
            ShapeGeometry::Rectangle { corners } => centroid(corners),
            ShapeGeometry::ClosedPolyline { points } => centroid(points),
        }
    }

    /// Polygon vertices; empty for circles.
    pub fn vertices(&self) -> &[GeoPoint] {
        match self {
            ShapeGeometry::Circle { .. } => &[],
            ShapeGeometry::Rectangle { corners } => corners,
            ShapeGeometry::ClosedPolyline { points } => points,
        }
    }
}

/// A drawn shape that a fence may be attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    /// Unique shape uid.
    pub id: String,
    /// Human readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Geometry.
    #[serde(flatten)]
    pub geometry: ShapeGeometry,
}

impl Shape {
    /// Create a shape.
    pub fn new(id: impl Into<String>, geometry: ShapeGeometry) -> Self {
        Self {
            id: id.into(),
            name: None,
            geometry,
        }
    }

    /// Circle with a single ring.
    pub fn circle(id: impl Into<String>, center: GeoPoint, radius_m: f64) -> Self {
        Self::new(
            id,
            ShapeGeometry::Circle {
                center,
                radius_m,
                rings: 1,
                anchors: Vec::new(),
            },
        )
    }

    /// Closed polygon.
    pub fn polygon(id: impl Into<String>, points: Vec<GeoPoint>) -> Self {
        Self::new(id, ShapeGeometry::ClosedPolyline { points })
    }

    /// Rectangle from four corners.
    pub fn rectangle(id: impl Into<String>, corners: [GeoPoint; 4]) -> Self {
        Self::new(id, ShapeGeometry::Rectangle { corners })
    }

    /// Display name, falling back to the uid.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Initial search range estimate in whole kilometers: the shape's
    /// furthest extent from its center plus `margin_km`.
    pub fn estimated_range_km(&self, margin_km: u32, max_rings: i32) -> u32 {
        let extent_m = match &self.geometry {
            ShapeGeometry::Circle {
                radius_m, rings, ..
            } => {
                let rings = if (1..=max_rings).contains(rings) { *rings } else { 1 };
                radius_m.max(0.0) * rings as f64
            }
            ShapeGeometry::Rectangle { .. } | ShapeGeometry::ClosedPolyline { .. } => {
                match self.geometry.center() {
                    Some(center) => furthest_distance_m(&center, self.geometry.vertices()),
                    None => 0.0,
                }
            }
        };
        margin_km.saturating_add((extent_m / METERS_PER_KM) as u32)
    }
}

/// Resolves shape uids to geometry.
pub trait ShapeProvider: Send + Sync {
    /// Look up a shape.
    fn shape(&self, id: &str) -> Option<Shape>;

    /// Whether a shape exists.
    fn exists(&self, id: &str) -> bool {
        self.shape(id).is_some()
    }
}

/// In-memory [`ShapeProvider`].
#[derive(Debug, Default)]
pub struct MemoryShapeStore {
    shapes: RwLock<HashMap<String, Shape>>,
}

impl MemoryShapeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a shape.
    pub fn upsert(&self, shape: Shape) {
        self.shapes.write().insert(shape.id.clone(), shape);
    }

    /// Remove a shape.
    pub fn remove(&self, id: &str) -> Option<Shape> {
        self.shapes.write().remove(id)
    }
}

impl ShapeProvider for MemoryShapeStore {
    fn shape(&self, id: &str) -> Option<Shape> {
        self.shapes.read().get(id).cloned()
    }

    fn exists(&self, id: &str) -> bool {
        self.shapes.read().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circle_range_estimate() {
        let shape = Shape::new(
            "c",
            ShapeGeometry::Circle {
                center: GeoPoint::new(0.0, 0.0),
                radius_m: 2_000.0,
                rings: 3,
                anchors: vec![],
            },
        );
        assert_eq!(shape.estimated_range_km(75, 25), 81);
    }

    #[test]
    fn test_circle_range_estimate_clamps_rings() {
        let shape = Shape::new(
            "c",
            ShapeGeometry::Circle {
                center: GeoPoint::new(0.0, 0.0),
                radius_m: 2_000.0,
                rings: 99,
                anchors: vec![],
            },
        );
        assert_eq!(shape.estimated_range_km(75, 25), 77);
    }

    #[test]
    fn test_polygon_range_estimate() {
        let center = GeoPoint::new(0.0, 0.0);
        let points = vec![
            center.destination(0.0, 5_000.0),
            center.destination(120.0, 5_000.0),
            center.destination(240.0, 5_000.0),
        ];
        let shape = Shape::polygon("p", points);
        // Centroid is close to but not exactly the origin
        let range = shape.estimated_range_km(75, 25);
        assert!((79..=81).contains(&range), "got {}", range);
    }

    #[test]
    fn test_kind_and_display_name() {
        let mut shape = Shape::circle("c1", GeoPoint::new(0.0, 0.0), 10.0);
        assert_eq!(shape.geometry.kind(), ShapeKind::Circle);
        assert_eq!(shape.display_name(), "c1");
        shape.name = Some("Perimeter".into());
        assert_eq!(shape.display_name(), "Perimeter");
    }

    #[test]
    fn test_deserialize_tagged_geometry() {
        let json = r#"{"id":"r1","kind":"rectangle","corners":[
            {"lat":0.0,"lon":0.0},{"lat":0.0,"lon":1.0},
            {"lat":1.0,"lon":1.0},{"lat":1.0,"lon":0.0}]}"#;
        let shape: Shape = serde_json::from_str(json).unwrap();
        assert_eq!(shape.geometry.kind(), ShapeKind::Rectangle);
        assert_eq!(shape.geometry.vertices().len(), 4);
    }

    #[test]
    fn test_store() {
        let store = MemoryShapeStore::new();
        store.upsert(Shape::circle("c1", GeoPoint::new(0.0, 0.0), 10.0));
        assert!(store.exists("c1"));
        assert!(store.remove("c1").is_some());
        assert!(!store.exists("c1"));
    }
}
