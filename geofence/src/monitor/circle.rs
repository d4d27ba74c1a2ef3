//! Range-ring fences.
//!
//! Containment is a great-circle distance test from the ring center against
//! the outermost ring. No spatial index is involved.

use std::collections::HashSet;

use tracing::warn;

use super::trigger::{should_fire, TriggerState};
use crate::coord::{GeoPoint, METERS_PER_KM};
use crate::error::{GeofenceError, GeofenceResult};
use crate::fence::{Fence, Trigger};
use crate::item::TrackedItem;
use crate::shape::{Shape, ShapeGeometry};

/// Highest ring count honored. Anything outside `1..=MAX_RINGS` is treated
/// as a single ring.
pub const MAX_RINGS: i32 = 25;

/// Correct an out-of-range ring count to 1.
pub fn clamp_rings(rings: i32) -> i32 {
    if (1..=MAX_RINGS).contains(&rings) {
        rings
    } else {
        warn!(rings, max = MAX_RINGS, "Ring count out of range, using 1");
        1
    }
}

/// Geometry state for a circle fence.
#[derive(Debug, Clone)]
pub struct CircleMonitor {
    center: GeoPoint,
    radius_m: f64,
    rings: i32,
    anchors: HashSet<String>,
}

impl CircleMonitor {
    /// Build from a circle shape.
    pub fn from_shape(shape: &Shape) -> GeofenceResult<Self> {
        let ShapeGeometry::Circle {
            center,
            radius_m,
            rings,
            anchors,
        } = &shape.geometry
        else {
            return Err(GeofenceError::invalid_shape(&shape.id, "not a circle"));
        };

        if !center.is_valid() {
            return Err(GeofenceError::invalid_shape(&shape.id, format!("bad center {}", center)));
        }
        if !radius_m.is_finite() || *radius_m <= 0.0 {
            return Err(GeofenceError::invalid_shape(
                &shape.id,
                format!("radius must be positive, got {}", radius_m),
            ));
        }

        Ok(Self {
            center: *center,
            radius_m: *radius_m,
            rings: clamp_rings(*rings),
            anchors: anchors.iter().cloned().collect(),
        })
    }

    /// Apply a geometry change. Leaves the monitor untouched on error.
    pub fn refresh(&mut self, shape: &Shape) -> GeofenceResult<()> {
        *self = Self::from_shape(shape)?;
        Ok(())
    }

    pub fn center(&self) -> GeoPoint {
        self.center
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn rings(&self) -> i32 {
        self.rings
    }

    /// Radius of the outermost ring.
    pub fn furthest_point_range_m(&self) -> f64 {
        self.radius_m * self.rings as f64
    }

    /// Whether the uid is one of the circle's own handle markers.
    pub fn is_anchor(&self, uid: &str) -> bool {
        self.anchors.contains(uid)
    }

    /// Inclusive distance test plus the fence's altitude band.
    pub fn contains(&self, fence: &Fence, item: &TrackedItem, location: &GeoPoint) -> bool {
        let distance = self.center.distance_to(location);
        distance <= self.furthest_point_range_m()
            && fence.elevation.contains(location.alt, item.elevation_valid)
    }
}

/// One-shot circular test without a live monitor.
///
/// Used to pick candidates around a fence before it is monitored. There is
/// no previous state and no altitude test. Items without a location never
/// pass.
pub fn quick_check(center: &GeoPoint, radius_km: f64, trigger: Trigger, item: &TrackedItem) -> bool {
    let Some(location) = item.location else {
        return false;
    };
    let inside = center.distance_to(&location) <= radius_km * METERS_PER_KM;
    should_fire(trigger, TriggerState::from_inside(inside), None)
}

/// [`quick_check`] over a batch, returning the items that pass.
pub fn quick_check_all<'a, I>(center: &GeoPoint, radius_km: f64, trigger: Trigger, items: I) -> Vec<TrackedItem>
where
    I: IntoIterator<Item = &'a TrackedItem>,
{
    items
        .into_iter()
        .filter(|item| quick_check(center, radius_km, trigger, item))
        .cloned()
        .collect()
}
