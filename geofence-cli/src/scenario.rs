//! Scenario files: shapes, items, fences and a script of item movements.
//!
//! ```json
//! {
//!   "shapes": [{ "id": "S1", "kind": "circle", "center": { "lat": 0, "lon": 0 }, "radius_m": 100 }],
//!   "items": [{ "uid": "U1", "item_type": "a-f-G", "location": { "lat": 0, "lon": 0.002 } }],
//!   "fences": [{ "shape_id": "S1", "trigger": "Entry", "monitored_type": "All" }],
//!   "steps": [
//!     { "ticks": 1 },
//!     { "moves": [{ "uid": "U1", "lat": 0, "lon": 0.0004 }], "ticks": 1 }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use geofence::fence::{ElevationRange, Fence, MonitoredType, Trigger};
use geofence::monitor::MAX_RINGS;
use geofence::{FenceManager, GeoPoint, MemoryItemStore, MemoryShapeStore, Shape, TrackedItem};

use crate::error::CliError;

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub shapes: Vec<Shape>,
    #[serde(default)]
    pub items: Vec<TrackedItem>,
    #[serde(default)]
    pub fences: Vec<ScenarioFence>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A fence whose range may be left out.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioFence {
    pub shape_id: String,
    pub trigger: Trigger,
    pub monitored_type: MonitoredType,
    /// Estimated from the shape extent when absent.
    #[serde(default)]
    pub range_km: Option<u32>,
    #[serde(default)]
    pub elevation: Option<ElevationRange>,
    /// Initial Custom selection.
    #[serde(default)]
    pub select: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Move {
    pub uid: String,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub alt: Option<f64>,
}

impl Move {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lon: self.lon,
            alt: self.alt,
        }
    }
}

/// One script entry: apply the events, then run `ticks` sweeps.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub moves: Vec<Move>,
    #[serde(default)]
    pub add: Vec<TrackedItem>,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub select: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub dismiss: Vec<String>,
    #[serde(default = "default_ticks")]
    pub ticks: u32,
}

fn default_ticks() -> u32 {
    1
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let text = std::fs::read_to_string(path).map_err(|e| CliError::Scenario {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| CliError::Scenario {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Fill the stores with the scenario's shapes and items.
    pub fn populate(&self, shapes: &MemoryShapeStore, items: &MemoryItemStore) {
        for shape in &self.shapes {
            shapes.upsert(shape.clone());
        }
        for item in &self.items {
            items.upsert(item.clone());
        }
    }

    /// Build the engine fence, estimating a missing range from its shape.
    pub fn fence(&self, fence: &ScenarioFence, margin_km: u32) -> Fence {
        let range_km = fence.range_km.unwrap_or_else(|| {
            self.shapes
                .iter()
                .find(|s| s.id == fence.shape_id)
                .map(|s| s.estimated_range_km(margin_km, MAX_RINGS))
                .unwrap_or(0)
        });
        let mut engine = Fence::new(fence.shape_id.clone(), fence.trigger, fence.monitored_type).with_range_km(range_km);
        if let Some(elevation) = fence.elevation {
            engine = engine.with_elevation(elevation);
        }
        engine
    }
}

impl Step {
    /// Apply this step's events to the stores and manager, without ticking.
    pub fn apply(&self, manager: &FenceManager, items: &MemoryItemStore) {
        for item in &self.add {
            items.upsert(item.clone());
            manager.on_item_added(&item.uid);
        }
        for mv in &self.moves {
            if !items.set_location(&mv.uid, mv.point()) {
                tracing::warn!(item = %mv.uid, "Moved item not in scenario");
            }
        }
        for uid in &self.remove {
            items.remove(uid);
            manager.on_item_removed(uid);
        }
        for (monitor, uids) in &self.select {
            manager.on_items_selected(monitor, uids.clone());
        }
        for monitor in &self.dismiss {
            manager.dismiss(monitor, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "shapes": [
            { "id": "S1", "kind": "circle", "center": { "lat": 0.0, "lon": 0.0 }, "radius_m": 2500.0, "rings": 2 },
            { "id": "R1", "kind": "rectangle", "corners": [
                { "lat": 0.0, "lon": 0.0 }, { "lat": 0.0, "lon": 0.01 },
                { "lat": 0.01, "lon": 0.01 }, { "lat": 0.01, "lon": 0.0 }
            ] }
        ],
        "items": [{ "uid": "U1", "item_type": "a-f-G", "location": { "lat": 0.0, "lon": 0.002 } }],
        "fences": [
            { "shape_id": "S1", "trigger": "Entry", "monitored_type": "All" },
            { "shape_id": "R1", "trigger": "Both", "monitored_type": "Custom", "range_km": 10, "select": ["U1"] }
        ],
        "steps": [{ "moves": [{ "uid": "U1", "lat": 0.0, "lon": 0.0001 }] }]
    }"#;

    #[test]
    fn test_parses_sample() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(scenario.shapes.len(), 2);
        assert_eq!(scenario.fences[1].select, vec!["U1"]);
        assert_eq!(scenario.steps[0].ticks, 1);
    }

    #[test]
    fn test_missing_range_estimated_from_shape() {
        let scenario: Scenario = serde_json::from_str(SAMPLE).unwrap();
        // 2 rings of 2.5km plus the margin
        assert_eq!(scenario.fence(&scenario.fences[0], 75).range_km, 80);
        assert_eq!(scenario.fence(&scenario.fences[1], 75).range_km, 10);
    }
}
