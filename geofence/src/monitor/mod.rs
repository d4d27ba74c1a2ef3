//! Fence monitors: one fence bound to one concrete shape.
//!
//! A [`FenceMonitor`] owns the per-item bookkeeping (tracked list, ignore
//! set, last containment state, Custom selection) and delegates the
//! containment test to a [`MonitorGeometry`] chosen by shape kind.
//!
//! # Evaluation
//!
//! ```text
//! check()
//!   │
//!   ├─► resolve tracked uids via ItemProvider   (missing → warn, skip)
//!   │
//!   └─► check_items(trigger, items, true)
//!         │
//!         ├─ ignored / anchor marker            → skip
//!         ├─ no location                        → warn, skip
//!         ├─ geometry.contains() error          → warn, skip
//!         └─ should_fire(trigger, now, prev)    → Alert
//! ```

mod circle;
mod polygon;
mod trigger;

pub use circle::{clamp_rings, quick_check, quick_check_all, CircleMonitor, MAX_RINGS};
pub use polygon::{PolygonMonitor, DEFAULT_MOVE_THRESHOLD_M};
pub use trigger::{should_fire, TriggerState, INITIAL_STATE};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::alert::Alert;
use crate::coord::{GeoPoint, METERS_PER_KM};
use crate::error::{GeofenceError, GeofenceResult};
use crate::fence::{Fence, MonitoredType, Trigger};
use crate::index::SharedSpatialIndex;
use crate::item::{ItemProvider, TrackedItem};
use crate::persist::MonitorState;
use crate::shape::{Shape, ShapeGeometry, ShapeKind};

/// Containment strategy, one variant per shape kind.
#[derive(Debug)]
pub enum MonitorGeometry {
    Circle(CircleMonitor),
    Rectangle(PolygonMonitor),
    ClosedShape(PolygonMonitor),
}

impl MonitorGeometry {
    /// Build the geometry matching the shape's kind.
    pub fn create(shape: &Shape, index: &SharedSpatialIndex, move_threshold_m: f64) -> GeofenceResult<Self> {
        Ok(match &shape.geometry {
            ShapeGeometry::Circle { .. } => MonitorGeometry::Circle(CircleMonitor::from_shape(shape)?),
            ShapeGeometry::Rectangle { .. } => {
                MonitorGeometry::Rectangle(PolygonMonitor::new(shape, index.clone(), move_threshold_m)?)
            }
            ShapeGeometry::ClosedPolyline { .. } => {
                MonitorGeometry::ClosedShape(PolygonMonitor::new(shape, index.clone(), move_threshold_m)?)
            }
        })
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            MonitorGeometry::Circle(_) => ShapeKind::Circle,
            MonitorGeometry::Rectangle(_) => ShapeKind::Rectangle,
            MonitorGeometry::ClosedShape(_) => ShapeKind::ClosedPolyline,
        }
    }

    pub fn center(&self) -> GeoPoint {
        match self {
            MonitorGeometry::Circle(c) => c.center(),
            MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) => p.center(),
        }
    }

    /// Largest distance from the center to the fence edge, in meters.
    pub fn furthest_point_range_m(&self) -> f64 {
        match self {
            MonitorGeometry::Circle(c) => c.furthest_point_range_m(),
            MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) => p.furthest_point_range_m(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            MonitorGeometry::Circle(_) => true,
            MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) => p.is_valid(),
        }
    }

    /// Items that belong to the shape itself.
    fn excludes(&self, uid: &str) -> bool {
        match self {
            MonitorGeometry::Circle(c) => c.is_anchor(uid),
            _ => false,
        }
    }

    fn contains(&mut self, fence: &Fence, item: &TrackedItem, location: &GeoPoint) -> GeofenceResult<bool> {
        match self {
            MonitorGeometry::Circle(c) => Ok(c.contains(fence, item, location)),
            MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) => p.contains(fence, item, location),
        }
    }

    fn forget(&mut self, uid: &str) {
        if let MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) = self {
            p.forget(uid);
        }
    }

    /// Apply a geometry change in place. A change of shape kind is rejected.
    pub fn refresh(&mut self, shape: &Shape) -> GeofenceResult<()> {
        if shape.geometry.kind() != self.kind() {
            return Err(GeofenceError::invalid_shape(
                &shape.id,
                format!("kind changed from {} to {}", self.kind(), shape.geometry.kind()),
            ));
        }
        match self {
            MonitorGeometry::Circle(c) => c.refresh(shape),
            MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) => p.refresh(shape),
        }
    }

    fn dispose(&mut self) {
        if let MonitorGeometry::Rectangle(p) | MonitorGeometry::ClosedShape(p) = self {
            p.dispose();
        }
    }
}

/// A fence bound to a shape, with per-item alert state.
pub struct FenceMonitor {
    fence: Fence,
    shape_name: String,
    geometry: MonitorGeometry,
    items: Arc<dyn ItemProvider>,
    tracked: Vec<String>,
    ignored: HashSet<String>,
    last_state: HashMap<String, TriggerState>,
    selection: BTreeSet<String>,
    disposed: bool,
}

impl std::fmt::Debug for FenceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceMonitor")
            .field("fence", &self.fence)
            .field("geometry", &self.geometry.kind())
            .field("tracked", &self.tracked.len())
            .field("ignored", &self.ignored.len())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl FenceMonitor {
    /// Bind a fence to its shape.
    pub fn create(
        fence: Fence,
        shape: &Shape,
        index: &SharedSpatialIndex,
        items: Arc<dyn ItemProvider>,
        move_threshold_m: f64,
    ) -> GeofenceResult<Self> {
        if !fence.is_valid() {
            return Err(GeofenceError::InvalidFence(format!("fence {} has no shape", fence)));
        }
        if fence.shape_id != shape.id {
            return Err(GeofenceError::invalid_shape(
                &shape.id,
                format!("fence is attached to {}", fence.shape_id),
            ));
        }

        let geometry = MonitorGeometry::create(shape, index, move_threshold_m)?;
        debug!(monitor = %shape.id, kind = %geometry.kind(), fence = %fence, "Created fence monitor");

        Ok(Self {
            fence,
            shape_name: shape.display_name().to_string(),
            geometry,
            items,
            tracked: Vec::new(),
            ignored: HashSet::new(),
            last_state: HashMap::new(),
            selection: BTreeSet::new(),
            disposed: false,
        })
    }

    /// Monitor id, which is the shape uid.
    pub fn id(&self) -> &str {
        &self.fence.shape_id
    }

    pub fn shape_name(&self) -> &str {
        &self.shape_name
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Swap in an updated fence with the same shape.
    pub fn set_fence(&mut self, fence: Fence) {
        self.fence = fence;
    }

    pub(crate) fn set_tracking(&mut self, tracking: bool) {
        self.fence.tracking = tracking;
    }

    pub(crate) fn set_range_km(&mut self, range_km: u32) {
        self.fence.range_km = range_km;
    }

    pub fn geometry(&self) -> &MonitorGeometry {
        &self.geometry
    }

    pub fn center(&self) -> GeoPoint {
        self.geometry.center()
    }

    pub fn furthest_point_range_km(&self) -> f64 {
        self.geometry.furthest_point_range_m() / METERS_PER_KM
    }

    /// Valid while the fence is usable, the geometry holds its handles and
    /// the monitor has not been disposed.
    pub fn is_valid(&self) -> bool {
        !self.disposed && self.fence.is_valid() && self.geometry.is_valid()
    }

    /// Apply a shape geometry change.
    pub fn refresh(&mut self, shape: &Shape) -> GeofenceResult<()> {
        self.geometry.refresh(shape)?;
        self.shape_name = shape.display_name().to_string();
        Ok(())
    }

    /// Evaluate every tracked item against the fence trigger, committing the
    /// new states.
    pub fn check(&mut self) -> Vec<Alert> {
        let items: Vec<TrackedItem> = self
            .tracked
            .iter()
            .filter_map(|uid| {
                let item = self.items.item(uid);
                if item.is_none() {
                    warn!(monitor = %self.id(), item = %uid, "Tracked item not found");
                }
                item
            })
            .collect();
        let trigger = self.fence.trigger;
        self.check_items(trigger, &items, true)
    }

    /// Evaluate a batch of items.
    ///
    /// With `check_previous` each item is compared to its last state and the
    /// new state is recorded. Without it the raw state decides and nothing is
    /// recorded.
    pub fn check_items(&mut self, trigger: Trigger, items: &[TrackedItem], check_previous: bool) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for item in items {
            if self.ignored.contains(&item.uid) || self.geometry.excludes(&item.uid) {
                continue;
            }
            let Some(location) = item.location else {
                warn!(monitor = %self.fence.shape_id, item = %item.uid, "Skipping item without location");
                continue;
            };

            let inside = match self.geometry.contains(&self.fence, item, &location) {
                Ok(inside) => inside,
                Err(e) => {
                    warn!(monitor = %self.fence.shape_id, item = %item.uid, error = %e, "Containment check failed");
                    continue;
                }
            };
            let current = TriggerState::from_inside(inside);

            let fire = if check_previous {
                let previous = self.last_state.insert(item.uid.clone(), current).unwrap_or(INITIAL_STATE);
                should_fire(trigger, current, Some(previous))
            } else {
                should_fire(trigger, current, None)
            };

            if fire {
                trace!(monitor = %self.fence.shape_id, item = %item.uid, inside, "Fence crossed");
                alerts.push(Alert::new(self.fence.shape_id.clone(), item.uid.clone(), Some(location), inside));
            }
        }

        alerts
    }

    /// Single-item form of [`check_items`](Self::check_items).
    pub fn check_item(&mut self, trigger: Trigger, item: &TrackedItem, check_previous: bool) -> bool {
        !self
            .check_items(trigger, std::slice::from_ref(item), check_previous)
            .is_empty()
    }

    /// Start tracking an item and clear it from the ignore set. Returns true
    /// when something changed.
    pub fn add_item(&mut self, uid: &str) -> bool {
        let unignored = self.ignored.remove(uid);
        if self.tracked.iter().any(|t| t == uid) {
            return unignored;
        }
        self.tracked.push(uid.to_string());
        true
    }

    /// Stop tracking an item. Returns true iff it was tracked and was the
    /// last one.
    pub fn remove_item(&mut self, uid: &str) -> bool {
        let Some(pos) = self.tracked.iter().position(|t| t == uid) else {
            return false;
        };
        self.tracked.remove(pos);
        self.last_state.remove(uid);
        self.ignored.remove(uid);
        self.geometry.forget(uid);
        self.tracked.is_empty()
    }

    /// Replace the tracked list, releasing state held for dropped items.
    pub fn set_tracked_items<I, S>(&mut self, uids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next: Vec<String> = Vec::new();
        for uid in uids {
            let uid = uid.into();
            if !next.contains(&uid) {
                next.push(uid);
            }
        }
        let dropped: Vec<String> = self.tracked.iter().filter(|t| !next.contains(t)).cloned().collect();
        for uid in &dropped {
            self.geometry.forget(uid);
            self.last_state.remove(uid);
        }
        self.tracked = next;
    }

    /// Release index handles and states of items that are not tracked.
    pub(crate) fn prune_untracked(&mut self) {
        let stale: Vec<String> = self
            .last_state
            .keys()
            .filter(|uid| !self.tracked.contains(uid))
            .cloned()
            .collect();
        for uid in stale {
            self.last_state.remove(&uid);
            self.geometry.forget(&uid);
        }
    }

    pub fn is_monitoring(&self, uid: &str) -> bool {
        self.tracked.iter().any(|t| t == uid)
    }

    pub fn tracked_uids(&self) -> &[String] {
        &self.tracked
    }

    pub fn has_tracked_items(&self) -> bool {
        !self.tracked.is_empty()
    }

    /// Last recorded containment, `None` if never observed.
    pub fn last_state(&self, uid: &str) -> Option<bool> {
        self.last_state.get(uid).map(|s| s.is_inside())
    }

    /// Seed last states, e.g. from an initial population pass.
    pub fn set_last_states(&mut self, states: HashMap<String, bool>) {
        self.last_state
            .extend(states.into_iter().map(|(uid, inside)| (uid, TriggerState::from_inside(inside))));
    }

    pub fn clear_last_states(&mut self) {
        self.last_state.clear();
    }

    /// Silence an item until it is added again. Returns true if newly
    /// ignored.
    pub fn ignore(&mut self, uid: &str) -> bool {
        self.ignored.insert(uid.to_string())
    }

    pub fn is_ignored(&self, uid: &str) -> bool {
        self.ignored.contains(uid)
    }

    /// Custom selection, including uids not resolved yet.
    pub fn selection(&self) -> &BTreeSet<String> {
        &self.selection
    }

    pub(crate) fn set_selection(&mut self, uids: BTreeSet<String>) {
        self.selection = uids;
    }

    /// Whether `uid` is selected but not tracked yet.
    pub fn is_pending_selection(&self, uid: &str) -> bool {
        self.fence.monitored_type == MonitoredType::Custom && self.selection.contains(uid) && !self.is_monitoring(uid)
    }

    /// Snapshot for persistence.
    pub fn state(&self) -> MonitorState {
        MonitorState::new(self.fence.clone(), self.selection.iter().cloned().collect())
    }

    /// Release every index handle. The monitor is invalid afterwards.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.geometry.dispose();
        self.last_state.clear();
        self.disposed = true;
        debug!(monitor = %self.fence.shape_id, "Disposed fence monitor");
    }
}

impl std::fmt::Display for FenceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) {} tracking {} items",
            self.shape_name,
            self.geometry.kind(),
            self.fence,
            self.tracked.len()
        )
    }
}
