//! Fence monitor registry and event handling.
//!
//! The [`FenceManager`] owns every [`FenceMonitor`] behind a single mutex.
//! Host events (fence, shape and item changes) and the periodic
//! [`tick`](FenceManager::tick) all take that lock, so they interleave but
//! never overlap. Shape and item providers are queried outside that lock,
//! and alert sinks, persistence and listeners are invoked only after it is
//! released. Alert and persist notices are re-checked against the registry
//! when delivered, so a removal racing with a delivery always wins.
//!
//! # Fence Lifecycle
//!
//! ```text
//! on_fence_added ──► shape missing? ──yes──► pending[shape_id]
//!        │                                        │
//!        │ no                        on_shape_added(shape_id)
//!        ▼                                        │
//!   create monitor (inert) ◄──────────────────────┘
//!        │
//!        ▼
//!   initial population (blocking task or inline)
//!        │
//!        ├── Custom, no saved selection ──► on_selection_required
//!        │                                        │
//!        │                               on_items_selected
//!        ▼                                        ▼
//!   tracking ◄────────────────────────────────────┘
//!        │
//!        ▼
//!   tick: sweep ─► rescan (every Nth) ─► check ─► AlertSink
//! ```

mod notice;
mod pools;

pub use notice::MonitorListener;
pub use pools::TypePools;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use notice::{Notice, Outbox};

use crate::alert::{Alert, AlertLog, AlertSink};
use crate::config::MonitorConfig;
use crate::error::{GeofenceError, GeofenceResult};
use crate::fence::{normalize_range_km, Fence, MonitoredType, Trigger};
use crate::index::SharedSpatialIndex;
use crate::item::{ItemProvider, TrackedItem};
use crate::monitor::{quick_check, quick_check_all, FenceMonitor};
use crate::persist::{MemoryPersistence, MonitorState, PersistenceSink};
use crate::shape::ShapeProvider;

struct Slot {
    monitor: FenceMonitor,
    generation: u64,
}

#[derive(Debug, Clone)]
struct PendingFence {
    fence: Fence,
    imported: bool,
}

#[derive(Default)]
struct ManagerState {
    monitors: BTreeMap<String, Slot>,
    pending: HashMap<String, PendingFence>,
    pools: TypePools,
    to_remove: BTreeSet<String>,
    tick: u64,
    next_generation: u64,
    disposed: bool,
}

/// Outcome of one [`FenceManager::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Sweep number, starting at 1.
    pub tick: u64,
    /// Monitors evaluated.
    pub checked: usize,
    /// Alerts raised across all monitors.
    pub alerts: usize,
    /// Items newly tracked by rescans.
    pub rescanned: usize,
    /// Monitors removed by the sweep.
    pub removed: Vec<String>,
}

/// Registry of fence monitors.
pub struct FenceManager {
    config: MonitorConfig,
    shapes: Arc<dyn ShapeProvider>,
    items: Arc<dyn ItemProvider>,
    index: SharedSpatialIndex,
    alerts: Arc<dyn AlertSink>,
    persistence: Arc<dyn PersistenceSink>,
    runtime: Option<Handle>,
    state: Mutex<ManagerState>,
    listeners: RwLock<Vec<Arc<dyn MonitorListener>>>,
}

impl std::fmt::Debug for FenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceManager")
            .field("config", &self.config)
            .field("monitors", &self.count())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl FenceManager {
    /// Create a manager with an in-memory index, alert log and persistence.
    ///
    /// Item pools are seeded from `items` immediately.
    pub fn new(config: MonitorConfig, shapes: Arc<dyn ShapeProvider>, items: Arc<dyn ItemProvider>) -> Self {
        let manager = Self {
            config,
            shapes,
            items,
            index: SharedSpatialIndex::in_memory(),
            alerts: Arc::new(AlertLog::new()),
            persistence: Arc::new(MemoryPersistence::new()),
            runtime: None,
            state: Mutex::new(ManagerState::default()),
            listeners: RwLock::new(Vec::new()),
        };
        manager.initialize();
        manager
    }

    pub fn with_index(mut self, index: SharedSpatialIndex) -> Self {
        self.index = index;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Run initial population on the runtime's blocking pool instead of
    /// inline.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn index(&self) -> &SharedSpatialIndex {
        &self.index
    }

    pub fn add_listener(&self, listener: Arc<dyn MonitorListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MonitorListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Rebuild the item pools from the item provider.
    pub fn initialize(&self) {
        let items = self.items.items();
        let mut state = self.state.lock();
        state.pools.clear();
        for item in &items {
            state.pools.add(item);
        }
        info!(
            friendly = state.pools.len(MonitoredType::Friendly),
            tak_users = state.pools.len(MonitoredType::TakUsers),
            hostile = state.pools.len(MonitoredType::Hostile),
            all = state.pools.len(MonitoredType::All),
            "Seeded item pools"
        );
    }

    /// Re-register every persisted fence that is still tracking. Restored
    /// fences are not persisted again when they begin monitoring.
    pub fn restore(self: &Arc<Self>) -> GeofenceResult<usize> {
        let states = self.persistence.load_all()?;
        let mut restored = 0;
        for state in states.into_iter().filter(|s| s.fence.tracking) {
            self.on_fence_added(state.fence, true);
            restored += 1;
        }
        info!(restored, "Restored persisted fences");
        Ok(restored)
    }

    // ---------------------------------------------------------------------
    // Fence and shape events
    // ---------------------------------------------------------------------

    /// Register a fence. `imported` fences are not persisted when they begin
    /// monitoring.
    pub fn on_fence_added(self: &Arc<Self>, fence: Fence, imported: bool) {
        if !fence.tracking {
            debug!(fence = %fence, "Skipping fence not tracking");
            return;
        }

        let Some(shape) = self.shapes.shape(&fence.shape_id) else {
            debug!(shape = %fence.shape_id, "Deferring fence until its shape exists");
            let shape_id = fence.shape_id.clone();
            {
                let mut state = self.state.lock();
                if state.disposed {
                    return;
                }
                state.pending.insert(shape_id.clone(), PendingFence { fence, imported });
            }
            // The shape may have arrived after the lookup, with its
            // on_shape_added finding nothing to replay
            if self.shapes.shape(&shape_id).is_some() {
                debug!(shape = %shape_id, "Shape arrived while deferring fence");
                self.on_shape_added(&shape_id);
            }
            return;
        };

        let mut fence = fence;
        fence.range_km = normalize_range_km(fence.range_km, self.config.default_range_km, self.config.max_range_km);

        let mut monitor = match FenceMonitor::create(
            fence,
            &shape,
            &self.index,
            Arc::clone(&self.items),
            self.config.move_threshold_m,
        ) {
            Ok(monitor) => monitor,
            Err(e) => {
                warn!(shape = %shape.id, error = %e, "Cannot monitor fence");
                return;
            }
        };

        // Inert until the initial population completes
        monitor.set_tracking(false);
        let id = monitor.id().to_string();
        info!(monitor = %id, "{}", monitor);

        let mut outbox = Outbox::new();
        let generation = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.pending.remove(&id);
            state.to_remove.remove(&id);
            state.next_generation += 1;
            let generation = state.next_generation;
            let previous = state.monitors.insert(id.clone(), Slot { monitor, generation });
            match previous {
                Some(mut old) => {
                    old.monitor.dispose();
                    outbox.push(Notice::Changed(id.clone()));
                }
                None => outbox.push(Notice::Added(id.clone())),
            }
            generation
        };
        self.dispatch(outbox);
        self.schedule_population(id, generation, imported);
    }

    /// React to an edited fence.
    pub fn on_fence_changed(self: &Arc<Self>, fence: Fence) {
        enum Action {
            Add,
            Swap,
            Stop,
            Recreate,
        }

        let id = fence.shape_id.clone();
        let mut outbox = Outbox::new();
        let action = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let status = state
                .monitors
                .get(&id)
                .map(|slot| (slot.monitor.is_valid(), slot.monitor.fence() == &fence));
            match status {
                None | Some((false, _)) => Action::Add,
                Some((true, true)) => {
                    if let Some(slot) = state.monitors.get_mut(&id) {
                        slot.monitor.set_fence(fence.clone());
                    }
                    Action::Swap
                }
                Some((true, false)) if !fence.tracking => {
                    let selection = state
                        .monitors
                        .get(&id)
                        .map(|slot| slot.monitor.selection().iter().cloned().collect())
                        .unwrap_or_default();
                    self.remove_monitor_locked(state, &id, &mut outbox);
                    outbox.push(Notice::Persist {
                        state: MonitorState::new(fence.clone(), selection),
                        generation: None,
                    });
                    Action::Stop
                }
                Some((true, false)) => {
                    self.remove_monitor_locked(state, &id, &mut outbox);
                    Action::Recreate
                }
            }
        };
        self.dispatch(outbox);

        match action {
            Action::Add => {
                debug!(monitor = %id, "Fence changed, adding monitor");
                self.on_fence_added(fence, false);
            }
            Action::Recreate => {
                debug!(monitor = %id, "Fence changed, re-adding monitor");
                self.on_fence_added(fence, false);
            }
            Action::Swap => trace!(monitor = %id, "Fence unchanged"),
            Action::Stop => debug!(monitor = %id, "Fence changed, not tracking"),
        }
    }

    /// Delete a fence and its persisted state.
    pub fn on_fence_removed(&self, shape_id: &str) {
        info!(monitor = %shape_id, "Fence removed");
        self.delete_monitor(shape_id);
    }

    /// Register a fence that was deferred waiting for this shape.
    pub fn on_shape_added(self: &Arc<Self>, shape_id: &str) {
        let pending = self.state.lock().pending.remove(shape_id);
        if let Some(pending) = pending {
            info!(shape = %shape_id, "Shape arrived, registering deferred fence");
            self.on_fence_added(pending.fence, pending.imported);
        }
    }

    /// Apply a geometry change in place. Unusable geometry queues the
    /// monitor for removal on the next tick.
    pub fn on_shape_changed(&self, shape_id: &str) {
        let shape = self.shapes.shape(shape_id);
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            let Some(slot) = state.monitors.get_mut(shape_id) else {
                return;
            };
            let result = match &shape {
                Some(shape) => slot.monitor.refresh(shape),
                None => Err(GeofenceError::StaleMonitor(shape_id.to_string())),
            };
            match result {
                Ok(()) => {
                    debug!(monitor = %shape_id, "Refreshed fence geometry");
                    outbox.push(Notice::Changed(shape_id.to_string()));
                }
                Err(e) => {
                    warn!(monitor = %shape_id, error = %e, "Fence geometry unusable, removing on next tick");
                    state.to_remove.insert(shape_id.to_string());
                }
            }
        }
        self.dispatch(outbox);
    }

    /// Drop the fence attached to a deleted shape.
    pub fn on_shape_removed(&self, shape_id: &str) {
        info!(shape = %shape_id, "Shape removed");
        self.delete_monitor(shape_id);
    }

    // ---------------------------------------------------------------------
    // Item events
    // ---------------------------------------------------------------------

    /// Pool a new item and start tracking it in every active monitor whose
    /// search area it falls in.
    pub fn on_item_added(&self, uid: &str) {
        let Some(item) = self.items.item(uid) else {
            warn!(item = %uid, "Added item not found");
            return;
        };

        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.pools.add(&item);

            let mut added = 0;
            for (id, slot) in state.monitors.iter_mut() {
                let monitor = &mut slot.monitor;
                let (tracking, monitored_type, range_km) = {
                    let fence = monitor.fence();
                    (fence.tracking, fence.monitored_type, fence.range_km)
                };
                if !tracking || !monitored_type.matches(&item) {
                    continue;
                }
                if monitored_type == MonitoredType::Custom {
                    if monitor.is_pending_selection(uid) && monitor.add_item(uid) {
                        debug!(monitor = %id, item = %uid, "Selected item arrived");
                        outbox.push(Notice::Changed(id.clone()));
                    }
                } else if quick_check(&monitor.center(), range_km as f64, Trigger::Entry, &item)
                    && monitor.add_item(uid)
                {
                    added += 1;
                    debug!(monitor = %id, item = %uid, "Added item to monitor");
                }
            }
            if added > 0 {
                debug!(item = %uid, monitors = added, "Item now monitored");
            }
        }
        self.dispatch(outbox);
    }

    /// Forget an item everywhere.
    pub fn on_item_removed(&self, uid: &str) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            state.pools.remove(uid);
            for (id, slot) in state.monitors.iter_mut() {
                if !slot.monitor.is_monitoring(uid) {
                    continue;
                }
                if slot.monitor.remove_item(uid) {
                    info!(monitor = %id, item = %uid, "Removed last tracked item");
                } else {
                    debug!(monitor = %id, item = %uid, "Removed tracked item");
                }
                outbox.push(Notice::Changed(id.clone()));
            }
        }
        self.dispatch(outbox);
    }

    /// Answer a selection request for a Custom fence.
    ///
    /// Uids not present yet are remembered and attached when the item is
    /// added. An empty selection with nothing pending removes the monitor.
    pub fn on_items_selected(&self, monitor_id: &str, uids: Vec<String>) {
        let present = self.present(&uids);
        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let previous: Vec<String> = match state.monitors.get(monitor_id) {
                Some(slot) => slot.monitor.selection().iter().cloned().collect(),
                None => {
                    warn!(monitor = %monitor_id, "Items selected for unknown monitor");
                    return;
                }
            };
            self.apply_selection(state, monitor_id, uids, &previous, &present, &mut outbox);
        }
        self.dispatch(outbox);
    }

    // ---------------------------------------------------------------------
    // Periodic sweep
    // ---------------------------------------------------------------------

    /// Run one sweep: drop stale monitors, rescan every `rescan_period`-th
    /// tick, evaluate every tracking monitor.
    ///
    /// Shape and item lookups happen between two short critical sections:
    /// the first snapshots what the sweep needs, the second evaluates it.
    /// Monitors added or replaced in between wait for the next tick.
    pub fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        let plan = {
            let mut state = self.state.lock();
            if state.disposed {
                return summary;
            }
            state.tick += 1;
            summary.tick = state.tick;
            SweepPlan::capture(&state, self.config.rescan_period)
        };
        let resolved = plan.lookup(self.shapes.as_ref(), self.items.as_ref());

        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for (id, slot) in state.monitors.iter_mut() {
                let Some(&exists) = resolved.exists.get(id) else {
                    continue;
                };
                if plan.generations.get(id) != Some(&slot.generation) {
                    continue;
                }
                let monitor = &mut slot.monitor;
                if !monitor.is_valid() {
                    warn!(monitor = %id, "Fence no longer valid");
                    state.to_remove.insert(id.clone());
                    continue;
                }
                if !exists {
                    let stale = GeofenceError::StaleMonitor(id.clone());
                    warn!(monitor = %id, error = %stale, "Fence no longer exists");
                    state.to_remove.insert(id.clone());
                    continue;
                }
                if !monitor.fence().tracking {
                    continue;
                }

                if plan.rescan {
                    summary.rescanned += self.rescan(monitor, &state.pools, &resolved.items);
                }

                let tracked: Vec<TrackedItem> = monitor
                    .tracked_uids()
                    .iter()
                    .filter_map(|uid| {
                        let item = resolved.items.get(uid).cloned();
                        if item.is_none() && plan.uids.contains(uid) {
                            warn!(monitor = %id, item = %uid, "Tracked item not found");
                        }
                        item
                    })
                    .collect();
                let trigger = monitor.fence().trigger;
                let alerts = monitor.check_items(trigger, &tracked, true);
                summary.checked += 1;
                if !alerts.is_empty() {
                    summary.alerts += alerts.len();
                    outbox.push(Notice::Alerts {
                        id: id.clone(),
                        generation: slot.generation,
                        alerts,
                    });
                    outbox.push(Notice::Changed(id.clone()));
                } else if self.config.auto_dismiss {
                    outbox.push(Notice::DismissAlerts(id.clone()));
                    outbox.push(Notice::Changed(id.clone()));
                }
            }

            let doomed = std::mem::take(&mut state.to_remove);
            if !doomed.is_empty() {
                warn!(count = doomed.len(), "Removing fences");
                for id in doomed {
                    self.delete_monitor_locked(state, &id, &mut outbox);
                    summary.removed.push(id);
                }
            }
        }
        self.dispatch(outbox);
        trace!(tick = summary.tick, checked = summary.checked, alerts = summary.alerts, "Tick complete");
        summary
    }

    /// Track pool items that wandered into the search area. Returns the
    /// number of items added.
    fn rescan(&self, monitor: &mut FenceMonitor, pools: &TypePools, resolved: &HashMap<String, TrackedItem>) -> usize {
        let monitored_type = monitor.fence().monitored_type;
        if monitored_type == MonitoredType::Custom || !monitor.fence().tracking {
            trace!(monitor = %monitor.id(), "Skipping rescan");
            return 0;
        }

        let range_km = (monitor.furthest_point_range_km() as u32)
            .saturating_add(self.config.rescan_margin_km)
            .min(self.config.max_range_km);
        if monitor.fence().range_km != range_km {
            monitor.set_range_km(range_km);
        }

        let center = monitor.center();
        let mut added = 0;
        for uid in pools.uids(monitored_type) {
            if monitor.is_monitoring(&uid) {
                continue;
            }
            let Some(item) = resolved.get(&uid) else {
                continue;
            };
            if monitored_type.matches(item)
                && quick_check(&center, range_km as f64, Trigger::Entry, item)
                && monitor.add_item(&uid)
            {
                added += 1;
            }
        }
        if added > 0 {
            debug!(monitor = %monitor.id(), added, range_km, "Rescan added items");
        }
        added
    }

    // ---------------------------------------------------------------------
    // Queries and dismissal
    // ---------------------------------------------------------------------

    /// Whether a monitor exists and can alert. Custom monitors need at least
    /// one tracked item.
    pub fn is_tracking(&self, monitor_id: &str) -> bool {
        self.state.lock().monitors.get(monitor_id).is_some_and(|slot| {
            slot.monitor.fence().monitored_type != MonitoredType::Custom || slot.monitor.has_tracked_items()
        })
    }

    pub fn monitor_ids(&self) -> Vec<String> {
        self.state.lock().monitors.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.state.lock().monitors.len()
    }

    /// Fences waiting for their shape.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn pool_len(&self, monitored_type: MonitoredType) -> usize {
        self.state.lock().pools.len(monitored_type)
    }

    /// Inspect a monitor under the registry lock.
    pub fn with_monitor<R>(&self, monitor_id: &str, f: impl FnOnce(&FenceMonitor) -> R) -> Option<R> {
        self.state.lock().monitors.get(monitor_id).map(|slot| f(&slot.monitor))
    }

    /// Dismiss every alert of a monitor. With `stop_monitoring` the monitor is
    /// removed and persisted with tracking off. Returns true when the sink
    /// has no outstanding alerts for it.
    pub fn dismiss(&self, monitor_id: &str, stop_monitoring: bool) -> bool {
        let all_dismissed = self.alerts.dismiss(monitor_id, None);
        if stop_monitoring {
            let mut outbox = Outbox::new();
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                let snapshot = state.monitors.get(monitor_id).map(|slot| {
                    let mut fence = slot.monitor.fence().clone();
                    fence.tracking = false;
                    MonitorState::new(fence, slot.monitor.selection().iter().cloned().collect())
                });
                if let Some(snapshot) = snapshot {
                    info!(monitor = %monitor_id, "Dismissed all tracked items, stopping monitor");
                    self.remove_monitor_locked(state, monitor_id, &mut outbox);
                    outbox.push(Notice::Persist {
                        state: snapshot,
                        generation: None,
                    });
                }
            }
            self.dispatch(outbox);
        }
        all_dismissed
    }

    /// Dismiss one item's alert. With `stop_tracking` the item is silenced
    /// on this monitor until it is added again.
    pub fn dismiss_item(&self, monitor_id: &str, uid: &str, stop_tracking: bool) -> bool {
        let all_dismissed = self.alerts.dismiss(monitor_id, Some(uid));
        if stop_tracking {
            let mut outbox = Outbox::new();
            if let Some(slot) = self.state.lock().monitors.get_mut(monitor_id) {
                if slot.monitor.ignore(uid) {
                    debug!(monitor = %monitor_id, item = %uid, "Stopped tracking item");
                    outbox.push(Notice::Changed(monitor_id.to_string()));
                }
            }
            self.dispatch(outbox);
        }
        if all_dismissed {
            debug!(monitor = %monitor_id, "Dismissed last alert, still monitoring");
        }
        all_dismissed
    }

    /// Dismiss every alert of every monitor.
    pub fn dismiss_all(&self) {
        debug!("Dismissing all monitors");
        for id in self.monitor_ids() {
            self.alerts.dismiss(&id, None);
        }
    }

    /// Remove every monitor, pending fence and persisted state.
    pub fn delete_all(&self) {
        info!("Deleting all monitors");
        self.alerts.dismiss_all();
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            let monitors = std::mem::take(&mut state.monitors);
            for (id, mut slot) in monitors {
                slot.monitor.dispose();
                outbox.push(Notice::Removed(id));
            }
            state.pending.clear();
            state.to_remove.clear();
            outbox.push(Notice::ForgetAll);
        }
        self.dispatch(outbox);
    }

    /// Release every monitor. Further events and ticks are ignored.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        for slot in state.monitors.values_mut() {
            slot.monitor.dispose();
        }
        state.monitors.clear();
        state.pending.clear();
        state.to_remove.clear();
        info!("Fence manager disposed");
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn schedule_population(self: &Arc<Self>, id: String, generation: u64, imported: bool) {
        match &self.runtime {
            Some(runtime) => {
                let manager = Arc::clone(self);
                runtime.spawn_blocking(move || manager.populate(&id, generation, imported));
            }
            None => self.populate(&id, generation, imported),
        }
    }

    /// Initial search around a new monitor, then begin monitoring.
    fn populate(&self, id: &str, generation: u64, imported: bool) {
        let persisted = match self.persistence.load(id) {
            Ok(state) => state,
            Err(e) => {
                warn!(monitor = %id, error = %e, "Failed to load persisted state");
                None
            }
        };

        let (monitored_type, uids) = {
            let state = self.state.lock();
            match state.monitors.get(id) {
                Some(slot) if slot.generation == generation => {
                    let monitored_type = slot.monitor.fence().monitored_type;
                    (monitored_type, state.pools.uids(monitored_type))
                }
                _ => {
                    debug!(monitor = %id, "Monitor replaced before initial search");
                    return;
                }
            }
        };
        let pool = resolve(self.items.as_ref(), uids);
        let saved = persisted.filter(|s| monitored_type == MonitoredType::Custom && !s.selected_uids.is_empty());
        let present = saved
            .as_ref()
            .map(|s| self.present(&s.selected_uids))
            .unwrap_or_default();

        let mut outbox = Outbox::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(slot) = state.monitors.get_mut(id) else {
                debug!(monitor = %id, "Monitor removed before initial search");
                return;
            };
            if slot.generation != generation || !slot.monitor.is_valid() {
                debug!(monitor = %id, "Monitor replaced before initial search");
                return;
            }
            let monitor = &mut slot.monitor;
            let fence = monitor.fence().clone();

            // Items removed since the lookup are no longer pooled
            let pool: Vec<TrackedItem> = pool
                .into_iter()
                .filter(|item| state.pools.contains(monitored_type, &item.uid))
                .collect();
            let found = quick_check_all(&monitor.center(), fence.range_km as f64, Trigger::Entry, &pool);
            debug!(monitor = %id, candidates = pool.len(), found = found.len(), range_km = fence.range_km, "Initial search");

            if fence.trigger == Trigger::Both {
                monitor.clear_last_states();
                let mut states = HashMap::with_capacity(found.len());
                for item in &found {
                    states.insert(item.uid.clone(), monitor.check_item(Trigger::Entry, item, false));
                }
                monitor.set_last_states(states);
            }

            let found_uids: Vec<String> = found.into_iter().map(|item| item.uid).collect();

            if fence.monitored_type != MonitoredType::Custom {
                info!(monitor = %id, items = found_uids.len(), "Monitoring items inside fence search area");
                monitor.set_tracked_items(found_uids);
                monitor.set_tracking(true);
                outbox.push(Notice::Changed(id.to_string()));
                if !imported {
                    outbox.push(Notice::Persist {
                        state: monitor.state(),
                        generation: Some(generation),
                    });
                }
            } else {
                match saved {
                    Some(saved) => {
                        debug!(monitor = %id, selected = saved.selected_uids.len(), "Replaying saved selection");
                        let previous = saved.selected_uids.clone();
                        self.apply_selection(state, id, saved.selected_uids, &previous, &present, &mut outbox);
                    }
                    None => {
                        debug!(monitor = %id, candidates = found_uids.len(), "Selection required");
                        monitor.set_tracking(false);
                        monitor.prune_untracked();
                        outbox.push(Notice::SelectionRequired(id.to_string(), found_uids));
                    }
                }
            }
        }
        self.dispatch(outbox);
    }

    /// The subset of `uids` the item provider knows.
    fn present(&self, uids: &[String]) -> HashSet<String> {
        uids.iter().filter(|uid| self.items.item(uid).is_some()).cloned().collect()
    }

    fn apply_selection(
        &self,
        state: &mut ManagerState,
        id: &str,
        uids: Vec<String>,
        previous: &[String],
        present: &HashSet<String>,
        outbox: &mut Outbox,
    ) {
        let Some(slot) = state.monitors.get_mut(id) else {
            warn!(monitor = %id, "Items selected for unknown monitor");
            return;
        };
        if !slot.monitor.is_valid() {
            warn!(monitor = %id, "Items selected for invalid monitor");
            return;
        }
        let generation = slot.generation;
        let monitor = &mut slot.monitor;
        let monitored_type = monitor.fence().monitored_type;

        let requested: BTreeSet<String> = uids.into_iter().collect();
        let (found, unresolved): (Vec<String>, Vec<String>) = requested
            .iter()
            .cloned()
            .partition(|uid| state.pools.contains(monitored_type, uid) && present.contains(uid));

        monitor.set_tracked_items(found.iter().cloned());
        monitor.set_selection(requested.clone());
        monitor.set_tracking(true);
        monitor.prune_untracked();

        if !unresolved.is_empty() {
            debug!(monitor = %id, unresolved = unresolved.len(), "Selected items not present yet");
        }

        if found.is_empty() && unresolved.is_empty() {
            warn!(monitor = %id, "No items selected, removing monitor");
            monitor.set_tracking(false);
            self.remove_monitor_locked(state, id, outbox);
            return;
        }
        if found.is_empty() {
            warn!(monitor = %id, "None of the selected items are present yet");
        } else {
            info!(monitor = %id, items = found.len(), "Monitoring selected items");
        }
        outbox.push(Notice::Changed(id.to_string()));

        let previous: BTreeSet<&str> = previous.iter().map(String::as_str).collect();
        let current: BTreeSet<&str> = requested.iter().map(String::as_str).collect();
        if previous != current {
            outbox.push(Notice::Persist {
                state: monitor.state(),
                generation: Some(generation),
            });
        }
    }

    fn remove_monitor_locked(&self, state: &mut ManagerState, id: &str, outbox: &mut Outbox) -> bool {
        state.to_remove.remove(id);
        match state.monitors.remove(id) {
            Some(mut slot) => {
                slot.monitor.dispose();
                outbox.push(Notice::DismissAlerts(id.to_string()));
                outbox.push(Notice::Removed(id.to_string()));
                true
            }
            None => {
                debug!(monitor = %id, "No monitor to remove");
                false
            }
        }
    }

    fn delete_monitor_locked(&self, state: &mut ManagerState, id: &str, outbox: &mut Outbox) {
        state.pending.remove(id);
        self.remove_monitor_locked(state, id, outbox);
        outbox.push(Notice::Forget(id.to_string()));
    }

    fn delete_monitor(&self, id: &str) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            self.delete_monitor_locked(&mut state, id, &mut outbox);
        }
        self.dispatch(outbox);
    }

    fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn MonitorListener>> = self.listeners.read().clone();

        for notice in outbox.into_notices() {
            match notice {
                Notice::Added(id) => listeners.iter().for_each(|l| l.on_monitor_added(&id)),
                Notice::Changed(id) => listeners.iter().for_each(|l| l.on_monitor_changed(&id)),
                Notice::Removed(id) => listeners.iter().for_each(|l| l.on_monitor_removed(&id)),
                Notice::SelectionRequired(id, candidates) => listeners
                    .iter()
                    .for_each(|l| l.on_selection_required(&id, &candidates)),
                Notice::Alerts { id, generation, alerts } => self.deliver_alerts(&id, generation, &alerts),
                Notice::DismissAlerts(id) => {
                    self.alerts.dismiss(&id, None);
                }
                Notice::Persist { state, generation: None } => self.write_state(&state),
                Notice::Persist {
                    state,
                    generation: Some(generation),
                } => {
                    if self.live_generation(state.shape_id()) != Some(generation) {
                        debug!(monitor = %state.shape_id(), "Monitor gone, not persisting");
                        continue;
                    }
                    self.write_state(&state);
                    self.reconcile(state.shape_id(), Some(generation));
                }
                Notice::Forget(id) => {
                    self.erase_state(&id);
                    self.reconcile(&id, None);
                }
                Notice::ForgetAll => {
                    if let Err(e) = self.persistence.clear_all() {
                        warn!(error = %e, "Failed to clear persisted monitors");
                    }
                }
            }
        }
    }

    /// Generation of the monitor registered under `id`.
    fn live_generation(&self, id: &str) -> Option<u64> {
        self.state.lock().monitors.get(id).map(|slot| slot.generation)
    }

    fn deliver_alerts(&self, id: &str, generation: u64, alerts: &[Alert]) {
        if self.live_generation(id) != Some(generation) {
            debug!(monitor = %id, alerts = alerts.len(), "Monitor gone, dropping alerts");
            return;
        }
        self.alerts.alert(id, alerts, self.config.auto_dismiss);
        // Removed while the sink was recording, after its dismissal ran
        if self.live_generation(id) != Some(generation) {
            debug!(monitor = %id, "Monitor removed during delivery, withdrawing alerts");
            self.alerts.dismiss(id, None);
        }
    }

    fn write_state(&self, state: &MonitorState) {
        if let Err(e) = self.persistence.persist(state) {
            warn!(monitor = %state.shape_id(), error = %e, "Failed to persist monitor");
        }
    }

    fn erase_state(&self, id: &str) {
        if let Err(e) = self.persistence.remove(id) {
            warn!(monitor = %id, error = %e, "Failed to remove persisted monitor");
        }
    }

    /// Bring the stored state for `id` back in line with the registry after
    /// a write made for `expected` (`None` meaning no monitor). A removal or
    /// replacement that landed during the write wins.
    fn reconcile(&self, id: &str, mut expected: Option<u64>) {
        loop {
            let current = {
                let state = self.state.lock();
                state.monitors.get(id).map(|slot| {
                    let populated = slot.monitor.fence().tracking.then(|| slot.monitor.state());
                    (slot.generation, populated)
                })
            };
            match current {
                None if expected.is_none() => return,
                None => {
                    debug!(monitor = %id, "Monitor removed during write, forgetting it");
                    self.erase_state(id);
                    expected = None;
                }
                Some((generation, _)) if expected == Some(generation) => return,
                Some((generation, Some(snapshot))) => {
                    debug!(monitor = %id, "Monitor replaced during write, persisting current state");
                    self.write_state(&snapshot);
                    expected = Some(generation);
                }
                // Still populating; it persists itself once monitoring
                Some((_, None)) => return,
            }
        }
    }
}

fn resolve(items: &dyn ItemProvider, uids: Vec<String>) -> Vec<TrackedItem> {
    uids.into_iter().filter_map(|uid| items.item(&uid)).collect()
}

/// What one sweep needs from the providers, captured under the lock.
struct SweepPlan {
    rescan: bool,
    generations: HashMap<String, u64>,
    /// Tracked uids, plus the rescanned pools on rescan ticks.
    uids: BTreeSet<String>,
}

/// Provider answers for a [`SweepPlan`].
struct SweepLookup {
    exists: HashMap<String, bool>,
    items: HashMap<String, TrackedItem>,
}

impl SweepPlan {
    fn capture(state: &ManagerState, rescan_period: u64) -> Self {
        let rescan = state.tick % rescan_period.max(1) == 0;
        let mut generations = HashMap::with_capacity(state.monitors.len());
        let mut uids = BTreeSet::new();
        let mut rescanned: HashSet<MonitoredType> = HashSet::new();

        for (id, slot) in &state.monitors {
            generations.insert(id.clone(), slot.generation);
            let fence = slot.monitor.fence();
            if !fence.tracking {
                continue;
            }
            uids.extend(slot.monitor.tracked_uids().iter().cloned());
            if rescan && fence.monitored_type != MonitoredType::Custom && rescanned.insert(fence.monitored_type) {
                uids.extend(state.pools.uids(fence.monitored_type));
            }
        }

        Self {
            rescan,
            generations,
            uids,
        }
    }

    fn lookup(&self, shapes: &dyn ShapeProvider, items: &dyn ItemProvider) -> SweepLookup {
        let exists = self
            .generations
            .keys()
            .map(|id| (id.clone(), shapes.exists(id)))
            .collect();
        let items = self
            .uids
            .iter()
            .filter_map(|uid| items.item(uid).map(|item| (uid.clone(), item)))
            .collect();
        SweepLookup { exists, items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::GeoPoint;
    use crate::item::MemoryItemStore;
    use crate::shape::{MemoryShapeStore, Shape};

    const CENTER: GeoPoint = GeoPoint {
        lat: 10.0,
        lon: 20.0,
        alt: None,
    };

    struct Fixture {
        shapes: Arc<MemoryShapeStore>,
        items: Arc<MemoryItemStore>,
        alerts: Arc<AlertLog>,
        persistence: Arc<MemoryPersistence>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                shapes: Arc::new(MemoryShapeStore::new()),
                items: Arc::new(MemoryItemStore::new()),
                alerts: Arc::new(AlertLog::new()),
                persistence: Arc::new(MemoryPersistence::new()),
            }
        }

        fn manager(&self) -> Arc<FenceManager> {
            Arc::new(
                FenceManager::new(MonitorConfig::default(), self.shapes.clone(), self.items.clone())
                    .with_alert_sink(self.alerts.clone())
                    .with_persistence(self.persistence.clone()),
            )
        }

        fn place(&self, uid: &str, item_type: &str, distance_m: f64) {
            self.items
                .upsert(TrackedItem::new(uid, item_type).at(CENTER.destination(90.0, distance_m)));
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_non_tracking_fence_ignored() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All).with_tracking(false), false);
            assert_eq!(manager.count(), 0);
        }

        #[test]
        fn test_added_fence_tracks_found_items_and_persists() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.place("F1", "a-f-G", 1_000.0);
            fx.place("H1", "a-h-G", 1_000.0);
            let manager = fx.manager();

            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::Friendly), false);

            assert!(manager.is_tracking("C1"));
            let tracked = manager.with_monitor("C1", |m| m.tracked_uids().to_vec()).unwrap();
            assert_eq!(tracked, vec!["F1"]);
            assert_eq!(fx.persistence.writes(), 1);
        }

        #[test]
        fn test_imported_fence_not_persisted() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), true);
            assert!(manager.is_tracking("C1"));
            assert_eq!(fx.persistence.writes(), 0);
        }

        #[test]
        fn test_both_trigger_seeds_last_state() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.place("IN", "a-f-G", 50.0);
            fx.place("OUT", "a-f-G", 5_000.0);
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Both, MonitoredType::All), false);

            assert_eq!(manager.with_monitor("C1", |m| m.last_state("IN")).flatten(), Some(true));
            assert_eq!(manager.with_monitor("C1", |m| m.last_state("OUT")).flatten(), Some(false));
            // Already-inside item does not alert on the first tick
            assert_eq!(manager.tick().alerts, 0);
        }

        #[test]
        fn test_invalid_shape_not_registered() {
            let fx = Fixture::new();
            fx.shapes
                .upsert(Shape::polygon("P1", vec![CENTER, CENTER.destination(0.0, 10.0)]));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("P1", Trigger::Entry, MonitoredType::All), false);
            assert_eq!(manager.count(), 0);
        }

        #[test]
        fn test_fence_changed_tracking_off_removes() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            let fence = Fence::new("C1", Trigger::Entry, MonitoredType::All);
            manager.on_fence_added(fence.clone(), false);

            manager.on_fence_changed(fence.with_tracking(false));
            assert_eq!(manager.count(), 0);
            assert!(!fx.persistence.load("C1").unwrap().unwrap().fence.tracking);
        }

        #[test]
        fn test_fence_changed_trigger_recreates() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);
            manager.on_fence_changed(Fence::new("C1", Trigger::Exit, MonitoredType::All));
            let trigger = manager.with_monitor("C1", |m| m.fence().trigger).unwrap();
            assert_eq!(trigger, Trigger::Exit);
        }

        #[test]
        fn test_fence_changed_without_monitor_adds() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_changed(Fence::new("C1", Trigger::Entry, MonitoredType::All));
            assert!(manager.is_tracking("C1"));
        }

        #[test]
        fn test_fence_removed_deletes_state() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);
            manager.on_fence_removed("C1");
            assert_eq!(manager.count(), 0);
            assert!(fx.persistence.is_empty());
        }

        #[test]
        fn test_range_normalized_on_add() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            let mut fence = Fence::new("C1", Trigger::Entry, MonitoredType::All);
            fence.range_km = 0;
            manager.on_fence_added(fence, false);
            assert_eq!(manager.with_monitor("C1", |m| m.fence().range_km), Some(75));
        }

        #[test]
        fn test_restore_registers_persisted_fences() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.shapes.upsert(Shape::circle("C2", CENTER, 100.0));
            fx.persistence
                .persist(&MonitorState::new(Fence::new("C1", Trigger::Entry, MonitoredType::All), vec![]))
                .unwrap();
            fx.persistence
                .persist(&MonitorState::new(
                    Fence::new("C2", Trigger::Entry, MonitoredType::All).with_tracking(false),
                    vec![],
                ))
                .unwrap();
            let manager = fx.manager();

            assert_eq!(manager.restore().unwrap(), 1);
            assert_eq!(manager.monitor_ids(), vec!["C1"]);
            assert_eq!(fx.persistence.writes(), 2);
        }
    }

    mod items {
        use super::*;

        #[test]
        fn test_item_added_inside_range_is_tracked() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::Hostile), false);

            fx.place("H1", "a-h-G", 500.0);
            fx.place("F1", "a-f-G", 500.0);
            fx.place("FAR", "a-h-G", 500_000.0);
            manager.on_item_added("H1");
            manager.on_item_added("F1");
            manager.on_item_added("FAR");

            let tracked = manager.with_monitor("C1", |m| m.tracked_uids().to_vec()).unwrap();
            assert_eq!(tracked, vec!["H1"]);
            assert_eq!(manager.pool_len(MonitoredType::Hostile), 2);
        }

        #[test]
        fn test_item_removed_untracks() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.place("U1", "a-f-G", 50.0);
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);

            fx.items.remove("U1");
            manager.on_item_removed("U1");
            assert_eq!(manager.with_monitor("C1", |m| m.has_tracked_items()), Some(false));
            // Non-Custom monitors stay active for later rescans
            assert!(manager.is_tracking("C1"));
            assert_eq!(manager.pool_len(MonitoredType::All), 0);
        }

        #[test]
        fn test_rescan_picks_up_items_entering_range() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.place("U1", "a-f-G", 300_000.0);
            let manager = Arc::new(
                FenceManager::new(
                    MonitorConfig::default().with_rescan_period(2),
                    fx.shapes.clone(),
                    fx.items.clone(),
                )
                .with_alert_sink(fx.alerts.clone()),
            );
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);
            assert_eq!(manager.with_monitor("C1", |m| m.has_tracked_items()), Some(false));

            // Moves within the rescan range without an item event
            fx.place("U1", "a-f-G", 50_000.0);
            assert_eq!(manager.tick().rescanned, 0);
            let summary = manager.tick();
            assert_eq!(summary.rescanned, 1);
            // Range reset to extent plus margin
            assert_eq!(manager.with_monitor("C1", |m| m.fence().range_km), Some(75));
        }
    }

    mod sweep {
        use super::*;

        #[test]
        fn test_stale_monitor_removed_after_sweep() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);

            fx.shapes.remove("C1");
            let summary = manager.tick();
            assert_eq!(summary.removed, vec!["C1"]);
            assert_eq!(manager.count(), 0);
            assert!(fx.persistence.is_empty());
        }

        #[test]
        fn test_unusable_geometry_queued_for_removal() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);

            fx.shapes.upsert(Shape::circle("C1", CENTER, -5.0));
            manager.on_shape_changed("C1");
            assert_eq!(manager.count(), 1);
            assert_eq!(manager.tick().removed, vec!["C1"]);
        }

        #[test]
        fn test_alerts_forwarded_to_sink() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            fx.place("U1", "a-f-G", 50.0);
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);

            let summary = manager.tick();
            assert_eq!(summary.alerts, 1);
            assert_eq!(fx.alerts.active("C1").len(), 1);
        }

        #[test]
        fn test_notices_for_replaced_monitor_dropped() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);
            let stale = manager.live_generation("C1").unwrap();
            manager.on_fence_changed(Fence::new("C1", Trigger::Exit, MonitoredType::All));
            let writes = fx.persistence.writes();

            let mut outbox = Outbox::new();
            outbox.push(Notice::Persist {
                state: MonitorState::new(Fence::new("C1", Trigger::Entry, MonitoredType::All), vec![]),
                generation: Some(stale),
            });
            outbox.push(Notice::Alerts {
                id: "C1".to_string(),
                generation: stale,
                alerts: vec![Alert::new("C1", "U1", Some(CENTER), true)],
            });
            manager.dispatch(outbox);

            assert_eq!(fx.persistence.writes(), writes);
            assert!(fx.alerts.active("C1").is_empty());
            let stored = fx.persistence.load("C1").unwrap().unwrap();
            assert_eq!(stored.fence.trigger, Trigger::Exit);
        }

        #[test]
        fn test_disposed_manager_ignores_ticks() {
            let fx = Fixture::new();
            fx.shapes.upsert(Shape::circle("C1", CENTER, 100.0));
            let manager = fx.manager();
            manager.on_fence_added(Fence::new("C1", Trigger::Entry, MonitoredType::All), false);
            manager.dispose();
            assert_eq!(manager.count(), 0);
            assert_eq!(manager.tick(), TickSummary::default());
        }
    }
}
