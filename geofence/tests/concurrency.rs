//! Host events racing with sweeps and with collaborator callbacks.
//!
//! Collaborators here call back into the manager from inside their own
//! methods. The registry lock is not reentrant, so any of them being invoked
//! under it would deadlock; [`within_deadline`] turns that into a failure.
//!
//! Run with: `cargo test --test concurrency`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use geofence::{
    Alert, AlertLog, AlertSink, Fence, FenceManager, GeoPoint, GeofenceResult, ItemProvider, MemoryItemStore,
    MemoryPersistence, MemoryShapeStore, MonitorConfig, MonitorListener, MonitorState, MonitoredType,
    PersistenceSink, Shape, ShapeProvider, TrackedItem, Trigger,
};

// ============================================================================
// Helpers
// ============================================================================

const ORIGIN: GeoPoint = GeoPoint {
    lat: 0.0,
    lon: 0.0,
    alt: None,
};

fn item_at(uid: &str, distance_m: f64) -> TrackedItem {
    TrackedItem::new(uid, "a-f-G").at(ORIGIN.destination(90.0, distance_m))
}

/// Manager handle for collaborators built before the manager.
#[derive(Default)]
struct Backref(OnceLock<Weak<FenceManager>>);

impl Backref {
    fn set(&self, manager: &Arc<FenceManager>) {
        let _ = self.0.set(Arc::downgrade(manager));
    }

    fn get(&self) -> Option<Arc<FenceManager>> {
        self.0.get().and_then(Weak::upgrade)
    }
}

/// Run `f` on its own thread, failing rather than hanging on a deadlock.
fn within_deadline<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("manager deadlocked or the task panicked")
}

/// Persistence that forwards to memory and runs a hook before the first
/// write.
struct HookedPersistence {
    inner: MemoryPersistence,
    hook: Mutex<Option<Box<dyn FnOnce(&MonitorState) + Send>>>,
}

impl HookedPersistence {
    fn new(hook: impl FnOnce(&MonitorState) + Send + 'static) -> Self {
        Self {
            inner: MemoryPersistence::new(),
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }
}

impl PersistenceSink for HookedPersistence {
    fn persist(&self, state: &MonitorState) -> GeofenceResult<()> {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook(state);
        }
        self.inner.persist(state)
    }

    fn remove(&self, shape_id: &str) -> GeofenceResult<()> {
        self.inner.remove(shape_id)
    }

    fn clear_all(&self) -> GeofenceResult<()> {
        self.inner.clear_all()
    }

    fn load(&self, shape_id: &str) -> GeofenceResult<Option<MonitorState>> {
        self.inner.load(shape_id)
    }

    fn load_all(&self) -> GeofenceResult<Vec<MonitorState>> {
        self.inner.load_all()
    }
}

// ============================================================================
// Shapes arriving mid-registration
// ============================================================================

/// Misses its first lookup, but stores the shape and announces it to the
/// manager before answering.
struct LateShapes {
    store: MemoryShapeStore,
    late: Mutex<Option<Shape>>,
    manager: Backref,
}

impl ShapeProvider for LateShapes {
    fn shape(&self, id: &str) -> Option<Shape> {
        let late = self.late.lock().take();
        if let Some(shape) = late {
            let shape_id = shape.id.clone();
            self.store.upsert(shape);
            if let Some(manager) = self.manager.get() {
                manager.on_shape_added(&shape_id);
            }
            return None;
        }
        self.store.shape(id)
    }

    fn exists(&self, id: &str) -> bool {
        self.store.exists(id)
    }
}

#[test]
fn test_shape_arriving_during_lookup_registers_fence() {
    let items = Arc::new(MemoryItemStore::new());
    items.upsert(item_at("U1", 50.0));
    let shapes = Arc::new(LateShapes {
        store: MemoryShapeStore::new(),
        late: Mutex::new(Some(Shape::circle("S1", ORIGIN, 100.0))),
        manager: Backref::default(),
    });
    let alerts = Arc::new(AlertLog::new());
    let manager = Arc::new(FenceManager::new(MonitorConfig::default(), shapes.clone(), items).with_alert_sink(alerts.clone()));
    shapes.manager.set(&manager);

    manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false);

    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.count(), 1);
    assert!(manager.is_tracking("S1"));
    assert_eq!(manager.tick().alerts, 1);
    assert_eq!(alerts.active("S1").len(), 1);
}

// ============================================================================
// Removal racing with delivery
// ============================================================================

#[test]
fn test_removal_during_persist_leaves_no_state() {
    let manager_ref = Arc::new(Backref::default());
    let hook_ref = Arc::clone(&manager_ref);
    let persistence = Arc::new(HookedPersistence::new(move |state| {
        if let Some(manager) = hook_ref.get() {
            manager.on_fence_removed(state.shape_id());
        }
    }));

    let shapes = Arc::new(MemoryShapeStore::new());
    shapes.upsert(Shape::circle("S1", ORIGIN, 100.0));
    let manager = Arc::new(
        FenceManager::new(MonitorConfig::default(), shapes, Arc::new(MemoryItemStore::new()))
            .with_persistence(persistence.clone()),
    );
    manager_ref.set(&manager);

    manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false);

    assert_eq!(manager.count(), 0);
    assert!(persistence.load("S1").unwrap().is_none());
    // A restart brings nothing back
    assert_eq!(manager.restore().unwrap(), 0);
}

#[test]
fn test_removal_on_another_thread_during_persist_wins() {
    let gate = Arc::new(Barrier::new(2));
    let hook_gate = Arc::clone(&gate);
    let persistence = Arc::new(HookedPersistence::new(move |_| {
        hook_gate.wait();
        hook_gate.wait();
    }));

    let shapes = Arc::new(MemoryShapeStore::new());
    shapes.upsert(Shape::circle("S1", ORIGIN, 100.0));
    let manager = Arc::new(
        FenceManager::new(MonitorConfig::default(), shapes, Arc::new(MemoryItemStore::new()))
            .with_persistence(persistence.clone()),
    );

    let adder = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false))
    };

    // The population write is parked in the sink
    gate.wait();
    manager.on_fence_removed("S1");
    gate.wait();
    adder.join().unwrap();

    assert_eq!(manager.count(), 0);
    assert!(persistence.load("S1").unwrap().is_none());
}

/// Alert log that removes the monitor it is alerted for before recording
/// the first batch.
struct RemovingAlerts {
    log: AlertLog,
    armed: AtomicBool,
    manager: Backref,
}

impl AlertSink for RemovingAlerts {
    fn alert(&self, monitor_id: &str, alerts: &[Alert], auto_dismiss: bool) {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(manager) = self.manager.get() {
                manager.on_fence_removed(monitor_id);
            }
        }
        self.log.alert(monitor_id, alerts, auto_dismiss);
    }

    fn dismiss(&self, monitor_id: &str, item: Option<&str>) -> bool {
        self.log.dismiss(monitor_id, item)
    }

    fn dismiss_all(&self) {
        self.log.dismiss_all();
    }
}

#[test]
fn test_removal_during_alert_leaves_no_alerts() {
    let shapes = Arc::new(MemoryShapeStore::new());
    shapes.upsert(Shape::circle("S1", ORIGIN, 100.0));
    let items = Arc::new(MemoryItemStore::new());
    items.upsert(item_at("U1", 50.0));
    let alerts = Arc::new(RemovingAlerts {
        log: AlertLog::new(),
        armed: AtomicBool::new(true),
        manager: Backref::default(),
    });
    let manager = Arc::new(FenceManager::new(MonitorConfig::default(), shapes, items).with_alert_sink(alerts.clone()));
    alerts.manager.set(&manager);
    manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false);

    assert_eq!(manager.tick().alerts, 1);

    assert_eq!(manager.count(), 0);
    assert_eq!(alerts.log.received(), 1);
    assert!(alerts.log.active("S1").is_empty());
    assert_eq!(alerts.log.active_count(), 0);
}

// ============================================================================
// Collaborators calling back into the manager
// ============================================================================

/// Item store that queries the manager on every lookup.
struct CallbackItems {
    store: MemoryItemStore,
    manager: Backref,
    lookups: AtomicUsize,
}

impl ItemProvider for CallbackItems {
    fn item(&self, uid: &str) -> Option<TrackedItem> {
        if let Some(manager) = self.manager.get() {
            manager.pending_count();
            self.lookups.fetch_add(1, Ordering::Relaxed);
        }
        self.store.item(uid)
    }

    fn items(&self) -> Vec<TrackedItem> {
        self.store.items()
    }
}

/// Shape store that queries the manager on every existence check.
struct CallbackShapes {
    store: MemoryShapeStore,
    manager: Backref,
    checks: AtomicUsize,
}

impl ShapeProvider for CallbackShapes {
    fn shape(&self, id: &str) -> Option<Shape> {
        if let Some(manager) = self.manager.get() {
            manager.count();
        }
        self.store.shape(id)
    }

    fn exists(&self, id: &str) -> bool {
        if let Some(manager) = self.manager.get() {
            manager.count();
            self.checks.fetch_add(1, Ordering::Relaxed);
        }
        self.store.exists(id)
    }
}

#[test]
fn test_providers_queried_outside_registry_lock() {
    let (lookups, checks) = within_deadline(|| {
        let shapes = Arc::new(CallbackShapes {
            store: MemoryShapeStore::new(),
            manager: Backref::default(),
            checks: AtomicUsize::new(0),
        });
        shapes.store.upsert(Shape::circle("S1", ORIGIN, 100.0));
        shapes.store.upsert(Shape::circle("S2", ORIGIN, 100.0));
        let items = Arc::new(CallbackItems {
            store: MemoryItemStore::new(),
            manager: Backref::default(),
            lookups: AtomicUsize::new(0),
        });
        items.store.upsert(item_at("U1", 300.0));
        let manager = Arc::new(FenceManager::new(
            MonitorConfig::default().with_rescan_period(2),
            shapes.clone(),
            items.clone(),
        ));
        shapes.manager.set(&manager);
        items.manager.set(&manager);

        manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false);
        manager.on_fence_added(Fence::new("S2", Trigger::Entry, MonitoredType::Custom), false);
        manager.on_items_selected("S2", vec!["U1".to_string()]);

        items.store.upsert(item_at("U2", 50.0));
        manager.on_item_added("U2");
        let mut raised = 0;
        for _ in 0..4 {
            raised += manager.tick().alerts;
        }
        assert_eq!(raised, 1);

        (items.lookups.load(Ordering::Relaxed), shapes.checks.load(Ordering::Relaxed))
    });
    assert!(lookups > 0);
    assert!(checks > 0);
}

/// Listener that inspects the manager from every callback.
#[derive(Default)]
struct InspectingListener {
    manager: Backref,
    seen: AtomicUsize,
}

impl MonitorListener for InspectingListener {
    fn on_monitor_added(&self, monitor_id: &str) {
        if let Some(manager) = self.manager.get() {
            manager.is_tracking(monitor_id);
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_monitor_changed(&self, monitor_id: &str) {
        if let Some(manager) = self.manager.get() {
            manager.with_monitor(monitor_id, |m| m.tracked_uids().len());
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_monitor_removed(&self, _monitor_id: &str) {
        if let Some(manager) = self.manager.get() {
            manager.monitor_ids();
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[test]
fn test_sinks_and_listeners_called_after_lock_released() {
    let seen = within_deadline(|| {
        let manager_ref = Arc::new(Backref::default());
        let hook_ref = Arc::clone(&manager_ref);
        let persistence = Arc::new(HookedPersistence::new(move |state| {
            if let Some(manager) = hook_ref.get() {
                assert!(manager.with_monitor(state.shape_id(), |_| ()).is_some());
            }
        }));
        let alerts = Arc::new(RemovingAlerts {
            log: AlertLog::new(),
            armed: AtomicBool::new(false),
            manager: Backref::default(),
        });

        let shapes = Arc::new(MemoryShapeStore::new());
        shapes.upsert(Shape::circle("S1", ORIGIN, 100.0));
        let items = Arc::new(MemoryItemStore::new());
        items.upsert(item_at("U1", 50.0));
        let manager = Arc::new(
            FenceManager::new(MonitorConfig::default(), shapes, items)
                .with_alert_sink(alerts.clone())
                .with_persistence(persistence),
        );
        manager_ref.set(&manager);
        alerts.manager.set(&manager);
        let listener = Arc::new(InspectingListener::default());
        listener.manager.set(&manager);
        manager.add_listener(listener.clone());

        manager.on_fence_added(Fence::new("S1", Trigger::Entry, MonitoredType::All), false);
        assert_eq!(manager.tick().alerts, 1);
        manager.on_fence_removed("S1");
        assert_eq!(alerts.log.active_count(), 0);

        listener.seen.load(Ordering::Relaxed)
    });
    // added, changed by population, changed by the alert, removed
    assert_eq!(seen, 4);
}

// ============================================================================
// Threads interleaving events with sweeps
// ============================================================================

#[test]
fn test_events_interleave_with_ticks() {
    within_deadline(|| {
        let shapes = Arc::new(MemoryShapeStore::new());
        for n in 0..4 {
            shapes.upsert(Shape::circle(format!("S{}", n), ORIGIN, 100.0 + 50.0 * n as f64));
        }
        let items = Arc::new(MemoryItemStore::new());
        let alerts = Arc::new(AlertLog::new());
        let persistence = Arc::new(MemoryPersistence::new());
        let manager = Arc::new(
            FenceManager::new(MonitorConfig::default().with_rescan_period(3), shapes.clone(), items.clone())
                .with_alert_sink(alerts.clone())
                .with_persistence(persistence.clone()),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut ticks = 0u64;
                while !stop.load(Ordering::SeqCst) {
                    manager.tick();
                    ticks += 1;
                }
                ticks
            })
        };
        let mover = {
            let manager = Arc::clone(&manager);
            let items = Arc::clone(&items);
            thread::spawn(move || {
                for i in 0..300u32 {
                    let uid = format!("U{}", i % 12);
                    items.upsert(item_at(&uid, f64::from((i * 37) % 400)));
                    if i % 3 == 0 {
                        manager.on_item_added(&uid);
                    }
                    if i % 11 == 0 {
                        items.remove(&uid);
                        manager.on_item_removed(&uid);
                    }
                }
            })
        };
        let fencer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..120u32 {
                    let id = format!("S{}", i % 4);
                    match i % 3 {
                        0 | 1 => manager.on_fence_added(Fence::new(id, Trigger::Both, MonitoredType::All), false),
                        _ => manager.on_fence_removed(&id),
                    }
                }
            })
        };

        mover.join().unwrap();
        fencer.join().unwrap();
        stop.store(true, Ordering::SeqCst);
        assert!(ticker.join().unwrap() > 0);

        // Every surviving monitor is whole and its stored state matches
        for id in manager.monitor_ids() {
            assert!(manager.with_monitor(&id, |m| m.is_valid()).unwrap_or(false));
            let stored = persistence.load(&id).unwrap().map(|s| s.fence.shape_id);
            assert_eq!(stored.as_deref(), Some(id.as_str()));
            manager.on_fence_removed(&id);
        }
        manager.tick();

        assert_eq!(manager.count(), 0);
        assert!(persistence.is_empty());
        assert_eq!(alerts.active_count(), 0);
    });
}
