//! Alerts raised by fence breaches and the sink contract that receives them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::coord::GeoPoint;

/// A single breach notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Monitor (shape uid) that fired.
    pub monitor_id: String,
    /// Item that crossed the fence.
    pub item_uid: String,
    /// When the crossing was detected.
    pub timestamp: DateTime<Utc>,
    /// Item position at detection time.
    pub location: Option<GeoPoint>,
    /// Whether the item is now inside the fence.
    pub inside: bool,
}

impl Alert {
    /// Create an alert stamped with the current time.
    pub fn new(monitor_id: impl Into<String>, item_uid: impl Into<String>, location: Option<GeoPoint>, inside: bool) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            item_uid: item_uid.into(),
            timestamp: Utc::now(),
            location,
            inside,
        }
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} {}",
            self.timestamp.format("%H:%M:%S"),
            self.item_uid,
            if self.inside { "entered" } else { "exited" },
            self.monitor_id
        )?;
        if let Some(location) = &self.location {
            write!(f, " at {}", location)?;
        }
        Ok(())
    }
}

/// Receives alert batches from the manager.
///
/// Called after the manager's registry lock is released, so implementations
/// may call back into the manager.
pub trait AlertSink: Send + Sync {
    /// Deliver a non-empty batch for one monitor. With `auto_dismiss` the
    /// batch replaces the monitor's outstanding alerts.
    fn alert(&self, monitor_id: &str, alerts: &[Alert], auto_dismiss: bool);

    /// Dismiss one item's alert, or every alert of the monitor when `item`
    /// is `None`. Returns true when the monitor has no outstanding alerts
    /// left.
    fn dismiss(&self, monitor_id: &str, item: Option<&str>) -> bool;

    /// Dismiss every outstanding alert.
    fn dismiss_all(&self);
}

/// In-memory [`AlertSink`] keeping the newest alert per item and monitor.
#[derive(Debug, Default)]
pub struct AlertLog {
    active: Mutex<HashMap<String, Vec<Alert>>>,
    received: AtomicU64,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding alerts of a monitor, oldest first.
    pub fn active(&self, monitor_id: &str) -> Vec<Alert> {
        self.active.lock().get(monitor_id).cloned().unwrap_or_default()
    }

    /// Outstanding alerts across all monitors.
    pub fn active_count(&self) -> usize {
        self.active.lock().values().map(Vec::len).sum()
    }

    /// Total alerts delivered since creation, dismissed or not.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl AlertSink for AlertLog {
    fn alert(&self, monitor_id: &str, alerts: &[Alert], auto_dismiss: bool) {
        self.received.fetch_add(alerts.len() as u64, Ordering::Relaxed);
        let mut active = self.active.lock();
        let entry = active.entry(monitor_id.to_string()).or_default();
        if auto_dismiss {
            entry.clear();
        }
        for alert in alerts {
            entry.retain(|a| a.item_uid != alert.item_uid);
            entry.push(alert.clone());
        }
    }

    fn dismiss(&self, monitor_id: &str, item: Option<&str>) -> bool {
        let mut active = self.active.lock();
        match item {
            None => {
                active.remove(monitor_id);
                true
            }
            Some(uid) => {
                let Some(entry) = active.get_mut(monitor_id) else {
                    return true;
                };
                entry.retain(|a| a.item_uid != uid);
                if entry.is_empty() {
                    active.remove(monitor_id);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn dismiss_all(&self) {
        self.active.lock().clear();
    }
}
