//! Tracked items and the provider contract that resolves their positions.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::coord::GeoPoint;

/// A spatial entity (marker, contact) that fences can watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    /// Stable unique id.
    pub uid: String,
    /// CoT type string, e.g. `a-f-G-U-C`.
    pub item_type: String,
    /// Whether this item is another TAK user.
    #[serde(default)]
    pub tak_user: bool,
    /// Current position, if known.
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Whether the altitude in `location` can be trusted.
    #[serde(default)]
    pub elevation_valid: bool,
}

impl TrackedItem {
    /// Create an item without a position.
    pub fn new(uid: impl Into<String>, item_type: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            item_type: item_type.into(),
            tak_user: false,
            location: None,
            elevation_valid: false,
        }
    }

    /// Set the position. Elevation is considered valid when it is present.
    pub fn at(mut self, location: GeoPoint) -> Self {
        self.elevation_valid = location.alt.is_some();
        self.location = Some(location);
        self
    }

    /// Mark the item as a TAK user.
    pub fn as_tak_user(mut self) -> Self {
        self.tak_user = true;
        self
    }

    /// Altitude, if known.
    pub fn altitude(&self) -> Option<f64> {
        self.location.and_then(|p| p.alt)
    }
}

/// Resolves item uids to their current state.
///
/// Implemented by the host application's map model. Must be cheap: monitors
/// call it once per tracked item per tick.
pub trait ItemProvider: Send + Sync {
    /// Look up an item by uid.
    fn item(&self, uid: &str) -> Option<TrackedItem>;

    /// Every item currently known.
    fn items(&self) -> Vec<TrackedItem>;
}

/// In-memory [`ItemProvider`].
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<HashMap<String, TrackedItem>>,
}

impl MemoryItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item.
    pub fn upsert(&self, item: TrackedItem) {
        self.items.write().insert(item.uid.clone(), item);
    }

    /// Remove an item, returning it.
    pub fn remove(&self, uid: &str) -> Option<TrackedItem> {
        self.items.write().remove(uid)
    }

    /// Move an item. Returns false if the uid is unknown.
    pub fn set_location(&self, uid: &str, location: GeoPoint) -> bool {
        match self.items.write().get_mut(uid) {
            Some(item) => {
                item.elevation_valid = location.alt.is_some();
                item.location = Some(location);
                true
            }
            None => false,
        }
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl ItemProvider for MemoryItemStore {
    fn item(&self, uid: &str) -> Option<TrackedItem> {
        self.items.read().get(uid).cloned()
    }

    fn items(&self) -> Vec<TrackedItem> {
        let mut items: Vec<TrackedItem> = self.items.read().values().cloned().collect();
        items.sort_by(|a, b| a.uid.cmp(&b.uid));
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_sets_elevation_validity() {
        let item = TrackedItem::new("u1", "a-f-G").at(GeoPoint::with_alt(0.0, 0.0, 10.0));
        assert!(item.elevation_valid);
        assert_eq!(item.altitude(), Some(10.0));

        let item = TrackedItem::new("u2", "a-f-G").at(GeoPoint::new(0.0, 0.0));
        assert!(!item.elevation_valid);
    }

    #[test]
    fn test_store_upsert_and_lookup() {
        let store = MemoryItemStore::new();
        store.upsert(TrackedItem::new("u1", "a-f-G"));
        assert_eq!(store.item("u1").unwrap().item_type, "a-f-G");
        assert!(store.item("missing").is_none());
    }

    #[test]
    fn test_store_set_location() {
        let store = MemoryItemStore::new();
        store.upsert(TrackedItem::new("u1", "a-f-G"));
        assert!(store.set_location("u1", GeoPoint::new(1.0, 2.0)));
        assert!(!store.set_location("u2", GeoPoint::new(1.0, 2.0)));
        assert_eq!(store.item("u1").unwrap().location, Some(GeoPoint::new(1.0, 2.0)));
    }

    #[test]
    fn test_items_sorted_by_uid() {
        let store = MemoryItemStore::new();
        store.upsert(TrackedItem::new("b", "a-f-G"));
        store.upsert(TrackedItem::new("a", "a-f-G"));
        let uids: Vec<String> = store.items().into_iter().map(|i| i.uid).collect();
        assert_eq!(uids, vec!["a", "b"]);
    }

    #[test]
    fn test_remove() {
        let store = MemoryItemStore::new();
        store.upsert(TrackedItem::new("u1", "a-f-G"));
        assert!(store.remove("u1").is_some());
        assert!(store.is_empty());
    }
}
