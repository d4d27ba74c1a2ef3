//! Global candidate pools, one per monitored type.

use std::collections::{BTreeSet, HashMap};

use crate::fence::MonitoredType;
use crate::item::TrackedItem;

/// Uids of every known item, bucketed by the monitored types they match.
#[derive(Debug, Default)]
pub struct TypePools {
    pools: HashMap<MonitoredType, BTreeSet<String>>,
}

impl TypePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an item to every pool it matches. Returns the number of pools.
    pub fn add(&mut self, item: &TrackedItem) -> usize {
        let mut added = 0;
        for tt in MonitoredType::VARIANTS {
            if tt.matches(item) {
                self.pools.entry(tt).or_default().insert(item.uid.clone());
                added += 1;
            }
        }
        added
    }

    /// Remove a uid from every pool.
    pub fn remove(&mut self, uid: &str) {
        for pool in self.pools.values_mut() {
            pool.remove(uid);
        }
    }

    /// Uids in a pool, sorted.
    pub fn uids(&self, tt: MonitoredType) -> Vec<String> {
        self.pools
            .get(&tt)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, tt: MonitoredType, uid: &str) -> bool {
        self.pools.get(&tt).is_some_and(|p| p.contains(uid))
    }

    pub fn len(&self, tt: MonitoredType) -> usize {
        self.pools.get(&tt).map_or(0, BTreeSet::len)
    }

    pub fn clear(&mut self) {
        self.pools.clear();
    }
}
