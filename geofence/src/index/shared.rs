//! Lock-funnelled access to a spatial index.
//!
//! Every read and write takes the lock for exactly one geometry call and
//! releases it before returning. Callers never hold the lock across an item
//! loop, so many polygon monitors interleave fairly on one index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{GeometryHandle, IndexError, MemorySpatialIndex, SpatialIndex};
use crate::coord::GeoPoint;

/// Point-in-time copy of index call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Point inserts and updates.
    pub point_writes: u64,
    /// Polygon inserts and updates.
    pub polygon_writes: u64,
    /// Deletes of any geometry.
    pub deletes: u64,
    /// Containment queries.
    pub queries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    point_writes: AtomicU64,
    polygon_writes: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
}

/// Cloneable, thread-safe handle to a single spatial index.
///
/// # Example
///
/// ```
/// use geofence::coord::GeoPoint;
/// use geofence::index::SharedSpatialIndex;
///
/// let index = SharedSpatialIndex::in_memory();
/// let ring = [
///     GeoPoint::new(0.0, 0.0),
///     GeoPoint::new(0.0, 1.0),
///     GeoPoint::new(1.0, 1.0),
///     GeoPoint::new(1.0, 0.0),
/// ];
/// let polygon = index.create_polygon(&ring).unwrap();
/// let point = index.create_point(&GeoPoint::new(0.5, 0.5)).unwrap();
/// assert!(index.contains(polygon, point).unwrap());
/// ```
#[derive(Clone)]
pub struct SharedSpatialIndex {
    inner: Arc<Mutex<Box<dyn SpatialIndex>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SharedSpatialIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSpatialIndex")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SharedSpatialIndex {
    /// Wrap an index implementation.
    pub fn new(index: Box<dyn SpatialIndex>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(index)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a shared [`MemorySpatialIndex`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemorySpatialIndex::new()))
    }

    pub fn create_point(&self, point: &GeoPoint) -> Result<GeometryHandle, IndexError> {
        self.counters.point_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().create_point(point)
    }

    pub fn update_point(&self, handle: GeometryHandle, point: &GeoPoint) -> Result<(), IndexError> {
        self.counters.point_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().update_point(handle, point)
    }

    pub fn create_polygon(&self, ring: &[GeoPoint]) -> Result<GeometryHandle, IndexError> {
        self.counters.polygon_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().create_polygon(ring)
    }

    pub fn update_polygon(&self, handle: GeometryHandle, ring: &[GeoPoint]) -> Result<(), IndexError> {
        self.counters.polygon_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().update_polygon(handle, ring)
    }

    pub fn delete(&self, handle: GeometryHandle) -> Result<(), IndexError> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().delete(handle)
    }

    pub fn contains(&self, polygon: GeometryHandle, point: GeometryHandle) -> Result<bool, IndexError> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().contains(polygon, point)
    }

    /// Number of stored geometries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no geometries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every stored geometry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Snapshot the call counters.
    pub fn stats(&self) -> IndexStats {
        IndexStats {
            point_writes: self.counters.point_writes.load(Ordering::Relaxed),
            polygon_writes: self.counters.polygon_writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            queries: self.counters.queries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_stats_count_calls() {
        let index = SharedSpatialIndex::in_memory();
        let pt = index.create_point(&GeoPoint::new(0.0, 0.0)).unwrap();
        index.update_point(pt, &GeoPoint::new(0.1, 0.1)).unwrap();
        index.delete(pt).unwrap();

        let stats = index.stats();
        assert_eq!(stats.point_writes, 2);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.polygon_writes, 0);
    }

    #[test]
    fn test_clones_share_storage() {
        let index = SharedSpatialIndex::in_memory();
        let other = index.clone();
        index.create_point(&GeoPoint::new(0.0, 0.0)).unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let index = SharedSpatialIndex::in_memory();
        let mut handles = vec![];

        for i in 0..8 {
            let idx = index.clone();
            handles.push(thread::spawn(move || {
                for j in 0..50 {
                    idx.create_point(&GeoPoint::new(i as f64, j as f64)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(index.len(), 400);
        assert_eq!(index.stats().point_writes, 400);
    }
}
