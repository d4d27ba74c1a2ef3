//! Geofence monitoring engine.
//!
//! Fences are bound to shapes (circles, rectangles, closed polylines) and
//! watched against a population of moving items. A periodic sweep evaluates
//! every tracked item and raises an alert when it crosses a fence in the
//! direction the fence's trigger asks for.
//!
//! # Architecture
//!
//! ```text
//! host events ──► FenceManager ──► FenceMonitor ──► MonitorGeometry
//!  (fence/shape/item)   │              │              ├─ CircleMonitor
//!                       │              │              └─ PolygonMonitor ──► SharedSpatialIndex
//!                       │              ▼
//!                       │           Alerts ──► AlertSink
//!                       ├──► PersistenceSink
//!                       └──► MonitorListener
//!
//! MonitorService ── interval ──► FenceManager::tick()
//! ```

pub mod alert;
pub mod config;
pub mod coord;
pub mod error;
pub mod fence;
pub mod index;
pub mod item;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod persist;
pub mod service;
pub mod shape;

pub use alert::{Alert, AlertLog, AlertSink};
pub use config::{ConfigFile, LoggingConfig, MonitorConfig};
pub use coord::GeoPoint;
pub use error::{GeofenceError, GeofenceResult};
pub use fence::{ElevationRange, Fence, MonitoredType, Trigger};
pub use index::{SharedSpatialIndex, SpatialIndex};
pub use item::{ItemProvider, MemoryItemStore, TrackedItem};
pub use manager::{FenceManager, MonitorListener, TickSummary};
pub use monitor::FenceMonitor;
pub use persist::{JsonFilePersistence, MemoryPersistence, MonitorState, PersistenceSink};
pub use service::MonitorService;
pub use shape::{MemoryShapeStore, Shape, ShapeGeometry, ShapeKind, ShapeProvider};
