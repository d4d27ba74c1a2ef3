//! Fence definitions: the monitoring policy attached to a shape.

use serde::{Deserialize, Serialize};

use crate::item::TrackedItem;

/// Default search range around a fence when none (or a bogus one) is given.
pub const DEFAULT_RANGE_KM: u32 = 75;

/// Largest search range accepted for a fence.
pub const MAX_RANGE_KM: u32 = 2000;

/// Lowest elevation bound accepted, in meters HAE.
pub const MIN_ELEVATION_M: f64 = -500.0;

/// Highest elevation bound accepted, in meters HAE.
pub const MAX_ELEVATION_M: f64 = 100_000.0;

/// CoT type prefix shared by every trackable atom.
const ATOM_PREFIX: &str = "a-";

/// Which transition raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    /// Outside to inside.
    Entry,
    /// Inside to outside.
    Exit,
    /// Either direction.
    Both,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Entry => write!(f, "Entry"),
            Trigger::Exit => write!(f, "Exit"),
            Trigger::Both => write!(f, "Both"),
        }
    }
}

/// Population of items a fence watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitoredType {
    /// Friendly atoms (`a-f-*`).
    Friendly,
    /// Hostile atoms (`a-h-*`).
    Hostile,
    /// Other TAK users on the network.
    TakUsers,
    /// Every atom.
    All,
    /// A user-selected subset of atoms.
    Custom,
}

impl MonitoredType {
    /// Every variant, in pool maintenance order.
    pub const VARIANTS: [MonitoredType; 5] = [
        MonitoredType::Friendly,
        MonitoredType::Hostile,
        MonitoredType::TakUsers,
        MonitoredType::All,
        MonitoredType::Custom,
    ];

    /// Whether the item belongs to this population.
    ///
    /// `Custom` accepts every atom; the actual subset comes from the user's
    /// selection on the monitor.
    pub fn matches(&self, item: &TrackedItem) -> bool {
        if !item.item_type.starts_with(ATOM_PREFIX) {
            return false;
        }
        match self {
            MonitoredType::Friendly => item.item_type.starts_with("a-f"),
            MonitoredType::Hostile => item.item_type.starts_with("a-h"),
            MonitoredType::TakUsers => item.tak_user,
            MonitoredType::All | MonitoredType::Custom => true,
        }
    }
}

impl std::fmt::Display for MonitoredType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitoredType::Friendly => write!(f, "Friendly"),
            MonitoredType::Hostile => write!(f, "Hostile"),
            MonitoredType::TakUsers => write!(f, "TAK Users"),
            MonitoredType::All => write!(f, "All"),
            MonitoredType::Custom => write!(f, "Custom"),
        }
    }
}

/// Optional altitude band a fence applies to, in meters HAE.
///
/// A missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ElevationRange {
    /// Lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound.
    #[serde(default)]
    pub max: Option<f64>,
}

impl ElevationRange {
    /// Range without bounds.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Build a range, normalizing bogus input.
    ///
    /// Non-finite or out-of-limits bounds are dropped; swapped bounds are
    /// put back in order.
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        let min = min.filter(|v| v.is_finite() && *v >= MIN_ELEVATION_M);
        let max = max.filter(|v| v.is_finite() && *v <= MAX_ELEVATION_M);
        match (min, max) {
            (Some(lo), Some(hi)) if lo > hi => Self {
                min: Some(hi),
                max: Some(lo),
            },
            _ => Self { min, max },
        }
    }

    /// Whether either bound is set.
    pub fn is_bounded(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    /// Whether the item's altitude satisfies this range.
    ///
    /// An unbounded range accepts everything. A bounded range requires an
    /// item with a valid, known altitude.
    pub fn contains(&self, alt: Option<f64>, elevation_valid: bool) -> bool {
        if !self.is_bounded() {
            return true;
        }
        let Some(alt) = alt.filter(|_| elevation_valid) else {
            return false;
        };
        self.min.map_or(true, |lo| alt >= lo) && self.max.map_or(true, |hi| alt <= hi)
    }
}

/// A user-defined fence: a shape reference plus its monitoring policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fence {
    /// Uid of the shape this fence is attached to.
    pub shape_id: String,
    /// Whether alerts are enabled.
    pub tracking: bool,
    /// Transition that raises alerts.
    pub trigger: Trigger,
    /// Population of items considered.
    pub monitored_type: MonitoredType,
    /// Search range around the fence center used for candidate selection.
    pub range_km: u32,
    /// Altitude band.
    #[serde(default)]
    pub elevation: ElevationRange,
}

impl Fence {
    /// Create a tracking fence with the default range and no altitude band.
    pub fn new(shape_id: impl Into<String>, trigger: Trigger, monitored_type: MonitoredType) -> Self {
        Self {
            shape_id: shape_id.into(),
            tracking: true,
            trigger,
            monitored_type,
            range_km: DEFAULT_RANGE_KM,
            elevation: ElevationRange::unbounded(),
        }
    }

    /// Set the search range, normalized with [`normalize_range_km`].
    pub fn with_range_km(mut self, range_km: u32) -> Self {
        self.range_km = normalize_range_km(range_km, DEFAULT_RANGE_KM, MAX_RANGE_KM);
        self
    }

    /// Set the altitude band.
    pub fn with_elevation(mut self, elevation: ElevationRange) -> Self {
        self.elevation = elevation;
        self
    }

    /// Set the tracking flag.
    pub fn with_tracking(mut self, tracking: bool) -> Self {
        self.tracking = tracking;
        self
    }

    /// A fence is valid when it references a shape.
    pub fn is_valid(&self) -> bool {
        !self.shape_id.trim().is_empty()
    }
}

impl std::fmt::Display for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{} {} {}km{}]",
            self.shape_id,
            self.trigger,
            self.monitored_type,
            self.range_km,
            if self.tracking { "" } else { " off" }
        )
    }
}

/// Clamp a search range: below 1km falls back to `default_km`, above
/// `max_km` is capped.
pub fn normalize_range_km(range_km: u32, default_km: u32, max_km: u32) -> u32 {
    if range_km < 1 {
        tracing::warn!(range_km, default_km, "Using default fence range");
        default_km
    } else if range_km > max_km {
        tracing::warn!(range_km, max_km, "Using max fence range");
        max_km
    } else {
        range_km
    }
}
