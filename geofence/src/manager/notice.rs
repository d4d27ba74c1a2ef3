//! Listener contract and the deferred side effects of manager operations.
//!
//! Operations record [`Notice`]s while holding the registry lock and
//! dispatch them once it is released, so sinks and listeners never run under
//! the lock and may call back into the manager. Dispatches from different
//! threads are not ordered, so alert and persist notices carry the slot
//! generation they were produced for and are re-checked on delivery.

use crate::alert::Alert;
use crate::persist::MonitorState;

/// Observer of monitor lifecycle changes.
pub trait MonitorListener: Send + Sync {
    fn on_monitor_added(&self, monitor_id: &str);

    fn on_monitor_changed(&self, monitor_id: &str);

    fn on_monitor_removed(&self, monitor_id: &str);

    /// A Custom fence needs a selection from `candidates` before it can
    /// alert. Answer with [`FenceManager::on_items_selected`].
    ///
    /// [`FenceManager::on_items_selected`]: super::FenceManager::on_items_selected
    fn on_selection_required(&self, monitor_id: &str, candidates: &[String]) {
        let _ = (monitor_id, candidates);
    }
}

#[derive(Debug)]
pub(crate) enum Notice {
    Added(String),
    Changed(String),
    Removed(String),
    SelectionRequired(String, Vec<String>),
    /// Alerts raised by the monitor at `generation`. Dropped or withdrawn
    /// when that monitor is gone by the time they are delivered.
    Alerts {
        id: String,
        generation: u64,
        alerts: Vec<Alert>,
    },
    DismissAlerts(String),
    /// State of the monitor at `generation`, or of a stopped monitor when
    /// `None`.
    Persist {
        state: MonitorState,
        generation: Option<u64>,
    },
    Forget(String),
    ForgetAll,
}

/// Ordered notices collected during one operation.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    notices: Vec<Notice>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }

    pub(crate) fn into_notices(self) -> Vec<Notice> {
        self.notices
    }
}
