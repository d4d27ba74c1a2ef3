//! Engine wiring shared by the scenario commands.

use std::sync::Arc;

use geofence::alert::{Alert, AlertLog, AlertSink};
use geofence::config::ConfigFile;
use geofence::persist::{JsonFilePersistence, PersistenceSink};
use geofence::{FenceManager, MemoryItemStore, MemoryPersistence, MemoryShapeStore, MonitorListener};

use crate::error::CliError;
use crate::scenario::Scenario;

/// Prints each alert as it arrives and keeps the log for the summary.
#[derive(Debug, Default)]
pub struct ConsoleAlerts {
    log: AlertLog,
}

impl ConsoleAlerts {
    pub fn log(&self) -> &AlertLog {
        &self.log
    }
}

impl AlertSink for ConsoleAlerts {
    fn alert(&self, monitor_id: &str, alerts: &[Alert], auto_dismiss: bool) {
        for alert in alerts {
            println!("{}", alert);
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

/// Reports Custom fences still waiting for a selection.
struct SelectionPrompt;

impl MonitorListener for SelectionPrompt {
    fn on_monitor_added(&self, _monitor_id: &str) {}

    fn on_monitor_changed(&self, _monitor_id: &str) {}

    fn on_monitor_removed(&self, monitor_id: &str) {
        println!("Monitor {} removed", monitor_id);
    }

    fn on_selection_required(&self, monitor_id: &str, candidates: &[String]) {
        println!(
            "Monitor {} needs a selection, candidates: {}",
            monitor_id,
            if candidates.is_empty() { "(none)".to_string() } else { candidates.join(", ") }
        );
    }
}

/// A manager loaded with a scenario's world and fences.
pub struct Engine {
    pub manager: Arc<FenceManager>,
    pub items: Arc<MemoryItemStore>,
    pub alerts: Arc<ConsoleAlerts>,
}

impl Engine {
    pub fn build(
        scenario: &Scenario,
        config: &ConfigFile,
        runtime: Option<tokio::runtime::Handle>,
    ) -> Result<Self, CliError> {
        let shapes = Arc::new(MemoryShapeStore::new());
        let items = Arc::new(MemoryItemStore::new());
        scenario.populate(&shapes, &items);

        let persistence: Arc<dyn PersistenceSink> = match &config.monitor.persist_dir {
            Some(dir) => Arc::new(JsonFilePersistence::new(dir)?),
            None => Arc::new(MemoryPersistence::new()),
        };
        let alerts = Arc::new(ConsoleAlerts::default());

        let mut manager = FenceManager::new(config.monitor.clone(), shapes, items.clone())
            .with_alert_sink(alerts.clone())
            .with_persistence(persistence);
        if let Some(runtime) = runtime {
            manager = manager.with_runtime(runtime);
        }
        let manager = Arc::new(manager);
        manager.add_listener(Arc::new(SelectionPrompt));

        let restored = manager.restore()?;
        if restored > 0 {
            println!("Restored {} monitors", restored);
        }
        for fence in &scenario.fences {
            manager.on_fence_added(scenario.fence(fence, config.monitor.rescan_margin_km), false);
            if !fence.select.is_empty() {
                manager.on_items_selected(&fence.shape_id, fence.select.clone());
            }
        }

        Ok(Self {
            manager,
            items,
            alerts,
        })
    }
}
