//! Periodic sweep driver.
//!
//! [`MonitorService`] runs [`FenceManager::tick`] on a fixed interval until
//! stopped. Each tick runs on the blocking pool so a slow sweep never stalls
//! the async workers, and a tick that overruns delays the next one instead
//! of queueing a burst.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::manager::FenceManager;

/// Errors from starting or stopping the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service already running")]
    AlreadyRunning,

    #[error("Service not started")]
    NotStarted,

    #[error("Sweep task failed: {0}")]
    TaskFailed(String),
}

/// Drives a [`FenceManager`] on a timer.
pub struct MonitorService {
    manager: Arc<FenceManager>,
    period: Duration,
    cancellation: CancellationToken,
    task: Option<JoinHandle<u64>>,
}

impl MonitorService {
    /// Sweep every `tick_interval` of the manager's config.
    pub fn new(manager: Arc<FenceManager>) -> Self {
        let period = manager.config().tick_interval;
        Self::with_period(manager, period)
    }

    pub fn with_period(manager: Arc<FenceManager>, period: Duration) -> Self {
        Self {
            manager,
            period,
            cancellation: CancellationToken::new(),
            task: None,
        }
    }

    pub fn manager(&self) -> &Arc<FenceManager> {
        &self.manager
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Token cancelled by [`stop`](Self::stop), for tying other tasks to the
    /// service's lifetime.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Spawn the sweep loop on `runtime`.
    pub fn start(&mut self, runtime: &Handle) -> Result<(), ServiceError> {
        if self.task.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }
        if self.cancellation.is_cancelled() {
            self.cancellation = CancellationToken::new();
        }

        let manager = Arc::clone(&self.manager);
        let token = self.cancellation.clone();
        let period = self.period.max(Duration::from_millis(1));
        info!(period_ms = period.as_millis() as u64, "Starting fence monitor service");
        self.task = Some(runtime.spawn(run_sweeps(manager, period, token)));
        Ok(())
    }

    /// Cancel the loop, wait for the in-flight sweep, then dispose the
    /// manager. Returns the number of sweeps run.
    pub async fn stop(&mut self) -> Result<u64, ServiceError> {
        let task = self.task.take().ok_or(ServiceError::NotStarted)?;
        self.cancellation.cancel();
        let sweeps = task.await.map_err(|e| ServiceError::TaskFailed(e.to_string()))?;
        self.manager.dispose();
        info!(sweeps, "Fence monitor service stopped");
        Ok(sweeps)
    }
}

impl Drop for MonitorService {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

async fn run_sweeps(manager: Arc<FenceManager>, period: Duration, shutdown: CancellationToken) -> u64 {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweeps = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Sweep loop cancelled");
                break;
            }

            _ = ticker.tick() => {
                let manager = Arc::clone(&manager);
                match tokio::task::spawn_blocking(move || manager.tick()).await {
                    Ok(summary) => {
                        sweeps += 1;
                        if summary.alerts > 0 || !summary.removed.is_empty() {
                            debug!(
                                tick = summary.tick,
                                alerts = summary.alerts,
                                removed = summary.removed.len(),
                                "Sweep complete"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Sweep panicked"),
                }
            }
        }
    }

    sweeps
}
