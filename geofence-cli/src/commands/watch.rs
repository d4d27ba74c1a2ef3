//! Watch command - replay a scenario on the live sweep timer.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use geofence::config::ConfigFile;
use geofence::MonitorService;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::common::Engine;
use crate::error::CliError;
use crate::scenario::Scenario;

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Scenario JSON file
    pub scenario: PathBuf,

    /// Sweep interval in milliseconds, overriding the config file
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Keep sweeping after the last step until Ctrl-C
    #[arg(long)]
    pub follow: bool,
}

pub fn run(args: WatchArgs, config: &ConfigFile) -> Result<(), CliError> {
    let mut config = config.clone();
    if let Some(ms) = args.interval_ms {
        config.monitor.tick_interval = Duration::from_millis(ms.max(1));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    let shutdown = CancellationToken::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    runtime.block_on(watch(args, config, shutdown))
}

async fn watch(args: WatchArgs, config: ConfigFile, shutdown: CancellationToken) -> Result<(), CliError> {
    let scenario = Scenario::load(&args.scenario)?;
    let engine = Engine::build(&scenario, &config, Some(tokio::runtime::Handle::current()))?;
    let period = config.monitor.tick_interval;

    let mut service = MonitorService::new(engine.manager.clone());
    service.start(&tokio::runtime::Handle::current())?;
    info!(steps = scenario.steps.len(), period_ms = period.as_millis() as u64, "Watching scenario");

    for step in &scenario.steps {
        step.apply(&engine.manager, &engine.items);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period * step.ticks) => {}
        }
    }
    if args.follow && !shutdown.is_cancelled() {
        println!("Scenario finished, press Ctrl-C to stop");
        shutdown.cancelled().await;
    }

    let sweeps = service.stop().await?;
    println!();
    println!(
        "{} sweeps, {} alerts raised, {} outstanding",
        sweeps,
        engine.alerts.log().received(),
        engine.alerts.log().active_count()
    );
    Ok(())
}
