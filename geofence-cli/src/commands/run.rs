//! Run command - replay a scenario tick by tick.

use std::path::PathBuf;

use clap::Args;
use geofence::config::ConfigFile;
use tracing::info;

use super::common::Engine;
use crate::error::CliError;
use crate::scenario::Scenario;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Scenario JSON file
    pub scenario: PathBuf,

    /// Extra sweeps after the last step
    #[arg(long, default_value_t = 0)]
    pub settle: u32,
}

pub fn run(args: RunArgs, config: &ConfigFile) -> Result<(), CliError> {
    let scenario = Scenario::load(&args.scenario)?;
    let engine = Engine::build(&scenario, config, None)?;
    info!(
        monitors = engine.manager.count(),
        pending = engine.manager.pending_count(),
        steps = scenario.steps.len(),
        "Scenario loaded"
    );

    let mut ticks = 0u64;
    for step in &scenario.steps {
        step.apply(&engine.manager, &engine.items);
        for _ in 0..step.ticks {
            engine.manager.tick();
            ticks += 1;
        }
    }
    for _ in 0..args.settle {
        engine.manager.tick();
        ticks += 1;
    }

    println!();
    println!(
        "{} ticks, {} alerts raised, {} outstanding, {} monitors",
        ticks,
        engine.alerts.log().received(),
        engine.alerts.log().active_count(),
        engine.manager.count()
    );
    engine.manager.dispose();
    Ok(())
}
