//! Geofence CLI - replay scenarios against the monitoring engine.

mod commands;
mod error;
mod scenario;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use geofence::config::ConfigFile;
use geofence::logging;

use commands::config::ConfigCommands;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "geofence", version, about = "Geofence monitoring engine")]
struct Cli {
    /// Configuration file (defaults to ~/.geofence/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. geofence=debug
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replay a scenario tick by tick and print every alert
    Run(commands::run::RunArgs),

    /// Run a scenario on the live timer until it ends or Ctrl-C
    Watch(commands::watch::WatchArgs),

    /// Inspect or write the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    if let Commands::Config { command } = cli.command {
        return commands::config::run(command, cli.config.as_deref());
    }

    let mut config = ConfigFile::load_or_default(cli.config.as_deref())?;
    if let Some(filter) = cli.log {
        config.logging.filter = filter;
    }
    let _guard = logging::init_logging(&config.logging)?;

    match cli.command {
        Commands::Run(args) => commands::run::run(args, &config),
        Commands::Watch(args) => commands::watch::run(args, &config),
        Commands::Config { .. } => Ok(()),
    }
}
