//! Configuration CLI commands.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use geofence::config::{default_config_path, ConfigFile};

use crate::error::CliError;

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write the default configuration if no file exists
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run(command: ConfigCommands, path: Option<&Path>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => run_show(path),
        ConfigCommands::Path => run_path(path),
        ConfigCommands::Init { force } => run_init(path, force),
    }
}

fn resolve(path: Option<&Path>) -> Result<PathBuf, CliError> {
    path.map(Path::to_path_buf)
        .or_else(default_config_path)
        .ok_or_else(|| CliError::Config("No home directory; pass --config".to_string()))
}

fn run_show(path: Option<&Path>) -> Result<(), CliError> {
    let config = ConfigFile::load_or_default(path)?;
    let mut out = Vec::new();
    config
        .to_ini()
        .write_to(&mut out)
        .map_err(|e| CliError::Config(e.to_string()))?;
    print!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

fn run_path(path: Option<&Path>) -> Result<(), CliError> {
    let path = resolve(path)?;
    let status = if path.exists() { "" } else { " (not created)" };
    println!("{}{}", path.display(), status);
    Ok(())
}

fn run_init(path: Option<&Path>, force: bool) -> Result<(), CliError> {
    let path = resolve(path)?;
    if path.exists() && !force {
        println!("{} already exists, use --force to overwrite", path.display());
        return Ok(());
    }
    ConfigFile::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.ini");
        run_init(Some(&path), false).unwrap();
        assert_eq!(ConfigFile::load(&path).unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_init_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[monitor]\nrescan_period = 3\n").unwrap();
        run_init(Some(&path), false).unwrap();
        assert_eq!(ConfigFile::load(&path).unwrap().monitor.rescan_period, 3);
    }
}
