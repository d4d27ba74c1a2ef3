//! CLI subcommands.

pub mod common;
pub mod config;
pub mod run;
pub mod watch;
