//! CLI module for termrunner
//!
//! Every core operation of the runner service is reachable as a subcommand.

pub mod backup;
pub mod exec;
pub mod module;
pub mod process;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ServiceConfig;

/// Exit codes for CLI commands
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const MISSING: i32 = 127;
    pub const UNEXPECTED_FAILURE: i32 = 255;
}

/// termrunner - command runner service for a terminal environment
#[derive(Parser, Debug)]
#[command(name = "termrunner")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    pub json_output: bool,

    /// Configuration file (defaults to <config dir>/termrunner/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a login shell session
    Exec(exec::ExecArgs),

    /// List running processes
    Ps(process::PsArgs),

    /// Send a signal to processes
    Kill(process::KillArgs),

    /// Archive home and usr into an output directory
    Backup(backup::BackupArgs),

    /// Replace home and usr from archives in an input directory
    Restore(backup::RestoreArgs),

    /// Manage terminal modules
    Module(module::ModuleArgs),

    /// Create the data layout and write the shell profile
    Init,

    /// Print version information
    Version,
}

impl Cli {
    /// Load configuration honoring `--config` and `--data-dir`
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        Ok(config)
    }
}

/// Run `init`
pub fn init(config: &ServiceConfig) -> anyhow::Result<i32> {
    config.init_layout()?;
    println!("{}", config.data_dir.display());
    Ok(exit_codes::SUCCESS)
}

/// Run `version`
pub fn version() -> i32 {
    println!("termrunner {}", env!("CARGO_PKG_VERSION"));
    exit_codes::SUCCESS
}
