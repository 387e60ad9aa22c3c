//! termrunner - privileged command runner for a terminal environment
//!
//! Provides:
//! - Login-shell command sessions with the environment profile applied
//! - Process listing and signalling
//! - Backup and restore of the home and usr trees as tar.gz archives
//! - Transactional install/uninstall of terminal modules

mod cli;
mod config;
mod core;
mod data;
mod host;
mod logging;
mod modules;

use clap::Parser;
use cli::{exit_codes, Cli, Commands};

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    let cli = Cli::parse();

    let config = match cli.service_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::FAILURE;
        }
    };

    // Initialize logging
    if let Err(e) = logging::init(cli.verbose, cli.json_output, config.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {}", e);
        return exit_codes::UNEXPECTED_FAILURE;
    }

    // Create tokio runtime for async commands
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            return exit_codes::UNEXPECTED_FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Exec(args) => rt.block_on(cli::exec::run(args, &config)),
        Commands::Ps(args) => {
            cli::process::run_ps(args, &host::ProcessController::system())
        }
        Commands::Kill(args) => {
            cli::process::run_kill(args, &host::ProcessController::system())
        }
        Commands::Backup(args) => rt.block_on(cli::backup::run_backup(args, &config)),
        Commands::Restore(args) => rt.block_on(cli::backup::run_restore(args, &config)),
        Commands::Module(args) => rt.block_on(cli::module::run(args, &config)),
        Commands::Init => cli::init(&config),
        Commands::Version => Ok(cli::version()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            categorize_error(&e)
        }
    }
}

/// Categorize an error into the appropriate exit code
fn categorize_error(e: &anyhow::Error) -> i32 {
    if let Some(exec) = e.downcast_ref::<host::ExecError>() {
        return exec.exit_code();
    }
    if let Some(module) = e.downcast_ref::<modules::ModuleError>() {
        return module.exit_code();
    }
    if e.downcast_ref::<host::ProcessError>().is_some()
        || e.downcast_ref::<data::ArchiveError>().is_some()
        || e.downcast_ref::<std::io::Error>().is_some()
    {
        return exit_codes::FAILURE;
    }
    exit_codes::UNEXPECTED_FAILURE
}
