//! Backup and restore command implementations

use clap::Args;
use std::path::PathBuf;

use crate::config::ServiceConfig;
use crate::data::{BackupSelection, DataBackup};

use super::exit_codes;

/// Arguments for the backup command
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Directory receiving home.tar.gz and usr.tar.gz
    #[arg(short, long)]
    pub output: PathBuf,

    /// Skip the home tree
    #[arg(long)]
    pub no_home: bool,

    /// Skip the usr tree
    #[arg(long)]
    pub no_usr: bool,
}

/// Arguments for the restore command
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Directory holding home.tar.gz and/or usr.tar.gz
    #[arg(short, long)]
    pub input: PathBuf,
}

/// Run the backup command
pub async fn run_backup(args: BackupArgs, config: &ServiceConfig) -> anyhow::Result<i32> {
    let selection = BackupSelection {
        home: !args.no_home,
        usr: !args.no_usr,
    };
    let written = DataBackup::new(config)
        .backup_async(args.output, selection)
        .await?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(exit_codes::SUCCESS)
}

/// Run the restore command
pub async fn run_restore(args: RestoreArgs, config: &ServiceConfig) -> anyhow::Result<i32> {
    let restored = DataBackup::new(config).restore_async(args.input).await?;
    for path in restored {
        println!("{}", path.display());
    }
    Ok(exit_codes::SUCCESS)
}
