//! Module command implementation

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::ServiceConfig;
use crate::core::ModuleInfo;
use crate::modules::{ModuleManager, OutputSink};

use super::exit_codes;

/// Arguments for the module command
#[derive(Args, Debug)]
pub struct ModuleArgs {
    #[command(subcommand)]
    pub command: ModuleCommand,
}

#[derive(Subcommand, Debug)]
pub enum ModuleCommand {
    /// List installed modules
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one module's manifest
    Info {
        id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Install a module zip
    Install { archive: PathBuf },

    /// Uninstall a module
    Uninstall {
        id: String,

        /// Ask the uninstall script to remove user data too
        #[arg(long)]
        purge: bool,
    },

    /// Enable a module
    Enable { id: String },

    /// Disable a module
    Disable { id: String },
}

/// Run the module command
pub async fn run(args: ModuleArgs, config: &ServiceConfig) -> anyhow::Result<i32> {
    let manager = ModuleManager::new(config)?;

    let code = match args.command {
        ModuleCommand::List { json } => {
            let modules = manager.list_modules();
            if json {
                println!("{}", serde_json::to_string_pretty(&modules)?);
            } else {
                for module in &modules {
                    println!("{}", list_line(module));
                }
            }
            exit_codes::SUCCESS
        }
        ModuleCommand::Info { id, json } => match manager.module_info(&id) {
            Some(info) if json => {
                println!("{}", serde_json::to_string_pretty(&info)?);
                exit_codes::SUCCESS
            }
            Some(info) => {
                for line in info.summary_lines() {
                    println!("{}", line);
                }
                println!("enabled: {}", info.enabled);
                exit_codes::SUCCESS
            }
            None => {
                eprintln!("{} hasn't been installed!", id);
                exit_codes::FAILURE
            }
        },
        ModuleCommand::Install { archive } => {
            manager
                .install(archive, OutputSink::new(std::io::stdout()))
                .exit_code()
                .await
        }
        ModuleCommand::Uninstall { id, purge } => {
            manager
                .uninstall(&id, purge, OutputSink::new(std::io::stdout()))
                .exit_code()
                .await
        }
        ModuleCommand::Enable { id } => toggle(&manager, &id, true)?,
        ModuleCommand::Disable { id } => toggle(&manager, &id, false)?,
    };

    Ok(code)
}

/// Enable or disable `id`. Already being in the target state is a success.
///
/// Both block on the module worker, so they run off the runtime.
fn toggle(manager: &ModuleManager, id: &str, enable: bool) -> anyhow::Result<i32> {
    let changed = tokio::task::block_in_place(|| {
        if enable {
            manager.enable(id)
        } else {
            manager.disable(id)
        }
    })?;
    let state = if enable { "enabled" } else { "disabled" };

    if changed {
        println!("{} {}", id, state);
    } else if manager.is_module(id) {
        println!("{} already {}", id, state);
    } else {
        eprintln!("{} hasn't been installed!", id);
        return Ok(exit_codes::FAILURE);
    }
    Ok(exit_codes::SUCCESS)
}

fn list_line(module: &ModuleInfo) -> String {
    format!(
        "{}\t{}\t{}\t{}",
        module.id,
        module.version.as_deref().unwrap_or("-"),
        if module.enabled { "enabled" } else { "disabled" },
        module.name.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_line() {
        let mut info = ModuleInfo::parse(b"id=demo\nname=Demo\nversion=1.2\n").unwrap();
        assert_eq!(list_line(&info), "demo\t1.2\tdisabled\tDemo");
        info.enabled = true;
        info.version = None;
        assert_eq!(list_line(&info), "demo\t-\tenabled\tDemo");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enable_unknown_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::with_data_dir(dir.path().join("data"));
        config.init_layout().unwrap();
        let args = ModuleArgs {
            command: ModuleCommand::Enable {
                id: "ghost".to_string(),
            },
        };
        assert_eq!(run(args, &config).await.unwrap(), exit_codes::FAILURE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_enable_and_disable_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig::with_data_dir(dir.path().join("data"));
        config.system_shell = PathBuf::from("/bin/sh");
        config.init_layout().unwrap();
        let module_dir = config.modules_dir().join("m");
        std::fs::create_dir_all(&module_dir).unwrap();
        std::fs::write(module_dir.join("module.prop"), "id=m\n").unwrap();
        std::fs::write(module_dir.join("disable"), "").unwrap();

        let enable = || ModuleArgs {
            command: ModuleCommand::Enable { id: "m".to_string() },
        };
        assert_eq!(run(enable(), &config).await.unwrap(), exit_codes::SUCCESS);
        assert_eq!(run(enable(), &config).await.unwrap(), exit_codes::SUCCESS);
        assert!(!module_dir.join("disable").exists());

        let disable = || ModuleArgs {
            command: ModuleCommand::Disable { id: "m".to_string() },
        };
        assert_eq!(run(disable(), &config).await.unwrap(), exit_codes::SUCCESS);
        assert_eq!(run(disable(), &config).await.unwrap(), exit_codes::SUCCESS);
        assert!(module_dir.join("disable").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_info_unknown_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::with_data_dir(dir.path().join("data"));
        let args = ModuleArgs {
            command: ModuleCommand::Info {
                id: "ghost".to_string(),
                json: false,
            },
        };
        assert_eq!(run(args, &config).await.unwrap(), exit_codes::FAILURE);
    }
}
