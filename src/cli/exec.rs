//! Exec command implementation

use clap::Args;
use std::os::fd::AsFd;

use crate::config::ServiceConfig;
use crate::host::CommandExecutor;

/// Arguments for the exec command
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Extra environment variable for the session (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Command line passed to the shell
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Run the exec command; the session's exit code becomes ours
pub async fn run(args: ExecArgs, config: &ServiceConfig) -> anyhow::Result<i32> {
    let executor = args
        .env
        .into_iter()
        .fold(CommandExecutor::new(config), |executor, (key, value)| {
            executor.with_env(key, value)
        });

    let output = std::io::stdout().as_fd().try_clone_to_owned()?;
    let command = args.command.join(" ");
    tracing::debug!("exec: {}", command);

    let outcome = executor.execute(&command, output).outcome().await;
    for line in &outcome.error_lines {
        eprintln!("{}", line);
    }
    Ok(outcome.exit_code)
}
