//! Ps and kill command implementations

use clap::Args;

use crate::core::ProcessInfo;
use crate::host::ProcessController;

use super::exit_codes;

/// Arguments for the ps command
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Print the table as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the kill command
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Signal number
    #[arg(short, long, default_value_t = 15)]
    pub signal: i32,

    /// Process ids
    #[arg(required = true, allow_negative_numbers = true)]
    pub pids: Vec<i32>,
}

/// Run the ps command
pub fn run_ps(args: PsArgs, controller: &ProcessController) -> anyhow::Result<i32> {
    let processes = controller.list_processes()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&processes)?);
    } else {
        print!("{}", format_table(&processes));
    }
    Ok(exit_codes::SUCCESS)
}

/// Run the kill command.
///
/// Fails when any non-reserved id could not be signalled.
pub fn run_kill(args: KillArgs, controller: &ProcessController) -> anyhow::Result<i32> {
    let results = controller.send_signal(&args.pids, args.signal)?;
    let mut code = exit_codes::SUCCESS;
    for (pid, delivered) in args.pids.iter().zip(results) {
        if !delivered {
            eprintln!("failed to signal {}", pid);
            code = exit_codes::FAILURE;
        }
    }
    Ok(code)
}

fn format_table(processes: &[ProcessInfo]) -> String {
    let mut out = format!(
        "{:>7} {:>7} {:>7} {:>6} {:>1} {}\n",
        "PID", "PPID", "PGID", "UID", "S", "COMMAND"
    );
    for p in processes {
        out.push_str(&format!(
            "{:>7} {:>7} {:>7} {:>6} {:>1} {}\n",
            p.pid,
            p.ppid,
            p.pgid,
            p.uid,
            p.state,
            p.display_command()
        ));
    }
    out
}
