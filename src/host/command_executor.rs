//! Command Executor
//!
//! Runs user commands through the managed login shell. The command is fed
//! through the shell's stdin after sourcing the service profile, stdout and
//! stderr go straight to the caller's sink, and completion is reported through
//! a oneshot channel.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::ServiceConfig;

/// Exit code for a missing prerequisite or failed spawn
pub const EXIT_MISSING: i32 = 127;

/// Exit code for an unexpected internal failure
pub const EXIT_INTERNAL: i32 = 255;

/// Command executor errors
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("{} not found, may be you don't install terminal extension", .0.display())]
    ShellNotFound(PathBuf),

    #[error("exec failed: {0}")]
    LaunchFailed(String),

    #[error("! Exception: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::ShellNotFound(_) | ExecError::LaunchFailed(_) => EXIT_MISSING,
            ExecError::Internal(_) => EXIT_INTERNAL,
        }
    }
}

/// Completion of one command session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Shell pid, present once the shell was spawned
    pub pid: Option<u32>,
    /// Shell exit code, `128 + signal` when killed, 127/255 on executor failure
    pub exit_code: i32,
    /// Diagnostics that did not go through the output sink
    pub error_lines: Vec<String>,
}

impl ExecOutcome {
    fn failed(pid: Option<u32>, error: &ExecError) -> Self {
        Self {
            pid,
            exit_code: error.exit_code(),
            error_lines: vec![error.to_string()],
        }
    }
}

/// Pending completion of [`CommandExecutor::execute`]
pub struct ExecHandle {
    rx: oneshot::Receiver<ExecOutcome>,
}

impl ExecHandle {
    /// Block until the session ends. Must not be called from async code.
    pub fn wait(self) -> ExecOutcome {
        self.rx.blocking_recv().unwrap_or_else(|_| lost_outcome())
    }

    /// Await the session's end
    pub async fn outcome(self) -> ExecOutcome {
        self.rx.await.unwrap_or_else(|_| lost_outcome())
    }
}

fn lost_outcome() -> ExecOutcome {
    ExecOutcome::failed(
        None,
        &ExecError::Internal("executor thread exited without reporting".to_string()),
    )
}

/// Shell-session executor
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: PathBuf,
    profile: PathBuf,
    /// Environment variables to add
    env_additions: HashMap<String, String>,
}

impl CommandExecutor {
    /// Executor for the managed login shell and profile
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_shell(config.login_shell(), config.profile_path())
    }

    pub fn with_shell(shell: impl Into<PathBuf>, profile: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            profile: profile.into(),
            env_additions: HashMap::new(),
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_additions.insert(key.into(), value.into());
        self
    }

    /// Start `command` on a dedicated thread and return immediately.
    ///
    /// Both stdout and stderr of the shell are bound to `output`.
    pub fn execute(&self, command: &str, output: impl Into<OwnedFd>) -> ExecHandle {
        let (tx, rx) = oneshot::channel();
        let executor = self.clone();
        let command = command.to_string();
        let output = output.into();

        let spawned = std::thread::Builder::new()
            .name("exec".to_string())
            .spawn(move || {
                let outcome = executor.run(&command, output);
                let _ = tx.send(outcome);
            });
        if let Err(e) = spawned {
            tracing::error!("failed to start exec thread: {}", e);
        }

        ExecHandle { rx }
    }

    /// Run `command` on the calling thread and wait for the shell to exit
    pub fn run(&self, command: &str, output: impl Into<OwnedFd>) -> ExecOutcome {
        let mut child = match self.spawn(output.into()) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("{}", e);
                return ExecOutcome::failed(None, &e);
            }
        };
        let pid = child.id();
        tracing::info!("Process started with PID: {}", pid);

        if let Some(mut stdin) = child.stdin.take() {
            let script = format!(". {}; {}; exit\n", self.profile.display(), command);
            if let Err(e) = stdin.write_all(script.as_bytes()).and_then(|_| stdin.flush()) {
                tracing::warn!("write to stdin error: {}", e);
            }
            // stdin dropped here: the shell sees EOF after `exit`
        }

        match child.wait() {
            Ok(status) => ExecOutcome {
                pid: Some(pid),
                exit_code: exit_code_of(status),
                error_lines: Vec::new(),
            },
            Err(e) => {
                let error = ExecError::Internal(e.to_string());
                tracing::error!("{}", error);
                ExecOutcome::failed(Some(pid), &error)
            }
        }
    }

    fn spawn(&self, output: OwnedFd) -> Result<Child, ExecError> {
        if !self.shell.exists() {
            return Err(ExecError::ShellNotFound(self.shell.clone()));
        }
        if let Err(e) =
            std::fs::set_permissions(&self.shell, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!("set permission error: {}", e);
        }

        let stdout = File::from(output);
        let stderr = stdout
            .try_clone()
            .map_err(|e| ExecError::LaunchFailed(e.to_string()))?;

        let mut cmd = Command::new(&self.shell);
        for (k, v) in &self.env_additions {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        cmd.spawn()
            .map_err(|e| ExecError::LaunchFailed(e.to_string()))
    }
}

/// Exit code, or `128 + signal` for a signalled process
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(EXIT_INTERNAL)
}
