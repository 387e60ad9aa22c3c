//! On-disk module state: discovery, the `disable` sentinel and lifecycle hooks
//!
//! Nothing here is cached; every query reads the filesystem.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::sink::OutputSink;
use crate::config::ServiceConfig;
use crate::core::{is_valid_module_id, ModuleInfo, MODULE_PROP};
use crate::host::exit_code_of;

/// Sentinel whose presence marks a module disabled
pub const DISABLE_SENTINEL: &str = "disable";
pub const INSTALL_SCRIPT: &str = "install.sh";
pub const UNINSTALL_SCRIPT: &str = "uninstall.sh";
pub const ENABLE_SCRIPT: &str = "enable.sh";
pub const DISABLE_SCRIPT: &str = "disable.sh";

/// Filesystem view of the modules root
#[derive(Debug, Clone)]
pub struct ModuleStore {
    modules_dir: PathBuf,
    home_dir: PathBuf,
    usr_dir: PathBuf,
    system_shell: PathBuf,
}

impl ModuleStore {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            modules_dir: config.modules_dir(),
            home_dir: config.home_dir(),
            usr_dir: config.usr_dir(),
            system_shell: config.system_shell.clone(),
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    pub fn module_dir(&self, id: &str) -> PathBuf {
        self.modules_dir.join(id)
    }

    /// True iff `<root>/<id>/module.prop` exists and is a regular file
    pub fn is_module(&self, id: &str) -> bool {
        is_valid_module_id(id) && self.module_dir(id).join(MODULE_PROP).is_file()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.is_module(id) && !self.module_dir(id).join(DISABLE_SENTINEL).exists()
    }

    /// Manifest of an installed module, `None` when absent or unreadable
    pub fn module_info(&self, id: &str) -> Option<ModuleInfo> {
        if !self.is_module(id) {
            return None;
        }
        match read_manifest(&self.module_dir(id)) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!("getModuleInfo error: {}", e);
                None
            }
        }
    }

    /// Every immediate subdirectory holding a regular `module.prop`.
    ///
    /// Unreadable manifests are logged and skipped.
    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        let entries = match fs::read_dir(&self.modules_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("cannot list {}: {}", self.modules_dir.display(), e);
                return Vec::new();
            }
        };

        let mut modules: Vec<ModuleInfo> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|dir| dir.is_dir() && dir.join(MODULE_PROP).is_file())
            .filter_map(|dir| match read_manifest(&dir) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::error!("getModuleInfo error in {}: {}", dir.display(), e);
                    None
                }
            })
            .collect();
        modules.sort_by(|a, b| a.id.cmp(&b.id));
        modules
    }

    /// Remove the sentinel, then run `enable.sh` if present.
    ///
    /// Returns whether the state changed; already-enabled or unknown modules are no-ops.
    pub fn enable(&self, id: &str) -> io::Result<bool> {
        if !self.is_module(id) || self.is_enabled(id) {
            return Ok(false);
        }
        fs::remove_file(self.module_dir(id).join(DISABLE_SENTINEL))?;
        tracing::info!("Enabled module {}", id);
        self.run_hook(id, ENABLE_SCRIPT);
        Ok(true)
    }

    /// Create the sentinel, then run `disable.sh` if present
    pub fn disable(&self, id: &str) -> io::Result<bool> {
        if !self.is_module(id) || !self.is_enabled(id) {
            return Ok(false);
        }
        File::create(self.module_dir(id).join(DISABLE_SENTINEL))?;
        tracing::info!("Disabled module {}", id);
        self.run_hook(id, DISABLE_SCRIPT);
        Ok(true)
    }

    /// Run an optional hook, logging its output. Failures are not surfaced.
    fn run_hook(&self, id: &str, script: &str) {
        let path = self.module_dir(id).join(script);
        if !path.is_file() {
            tracing::debug!("{} has no {}, skipping", id, script);
            return;
        }

        match self.script_command(id, &path, &[]).stdin(Stdio::null()).output() {
            Ok(output) => {
                for line in String::from_utf8_lossy(&output.stdout).lines() {
                    tracing::debug!("[{}/{}] {}", id, script, line);
                }
                if !output.status.success() {
                    tracing::warn!(
                        "{}/{} exited with {}",
                        id,
                        script,
                        exit_code_of(output.status)
                    );
                }
            }
            Err(e) => tracing::warn!("failed to run {}/{}: {}", id, script, e),
        }
    }

    /// Run a lifecycle script, forwarding each line of its combined
    /// stdout/stderr to `sink`. Returns the script's exit code.
    pub fn run_script(
        &self,
        id: &str,
        script: &str,
        extra_env: &[(&str, String)],
        sink: &mut OutputSink,
    ) -> io::Result<i32> {
        let path = self.module_dir(id).join(script);
        let mut child = self
            .script_command(id, &path, extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let forwarded = match child.stdout.take() {
            Some(stdout) => forward_lines(stdout, sink),
            None => Ok(()),
        };
        reap(child, forwarded)
    }

    /// `sh -c 'exec "$0" "$1" 2>&1' <shell> <script>` with the hook environment
    fn script_command(&self, id: &str, script: &Path, extra_env: &[(&str, String)]) -> Command {
        let mut cmd = Command::new(&self.system_shell);
        cmd.arg("-c")
            .arg("exec \"$0\" \"$1\" 2>&1")
            .arg(&self.system_shell)
            .arg(script)
            .env("HOME", &self.home_dir)
            .env("MODDIR", self.module_dir(id))
            .env("PREFIX", &self.usr_dir);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn forward_lines(reader: impl io::Read, sink: &mut OutputSink) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line);
        sink.progress(text.trim_end_matches(['\n', '\r']));
    }
}

/// Wait for a script. If its output could not be read, kill it first so it
/// never outlives the operation that started it.
fn reap(mut child: Child, forwarded: io::Result<()>) -> io::Result<i32> {
    if let Err(e) = forwarded {
        tracing::error!("reading script output failed: {}", e);
        if let Err(kill_err) = child.kill() {
            tracing::warn!("failed to kill script {}: {}", child.id(), kill_err);
        }
        if let Err(wait_err) = child.wait() {
            tracing::warn!("failed to reap script {}: {}", child.id(), wait_err);
        }
        return Err(e);
    }
    Ok(exit_code_of(child.wait()?))
}

fn read_manifest(dir: &Path) -> io::Result<ModuleInfo> {
    let bytes = fs::read(dir.join(MODULE_PROP))?;
    let mut info = ModuleInfo::parse(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    info.enabled = !dir.join(DISABLE_SENTINEL).exists();
    Ok(info)
}
