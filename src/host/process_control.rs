//! Process Control
//!
//! Lists OS processes and delivers signals on behalf of the caller, refusing to
//! touch the reserved ids -1, 0 and 1.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use crate::core::ProcessInfo;

/// Reserved targets: -1 (every process), 0 (own process group), 1 (init)
const RESERVED_PIDS: std::ops::RangeInclusive<i32> = -1..=1;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessError {
    /// The process table failed to initialize; persists for the service lifetime
    #[error("Process table unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to read process table: {0}")]
    Read(String),
}

/// Native capability for enumerating and signalling processes
pub trait ProcessTable: Send + Sync {
    /// Snapshot of all visible processes
    fn processes(&self) -> Result<Vec<ProcessInfo>, ProcessError>;

    /// Deliver `signal` to `pid` (negative: process group). Returns delivery success.
    fn send_signal(&self, pid: i32, signal: i32) -> bool;
}

/// Linux `/proc` backed process table
pub struct ProcFsTable {
    root: PathBuf,
}

impl ProcFsTable {
    /// Open the table at `/proc`
    pub fn open() -> Result<Self, ProcessError> {
        Self::open_at("/proc")
    }

    pub fn open_at(root: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let root = root.into();
        fs::read_dir(&root).map_err(|e| {
            ProcessError::Unavailable(format!("cannot read {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    fn read_process(&self, dir: &Path, pid: i32) -> Option<ProcessInfo> {
        // The process may exit between listing and reading; skip it then
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let (name, state, ppid, pgid) = parse_stat(&stat)?;
        let uid = fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|s| parse_status_uid(&s))
            .unwrap_or(0);
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| parse_cmdline(&raw))
            .unwrap_or_default();

        Some(ProcessInfo {
            pid,
            ppid,
            pgid,
            uid,
            state,
            name,
            cmdline,
        })
    }
}

impl ProcessTable for ProcFsTable {
    fn processes(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let entries = fs::read_dir(&self.root).map_err(|e| ProcessError::Read(e.to_string()))?;

        let mut processes: Vec<ProcessInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<i32>().ok()?;
                self.read_process(&entry.path(), pid)
            })
            .collect();
        processes.sort_by_key(|p| p.pid);
        Ok(processes)
    }

    fn send_signal(&self, pid: i32, signal: i32) -> bool {
        let signal = if signal == 0 {
            None
        } else {
            match Signal::try_from(signal) {
                Ok(s) => Some(s),
                Err(_) => {
                    tracing::warn!("invalid signal number: {}", signal);
                    return false;
                }
            }
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("kill({}, {:?}) failed: {}", pid, signal, e);
                false
            }
        }
    }
}

/// `(comm, state, ppid, pgrp)` from `/proc/<pid>/stat`.
///
/// `comm` may itself contain spaces and parentheses, so split at the last `)`.
fn parse_stat(stat: &str) -> Option<(String, char, i32, i32)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let mut fields = stat.get(close + 1..)?.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    let pgid = fields.next()?.parse().ok()?;
    Some((name, state, ppid, pgid))
}

/// Real uid from the `Uid:` line of `/proc/<pid>/status`
fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Policy layer over a [`ProcessTable`]
#[derive(Clone)]
pub struct ProcessController {
    table: Result<Arc<dyn ProcessTable>, ProcessError>,
}

impl ProcessController {
    /// Wrap the outcome of initializing a process table. A failed initialization
    /// makes every call report [`ProcessError::Unavailable`].
    pub fn new(table: Result<Arc<dyn ProcessTable>, ProcessError>) -> Self {
        if let Err(e) = &table {
            tracing::error!("process table not loaded: {}", e);
        }
        Self { table }
    }

    /// Controller over the host's `/proc`
    pub fn system() -> Self {
        Self::new(ProcFsTable::open().map(|t| Arc::new(t) as Arc<dyn ProcessTable>))
    }

    fn table(&self) -> Result<&Arc<dyn ProcessTable>, ProcessError> {
        self.table.as_ref().map_err(|e| match e {
            ProcessError::Unavailable(msg) => ProcessError::Unavailable(msg.clone()),
            other => ProcessError::Unavailable(other.to_string()),
        })
    }

    pub fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let table = self.table()?;
        tracing::info!("get processes");
        table.processes()
    }

    /// Signal every id, returning per-target success in input order.
    ///
    /// Reserved ids are reported as delivered without being forwarded.
    pub fn send_signal(&self, ids: &[i32], signal: i32) -> Result<Vec<bool>, ProcessError> {
        let table = self.table()?;
        Ok(ids
            .iter()
            .map(|&id| {
                let group = if id < 0 { " group" } else { "" };
                if RESERVED_PIDS.contains(&id) {
                    tracing::warn!("skip killing process{}: {}", group, id);
                    true
                } else {
                    tracing::info!("kill process{}: {}", group, id);
                    table.send_signal(id, signal)
                }
            })
            .collect())
    }
}
