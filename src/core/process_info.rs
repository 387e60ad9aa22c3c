//! Process table entry model

use serde::{Deserialize, Serialize};

/// One OS process as reported by a process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    /// Process group id
    pub pgid: i32,
    pub uid: u32,
    /// Single-letter scheduler state (R, S, D, Z, T, ...)
    pub state: char,
    /// Short executable name
    pub name: String,
    /// Full command line, empty for kernel threads
    #[serde(default)]
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    /// Command line joined for display, falling back to `[name]` like `ps` does
    pub fn display_command(&self) -> String {
        if self.cmdline.is_empty() {
            format!("[{}]", self.name)
        } else {
            self.cmdline.join(" ")
        }
    }
}
