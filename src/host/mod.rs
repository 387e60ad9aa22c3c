//! Host module for shell sessions and process control

pub mod command_executor;
pub mod process_control;

pub use command_executor::{exit_code_of, CommandExecutor, ExecError, EXIT_INTERNAL};
pub use process_control::{ProcessController, ProcessError};
