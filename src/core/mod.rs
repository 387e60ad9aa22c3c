//! Core data models

mod module_info;
mod process_info;

pub use module_info::*;
pub use process_info::*;
