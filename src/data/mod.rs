//! Archiving and whole-tree backup/restore

pub mod archive;
pub mod backup;

pub use archive::ArchiveError;
pub use backup::{BackupSelection, DataBackup};
