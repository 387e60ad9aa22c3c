//! Terminal module lifecycle
//!
//! All mutations (install, uninstall, and direct enable/disable) go through one
//! FIFO worker so no two of them ever race on a module directory. Queries read
//! the filesystem directly.

pub mod installer;
pub mod sink;
pub mod store;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

pub use installer::ModuleError;
pub use sink::OutputSink;
pub use store::ModuleStore;
pub use worker::{Completion, ModuleWorker};

use crate::config::ServiceConfig;
use crate::core::ModuleInfo;

/// Entry point for module operations
pub struct ModuleManager {
    store: Arc<ModuleStore>,
    worker: ModuleWorker,
}

impl ModuleManager {
    pub fn new(config: &ServiceConfig) -> std::io::Result<Self> {
        Ok(Self {
            store: Arc::new(ModuleStore::new(config)),
            worker: ModuleWorker::spawn()?,
        })
    }

    pub fn is_module(&self, id: &str) -> bool {
        self.store.is_module(id)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.store.is_enabled(id)
    }

    pub fn module_info(&self, id: &str) -> Option<ModuleInfo> {
        self.store.module_info(id)
    }

    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        self.store.list_modules()
    }

    /// Queue installation of the flat module zip at `archive`
    pub fn install(&self, archive: impl Into<PathBuf>, sink: OutputSink) -> Completion {
        let store = self.store.clone();
        let archive = archive.into();
        self.worker
            .submit(move || installer::install(&store, &archive, sink))
    }

    /// Queue removal of module `id`
    pub fn uninstall(&self, id: &str, purge: bool, sink: OutputSink) -> Completion {
        let store = self.store.clone();
        let id = id.to_string();
        self.worker
            .submit(move || installer::uninstall(&store, &id, purge, sink))
    }

    /// Enable `id` once every queued operation ahead of it has finished.
    ///
    /// Returns whether the state changed.
    pub fn enable(&self, id: &str) -> std::io::Result<bool> {
        let store = self.store.clone();
        let id = id.to_string();
        self.worker
            .run_blocking(move || store.enable(&id))
            .unwrap_or_else(|| Err(worker_gone()))
    }

    /// Disable `id` once every queued operation ahead of it has finished
    pub fn disable(&self, id: &str) -> std::io::Result<bool> {
        let store = self.store.clone();
        let id = id.to_string();
        self.worker
            .run_blocking(move || store.disable(&id))
            .unwrap_or_else(|| Err(worker_gone()))
    }
}

fn worker_gone() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "module worker is not running")
}
