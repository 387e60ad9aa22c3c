//! Transactional module install and uninstall
//!
//! Install walks `Validating -> (BackingUp) -> Extracting -> Scripting` and ends
//! in exactly one of: committed, rolled back to the previous version, or aborted
//! with the partial target removed. Every path closes the sink and yields an exit
//! code. These functions run on the module worker thread.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use super::sink::OutputSink;
use super::store::{ModuleStore, DISABLE_SENTINEL, INSTALL_SCRIPT, UNINSTALL_SCRIPT};
use crate::core::{ModuleInfo, MODULE_PROP};
use crate::data::archive::copy_stream;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

/// Why a module transaction failed
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Malformed or missing manifest/script, bad id. Nothing was mutated.
    #[error("{0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A lifecycle script exited non-zero
    #[error("{0}")]
    Script(String),

    #[error("{0} hasn't been installed!")]
    NotInstalled(String),
}

impl ModuleError {
    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> ModuleError {
        let context = context.into();
        move |source| ModuleError::Io { context, source }
    }

    fn zip(context: impl Into<String>) -> impl FnOnce(ZipError) -> ModuleError {
        let context = context.into();
        move |e| ModuleError::Io {
            context,
            source: match e {
                ZipError::Io(source) => source,
                other => io::Error::new(io::ErrorKind::InvalidData, other),
            },
        }
    }

    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

/// Steps of an install, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Validating,
    BackingUp,
    Extracting,
    Scripting,
}

/// Worker-local state of one install
#[derive(Debug)]
struct InstallTransaction {
    module_id: String,
    module_dir: PathBuf,
    /// Set only when an existing module of the same id was moved aside
    backup_dir: Option<PathBuf>,
    /// The replaced module was enabled before we disabled it
    previously_enabled: bool,
    /// Extraction has started, so the target directory may hold partial content
    extracted: bool,
}

fn backup_path(module_dir: &Path) -> PathBuf {
    let mut name = module_dir.as_os_str().to_os_string();
    name.push(format!("_backup_{}", uuid::Uuid::new_v4()));
    PathBuf::from(name)
}

struct Installer<'a> {
    store: &'a ModuleStore,
    sink: OutputSink,
    stage: InstallStage,
    txn: Option<InstallTransaction>,
}

/// Install the module packaged as a flat zip at `archive`. Returns the exit code.
pub fn install(store: &ModuleStore, archive: &Path, sink: OutputSink) -> i32 {
    let mut installer = Installer {
        store,
        sink,
        stage: InstallStage::Validating,
        txn: None,
    };
    let result = installer.run(archive);
    installer.finish(result)
}

impl Installer<'_> {
    fn run(&mut self, archive: &Path) -> Result<(), ModuleError> {
        self.sink
            .progress(&format!("Install terminal module: {}", archive.display()));

        let file = File::open(archive).map_err(ModuleError::io("Read terminal module file error"))?;
        let mut zip =
            ZipArchive::new(file).map_err(ModuleError::zip("Read terminal module file error"))?;

        if zip.index_for_name(MODULE_PROP).is_none() {
            return Err(ModuleError::Validation(format!("'{}' doesn't exist", MODULE_PROP)));
        }
        if zip.index_for_name(INSTALL_SCRIPT).is_none() {
            return Err(ModuleError::Validation(format!("'{}' doesn't exist", INSTALL_SCRIPT)));
        }

        let mut manifest = Vec::new();
        zip.by_name(MODULE_PROP)
            .map_err(ModuleError::zip("Read terminal module file error"))?
            .read_to_end(&mut manifest)
            .map_err(ModuleError::io("Read terminal module file error"))?;
        let info =
            ModuleInfo::parse(&manifest).map_err(|e| ModuleError::Validation(e.to_string()))?;
        for line in info.summary_lines() {
            self.sink.progress(&line);
        }

        self.back_up_existing(&info.id)?;
        self.extract(&mut zip)?;
        self.run_install_script()?;

        let module_dir = self.store.module_dir(&info.id);
        File::create(module_dir.join(DISABLE_SENTINEL))
            .map_err(ModuleError::io("Unable to create disable sentinel"))?;
        self.sink.progress("Finish");
        Ok(())
    }

    fn back_up_existing(&mut self, id: &str) -> Result<(), ModuleError> {
        let module_dir = self.store.module_dir(id);
        let mut txn = InstallTransaction {
            module_id: id.to_string(),
            module_dir: module_dir.clone(),
            backup_dir: None,
            previously_enabled: false,
            extracted: false,
        };

        if self.store.is_module(id) {
            self.stage = InstallStage::BackingUp;
            txn.previously_enabled = self.store.is_enabled(id);
            self.sink.progress("Disable the previous version");
            self.store
                .disable(id)
                .map_err(ModuleError::io("Unable to disable the previous version"))?;

            self.sink.progress("Backup the previous version");
            let backup = backup_path(&module_dir);
            fs::rename(&module_dir, &backup)
                .map_err(ModuleError::io("Unable to backup the previous version"))?;
            txn.backup_dir = Some(backup);
        }

        self.txn = Some(txn);
        Ok(())
    }

    fn extract(&mut self, zip: &mut ZipArchive<File>) -> Result<(), ModuleError> {
        let Some(txn) = self.txn.as_mut() else {
            return Ok(());
        };
        self.stage = InstallStage::Extracting;
        self.sink.progress("Unzip files");
        txn.extracted = true;
        let module_dir = txn.module_dir.clone();

        fs::create_dir_all(&module_dir)
            .map_err(ModuleError::io(format!("Unable to create {}", module_dir.display())))?;

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(ModuleError::zip(format!("Unable to unzip entry #{}", i)))?;
            let name = entry.name().to_string();
            let context = format!("Unable to unzip file: {}", name);

            let rel = entry.enclosed_name().ok_or_else(|| ModuleError::Io {
                context: context.clone(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    "entry escapes the module directory",
                ),
            })?;
            let out = module_dir.join(rel);
            self.sink
                .progress(&format!("Unzip '{}' to '{}'", name, out.display()));

            if entry.is_dir() {
                fs::create_dir_all(&out).map_err(ModuleError::io(context))?;
            } else {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent).map_err(ModuleError::io(context.clone()))?;
                }
                let mut file = File::create(&out).map_err(ModuleError::io(context.clone()))?;
                copy_stream(&mut entry, &mut file).map_err(ModuleError::io(context))?;
            }
        }

        self.sink.progress("Complete unzipping");
        Ok(())
    }

    fn run_install_script(&mut self) -> Result<(), ModuleError> {
        let Some(id) = self.txn.as_ref().map(|t| t.module_id.clone()) else {
            return Ok(());
        };
        self.stage = InstallStage::Scripting;
        self.sink.progress("Execute install script");

        let code = self
            .store
            .run_script(&id, INSTALL_SCRIPT, &[], &mut self.sink)
            .map_err(ModuleError::io("Unable to execute install script"))?;
        if code != 0 {
            return Err(ModuleError::Script(format!(
                "Install script exit with non-zero value {}",
                code
            )));
        }
        self.sink.progress("Install script exit successfully");
        Ok(())
    }

    fn finish(mut self, result: Result<(), ModuleError>) -> i32 {
        let code = match &result {
            Ok(()) => {
                self.commit();
                EXIT_SUCCESS
            }
            Err(e) => {
                tracing::error!("install failed during {:?}: {}", self.stage, e);
                self.sink.failure(&e.to_string());
                self.roll_back();
                e.exit_code()
            }
        };
        self.sink.close();
        code
    }

    fn commit(&mut self) {
        let Some(backup) = self.txn.as_ref().and_then(|t| t.backup_dir.clone()) else {
            return;
        };
        self.sink.progress("Cleanup the previous version backup");
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::error!("failed to remove backup {}: {}", backup.display(), e);
        }
    }

    fn roll_back(&mut self) {
        let Some(txn) = self.txn.take() else {
            // Failed while validating: nothing was touched
            return;
        };

        match &txn.backup_dir {
            Some(backup) => {
                self.sink
                    .progress("Cleanup and restore the previous version backup");
                remove_if_exists(&txn.module_dir);
                if let Err(e) = fs::rename(backup, &txn.module_dir) {
                    self.sink.failure(&format!(
                        "Unable to restore {} from {}: {}",
                        txn.module_dir.display(),
                        backup.display(),
                        e
                    ));
                    return;
                }
                if txn.previously_enabled {
                    if let Err(e) = self.store.enable(&txn.module_id) {
                        tracing::error!("failed to re-enable {}: {}", txn.module_id, e);
                    }
                }
            }
            None if txn.extracted => {
                self.sink.progress("Cleanup temp dir");
                remove_if_exists(&txn.module_dir);
            }
            None => {}
        }
    }
}

fn remove_if_exists(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!("failed to remove {}: {}", dir.display(), e),
    }
}

/// Uninstall `id`: disable it, run `uninstall.sh` with `PURGE`, then delete it.
///
/// The directory is deleted even when the script fails; the exit code still
/// reports the script's failure.
pub fn uninstall(store: &ModuleStore, id: &str, purge: bool, mut sink: OutputSink) -> i32 {
    sink.progress(&format!("Uninstall terminal module: {}", id));
    let exists = store.is_module(id);

    let result = run_uninstall(store, id, purge, exists, &mut sink);
    if let Err(e) = &result {
        sink.failure(&e.to_string());
    }

    if exists {
        sink.progress("Cleanup module dir");
        remove_if_exists(&store.module_dir(id));
    }
    sink.close();

    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => e.exit_code(),
    }
}

fn run_uninstall(
    store: &ModuleStore,
    id: &str,
    purge: bool,
    exists: bool,
    sink: &mut OutputSink,
) -> Result<(), ModuleError> {
    if !exists {
        return Err(ModuleError::NotInstalled(id.to_string()));
    }

    sink.progress("Disable the module");
    if let Err(e) = store.disable(id) {
        tracing::warn!("failed to disable {}: {}", id, e);
    }

    if store.module_dir(id).join(UNINSTALL_SCRIPT).is_file() {
        sink.progress("Execute uninstall script");
        let code = store
            .run_script(id, UNINSTALL_SCRIPT, &[("PURGE", purge.to_string())], sink)
            .map_err(ModuleError::io("Unable to execute uninstall script"))?;
        if code != 0 {
            return Err(ModuleError::Script(format!(
                "Uninstall script exit with non-zero value {}",
                code
            )));
        }
        sink.progress("Uninstall script exit successfully");
    } else {
        sink.progress("No uninstall script, skipping");
    }

    sink.progress("Finish");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::module_zip;
    use super::*;
    use crate::modules::sink::test_support::SharedBuffer;
    use crate::modules::store::test_support::{temp_store, write_module};
    use std::collections::BTreeMap;

    /// Relative path -> content snapshot of a tree (directories map to None)
    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Option<Vec<u8>>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                let rel = path.strip_prefix(root).unwrap().to_path_buf();
                if path.is_dir() {
                    out.insert(rel, None);
                    walk(root, &path, out);
                } else {
                    out.insert(rel, Some(fs::read(&path).unwrap()));
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn backups_in(store: &ModuleStore) -> Vec<PathBuf> {
        fs::read_dir(store.modules_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains("_backup_"))
            .collect()
    }

    #[test]
    fn test_fresh_install_starts_disabled() {
        let (dir, _config, store) = temp_store();
        let archive = module_zip(
            dir.path(),
            "hello.zip",
            &[
                ("module.prop", "id=hello\nname=Hello\nversionCode=3\n"),
                ("install.sh", "echo installing into $MODDIR\n"),
                ("bin/", ""),
                ("bin/hello", "#!/bin/sh\necho hello\n"),
            ],
        );
        let buffer = SharedBuffer::default();

        let code = install(&store, &archive, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_SUCCESS, "{}", buffer.text());

        assert!(store.is_module("hello"));
        assert!(!store.is_enabled("hello"));
        assert!(store.module_dir("hello").join("bin/hello").is_file());
        assert!(backups_in(&store).is_empty());

        let lines = buffer.lines();
        assert!(lines.iter().all(|l| l.starts_with("- ")));
        assert!(lines.contains(&"- moduleId: hello".to_string()));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("- installing into ") && l.ends_with("/usr/opt/hello")));
        assert_eq!(lines.last().map(String::as_str), Some("- Finish"));
    }

    #[test]
    fn test_missing_install_script_changes_nothing() {
        let (dir, _config, store) = temp_store();
        let archive = module_zip(dir.path(), "bad.zip", &[("module.prop", "id=bad\n")]);
        let before = snapshot(store.modules_dir());
        let buffer = SharedBuffer::default();

        let code = install(&store, &archive, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(snapshot(store.modules_dir()), before);
        let last = buffer.lines().pop().unwrap();
        assert!(last.starts_with("! ") && last.contains("install.sh"), "{}", last);
    }

    #[test]
    fn test_missing_manifest_or_id_aborts() {
        let (dir, _config, store) = temp_store();

        let no_prop = module_zip(dir.path(), "a.zip", &[("install.sh", "true\n")]);
        let buffer = SharedBuffer::default();
        assert_eq!(install(&store, &no_prop, OutputSink::new(buffer.clone())), EXIT_FAILURE);
        assert!(buffer.text().contains("! 'module.prop' doesn't exist"));

        let no_id = module_zip(
            dir.path(),
            "b.zip",
            &[("module.prop", "name=anonymous\n"), ("install.sh", "true\n")],
        );
        let buffer = SharedBuffer::default();
        assert_eq!(install(&store, &no_id, OutputSink::new(buffer.clone())), EXIT_FAILURE);
        assert!(buffer.text().contains("! Module id is null or empty"));
        assert!(snapshot(store.modules_dir()).is_empty());
    }

    #[test]
    fn test_unreadable_archive_aborts() {
        let (dir, _config, store) = temp_store();
        let not_zip = dir.path().join("junk.zip");
        fs::write(&not_zip, b"not a zip").unwrap();

        let buffer = SharedBuffer::default();
        assert_eq!(install(&store, &not_zip, OutputSink::new(buffer.clone())), EXIT_FAILURE);
        assert!(buffer.text().contains("! Read terminal module file error"));
        assert!(snapshot(store.modules_dir()).is_empty());
    }

    #[test]
    fn test_failing_script_without_backup_removes_target() {
        let (dir, _config, store) = temp_store();
        let archive = module_zip(
            dir.path(),
            "fail.zip",
            &[("module.prop", "id=fail\n"), ("install.sh", "echo nope\nexit 3\n")],
        );
        let buffer = SharedBuffer::default();

        let code = install(&store, &archive, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_FAILURE);
        assert!(!store.module_dir("fail").exists());
        assert!(backups_in(&store).is_empty());

        let text = buffer.text();
        assert!(text.contains("! Install script exit with non-zero value 3"));
        assert!(text.contains("- Cleanup temp dir"));
    }

    #[test]
    fn test_failing_upgrade_restores_previous_version_exactly() {
        let (dir, _config, store) = temp_store();
        write_module(
            &store,
            "tool",
            &[
                ("install.sh", "true\n"),
                ("data/config", "old config"),
                (DISABLE_SENTINEL, ""),
            ],
        );
        let before = snapshot(&store.module_dir("tool"));

        let archive = module_zip(
            dir.path(),
            "tool-v2.zip",
            &[
                ("module.prop", "id=tool\nversionCode=2\n"),
                ("install.sh", "exit 1\n"),
                ("data/config", "new config"),
                ("data/extra", "only in v2"),
            ],
        );
        let code = install(&store, &archive, OutputSink::null());
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(snapshot(&store.module_dir("tool")), before);
        assert!(backups_in(&store).is_empty());
    }

    #[test]
    fn test_failing_upgrade_re_enables_previously_enabled_module() {
        let (dir, _config, store) = temp_store();
        write_module(&store, "live", &[("install.sh", "true\n")]);
        assert!(store.is_enabled("live"));

        let archive = module_zip(
            dir.path(),
            "live.zip",
            &[("module.prop", "id=live\n"), ("install.sh", "exit 2\n")],
        );
        assert_eq!(install(&store, &archive, OutputSink::null()), EXIT_FAILURE);
        assert!(store.is_enabled("live"));
    }

    #[test]
    fn test_successful_upgrade_drops_backup() {
        let (dir, _config, store) = temp_store();
        write_module(
            &store,
            "tool",
            &[("disable.sh", "touch \"$HOME/disabled-old\"\n"), ("stale", "old")],
        );

        let archive = module_zip(
            dir.path(),
            "tool.zip",
            &[("module.prop", "id=tool\nversion=v2\n"), ("install.sh", "true\n")],
        );
        let buffer = SharedBuffer::default();
        assert_eq!(install(&store, &archive, OutputSink::new(buffer.clone())), EXIT_SUCCESS);

        let info = store.module_info("tool").unwrap();
        assert_eq!(info.version.as_deref(), Some("v2"));
        assert!(!info.enabled);
        assert!(!store.module_dir("tool").join("stale").exists());
        assert!(backups_in(&store).is_empty());
        assert!(buffer.text().contains("- Backup the previous version"));
        assert!(buffer.text().contains("- Cleanup the previous version backup"));
    }

    #[test]
    fn test_unsafe_zip_entry_aborts_extraction() {
        let (dir, _config, store) = temp_store();
        let archive = module_zip(
            dir.path(),
            "evil.zip",
            &[
                ("module.prop", "id=evil\n"),
                ("install.sh", "true\n"),
                ("../escape", "x"),
            ],
        );
        let buffer = SharedBuffer::default();
        assert_eq!(install(&store, &archive, OutputSink::new(buffer.clone())), EXIT_FAILURE);
        assert!(!store.module_dir("evil").exists());
        assert!(!store.modules_dir().join("escape").exists());
        assert!(buffer.text().contains("! Unable to unzip file: ../escape"));
    }

    #[test]
    fn test_uninstall_missing_module() {
        let (_dir, _config, store) = temp_store();
        let buffer = SharedBuffer::default();
        let code = uninstall(&store, "missing-id", true, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_FAILURE);
        assert!(buffer.text().contains("hasn't been installed"));
    }

    #[test]
    fn test_uninstall_passes_purge_and_deletes() {
        let (_dir, config, store) = temp_store();
        write_module(
            &store,
            "gone",
            &[(
                "uninstall.sh",
                "echo \"purge=$PURGE\"\n[ -f \"$MODDIR/disable\" ] && echo disabled-first\n",
            )],
        );
        let buffer = SharedBuffer::default();

        let code = uninstall(&store, "gone", false, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_SUCCESS, "{}", buffer.text());
        assert!(!config.modules_dir().join("gone").exists());
        let text = buffer.text();
        assert!(text.contains("- purge=false"));
        assert!(text.contains("- disabled-first"));
    }

    #[test]
    fn test_uninstall_script_failure_still_deletes() {
        let (_dir, _config, store) = temp_store();
        write_module(&store, "stubborn", &[("uninstall.sh", "exit 5\n")]);
        let buffer = SharedBuffer::default();

        let code = uninstall(&store, "stubborn", true, OutputSink::new(buffer.clone()));
        assert_eq!(code, EXIT_FAILURE);
        assert!(!store.module_dir("stubborn").exists());
        assert!(buffer
            .text()
            .contains("! Uninstall script exit with non-zero value 5"));
    }

    #[test]
    fn test_uninstall_without_script_succeeds() {
        let (_dir, _config, store) = temp_store();
        write_module(&store, "bare", &[]);
        assert_eq!(uninstall(&store, "bare", true, OutputSink::null()), EXIT_SUCCESS);
        assert!(!store.is_module("bare"));
    }

    #[test]
    fn test_backup_path_is_sibling() {
        let backup = backup_path(Path::new("/data/usr/opt/mod"));
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(backup.parent(), Some(Path::new("/data/usr/opt")));
        assert!(name.starts_with("mod_backup_"));
    }
}
