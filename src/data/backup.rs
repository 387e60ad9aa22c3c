//! Whole-tree backup and restore of the managed `home` and `usr` directories

use std::path::{Path, PathBuf};

use super::archive::{ArchiveError, Archiver};
use crate::config::ServiceConfig;

/// Archive name for the home tree
pub const HOME_ARCHIVE: &str = "home.tar.gz";

/// Archive name for the usr tree
pub const USR_ARCHIVE: &str = "usr.tar.gz";

/// Which trees a backup should include
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupSelection {
    pub home: bool,
    pub usr: bool,
}

impl Default for BackupSelection {
    fn default() -> Self {
        Self {
            home: true,
            usr: true,
        }
    }
}

/// Backup/restore of the service's data trees
#[derive(Debug, Clone)]
pub struct DataBackup {
    home_dir: PathBuf,
    usr_dir: PathBuf,
}

impl DataBackup {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            home_dir: config.home_dir(),
            usr_dir: config.usr_dir(),
        }
    }

    /// Pack the selected trees into `output_dir`. Trees that do not exist are skipped.
    ///
    /// Returns the archives written.
    pub fn backup(
        &self,
        output_dir: &Path,
        selection: BackupSelection,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        std::fs::create_dir_all(output_dir).map_err(|source| ArchiveError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        let targets = [
            (selection.home, &self.home_dir, HOME_ARCHIVE),
            (selection.usr, &self.usr_dir, USR_ARCHIVE),
        ];
        for (selected, dir, name) in targets {
            if !selected {
                continue;
            }
            if !dir.exists() {
                tracing::info!("Skipping backup of missing {}", dir.display());
                continue;
            }
            let archive = output_dir.join(name);
            Archiver::pack(dir, &archive).inspect_err(|e| {
                tracing::error!("backupData error: {}", e);
            })?;
            written.push(archive);
        }

        Ok(written)
    }

    /// Replace each live tree that has an archive in `input_dir`.
    ///
    /// Destructive: the live tree is deleted before extraction. A missing input
    /// directory is logged and leaves everything untouched.
    pub fn restore(&self, input_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
        if !input_dir.exists() {
            tracing::error!(
                "restoreData: input directory does not exist: {}",
                input_dir.display()
            );
            return Ok(Vec::new());
        }

        let mut restored = Vec::new();
        let targets = [
            (HOME_ARCHIVE, &self.home_dir),
            (USR_ARCHIVE, &self.usr_dir),
        ];
        for (name, dir) in targets {
            let archive = input_dir.join(name);
            if !archive.exists() {
                continue;
            }
            remove_tree(dir)?;
            Archiver::unpack(&archive, dir).inspect_err(|e| {
                tracing::error!("restoreData error: {}", e);
            })?;
            restored.push(dir.clone());
        }

        Ok(restored)
    }

    /// [`Self::backup`] on a blocking thread
    pub async fn backup_async(
        &self,
        output_dir: PathBuf,
        selection: BackupSelection,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let this = self.clone();
        let written =
            tokio::task::spawn_blocking(move || this.backup(&output_dir, selection)).await??;
        Ok(written)
    }

    /// [`Self::restore`] on a blocking thread
    pub async fn restore_async(&self, input_dir: PathBuf) -> anyhow::Result<Vec<PathBuf>> {
        let this = self.clone();
        let restored = tokio::task::spawn_blocking(move || this.restore(&input_dir)).await??;
        Ok(restored)
    }
}

fn remove_tree(dir: &Path) -> Result<(), ArchiveError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ArchiveError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, ServiceConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::with_data_dir(dir.path().join("data"));
        fs::create_dir_all(config.home_dir().join(".config")).unwrap();
        fs::write(config.home_dir().join(".config/rc"), b"home rc").unwrap();
        fs::create_dir_all(config.bin_dir()).unwrap();
        fs::write(config.bin_dir().join("tool"), b"usr tool").unwrap();
        (dir, config)
    }

    #[test]
    fn test_backup_then_restore_replaces_live_trees() {
        let (dir, config) = setup();
        let backup = DataBackup::new(&config);
        let out = dir.path().join("backup");

        let written = backup.backup(&out, BackupSelection::default()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(out.join(HOME_ARCHIVE).is_file());
        assert!(out.join(USR_ARCHIVE).is_file());

        fs::write(config.home_dir().join("stray"), b"created later").unwrap();
        fs::write(config.bin_dir().join("tool"), b"modified").unwrap();

        let restored = backup.restore(&out).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(!config.home_dir().join("stray").exists());
        assert_eq!(fs::read(config.home_dir().join(".config/rc")).unwrap(), b"home rc");
        assert_eq!(fs::read(config.bin_dir().join("tool")).unwrap(), b"usr tool");
    }

    #[test]
    fn test_backup_respects_selection() {
        let (dir, config) = setup();
        let out = dir.path().join("only-home");
        let selection = BackupSelection {
            home: true,
            usr: false,
        };
        DataBackup::new(&config).backup(&out, selection).unwrap();
        assert!(out.join(HOME_ARCHIVE).exists());
        assert!(!out.join(USR_ARCHIVE).exists());
    }

    #[test]
    fn test_restore_missing_input_is_noop() {
        let (dir, config) = setup();
        let restored = DataBackup::new(&config)
            .restore(&dir.path().join("nowhere"))
            .unwrap();
        assert!(restored.is_empty());
        assert!(config.home_dir().join(".config/rc").exists());
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (dir, config) = setup();
        let backup = DataBackup::new(&config);
        let out = dir.path().join("async");

        let written = backup
            .backup_async(out.clone(), BackupSelection::default())
            .await
            .unwrap();
        assert_eq!(written.len(), 2);

        fs::remove_dir_all(config.home_dir()).unwrap();
        backup.restore_async(out).await.unwrap();
        assert!(config.home_dir().join(".config/rc").exists());
    }
}
