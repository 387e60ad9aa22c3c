//! Service configuration and managed directory layout

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default root of everything the service manages
pub const DEFAULT_DATA_DIR: &str = "/data/local/tmp/runner";

/// Shell used for module lifecycle scripts when present
pub const DEFAULT_SYSTEM_SHELL: &str = "/system/bin/sh";

/// Environment variable overriding `data_dir`
pub const DATA_DIR_ENV: &str = "TERMRUNNER_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// On-disk configuration (`config.toml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root holding `usr/` and `home/`
    pub data_dir: PathBuf,
    /// Shell that runs lifecycle hooks (`install.sh`, `enable.sh`, ...)
    pub system_shell: PathBuf,
    /// Append logs here instead of stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            system_shell: default_system_shell(),
            log_file: None,
        }
    }
}

fn default_system_shell() -> PathBuf {
    let android = PathBuf::from(DEFAULT_SYSTEM_SHELL);
    if android.exists() {
        return android;
    }
    which::which("sh").unwrap_or_else(|_| PathBuf::from("/bin/sh"))
}

impl ServiceConfig {
    /// Configuration rooted at an explicit data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Default config file location, e.g. `~/.config/termrunner/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("termrunner").join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist; the default path is optional. The
    /// `TERMRUNNER_DATA_DIR` environment variable wins over the file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn usr_dir(&self) -> PathBuf {
        self.data_dir.join("usr")
    }

    pub fn home_dir(&self) -> PathBuf {
        self.data_dir.join("home")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.usr_dir().join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.usr_dir().join("lib")
    }

    /// Root under which every module lives as `<modules_dir>/<id>`
    pub fn modules_dir(&self) -> PathBuf {
        self.usr_dir().join("opt")
    }

    /// Login shell used for user command sessions
    pub fn login_shell(&self) -> PathBuf {
        self.bin_dir().join("bash")
    }

    /// Profile sourced before every user command
    pub fn profile_path(&self) -> PathBuf {
        self.usr_dir().join("etc").join("profile")
    }

    /// Create the managed directory tree and rewrite the shell profile.
    ///
    /// Directory creation failures propagate; a profile write failure is logged only.
    pub fn init_layout(&self) -> std::io::Result<()> {
        let usr = self.usr_dir();
        let dirs = [
            usr.clone(),
            self.home_dir(),
            self.bin_dir(),
            self.lib_dir(),
            usr.join("etc"),
            usr.join("etc").join("profile.d"),
            usr.join("etc").join("shells.d"),
            self.modules_dir(),
            usr.join("tmp"),
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
        }

        if let Err(e) = std::fs::write(self.profile_path(), self.profile_script()) {
            tracing::error!("writing profile error: {}", e);
        }
        Ok(())
    }

    /// Contents of `usr/etc/profile`
    pub fn profile_script(&self) -> String {
        let home = self.home_dir();
        let usr = self.usr_dir();
        format!(
            r#"#!/system/bin/sh

# !!!Please do not modify this file, it will be overwritten each time the service starts.!!!

export HOME={home}
export PREFIX={usr}
if [ -z "$PATH" ]; then
    export PATH={usr}/bin
else
    export PATH={usr}/bin:$PATH
fi
if [ -z "$LD_LIBRARY_PATH" ]; then
    export LD_LIBRARY_PATH={usr}/lib
else
    export LD_LIBRARY_PATH={usr}/lib:$LD_LIBRARY_PATH
fi

for i in $PREFIX/etc/profile.d/*.sh; do
  if [ -r $i ]; then
    . $i
  fi
done
unset i
"#,
            home = home.display(),
            usr = usr.display(),
        )
    }
}
