//! Application directory structure for machinery.
//!
//! - Config:  `~/.config/machinery/settings.toml` (human-editable, XDG-style)
//! - Data:    `~/.machinery/` (machine catalog, unless overridden in settings)
//! - Logs:    `~/.local/share/machinery/logs/` (`~/Library/Logs/machinery/` on macOS)

use std::path::{Path, PathBuf};

use tracing::debug;

const APP_NAME: &str = "machinery";
const SETTINGS_FILE: &str = "settings.toml";

/// File name of the machine catalog inside the data directory.
pub const CATALOG_FILE: &str = "machines.json";

/// Resolved application directories.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Human-editable config directory.
    pub config: PathBuf,
    /// Default data directory holding the catalog.
    pub data: PathBuf,
    /// Application logs.
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = home_dir()?;
        Some(Self {
            config: resolve_config_dir(&home),
            data: default_data_dir(&home),
            logs: resolve_log_dir(&home),
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config.join(SETTINGS_FILE)
    }

    /// Create the config, data and log directories if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Dot-directory under the home directory.
pub fn default_data_dir(home: &Path) -> PathBuf {
    home.join(format!(".{APP_NAME}"))
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}
