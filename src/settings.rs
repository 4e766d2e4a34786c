//! User preferences.
//!
//! A [`Settings`] value is loaded once at startup, passed by reference to
//! whatever needs it, and written back only on an explicit `save`. Every
//! section uses `#[serde(default)]` so older or partial files still load.
//! Proxy, update and language values are stored for the presentation layer
//! and never interpreted here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::paths;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Parent folder for new machine directories.
    pub machine_path: PathBuf,
    /// Folder holding the machine catalog.
    pub data_dir: PathBuf,
    /// Emulator binary to use instead of the platform default.
    pub emulator_binary: Option<String>,
    /// Disk image tool (`qemu-img`).
    pub image_tool: String,
    pub update: UpdateSettings,
    pub language: LanguageSettings,
    pub proxy: ProxySettings,
    pub hooks: HookSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub enabled: bool,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LanguageSettings {
    pub code: String,
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    pub kind: u32,
    pub hostname: String,
    pub port: String,
    pub auth: bool,
    pub user: String,
    pub password: String,
}

/// Free-form commands the presentation layer runs around a machine session.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HookSettings {
    pub before_start: String,
    pub after_exit: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Settings {
    fn default() -> Self {
        let home = paths::home_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            data_dir: paths::default_data_dir(&home),
            machine_path: home,
            emulator_binary: None,
            image_tool: "qemu-img".to_string(),
            update: UpdateSettings::default(),
            language: LanguageSettings::default(),
            proxy: ProxySettings::default(),
            hooks: HookSettings::default(),
        }
    }
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: "stable".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

impl Settings {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or cannot be parsed.
    pub fn load(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read settings, using defaults");
                return Self::default();
            }
        };

        match toml::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed settings, using defaults");
                Self::default()
            }
        }
    }

    /// Writes settings to `path`, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create settings directory {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("serialise settings")?;
        std::fs::write(path, text)
            .with_context(|| format!("write settings {}", path.display()))?;
        info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Location of the machine catalog.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(paths::CATALOG_FILE)
    }
}
