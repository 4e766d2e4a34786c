//! Emulator binary resolution.
//!
//! The host platform is looked up at runtime in a small strategy table
//! instead of being fixed at compile time. A binary configured in
//! [`Settings`] always takes precedence over the table.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LaunchError;
use crate::settings::Settings;

/// Host platform → emulator binary name.
const EMULATOR_BINARIES: &[(&str, &str)] = &[
    ("linux", "qemu-system-x86_64"),
    ("macos", "qemu-system-x86_64"),
    ("freebsd", "qemu-system-x86_64"),
    ("windows", "qemu-system-x86_64.exe"),
];

/// Emulator binary name for `platform` (an `std::env::consts::OS` value).
pub fn emulator_for(platform: &str) -> Option<&'static str> {
    EMULATOR_BINARIES
        .iter()
        .find(|(os, _)| *os == platform)
        .map(|(_, binary)| *binary)
}

/// Resolves the emulator to launch on this host.
///
/// Returns the absolute path of the binary. Fails with
/// [`LaunchError::UnsupportedPlatform`] when the host has no table entry and
/// no override is configured, and with [`LaunchError::BinaryNotFound`] when
/// the chosen binary is not on `PATH`.
pub fn resolve_emulator(settings: &Settings) -> Result<PathBuf, LaunchError> {
    let name = match settings.emulator_binary.as_deref().filter(|b| !b.is_empty()) {
        Some(name) => name,
        None => emulator_for(std::env::consts::OS)
            .ok_or_else(|| LaunchError::UnsupportedPlatform(std::env::consts::OS.to_string()))?,
    };

    let path = find_executable(name).ok_or_else(|| LaunchError::BinaryNotFound(name.to_string()))?;
    debug!(binary = %path.display(), "resolved emulator binary");
    Ok(path)
}

/// Finds `name` either as a direct path or in a `PATH` directory.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
