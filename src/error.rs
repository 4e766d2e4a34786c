//! Error types for machine configuration, launch, persistence and disk
//! creation.
//!
//! Every external-process failure surfaces as one of these values. None of
//! them is fatal to the hosting application.

use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration edits and machine creation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("machine name must not be empty")]
    EmptyName,

    #[error("machine name `{0}` must be a plain folder name")]
    InvalidName(String),

    #[error("requested {requested} MiB of RAM but the host only has {available} MiB")]
    RamExceedsHost { requested: u64, available: u64 },

    #[error("machine folder {} already exists and possibly belongs to another machine", .0.display())]
    DirectoryExists(PathBuf),

    #[error("cannot create machine folder {}: {source}", .path.display())]
    DirectoryUncreatable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while starting the emulator process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no emulator binary is known for platform `{0}`")]
    UnsupportedPlatform(String),

    #[error("emulator binary `{0}` was not found on PATH")]
    BinaryNotFound(String),

    #[error("failed to start `{}`: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("machine `{0}` already has a running process")]
    AlreadyRunning(String),
}

/// Failure writing to the control channel of a running process.
#[derive(Debug, Error)]
#[error("control command `{command}` could not be delivered: {source}")]
pub struct ControlError {
    pub command: &'static str,
    #[source]
    pub source: std::io::Error,
}

/// Persistence failures for machine records and the catalog.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed document {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no machine with uuid {0} in the catalog")]
    UnknownMachine(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Classified outcome of a failed disk image creation.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("cannot start `{0}`; ensure it is installed and available")]
    ToolNotFound(String),

    #[error("`{0}` did not finish correctly; the image was not created")]
    DidNotFinish(String),

    #[error("`{tool}` reported an error: {message}")]
    ToolReported { tool: String, message: String },

    #[error("unsupported disk image format `{0}`")]
    UnsupportedFormat(String),

    #[error("invalid disk size {0} GiB")]
    InvalidSize(f64),

    #[error("disk image I/O error: {0}")]
    Io(#[from] std::io::Error),
}
