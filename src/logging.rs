//! Tracing setup for the `machinery` binary.
//!
//! Stderr always receives events filtered by `RUST_LOG` (default `warn`).
//! Setting `MACHINERY_LOG=1` adds a plain-text copy in `machinery.log`
//! inside the log directory and raises the default level to `info`, so
//! machine actions and emulator exits are recorded.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_ENV: &str = "MACHINERY_LOG";
const LOG_FILE_PREFIX: &str = "machinery";
const LOG_FILE_SUFFIX: &str = "log";

/// Flushes the file writer when dropped. Keep it alive until exit.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. `log_dir` is where `machinery.log` goes
/// when file logging is requested.
pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let requested = file_logging_requested(std::env::var(LOG_ENV).ok().as_deref());

    let mut open_error = None;
    let appender = match log_dir.filter(|_| requested) {
        Some(dir) => match open_log_file(dir) {
            Ok(appender) => Some(appender),
            Err(e) => {
                open_error = Some(format!("{}: {e}", dir.display()));
                None
            }
        },
        None => None,
    };

    let (file_writer, file_guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let default_level = if file_writer.is_some() { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let file_layer = file_writer.map(|writer| fmt::layer().with_writer(writer).with_ansi(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    if let Some(e) = open_error {
        tracing::warn!(error = %e, "file logging disabled, cannot open log file");
    }

    LogGuard { _file_guard: file_guard }
}

fn file_logging_requested(value: Option<&str>) -> bool {
    value.map(str::trim) == Some("1")
}

fn open_log_file(dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(dir)
}
