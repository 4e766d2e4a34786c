//! Disk image creation through the external image tool (`qemu-img`).
//!
//! [`DiskTool::create_disk`] blocks the calling thread until the tool exits
//! or the finish timeout elapses. Every failure is classified into a
//! [`DiskError`] variant; on failure no image path is handed back, so the
//! caller never attaches a half-written disk to a machine.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{MachineConfig, Media, MediaKind};
use crate::error::DiskError;
use crate::settings::Settings;

const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Image formats the tool is asked to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Raw,
    Qcow,
    Qcow2,
    Qed,
    Vmdk,
    Vdi,
    Vpc,
    Vhdx,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 8] = [
        DiskFormat::Raw,
        DiskFormat::Qcow,
        DiskFormat::Qcow2,
        DiskFormat::Qed,
        DiskFormat::Vmdk,
        DiskFormat::Vdi,
        DiskFormat::Vpc,
        DiskFormat::Vhdx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow => "qcow",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Qed => "qed",
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Vpc => "vpc",
            DiskFormat::Vhdx => "vhdx",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskFormat {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiskFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DiskError::UnsupportedFormat(s.to_string()))
    }
}

/// Creates disk images for one machine directory.
#[derive(Debug, Clone)]
pub struct DiskTool {
    program: String,
    directory: PathBuf,
    finish_timeout: Duration,
}

impl DiskTool {
    pub fn new(program: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            directory: directory.into(),
            finish_timeout: DEFAULT_FINISH_TIMEOUT,
        }
    }

    /// Tool from the settings, images placed in the machine's directory.
    pub fn for_machine(settings: &Settings, machine: &MachineConfig) -> Self {
        Self::new(settings.image_tool.clone(), machine.path())
    }

    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Where an image called `name` in `format` is written. Spaces in the
    /// name become underscores.
    pub fn disk_path(&self, name: &str, format: DiskFormat) -> PathBuf {
        self.directory
            .join(format!("{}.{}", name.trim().replace(' ', "_"), format))
    }

    /// Runs `<tool> create [-e] -f <format> <path> <size>G`.
    ///
    /// On success returns a disk [`Media`] entry ready to attach. A non-empty
    /// error stream counts as a failure even when the exit code is zero.
    pub fn create_disk(
        &self,
        format: &str,
        name: &str,
        size_gib: f64,
        use_encryption: bool,
    ) -> Result<Media, DiskError> {
        let format: DiskFormat = format.parse()?;
        if !size_gib.is_finite() || size_gib <= 0.0 {
            return Err(DiskError::InvalidSize(size_gib));
        }

        let path = self.disk_path(name, format);
        let existed = path.exists();
        let created_directory = !self.directory.exists();
        std::fs::create_dir_all(&self.directory)?;

        let mut args: Vec<String> = vec!["create".into()];
        if use_encryption {
            args.push("-e".into());
        }
        args.extend([
            "-f".to_string(),
            format.to_string(),
            path.to_string_lossy().into_owned(),
            format!("{size_gib}G"),
        ]);
        debug!(target: "disk", tool = %self.program, ?args, "invoking image tool");

        let result = self.run_tool(&args);
        if let Err(e) = &result {
            warn!(target: "disk", tool = %self.program, path = %path.display(), error = %e, "disk creation failed");
            if !existed && path.exists() {
                if let Err(cleanup) = std::fs::remove_file(&path) {
                    warn!(target: "disk", path = %path.display(), error = %cleanup, "cannot remove partial image");
                }
            }
            // Only removes the folder if nothing else ended up in it.
            if created_directory && std::fs::remove_dir(&self.directory).is_err() {
                debug!(target: "disk", dir = %self.directory.display(), "folder kept, not empty");
            }
        }
        result?;

        info!(target: "disk", path = %path.display(), %format, size_gib, "disk image created");
        let mut media = Media::new(name.trim(), path, MediaKind::Disk);
        media.format = format.to_string();
        media.size_bytes = (size_gib * GIB) as u64;
        Ok(media)
    }

    fn run_tool(&self, args: &[String]) -> Result<(), DiskError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                debug!(target: "disk", tool = %self.program, error = %e, "image tool did not start");
                if e.kind() == std::io::ErrorKind::NotFound {
                    DiskError::ToolNotFound(self.program.clone())
                } else {
                    DiskError::Io(e)
                }
            })?;

        // Drained on its own thread so a chatty tool cannot fill the pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        let deadline = Instant::now() + self.finish_timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(target: "disk", tool = %self.program, timeout = ?self.finish_timeout, "image tool timed out, killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Err(DiskError::DidNotFinish(self.program.clone()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let message = stderr.trim();

        let Some(code) = status.code() else {
            return Err(DiskError::DidNotFinish(self.program.clone()));
        };
        if !message.is_empty() {
            return Err(DiskError::ToolReported {
                tool: self.program.clone(),
                message: message.to_string(),
            });
        }
        if code != 0 {
            return Err(DiskError::ToolReported {
                tool: self.program.clone(),
                message: format!("exited with code {code}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("qcow2".parse::<DiskFormat>().unwrap(), DiskFormat::Qcow2);
        assert_eq!("VHDX".parse::<DiskFormat>().unwrap(), DiskFormat::Vhdx);
        assert!(matches!(
            "iso".parse::<DiskFormat>(),
            Err(DiskError::UnsupportedFormat(f)) if f == "iso"
        ));
    }

    #[test]
    fn disk_path_replaces_spaces() {
        let tool = DiskTool::new("qemu-img", "/vms/debian");
        assert_eq!(
            tool.disk_path("system disk", DiskFormat::Qcow2),
            PathBuf::from("/vms/debian/system_disk.qcow2")
        );
    }

    #[test]
    fn missing_tool_is_classified_and_leaves_no_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("vm");
        let tool = DiskTool::new("qemu-img-that-does-not-exist", &dir);
        let err = tool.create_disk("qcow2", "disk1", 10.0, false).unwrap_err();
        assert!(matches!(err, DiskError::ToolNotFound(t) if t == "qemu-img-that-does-not-exist"));
        assert!(!dir.exists());
    }

    #[test]
    fn existing_folder_survives_a_failed_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = DiskTool::new("qemu-img-that-does-not-exist", tmp.path());
        assert!(tool.create_disk("raw", "disk1", 1.0, false).is_err());
        assert!(tmp.path().is_dir());
    }

    #[test]
    fn nonsensical_size_is_rejected_before_running() {
        let tool = DiskTool::new("qemu-img-that-does-not-exist", "/nowhere");
        assert!(matches!(
            tool.create_disk("raw", "d", 0.0, false),
            Err(DiskError::InvalidSize(_))
        ));
        assert!(matches!(
            tool.create_disk("raw", "d", f64::NAN, false),
            Err(DiskError::InvalidSize(_))
        ));
    }

    #[cfg(unix)]
    mod with_fake_tool {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn fake_tool(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-img");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[test]
        fn success_returns_attachable_media() {
            let tmp = tempfile::tempdir().unwrap();
            // Arguments: create -f <fmt> <path> <size>; touch the path.
            let tool = DiskTool::new(fake_tool(tmp.path(), "touch \"$4\""), tmp.path().join("vm"));

            let media = tool.create_disk("qcow2", "disk 1", 2.0, false).unwrap();
            assert_eq!(media.path, tmp.path().join("vm").join("disk_1.qcow2"));
            assert!(media.path.exists());
            assert_eq!(media.format, "qcow2");
            assert_eq!(media.kind, MediaKind::Disk);
            assert_eq!(media.size_bytes, 2 * 1024 * 1024 * 1024);
        }

        #[test]
        fn stderr_output_is_a_reported_error_and_partial_file_is_removed() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = DiskTool::new(
                fake_tool(tmp.path(), "touch \"$4\"; echo 'invalid size' >&2"),
                tmp.path(),
            );

            let err = tool.create_disk("raw", "broken", 1.0, false).unwrap_err();
            assert!(matches!(err, DiskError::ToolReported { message, .. } if message == "invalid size"));
            assert!(!tmp.path().join("broken.raw").exists());
        }

        #[test]
        fn encryption_flag_is_passed_first() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = DiskTool::new(
                fake_tool(tmp.path(), "[ \"$2\" = \"-e\" ] || echo 'no -e' >&2"),
                tmp.path(),
            );
            tool.create_disk("qcow", "enc", 1.0, true).unwrap();
        }

        #[test]
        fn non_executable_tool_is_an_io_error_not_a_missing_tool() {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("not-executable");
            std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

            let tool = DiskTool::new(path.to_string_lossy(), tmp.path().join("vm"));
            let err = tool.create_disk("qcow2", "disk1", 1.0, false).unwrap_err();
            assert!(
                matches!(&err, DiskError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied),
                "{err:?}"
            );
            assert!(!tmp.path().join("vm").exists());
        }

        #[test]
        fn hung_tool_is_killed_after_timeout() {
            let tmp = tempfile::tempdir().unwrap();
            let tool = DiskTool::new(fake_tool(tmp.path(), "exec sleep 30"), tmp.path())
                .with_finish_timeout(Duration::from_millis(200));

            let started = Instant::now();
            let err = tool.create_disk("vdi", "slow", 1.0, false).unwrap_err();
            assert!(matches!(err, DiskError::DidNotFinish(_)));
            assert!(started.elapsed() < Duration::from_secs(10));
        }
    }
}
