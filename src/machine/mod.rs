//! Virtual machine definitions and everything that acts on them.
//!
//! A [`MachineConfig`] describes one machine's hardware profile. It is
//! compiled into an emulator invocation by [`command`], supervised at
//! runtime by [`supervisor`], persisted by [`store`], and gets its disks from
//! [`disk`].
//!
//! ```text
//! MachineConfig ──► command::compile ──► Supervisor::run ──► emulator process
//!       │                                      │
//!       └──► MachineStore (record + catalog)   └──► SupervisorEvent observers
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::host::HostMemory;

pub mod command;
pub mod disk;
pub mod labels;
pub mod platform;
pub mod store;
pub mod supervisor;

use labels::LabelTable;

/// Emulator binary recorded for new machines.
pub const DEFAULT_BINARY: &str = "qemu-system-x86_64";

// ---------------------------------------------------------------------------
// Hardware sub-structures
// ---------------------------------------------------------------------------

/// SMP topology and CPU model. Counts are passed to the emulator verbatim;
/// no cross-validation between them is performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuConfig {
    pub cpu_type: String,
    pub cpu_count: u32,
    pub socket_count: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    pub max_hotplug_cpus: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            cpu_type: "qemu64".to_string(),
            cpu_count: 1,
            socket_count: 0,
            cores_per_socket: 0,
            threads_per_core: 0,
            max_hotplug_cpus: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuConfig {
    pub gpu_type: String,
    pub keyboard: String,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            gpu_type: "std".to_string(),
            keyboard: "en-us".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// Kind of attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Disk,
    Cdrom,
    Floppy,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Disk => "disk",
            MediaKind::Cdrom => "cdrom",
            MediaKind::Floppy => "floppy",
        }
    }
}

/// One attached storage or optical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub kind: MediaKind,
    /// Image format (`qcow2`, `raw`, ...). Empty lets the emulator detect it.
    pub format: String,
    /// Controller interface (`ide`, `scsi`, `virtio`, ...).
    pub interface: String,
    /// Cache policy (`none`, `writeback`, ...). Empty means emulator default.
    pub cache: String,
    /// Asynchronous I/O mode (`threads`, `native`, ...).
    pub io: String,
    uuid: String,
}

impl Media {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, kind: MediaKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size_bytes: 0,
            kind,
            format: String::new(),
            interface: "ide".to_string(),
            cache: String::new(),
            io: String::new(),
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Rebuilds a media entry read from a stored record, keeping its id.
    pub(crate) fn with_uuid(mut self, uuid: String) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

// ---------------------------------------------------------------------------
// Boot configuration
// ---------------------------------------------------------------------------

/// Direct kernel boot, bypassing the firmware boot devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelBoot {
    pub enabled: bool,
    pub kernel_path: String,
    pub initrd_path: String,
    pub kernel_args: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    pub boot_menu: bool,
    pub kernel_boot: KernelBoot,
    boot_order: Vec<String>,
}

impl BootConfig {
    pub fn boot_order(&self) -> &[String] {
        &self.boot_order
    }

    /// Appends a device to the boot order. No-op if already present.
    pub fn add_boot_device(&mut self, device: impl Into<String>) -> bool {
        insert_unique(&mut self.boot_order, device.into())
    }

    /// Removes a device from the boot order. No-op if absent.
    pub fn remove_boot_device(&mut self, device: &str) -> bool {
        remove_value(&mut self.boot_order, device)
    }

    pub fn clear_boot_order(&mut self) {
        self.boot_order.clear();
    }
}

// ---------------------------------------------------------------------------
// MachineConfig
// ---------------------------------------------------------------------------

/// Complete hardware profile of one virtual machine.
///
/// The uuid is assigned once, either freshly by [`MachineConfig::new`] or
/// from a stored record, and never changes afterwards. Audio cards,
/// accelerators, media and boot order behave as insertion-ordered sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    name: String,
    uuid: String,
    pub description: String,
    pub os_type: String,
    pub os_version: String,
    path: PathBuf,
    config_path: PathBuf,
    /// Emulator binary recorded in the machine file.
    pub binary: String,
    pub cpu: CpuConfig,
    pub gpu: GpuConfig,
    ram_mib: u64,
    audio: Vec<String>,
    pub host_sound_system: String,
    pub network: bool,
    accelerators: Vec<String>,
    media: Vec<Media>,
    pub boot: BootConfig,
}

impl MachineConfig {
    /// A new machine named `name` living in `<machines_root>/<name>/`.
    ///
    /// The name must be a single folder name: no separators, not `.` or
    /// `..`, not absolute.
    ///
    /// Starts with the defaults the creation flow uses: one `ac97` sound
    /// card, one CPU with zeroed topology, 512 MiB of RAM and user-mode
    /// networking.
    pub fn new(name: impl Into<String>, machines_root: &Path) -> Result<Self, ConfigError> {
        let name = name.into();
        validate_name(&name)?;

        let path = machines_root.join(&name);
        let config_path = path.join(format!("{name}.json"));

        Ok(Self {
            uuid: Uuid::new_v4().to_string(),
            description: String::new(),
            os_type: String::new(),
            os_version: String::new(),
            binary: DEFAULT_BINARY.to_string(),
            cpu: CpuConfig::default(),
            gpu: GpuConfig::default(),
            ram_mib: 512,
            audio: vec!["ac97".to_string()],
            host_sound_system: String::new(),
            network: true,
            accelerators: Vec::new(),
            media: Vec::new(),
            boot: BootConfig::default(),
            name,
            path,
            config_path,
        })
    }

    /// Rebuilds a machine from persisted identity fields. Used by the store.
    pub(crate) fn restore(name: String, uuid: String, path: PathBuf, config_path: PathBuf) -> Self {
        Self {
            name,
            uuid,
            description: String::new(),
            os_type: String::new(),
            os_version: String::new(),
            path,
            config_path,
            binary: DEFAULT_BINARY.to_string(),
            cpu: CpuConfig::default(),
            gpu: GpuConfig::default(),
            ram_mib: 0,
            audio: Vec::new(),
            host_sound_system: String::new(),
            network: false,
            accelerators: Vec::new(),
            media: Vec::new(),
            boot: BootConfig::default(),
        }
    }

    // --- identity and filesystem ---

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Directory holding the machine's files.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the machine's JSON record.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Pid file the emulator writes while running.
    pub fn pid_file(&self) -> PathBuf {
        self.path.join(format!("{}.pid", self.name))
    }

    // --- memory ---

    pub fn ram_mib(&self) -> u64 {
        self.ram_mib
    }

    /// Sets RAM without consulting the host. Used when restoring records.
    pub fn set_ram_mib(&mut self, mib: u64) {
        self.ram_mib = mib;
    }

    /// Sets RAM, rejecting values above the host's total memory.
    pub fn request_ram_mib(&mut self, mib: u64, host: &HostMemory) -> Result<(), ConfigError> {
        if !host.admits(mib) {
            return Err(ConfigError::RamExceedsHost {
                requested: mib,
                available: host.total_mib(),
            });
        }
        self.ram_mib = mib;
        Ok(())
    }

    // --- audio ---

    pub fn audio(&self) -> &[String] {
        &self.audio
    }

    pub fn add_audio(&mut self, card: impl Into<String>) -> bool {
        insert_unique(&mut self.audio, card.into())
    }

    pub fn remove_audio(&mut self, card: &str) -> bool {
        remove_value(&mut self.audio, card)
    }

    pub fn clear_audio(&mut self) {
        self.audio.clear();
    }

    pub fn audio_label(&self, table: &LabelTable, show_code: bool) -> String {
        table.format(&self.audio, show_code)
    }

    // --- accelerators ---

    pub fn accelerators(&self) -> &[String] {
        &self.accelerators
    }

    pub fn add_accelerator(&mut self, accelerator: impl Into<String>) -> bool {
        insert_unique(&mut self.accelerators, accelerator.into())
    }

    pub fn remove_accelerator(&mut self, accelerator: &str) -> bool {
        remove_value(&mut self.accelerators, accelerator)
    }

    pub fn clear_accelerators(&mut self) {
        self.accelerators.clear();
    }

    pub fn accelerator_label(&self, table: &LabelTable, show_code: bool) -> String {
        table.format(&self.accelerators, show_code)
    }

    // --- media ---

    pub fn media(&self) -> &[Media] {
        &self.media
    }

    /// Attaches `media` at the end of the list. A media entry pointing at an
    /// already attached path, or carrying an already attached id, is ignored.
    pub fn add_media(&mut self, media: Media) -> bool {
        let duplicate = self
            .media
            .iter()
            .any(|m| m.path == media.path || m.uuid == media.uuid);
        if duplicate {
            return false;
        }
        self.media.push(media);
        true
    }

    /// Detaches the media entry with the given id.
    pub fn remove_media(&mut self, uuid: &str) -> Option<Media> {
        let index = self.media.iter().position(|m| m.uuid == uuid)?;
        Some(self.media.remove(index))
    }
}

/// Rejects names that would not resolve to a direct child of the machines
/// folder.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." || Path::new(name).is_absolute() {
        return Err(ConfigError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Set helpers
// ---------------------------------------------------------------------------

fn insert_unique(values: &mut Vec<String>, value: String) -> bool {
    if values.contains(&value) {
        return false;
    }
    values.push(value);
    true
}

fn remove_value(values: &mut Vec<String>, value: &str) -> bool {
    match values.iter().position(|v| v == value) {
        Some(index) => {
            values.remove(index);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> MachineConfig {
        MachineConfig::new("debian-test", Path::new("/vms")).unwrap()
    }

    #[test]
    fn new_machine_derives_paths_from_name() {
        let m = machine();
        assert_eq!(m.path(), Path::new("/vms/debian-test"));
        assert_eq!(m.config_path(), Path::new("/vms/debian-test/debian-test.json"));
        assert_eq!(m.pid_file(), PathBuf::from("/vms/debian-test/debian-test.pid"));
        assert!(Uuid::parse_str(m.uuid()).is_ok());
        assert_eq!(m.audio(), ["ac97"]);
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = MachineConfig::new("  ", Path::new("/vms")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyName));
    }

    #[test]
    fn names_that_leave_the_machines_folder_are_rejected() {
        for name in ["/tmp/elsewhere", "../escape", "nested/vm", "back\\slash", ".", ".."] {
            let err = MachineConfig::new(name, Path::new("/vms")).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidName(n) if n == name), "{name} accepted");
        }
        let ok = MachineConfig::new("debian 12..beta", Path::new("/vms")).unwrap();
        assert_eq!(ok.path(), Path::new("/vms/debian 12..beta"));
    }

    #[test]
    fn accelerator_insertion_is_idempotent() {
        let mut m = machine();
        assert!(m.add_accelerator("kvm"));
        assert!(!m.add_accelerator("kvm"));
        assert!(m.add_accelerator("tcg"));
        assert_eq!(m.accelerators(), ["kvm", "tcg"]);

        assert!(!m.remove_accelerator("hax"));
        assert!(m.remove_accelerator("kvm"));
        assert_eq!(m.accelerators(), ["tcg"]);
    }

    #[test]
    fn audio_and_boot_order_reject_duplicates() {
        let mut m = machine();
        assert!(!m.add_audio("ac97"));
        assert!(m.add_audio("hda"));
        m.clear_audio();
        assert!(m.audio().is_empty());

        assert!(m.boot.add_boot_device("cdrom"));
        assert!(!m.boot.add_boot_device("cdrom"));
        assert!(m.boot.add_boot_device("hdd"));
        assert!(!m.boot.remove_boot_device("network"));
        assert_eq!(m.boot.boot_order(), ["cdrom", "hdd"]);
    }

    #[test]
    fn media_list_rejects_same_path_twice() {
        let mut m = machine();
        assert!(m.add_media(Media::new("root", "/vms/debian-test/root.qcow2", MediaKind::Disk)));
        assert!(!m.add_media(Media::new("again", "/vms/debian-test/root.qcow2", MediaKind::Disk)));
        assert_eq!(m.media().len(), 1);

        let id = m.media()[0].uuid().to_string();
        assert!(m.remove_media(&id).is_some());
        assert!(m.remove_media(&id).is_none());
    }

    #[test]
    fn ram_above_host_total_is_rejected_not_clamped() {
        let mut m = machine();
        let host = HostMemory::from_total_mib(8192);

        m.request_ram_mib(2048, &host).unwrap();
        assert_eq!(m.ram_mib(), 2048);

        let err = m.request_ram_mib(16384, &host).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::RamExceedsHost { requested: 16384, available: 8192 }
        ));
        assert_eq!(m.ram_mib(), 2048);
    }

    #[test]
    fn labels_use_injected_table() {
        let mut m = machine();
        m.add_accelerator("kvm");
        m.add_accelerator("tcg");
        let table = LabelTable::from_pairs([("kvm", "KVM")]);
        assert_eq!(m.accelerator_label(&table, false), "KVM, tcg");
        assert_eq!(m.accelerator_label(&table, true), "kvm: KVM, tcg: tcg");
    }
}
