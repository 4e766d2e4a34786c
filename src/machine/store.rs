//! Persistence of machine records and the machine catalog.
//!
//! Each machine is one JSON document at its `config_path`:
//!
//! ```json
//! { "name": "debian", "OSType": "GNU/Linux", "OSVersion": "Debian", "RAM": 2048,
//!   "network": true, "uuid": "…", "binary": "qemu-system-x86_64",
//!   "cpu": { "CPUType": "host", "CPUCount": 2, … },
//!   "gpu": { "GPUType": "std", "keyboard": "es" },
//!   "media": [ { "name": "…", "path": "…", "type": "disk", "interface": "ide", "uuid": "…" } ],
//!   "boot": { "bootMenu": false, "kernelBoot": { … }, "bootOrder": [] },
//!   "accelerator": ["kvm"], "audio": ["ac97"] }
//! ```
//!
//! The catalog (`machines.json` in the data directory) lists every known
//! machine as `{ "machines": [ { uuid, name, path, configpath, icon } ] }`.
//!
//! There is no file locking: the application is assumed to be the only
//! writer of both documents.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use super::{BootConfig, CpuConfig, DEFAULT_BINARY, GpuConfig, KernelBoot, MachineConfig, Media, MediaKind, labels};
use crate::error::{ConfigError, StoreError};
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Machine record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MachineRecord {
    name: String,
    #[serde(rename = "OSType", default)]
    os_type: String,
    #[serde(rename = "OSVersion", default)]
    os_version: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "RAM", default)]
    ram: u64,
    #[serde(default)]
    network: bool,
    path: PathBuf,
    uuid: String,
    #[serde(rename = "hostsoundsystem", default)]
    host_sound_system: String,
    #[serde(default = "default_binary")]
    binary: String,
    #[serde(default)]
    cpu: CpuRecord,
    #[serde(default)]
    gpu: GpuRecord,
    #[serde(default)]
    media: Vec<MediaRecord>,
    #[serde(default)]
    boot: BootRecord,
    #[serde(default)]
    accelerator: Vec<String>,
    #[serde(default)]
    audio: Vec<String>,
}

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CpuRecord {
    #[serde(rename = "CPUType")]
    cpu_type: String,
    #[serde(rename = "CPUCount")]
    cpu_count: u32,
    #[serde(rename = "socketCount")]
    socket_count: u32,
    #[serde(rename = "coresSocket")]
    cores_socket: u32,
    #[serde(rename = "threadsCore")]
    threads_core: u32,
    #[serde(rename = "maxHotCPU")]
    max_hot_cpu: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct GpuRecord {
    #[serde(rename = "GPUType")]
    gpu_type: String,
    keyboard: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MediaRecord {
    name: String,
    path: PathBuf,
    #[serde(rename = "type", default)]
    kind: MediaKind,
    #[serde(default)]
    interface: String,
    uuid: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    format: String,
    #[serde(default)]
    cache: String,
    #[serde(default)]
    io: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BootRecord {
    boot_menu: bool,
    kernel_boot: KernelBootRecord,
    boot_order: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct KernelBootRecord {
    enabled: bool,
    kernel_path: String,
    initrd_path: String,
    kernel_args: String,
}

impl From<&MachineConfig> for MachineRecord {
    fn from(config: &MachineConfig) -> Self {
        let cpu = &config.cpu;
        let kernel = &config.boot.kernel_boot;
        Self {
            name: config.name().to_string(),
            os_type: config.os_type.clone(),
            os_version: config.os_version.clone(),
            description: config.description.clone(),
            ram: config.ram_mib(),
            network: config.network,
            path: config.path().to_path_buf(),
            uuid: config.uuid().to_string(),
            host_sound_system: config.host_sound_system.clone(),
            binary: config.binary.clone(),
            cpu: CpuRecord {
                cpu_type: cpu.cpu_type.clone(),
                cpu_count: cpu.cpu_count,
                socket_count: cpu.socket_count,
                cores_socket: cpu.cores_per_socket,
                threads_core: cpu.threads_per_core,
                max_hot_cpu: cpu.max_hotplug_cpus,
            },
            gpu: GpuRecord {
                gpu_type: config.gpu.gpu_type.clone(),
                keyboard: config.gpu.keyboard.clone(),
            },
            media: config
                .media()
                .iter()
                .map(|m| MediaRecord {
                    name: m.name.clone(),
                    path: m.path.clone(),
                    kind: m.kind,
                    interface: m.interface.clone(),
                    uuid: m.uuid().to_string(),
                    size: m.size_bytes,
                    format: m.format.clone(),
                    cache: m.cache.clone(),
                    io: m.io.clone(),
                })
                .collect(),
            boot: BootRecord {
                boot_menu: config.boot.boot_menu,
                kernel_boot: KernelBootRecord {
                    enabled: kernel.enabled,
                    kernel_path: kernel.kernel_path.clone(),
                    initrd_path: kernel.initrd_path.clone(),
                    kernel_args: kernel.kernel_args.clone(),
                },
                boot_order: config.boot.boot_order().to_vec(),
            },
            accelerator: config.accelerators().to_vec(),
            audio: config.audio().to_vec(),
        }
    }
}

impl MachineRecord {
    /// Builds the machine; `config_path` is where the record was read from.
    fn into_config(self, config_path: PathBuf) -> MachineConfig {
        let mut config = MachineConfig::restore(self.name, self.uuid, self.path, config_path);
        config.os_type = self.os_type;
        config.os_version = self.os_version;
        config.description = self.description;
        config.set_ram_mib(self.ram);
        config.network = self.network;
        config.host_sound_system = self.host_sound_system;
        config.binary = self.binary;
        config.cpu = CpuConfig {
            cpu_type: self.cpu.cpu_type,
            cpu_count: self.cpu.cpu_count,
            socket_count: self.cpu.socket_count,
            cores_per_socket: self.cpu.cores_socket,
            threads_per_core: self.cpu.threads_core,
            max_hotplug_cpus: self.cpu.max_hot_cpu,
        };
        config.gpu = GpuConfig {
            gpu_type: self.gpu.gpu_type,
            keyboard: self.gpu.keyboard,
        };
        for m in self.media {
            let mut media = Media::new(m.name, m.path, m.kind).with_uuid(m.uuid);
            media.interface = m.interface;
            media.size_bytes = m.size;
            media.format = m.format;
            media.cache = m.cache;
            media.io = m.io;
            config.add_media(media);
        }

        let mut boot = BootConfig {
            boot_menu: self.boot.boot_menu,
            kernel_boot: KernelBoot {
                enabled: self.boot.kernel_boot.enabled,
                kernel_path: self.boot.kernel_boot.kernel_path,
                initrd_path: self.boot.kernel_boot.initrd_path,
                kernel_args: self.boot.kernel_boot.kernel_args,
            },
            ..BootConfig::default()
        };
        for device in self.boot.boot_order {
            boot.add_boot_device(device);
        }
        config.boot = boot;

        for accelerator in self.accelerator {
            config.add_accelerator(accelerator);
        }
        for card in self.audio {
            config.add_audio(card);
        }
        config
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Summary of one machine in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub uuid: String,
    pub name: String,
    pub path: PathBuf,
    #[serde(rename = "configpath")]
    pub config_path: PathBuf,
    #[serde(default)]
    pub icon: String,
}

impl From<&MachineConfig> for CatalogEntry {
    fn from(config: &MachineConfig) -> Self {
        Self {
            uuid: config.uuid().to_string(),
            name: config.name().to_string(),
            path: config.path().to_path_buf(),
            config_path: config.config_path().to_path_buf(),
            icon: labels::os_icon(&config.os_version),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub machines: Vec<CatalogEntry>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Reads and writes machine records and the catalog.
#[derive(Debug, Clone)]
pub struct MachineStore {
    catalog_path: PathBuf,
}

impl MachineStore {
    pub fn new(catalog_path: impl Into<PathBuf>) -> Self {
        Self {
            catalog_path: catalog_path.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.catalog_path())
    }

    pub fn catalog_path(&self) -> &Path {
        &self.catalog_path
    }

    // --- machine records ---

    /// Writes `config` to its config path, replacing any previous contents.
    pub fn save(&self, config: &MachineConfig) -> Result<(), StoreError> {
        write_json(config.config_path(), &MachineRecord::from(config))?;
        info!(target: "store", machine = %config.name(), path = %config.config_path().display(), "machine saved");
        Ok(())
    }

    /// Reads the machine record at `path`.
    pub fn load(&self, path: &Path) -> Result<MachineConfig, StoreError> {
        let record: MachineRecord = read_json(path)?;
        Ok(record.into_config(path.to_path_buf()))
    }

    // --- catalog ---

    /// Reads the catalog; a missing file is an empty catalog.
    pub fn read_catalog(&self) -> Result<Catalog, StoreError> {
        if !self.catalog_path.exists() {
            return Ok(Catalog::default());
        }
        read_json(&self.catalog_path)
    }

    /// Rewrites the whole catalog document.
    pub fn write_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        write_json(&self.catalog_path, catalog)
    }

    /// Appends a summary of `config` to the catalog. An entry with the same
    /// uuid is replaced in place.
    pub fn append_to_catalog(&self, config: &MachineConfig) -> Result<(), StoreError> {
        let mut catalog = self.read_catalog()?;
        let entry = CatalogEntry::from(config);
        match catalog.machines.iter_mut().find(|m| m.uuid == entry.uuid) {
            Some(existing) => *existing = entry,
            None => catalog.machines.push(entry),
        }
        self.write_catalog(&catalog)
    }

    /// Removes every catalog entry with `uuid`. Returns the removed entry, or
    /// `None` when the machine was not listed.
    pub fn remove_from_catalog(&self, uuid: &str) -> Result<Option<CatalogEntry>, StoreError> {
        let mut catalog = self.read_catalog()?;
        let Some(index) = catalog.machines.iter().position(|m| m.uuid == uuid) else {
            return Ok(None);
        };
        let removed = catalog.machines.remove(index);
        catalog.machines.retain(|m| m.uuid != uuid);
        self.write_catalog(&catalog)?;
        Ok(Some(removed))
    }

    pub fn list(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(self.read_catalog()?.machines)
    }

    pub fn find(&self, uuid: &str) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.list()?.into_iter().find(|m| m.uuid == uuid))
    }

    /// Loads a machine through its catalog entry.
    pub fn load_by_uuid(&self, uuid: &str) -> Result<MachineConfig, StoreError> {
        let entry = self
            .find(uuid)?
            .ok_or_else(|| StoreError::UnknownMachine(uuid.to_string()))?;
        self.load(&entry.config_path)
    }

    // --- lifecycle ---

    /// Creates the machine directory, writes the record and registers the
    /// machine in the catalog.
    ///
    /// Fails without touching anything if the directory already exists. If a
    /// later step fails the directory is removed again, so no half-created
    /// machine is left behind.
    pub fn create(&self, config: &MachineConfig) -> Result<(), StoreError> {
        let dir = config.path();
        if dir.exists() {
            warn!(target: "store", path = %dir.display(), "machine folder already exists");
            return Err(ConfigError::DirectoryExists(dir.to_path_buf()).into());
        }
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::DirectoryUncreatable {
            path: dir.to_path_buf(),
            source,
        })?;

        if let Err(e) = self.save(config).and_then(|()| self.append_to_catalog(config)) {
            warn!(target: "store", machine = %config.name(), error = %e, "machine creation failed, rolling back");
            if let Err(cleanup) = std::fs::remove_dir_all(dir) {
                warn!(target: "store", path = %dir.display(), error = %cleanup, "rollback could not remove folder");
            }
            return Err(e);
        }

        info!(target: "store", machine = %config.name(), uuid = %config.uuid(), "machine created");
        Ok(())
    }

    /// Removes a machine from the catalog and, with `purge_files`, deletes
    /// its directory.
    pub fn delete(&self, uuid: &str, purge_files: bool) -> Result<CatalogEntry, StoreError> {
        let entry = self
            .remove_from_catalog(uuid)?
            .ok_or_else(|| StoreError::UnknownMachine(uuid.to_string()))?;

        if purge_files && entry.path.exists() {
            std::fs::remove_dir_all(&entry.path).map_err(|source| StoreError::Write {
                path: entry.path.clone(),
                source,
            })?;
        }
        info!(target: "store", machine = %entry.name, uuid, purge_files, "machine deleted");
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let json = serde_json::to_vec_pretty(value).map_err(|e| write_err(std::io::Error::other(e)))?;
    std::fs::write(path, json).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> MachineStore {
        MachineStore::new(dir.join("data").join("machines.json"))
    }

    #[test]
    fn record_uses_documented_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MachineConfig::new("keys", tmp.path()).unwrap();
        config.add_accelerator("kvm");
        config.boot.add_boot_device("cdrom");
        config.add_media(Media::new("root", tmp.path().join("root.qcow2"), MediaKind::Disk));

        let json = serde_json::to_value(MachineRecord::from(&config)).unwrap();
        for key in [
            "name", "OSType", "OSVersion", "description", "RAM", "network", "path", "uuid",
            "hostsoundsystem", "binary", "cpu", "gpu", "media", "boot", "accelerator", "audio",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert!(json["cpu"].get("maxHotCPU").is_some());
        assert!(json["gpu"].get("GPUType").is_some());
        assert_eq!(json["media"][0]["type"], "disk");
        assert_eq!(json["boot"]["bootOrder"][0], "cdrom");
        assert!(json["boot"]["kernelBoot"].get("kernelArgs").is_some());
    }

    #[test]
    fn load_of_missing_file_is_a_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = store(tmp.path()).load(&tmp.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, StoreError::Read { .. }));
    }

    #[test]
    fn load_of_garbage_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, b"{ \"name\": ").unwrap();
        let err = store(tmp.path()).load(&path).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn duplicate_entries_in_a_record_are_collapsed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dup.json");
        std::fs::write(
            &path,
            r#"{ "name": "dup", "path": "/vms/dup", "uuid": "u-1",
                 "accelerator": ["kvm", "kvm"], "audio": ["ac97", "hda", "ac97"],
                 "boot": { "bootOrder": ["hdd", "hdd"] } }"#,
        )
        .unwrap();

        let config = store(tmp.path()).load(&path).unwrap();
        assert_eq!(config.accelerators(), ["kvm"]);
        assert_eq!(config.audio(), ["ac97", "hda"]);
        assert_eq!(config.boot.boot_order(), ["hdd"]);
        assert_eq!(config.binary, DEFAULT_BINARY);
        assert_eq!(config.config_path(), path.as_path());
    }

    #[test]
    fn missing_catalog_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(store(tmp.path()).read_catalog().unwrap(), Catalog::default());
    }

    #[test]
    fn catalog_entry_icon_comes_from_os_version() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = MachineConfig::new("icon", tmp.path()).unwrap();
        config.os_version = "Arch Linux".into();
        assert_eq!(CatalogEntry::from(&config).icon, "arch_linux");
    }

    #[test]
    fn appending_a_known_machine_updates_its_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let first = MachineConfig::new("first", tmp.path()).unwrap();
        let mut second = MachineConfig::new("second", tmp.path()).unwrap();
        store.append_to_catalog(&first).unwrap();
        store.append_to_catalog(&second).unwrap();

        second.os_version = "Fedora".into();
        store.append_to_catalog(&second).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].uuid, first.uuid());
        assert_eq!(listed[1].uuid, second.uuid());
        assert_eq!(listed[1].icon, "fedora");
    }

    #[test]
    fn create_refuses_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MachineConfig::new("taken", tmp.path()).unwrap();
        std::fs::create_dir_all(config.path()).unwrap();

        let store = store(tmp.path());
        let err = store.create(&config).unwrap_err();
        assert!(matches!(err, StoreError::Config(ConfigError::DirectoryExists(_))));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn create_rolls_back_directory_when_catalog_write_fails() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the catalog file should be makes the write fail.
        let catalog = tmp.path().join("catalog-is-a-dir");
        std::fs::create_dir_all(&catalog).unwrap();
        let store = MachineStore::new(&catalog);
        let config = MachineConfig::new("rollback", &tmp.path().join("vms")).unwrap();

        assert!(store.create(&config).is_err());
        assert!(!config.path().exists());
    }

    #[test]
    fn delete_removes_entry_and_optionally_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let keep = MachineConfig::new("keep", tmp.path()).unwrap();
        let purge = MachineConfig::new("purge", tmp.path()).unwrap();
        store.create(&keep).unwrap();
        store.create(&purge).unwrap();

        store.delete(keep.uuid(), false).unwrap();
        assert!(keep.path().exists());

        store.delete(purge.uuid(), true).unwrap();
        assert!(!purge.path().exists());

        assert!(store.list().unwrap().is_empty());
        assert!(matches!(
            store.delete(keep.uuid(), false),
            Err(StoreError::UnknownMachine(_))
        ));
    }
}
