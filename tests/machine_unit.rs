//! Tests for machine definitions, command compilation, persistence and disk
//! creation that need no emulator on the host.
//!
//! Tested in this file:
//! - argument compilation for typical machines (topology, memory, network)
//! - determinism of the compiler
//! - record save/load round trips, including media and boot order
//! - catalog bookkeeping across several machines
//! - disk creation against a missing image tool

use std::path::Path;

use machinery::error::{ConfigError, DiskError, StoreError};
use machinery::host::HostMemory;
use machinery::machine::command::{self, AUDIO_DRIVER_ENV};
use machinery::machine::disk::DiskTool;
use machinery::machine::store::MachineStore;
use machinery::machine::{MachineConfig, Media, MediaKind};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn debian(root: &Path) -> MachineConfig {
    let mut m = MachineConfig::new("debian-test", root).unwrap();
    m.cpu.cpu_count = 2;
    m.cpu.socket_count = 1;
    m.cpu.cores_per_socket = 2;
    m.cpu.threads_per_core = 1;
    m.cpu.max_hotplug_cpus = 2;
    m.request_ram_mib(2048, &HostMemory::from_total_mib(16384)).unwrap();
    m.add_accelerator("kvm");
    m.network = true;
    m
}

/// Value following the first occurrence of `flag`.
fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn contains_pair(args: &[String], first: &str, second: &str) -> bool {
    args.windows(2).any(|w| w[0] == first && w[1] == second)
}

fn store_in(dir: &Path) -> MachineStore {
    MachineStore::new(dir.join(".machinery").join("machines.json"))
}

// ---------------------------------------------------------------------------
// Command compilation
// ---------------------------------------------------------------------------

#[test]
fn typical_machine_compiles_topology_memory_and_network() {
    let m = debian(Path::new("/vms"));
    let args = command::compile(&m);

    assert_eq!(args[..2], ["-monitor", "stdio"]);
    assert_eq!(value_after(&args, "-smp"), Some("2,cores=2,threads=1,sockets=1,maxcpus=2"));
    assert_eq!(value_after(&args, "-m"), Some("2048"));
    assert_eq!(value_after(&args, "-accel"), Some("kvm"));
    assert_eq!(value_after(&args, "-soundhw"), Some("ac97"));
    assert_eq!(value_after(&args, "-pidfile"), Some("/vms/debian-test/debian-test.pid"));

    let nic = args.windows(2).position(|w| w == ["-net", "nic"]).unwrap();
    assert_eq!(args[nic + 2..nic + 4], ["-net", "user"]);
}

#[test]
fn disabled_network_compiles_to_none() {
    let mut m = debian(Path::new("/vms"));
    m.network = false;
    let args = command::compile(&m);

    assert!(contains_pair(&args, "-net", "none"));
    assert!(!contains_pair(&args, "-net", "nic"));
    assert!(!contains_pair(&args, "-net", "user"));
}

#[test]
fn compilation_is_deterministic() {
    let mut m = debian(Path::new("/vms"));
    m.add_media(Media::new("root", "/vms/debian-test/root.qcow2", MediaKind::Disk));
    m.boot.add_boot_device("hdd");
    assert_eq!(command::compile(&m), command::compile(&m));
}

#[test]
fn empty_lists_keep_their_flags() {
    let mut m = debian(Path::new("/vms"));
    m.clear_accelerators();
    m.clear_audio();
    let args = command::compile(&m);
    assert_eq!(value_after(&args, "-accel"), Some(""));
    assert_eq!(value_after(&args, "-soundhw"), Some(""));
}

#[test]
fn host_sound_backend_becomes_environment() {
    let mut m = debian(Path::new("/vms"));
    assert!(command::environment(&m).is_empty());
    m.host_sound_system = "pa".into();
    assert_eq!(
        command::environment(&m),
        vec![(AUDIO_DRIVER_ENV.to_string(), "pa".to_string())]
    );
}

// ---------------------------------------------------------------------------
// Configuration boundaries
// ---------------------------------------------------------------------------

#[test]
fn ram_above_host_memory_is_rejected() {
    let mut m = debian(Path::new("/vms"));
    let err = m
        .request_ram_mib(32768, &HostMemory::from_total_mib(16384))
        .unwrap_err();
    assert!(matches!(err, ConfigError::RamExceedsHost { .. }));
    assert_eq!(m.ram_mib(), 2048);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn save_then_load_reconstructs_the_machine() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());

    let mut m = debian(tmp.path());
    m.description = "test box".into();
    m.os_type = "GNU/Linux".into();
    m.os_version = "Debian".into();
    m.host_sound_system = "alsa".into();
    m.gpu.keyboard = "es".into();
    m.add_audio("hda");
    let mut root = Media::new("root", tmp.path().join("root.qcow2"), MediaKind::Disk);
    root.format = "qcow2".into();
    root.cache = "writeback".into();
    m.add_media(root);
    m.add_media(Media::new("install", tmp.path().join("debian.iso"), MediaKind::Cdrom));
    m.boot.boot_menu = true;
    m.boot.add_boot_device("cdrom");
    m.boot.add_boot_device("hdd");
    m.boot.kernel_boot.kernel_args = "console=ttyS0".into();

    store.create(&m).unwrap();
    let loaded = store.load(m.config_path()).unwrap();

    assert_eq!(loaded, m);
    assert_eq!(command::compile(&loaded), command::compile(&m));
}

#[test]
fn catalog_keeps_every_machine() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());

    let first = debian(tmp.path());
    let mut second = MachineConfig::new("arch", tmp.path()).unwrap();
    second.os_version = "Arch Linux".into();
    store.create(&first).unwrap();
    store.create(&second).unwrap();

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 2);
    for (entry, machine) in listed.iter().zip([&first, &second]) {
        assert_eq!(entry.uuid, machine.uuid());
        assert_eq!(entry.name, machine.name());
        assert_eq!(entry.path, machine.path());
        assert_eq!(entry.config_path, machine.config_path());
    }
    assert_eq!(listed[1].icon, "arch_linux");

    let found = store.load_by_uuid(second.uuid()).unwrap();
    assert_eq!(found.name(), "arch");
    assert!(matches!(
        store.load_by_uuid("no-such-uuid"),
        Err(StoreError::UnknownMachine(_))
    ));
}

#[test]
fn malformed_catalog_is_reported_not_replaced() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());
    std::fs::create_dir_all(store.catalog_path().parent().unwrap()).unwrap();
    std::fs::write(store.catalog_path(), "not json").unwrap();

    let m = debian(tmp.path());
    assert!(matches!(store.create(&m), Err(StoreError::Malformed { .. })));
    assert!(!m.path().exists());
    assert_eq!(std::fs::read_to_string(store.catalog_path()).unwrap(), "not json");
}

// ---------------------------------------------------------------------------
// Disk creation
// ---------------------------------------------------------------------------

#[test]
fn missing_image_tool_is_reported_as_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let tool = DiskTool::new("no-such-qemu-img", tmp.path());

    let err = tool.create_disk("qcow2", "disk1", 10.0, false).unwrap_err();
    assert!(matches!(err, DiskError::ToolNotFound(_)));
}
