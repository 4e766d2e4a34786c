//! Compiles a [`MachineConfig`] into an emulator argument list.
//!
//! Compilation is pure: no I/O, no clock, no randomness. The same machine
//! state always yields the same tokens, in this fixed order:
//!
//! ```text
//! -monitor stdio  -name  -uuid  -accel  -soundhw  -m  -k  -vga  -cpu  -smp
//! -pidfile  -net ...  -drive ... (per media)  -boot  -kernel/-initrd/-append
//! ```
//!
//! Empty accelerator and audio lists still produce their flag followed by an
//! empty string argument.

use super::{MachineConfig, Media, MediaKind};

/// Environment variable selecting the emulator's host audio driver.
pub const AUDIO_DRIVER_ENV: &str = "QEMU_AUDIO_DRV";

/// Builds the emulator argument list for `config`.
pub fn compile(config: &MachineConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(32);
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    // Control channel on the process's stdin/stdout.
    push("-monitor", "stdio".to_string());

    push("-name", config.name().to_string());
    push("-uuid", config.uuid().replace(['{', '}'], ""));

    push("-accel", config.accelerators().join(","));
    push("-soundhw", config.audio().join(","));

    push("-m", config.ram_mib().to_string());
    push("-k", config.gpu.keyboard.clone());
    push("-vga", config.gpu.gpu_type.clone());

    push("-cpu", config.cpu.cpu_type.clone());
    push("-smp", smp_topology(config));

    push("-pidfile", config.pid_file().display().to_string());

    if config.network {
        push("-net", "nic".to_string());
        push("-net", "user".to_string());
    } else {
        push("-net", "none".to_string());
    }

    for (index, media) in config.media().iter().enumerate() {
        push("-drive", drive_spec(index, media));
    }

    if let Some(boot) = boot_spec(config) {
        push("-boot", boot);
    }

    let kernel = &config.boot.kernel_boot;
    if kernel.enabled {
        push("-kernel", kernel.kernel_path.clone());
        if !kernel.initrd_path.is_empty() {
            push("-initrd", kernel.initrd_path.clone());
        }
        if !kernel.kernel_args.is_empty() {
            push("-append", kernel.kernel_args.clone());
        }
    }

    args
}

/// Extra environment for the emulator process.
pub fn environment(config: &MachineConfig) -> Vec<(String, String)> {
    if config.host_sound_system.is_empty() {
        return Vec::new();
    }
    vec![(AUDIO_DRIVER_ENV.to_string(), config.host_sound_system.clone())]
}

/// `<count>,cores=<n>,threads=<n>,sockets=<n>,maxcpus=<n>`
fn smp_topology(config: &MachineConfig) -> String {
    let cpu = &config.cpu;
    format!(
        "{},cores={},threads={},sockets={},maxcpus={}",
        cpu.cpu_count,
        cpu.cores_per_socket,
        cpu.threads_per_core,
        cpu.socket_count,
        cpu.max_hotplug_cpus
    )
}

fn drive_spec(index: usize, media: &Media) -> String {
    let mut spec = format!("file={},index={}", media.path.display(), index);

    match media.kind {
        MediaKind::Floppy => spec.push_str(",if=floppy"),
        kind => {
            spec.push_str(",media=");
            spec.push_str(kind.as_str());
            if !media.interface.is_empty() {
                spec.push_str(",if=");
                spec.push_str(&media.interface);
            }
        }
    }

    for (key, value) in [("format", &media.format), ("cache", &media.cache), ("aio", &media.io)] {
        if !value.is_empty() {
            spec.push_str(&format!(",{key}={value}"));
        }
    }

    spec
}

fn boot_spec(config: &MachineConfig) -> Option<String> {
    let boot = &config.boot;
    let order: String = boot
        .boot_order()
        .iter()
        .filter_map(|device| boot_letter(device))
        .collect();

    if !boot.boot_menu && order.is_empty() {
        return None;
    }

    let mut spec = format!("menu={}", if boot.boot_menu { "on" } else { "off" });
    if !order.is_empty() {
        spec.push_str(",order=");
        spec.push_str(&order);
    }
    Some(spec)
}

fn boot_letter(device: &str) -> Option<char> {
    match device.to_ascii_lowercase().as_str() {
        "floppy" => Some('a'),
        "hdd" | "disk" => Some('c'),
        "cdrom" => Some('d'),
        "network" => Some('n'),
        _ => None,
    }
}
