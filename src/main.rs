//! machinery: command-line virtual machine manager.
//!
//! Creates, inspects, launches and deletes QEMU machines. `run` keeps the
//! machine attached to the terminal: console output is printed as it
//! arrives, and `stop`, `reset`, `pause` or `status` typed on stdin are
//! forwarded to the supervisor. Closing stdin powers the machine down.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use machinery::host::HostMemory;
use machinery::logging;
use machinery::machine::disk::DiskTool;
use machinery::machine::labels;
use machinery::machine::store::{CatalogEntry, MachineStore};
use machinery::machine::supervisor::{Fleet, MachineState, OutputStream, SupervisorEvent};
use machinery::machine::{MachineConfig, Media, MediaKind, command};
use machinery::paths::AppPaths;
use machinery::settings::Settings;

/// QEMU virtual machine manager
#[derive(Parser, Debug)]
#[command(name = "machinery", version, about = "QEMU virtual machine manager")]
struct Args {
    /// Settings file to use instead of the default location
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List machines in the catalog
    List,
    /// Create a new machine
    Create(CreateArgs),
    /// Show a machine's configuration
    Show {
        /// Machine uuid or name
        machine: String,
    },
    /// Print the emulator command line for a machine
    Command {
        /// Machine uuid or name
        machine: String,
    },
    /// Launch a machine and attach to it
    Run {
        /// Machine uuid or name
        machine: String,
    },
    /// Remove a machine from the catalog
    Delete {
        /// Machine uuid or name
        machine: String,
        /// Also delete the machine folder and its disks
        #[arg(long)]
        purge: bool,
    },
    /// Create a disk image and attach it to a machine
    Disk(DiskArgs),
    /// Print the effective settings
    Settings {
        /// Write the effective settings to the settings file
        #[arg(long)]
        save: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct CreateArgs {
    name: String,
    #[arg(long, default_value = "")]
    os_type: String,
    #[arg(long, default_value = "")]
    os_version: String,
    #[arg(long, default_value = "")]
    description: String,
    /// RAM in MiB (must not exceed host memory)
    #[arg(long)]
    ram: Option<u64>,
    #[arg(long, default_value_t = 1)]
    cpus: u32,
    #[arg(long)]
    cpu_type: Option<String>,
    /// Accelerator codes (kvm, tcg, hax, whpx, hvf)
    #[arg(long = "accel")]
    accelerators: Vec<String>,
    /// Sound card codes; replaces the default card when given
    #[arg(long = "audio")]
    audio: Vec<String>,
    /// Host sound backend exported to the emulator
    #[arg(long)]
    sound_backend: Option<String>,
    #[arg(long)]
    no_network: bool,
    /// Installation image attached as a CD-ROM
    #[arg(long)]
    cdrom: Option<PathBuf>,
    /// Size in GiB of a system disk created with the machine
    #[arg(long)]
    disk_size: Option<f64>,
    #[arg(long, default_value = "qcow2")]
    disk_format: String,
}

#[derive(ClapArgs, Debug)]
struct DiskArgs {
    /// Machine uuid or name
    machine: String,
    /// Disk name
    name: String,
    /// Size in GiB
    #[arg(long)]
    size: f64,
    #[arg(long, default_value = "qcow2")]
    format: String,
    #[arg(long)]
    encrypt: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let app_paths = AppPaths::resolve();
    let _log_guard = logging::init(app_paths.as_ref().map(|paths| paths.logs.as_path()));
    if let Some(paths) = &app_paths {
        if let Err(e) = paths.ensure() {
            warn!(error = %e, "cannot create application directories");
        }
    }

    let settings_path = match (&args.settings, &app_paths) {
        (Some(path), _) => path.clone(),
        (None, Some(paths)) => paths.settings_file(),
        (None, None) => bail!("cannot locate a settings file: HOME is not set; pass --settings"),
    };
    let settings = Settings::load(&settings_path);
    let store = MachineStore::from_settings(&settings);

    match args.command {
        Cmd::List => list(&store),
        Cmd::Create(create_args) => create(&store, &settings, create_args),
        Cmd::Show { machine } => show(&store.load_by_uuid(&resolve(&store, &machine)?.uuid)?),
        Cmd::Command { machine } => {
            let config = store.load_by_uuid(&resolve(&store, &machine)?.uuid)?;
            println!("{}", command::compile(&config).join(" "));
            Ok(())
        }
        Cmd::Run { machine } => {
            let config = store.load_by_uuid(&resolve(&store, &machine)?.uuid)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("create tokio runtime")?;
            runtime.block_on(run_machine(config, settings))
        }
        Cmd::Delete { machine, purge } => {
            let entry = resolve(&store, &machine)?;
            store.delete(&entry.uuid, purge)?;
            println!("deleted {} ({})", entry.name, entry.uuid);
            Ok(())
        }
        Cmd::Disk(disk_args) => add_disk(&store, &settings, disk_args),
        Cmd::Settings { save } => {
            if save {
                settings.save(&settings_path)?;
            }
            print!("{}", toml::to_string_pretty(&settings).context("serialise settings")?);
            Ok(())
        }
    }
}

/// Finds a catalog entry by uuid, falling back to the machine name.
fn resolve(store: &MachineStore, key: &str) -> Result<CatalogEntry> {
    let machines = store.list()?;
    machines
        .iter()
        .find(|m| m.uuid == key)
        .or_else(|| machines.iter().find(|m| m.name == key))
        .cloned()
        .with_context(|| format!("no machine named or identified by `{key}`"))
}

fn list(store: &MachineStore) -> Result<()> {
    let machines = store.list()?;
    if machines.is_empty() {
        println!("no machines in {}", store.catalog_path().display());
    }
    for m in machines {
        println!("{}  {:<20}  {}", m.uuid, m.name, m.path.display());
    }
    Ok(())
}

fn create(store: &MachineStore, settings: &Settings, args: CreateArgs) -> Result<()> {
    let mut config = MachineConfig::new(args.name.clone(), &settings.machine_path)?;
    config.os_type = args.os_type;
    config.os_version = args.os_version;
    config.description = args.description;
    if let Some(ram) = args.ram {
        config.request_ram_mib(ram, &HostMemory::query())?;
    }
    config.cpu.cpu_count = args.cpus;
    if let Some(cpu_type) = args.cpu_type {
        config.cpu.cpu_type = cpu_type;
    }
    for accelerator in args.accelerators {
        config.add_accelerator(accelerator);
    }
    if !args.audio.is_empty() {
        config.clear_audio();
        for card in args.audio {
            config.add_audio(card);
        }
    }
    if let Some(backend) = args.sound_backend {
        config.host_sound_system = backend;
    }
    config.network = !args.no_network;
    if let Some(iso) = args.cdrom {
        config.add_media(Media::new("cdrom", iso, MediaKind::Cdrom));
        config.boot.add_boot_device("cdrom");
    }

    store.create(&config)?;

    if let Some(size) = args.disk_size {
        let disk = DiskTool::for_machine(settings, &config).create_disk(&args.disk_format, &args.name, size, false)?;
        config.add_media(disk);
        config.boot.add_boot_device("hdd");
        store.save(&config)?;
    }

    println!("created {} ({})", config.name(), config.uuid());
    Ok(())
}

fn add_disk(store: &MachineStore, settings: &Settings, args: DiskArgs) -> Result<()> {
    let mut config = store.load_by_uuid(&resolve(store, &args.machine)?.uuid)?;
    let disk = DiskTool::for_machine(settings, &config).create_disk(&args.format, &args.name, args.size, args.encrypt)?;
    let path = disk.path.clone();
    if !config.add_media(disk) {
        warn!(path = %path.display(), "disk already attached");
    }
    store.save(&config)?;
    println!("created {}", path.display());
    Ok(())
}

fn show(config: &MachineConfig) -> Result<()> {
    let accelerators = labels::accelerators();
    let sound_cards = labels::sound_cards();
    let cpu = &config.cpu;

    println!("name:         {}", config.name());
    println!("uuid:         {}", config.uuid());
    println!("path:         {}", config.path().display());
    println!("os:           {} {}", config.os_type, config.os_version);
    if !config.description.is_empty() {
        println!("description:  {}", config.description);
    }
    println!("ram:          {} MiB", config.ram_mib());
    println!(
        "cpu:          {} x{} (sockets {}, cores {}, threads {}, max {})",
        cpu.cpu_type, cpu.cpu_count, cpu.socket_count, cpu.cores_per_socket, cpu.threads_per_core, cpu.max_hotplug_cpus
    );
    println!("gpu:          {} ({})", config.gpu.gpu_type, config.gpu.keyboard);
    println!("accelerators: {}", config.accelerator_label(&accelerators, false));
    println!("audio:        {}", config.audio_label(&sound_cards, false));
    println!("network:      {}", if config.network { "user" } else { "none" });
    for media in config.media() {
        println!("media:        [{}] {} {}", media.kind.as_str(), media.name, media.path.display());
    }
    if !config.boot.boot_order().is_empty() {
        println!("boot order:   {}", config.boot.boot_order().join(", "));
    }
    Ok(())
}

/// What woke the run loop.
enum Step {
    Signal(bool),
    Input(std::io::Result<Option<String>>),
}

async fn run_machine(config: MachineConfig, settings: Settings) -> Result<()> {
    let uuid = config.uuid().to_string();
    run_hook("before_start", &settings.hooks.before_start, &config).await?;

    let mut fleet = Fleet::new();
    let mut events = fleet.supervisor(&config).subscribe();
    fleet.launch(&config, &settings)?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let mut stdout = tokio::io::stdout();

    loop {
        let Some(supervisor) = fleet.get_mut(&uuid) else {
            break;
        };

        let step = tokio::select! {
            alive = supervisor.wait_signal() => Step::Signal(alive),
            line = input.next_line(), if input_open => Step::Input(line),
        };

        match step {
            Step::Signal(false) => break,
            Step::Signal(true) => {}
            Step::Input(Ok(Some(line))) => {
                let result = match line.trim() {
                    "stop" => supervisor.stop().await,
                    "reset" => supervisor.reset().await,
                    "pause" => supervisor.pause().await,
                    "status" => {
                        let since = supervisor
                            .started_at()
                            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                            .unwrap_or_else(|| "-".to_string());
                        eprintln!(
                            "[{}] {:?}, pid {:?}, started {since}",
                            supervisor.machine(),
                            supervisor.state(),
                            supervisor.pid()
                        );
                        Ok(())
                    }
                    "" => Ok(()),
                    other => {
                        eprintln!("unknown command `{other}` (stop, reset, pause, status)");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    eprintln!("{e}");
                }
            }
            Step::Input(end) => {
                if let Err(e) = end {
                    warn!(error = %e, "stdin read failed");
                }
                input_open = false;
                if supervisor.state() != MachineState::Stopped {
                    if let Err(e) = supervisor.stop().await {
                        eprintln!("{e}");
                    }
                }
            }
        }

        while let Ok(event) = events.try_recv() {
            match event {
                SupervisorEvent::StateChanged(state) => eprintln!("[{}] {state:?}", config.name()),
                SupervisorEvent::Output { stream: OutputStream::Stdout, chunk } => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                SupervisorEvent::Output { stream: OutputStream::Stderr, chunk } => {
                    eprint!("{}", String::from_utf8_lossy(&chunk));
                }
                SupervisorEvent::Exited(record) => {
                    eprintln!("[{}] exited: code {:?} ({:?})", config.name(), record.code, record.kind);
                }
            }
        }
    }

    fleet.forget(&uuid);
    run_hook("after_exit", &settings.hooks.after_exit, &config).await
}

/// Runs a user hook command through the shell with the machine's folder as
/// working directory. An empty command is skipped; a failing one aborts.
async fn run_hook(kind: &str, command_line: &str, config: &MachineConfig) -> Result<()> {
    let command_line = command_line.trim();
    if command_line.is_empty() {
        return Ok(());
    }

    let mut hook = if cfg!(windows) {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    } else {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    };
    if config.path().is_dir() {
        hook.current_dir(config.path());
    }

    info!(hook = kind, command = command_line, machine = %config.name(), "running hook");
    let status = hook
        .env("MACHINERY_MACHINE", config.name())
        .env("MACHINERY_UUID", config.uuid())
        .status()
        .await
        .with_context(|| format!("start {kind} hook `{command_line}`"))?;
    if !status.success() {
        bail!("{kind} hook `{command_line}` failed with {status}");
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hooks_run_in_the_machine_folder_with_its_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MachineConfig::new("hooked", tmp.path()).unwrap();
        std::fs::create_dir_all(config.path()).unwrap();

        run_hook(
            "before_start",
            r#"echo "$MACHINERY_MACHINE $MACHINERY_UUID" > hook.out"#,
            &config,
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(config.path().join("hook.out")).unwrap();
        assert_eq!(written.trim(), format!("hooked {}", config.uuid()));
    }

    #[tokio::test]
    async fn empty_hook_is_skipped_and_failing_hook_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MachineConfig::new("hooked", tmp.path()).unwrap();

        run_hook("after_exit", "   ", &config).await.unwrap();
        let err = run_hook("before_start", "exit 3", &config).await.unwrap_err();
        assert!(err.to_string().contains("before_start hook"));
    }
}
