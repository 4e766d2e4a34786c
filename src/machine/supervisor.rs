//! Emulator process supervision.
//!
//! A [`Supervisor`] owns at most one emulator process for one machine. It
//! launches the process with the compiled argument list, forwards control
//! commands over the process's stdin (the emulator monitor runs on `stdio`),
//! drains stdout/stderr, and tracks the lifecycle with a small state machine:
//!
//! ```text
//!                 run()
//!   Stopped ───────────────► Starting
//!      ▲                        │ process spawned
//!      │ stop() / exit          ▼
//!      ├──────────────────── Started ◄──┐
//!      │                        │ pause │ pause
//!      │                        ▼       │
//!      └──────────────────── Paused ────┘
//! ```
//!
//! `stop()` and `pause()` flip the state optimistically: the emulator never
//! confirms them. The real process exit arrives later as an `Exited` event
//! and always leaves the machine `Stopped`.
//!
//! Process I/O is gathered by background tasks into a per-process signal
//! queue. Nothing changes until the owner calls [`Supervisor::poll`] (once
//! per frame) or awaits [`Supervisor::wait_signal`]; all state changes and
//! observer notifications therefore happen on the owner's task, in the
//! order the process produced them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use statig::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MachineConfig, command, platform};
use crate::error::{ControlError, LaunchError};
use crate::settings::Settings;

// ---------------------------------------------------------------------------
// Control channel commands
// ---------------------------------------------------------------------------

pub const CMD_POWERDOWN: &str = "system_powerdown";
pub const CMD_RESET: &str = "system_reset";
pub const CMD_STOP: &str = "stop";
pub const CMD_CONT: &str = "cont";

/// Console bytes kept per stream for inspection.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;
const READ_CHUNK_BYTES: usize = 4096;
/// How long the exit watcher waits for the output readers to hit EOF.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public event types
// ---------------------------------------------------------------------------

/// Lifecycle state reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Stopped,
    Starting,
    Started,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// The process exited by itself with an exit code.
    Normal,
    /// The process was killed by a signal or its status could not be read.
    Crashed,
}

/// Recorded termination of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub kind: ExitKind,
    pub at: DateTime<Utc>,
}

impl ExitRecord {
    fn from_status(status: ExitStatus) -> Self {
        let code = status.code();
        Self {
            code,
            kind: if code.is_some() { ExitKind::Normal } else { ExitKind::Crashed },
            at: Utc::now(),
        }
    }

    fn lost() -> Self {
        Self {
            code: None,
            kind: ExitKind::Crashed,
            at: Utc::now(),
        }
    }

    /// `true` for a normal exit with code 0.
    pub fn is_clean(&self) -> bool {
        self.kind == ExitKind::Normal && self.code == Some(0)
    }
}

/// Notification delivered to every subscribed observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged(MachineState),
    /// Raw console bytes; not aligned to lines.
    Output { stream: OutputStream, chunk: Vec<u8> },
    Exited(ExitRecord),
}

// ---------------------------------------------------------------------------
// Lifecycle state machine
// ---------------------------------------------------------------------------

/// Events dispatched to the lifecycle state machine.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Launch,
    StartConfirmed,
    Pause,
    Resume,
    PowerDown,
    Reset,
    Exited,
}

/// Shared storage for the lifecycle state machine.
pub struct Lifecycle {
    machine: String,
}

impl Lifecycle {
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
        }
    }

    pub fn machine_state(state: &State) -> MachineState {
        match state {
            State::Stopped {} => MachineState::Stopped,
            State::Starting {} => MachineState::Starting,
            State::Started {} => MachineState::Started,
            State::Paused {} => MachineState::Paused,
        }
    }
}

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq))
)]
impl Lifecycle {
    /// No process. Only a launch leaves this state.
    #[state]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Launch => Transition(State::starting()),
            _ => Handled,
        }
    }

    /// Parent of every state with a live process; power-down and exit both
    /// end in `Stopped`.
    #[superstate]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::PowerDown | LifecycleEvent::Exited => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state(superstate = "running")]
    fn starting(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StartConfirmed => Transition(State::started()),
            _ => Super,
        }
    }

    #[state(superstate = "running")]
    fn started(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Pause => Transition(State::paused()),
            LifecycleEvent::Reset => {
                debug!(target: "supervisor", machine = %self.machine, "reset keeps machine started");
                Handled
            }
            _ => Super,
        }
    }

    #[state(superstate = "running")]
    fn paused(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Resume => Transition(State::started()),
            _ => Super,
        }
    }
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

/// Signals produced by the background I/O tasks of one process.
#[derive(Debug)]
enum ProcessSignal {
    Started,
    Output { stream: OutputStream, chunk: Vec<u8> },
    Exited(ExitRecord),
}

/// Last `OUTPUT_TAIL_BYTES` of one output stream.
#[derive(Debug, Default)]
struct OutputTail {
    bytes: VecDeque<u8>,
}

impl OutputTail {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend(chunk);
        let overflow = self.bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
        self.bytes.drain(..overflow);
    }

    fn contents(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }
}

/// One live emulator process. Dropped once its exit has been observed.
struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    signals: mpsc::UnboundedReceiver<ProcessSignal>,
    stdout_tail: OutputTail,
    stderr_tail: OutputTail,
    started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Supervises the emulator process of one machine.
///
/// Dropping a supervisor does not stop its process; call `stop()` first.
pub struct Supervisor {
    machine: String,
    lifecycle: StateMachine<Lifecycle>,
    handle: Option<ProcessHandle>,
    last_exit: Option<ExitRecord>,
    observers: Vec<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl Supervisor {
    pub fn new(machine: impl Into<String>) -> Self {
        let machine = machine.into();
        Self {
            lifecycle: Lifecycle::new(machine.clone()).state_machine(),
            machine,
            handle: None,
            last_exit: None,
            observers: Vec::new(),
        }
    }

    /// Registers an observer. Events are delivered in the order they occur.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SupervisorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn state(&self) -> MachineState {
        Lifecycle::machine_state(self.lifecycle.state())
    }

    /// `true` while a process exists that has not yet been reaped. This can
    /// differ from `state()` right after an optimistic `stop()`.
    pub fn has_process(&self) -> bool {
        self.handle.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.handle.as_ref().map(|h| h.started_at)
    }

    /// Exit record of the most recent run, if any run has ended.
    pub fn last_exit(&self) -> Option<&ExitRecord> {
        self.last_exit.as_ref()
    }

    /// Buffered tail of the current process's output.
    pub fn output_tail(&self, stream: OutputStream) -> Option<Vec<u8>> {
        self.handle.as_ref().map(|h| match stream {
            OutputStream::Stdout => h.stdout_tail.contents(),
            OutputStream::Stderr => h.stderr_tail.contents(),
        })
    }

    /// Compiles `config`, resolves the emulator binary and launches it.
    ///
    /// Must be called from within a tokio runtime. On failure nothing is
    /// started and the supervisor stays `Stopped`.
    pub fn run(&mut self, config: &MachineConfig, settings: &Settings) -> Result<(), LaunchError> {
        if self.handle.is_some() || self.state() != MachineState::Stopped {
            return Err(LaunchError::AlreadyRunning(self.machine.clone()));
        }

        let binary = platform::resolve_emulator(settings)?;
        let args = command::compile(config);
        debug!(target: "supervisor", machine = %self.machine, ?args, "emulator command");

        let mut child = Command::new(&binary)
            .args(&args)
            .envs(command::environment(config))
            .current_dir(existing_dir(config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                warn!(target: "supervisor", machine = %self.machine, error = %source, "emulator failed to start");
                LaunchError::Spawn {
                    binary: binary.clone(),
                    source,
                }
            })?;

        let pid = child.id();
        info!(
            target: "supervisor",
            machine = %self.machine,
            binary = %binary.display(),
            pid,
            "machine launched"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        // The spawn returning is the OS start confirmation.
        let _ = tx.send(ProcessSignal::Started);

        let stdin = child.stdin.take();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(stdout, OutputStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(stderr, OutputStream::Stderr, tx.clone())));
        }
        tokio::spawn(watch_exit(child, readers, tx));

        self.handle = Some(ProcessHandle {
            pid,
            stdin,
            signals: rx,
            stdout_tail: OutputTail::default(),
            stderr_tail: OutputTail::default(),
            started_at: Utc::now(),
        });
        self.dispatch(LifecycleEvent::Launch);
        Ok(())
    }

    /// Requests a graceful power-down and marks the machine `Stopped`
    /// without waiting for the process. No-op once the machine is
    /// `Stopped`, including while a stopped process is still shutting down.
    pub async fn stop(&mut self) -> Result<(), ControlError> {
        if self.handle.is_none() || self.state() == MachineState::Stopped {
            return Ok(());
        }
        match self.send_command(CMD_POWERDOWN).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(target: "supervisor", machine = %self.machine, "process already gone, stop treated as clean");
            }
            Err(source) => {
                return Err(ControlError {
                    command: CMD_POWERDOWN,
                    source,
                });
            }
        }
        info!(target: "supervisor", machine = %self.machine, "machine stop requested");
        self.dispatch(LifecycleEvent::PowerDown);
        Ok(())
    }

    /// Sends a system reset. The state does not change. No-op unless the
    /// machine is `Started`.
    pub async fn reset(&mut self) -> Result<(), ControlError> {
        if self.handle.is_none() || self.state() != MachineState::Started {
            return Ok(());
        }
        self.send_command(CMD_RESET)
            .await
            .map_err(|source| ControlError {
                command: CMD_RESET,
                source,
            })?;
        info!(target: "supervisor", machine = %self.machine, "machine reset");
        self.dispatch(LifecycleEvent::Reset);
        Ok(())
    }

    /// Toggles between `Started` and `Paused`. No-op in any other state.
    pub async fn pause(&mut self) -> Result<(), ControlError> {
        let (command, event) = match self.state() {
            MachineState::Started => (CMD_STOP, LifecycleEvent::Pause),
            MachineState::Paused => (CMD_CONT, LifecycleEvent::Resume),
            MachineState::Stopped | MachineState::Starting => return Ok(()),
        };
        self.send_command(command)
            .await
            .map_err(|source| ControlError { command, source })?;
        info!(target: "supervisor", machine = %self.machine, command, "machine pause toggled");
        self.dispatch(event);
        Ok(())
    }

    /// Applies every signal already queued by the process without waiting.
    /// Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(signal) = self.try_next_signal() {
            self.apply(signal);
            applied += 1;
        }
        applied
    }

    /// Waits for the next process signal and applies it. Returns `false`
    /// immediately when there is no process. Cancel-safe.
    pub async fn wait_signal(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        let signal = handle
            .signals
            .recv()
            .await
            .unwrap_or_else(|| ProcessSignal::Exited(ExitRecord::lost()));
        self.apply(signal);
        true
    }

    /// Applies signals until the current process has been reaped.
    pub async fn wait_exit(&mut self) -> Option<&ExitRecord> {
        while self.wait_signal().await {}
        self.last_exit.as_ref()
    }

    fn try_next_signal(&mut self) -> Option<ProcessSignal> {
        let handle = self.handle.as_mut()?;
        match handle.signals.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ProcessSignal::Exited(ExitRecord::lost())),
        }
    }

    fn apply(&mut self, signal: ProcessSignal) {
        match signal {
            ProcessSignal::Started => {
                debug!(target: "supervisor", machine = %self.machine, "start confirmed");
                self.dispatch(LifecycleEvent::StartConfirmed);
            }
            ProcessSignal::Output { stream, chunk } => {
                debug!(
                    target: "supervisor",
                    machine = %self.machine,
                    ?stream,
                    text = %String::from_utf8_lossy(&chunk),
                    "console output"
                );
                if let Some(handle) = self.handle.as_mut() {
                    match stream {
                        OutputStream::Stdout => handle.stdout_tail.push(&chunk),
                        OutputStream::Stderr => handle.stderr_tail.push(&chunk),
                    }
                }
                self.broadcast(SupervisorEvent::Output { stream, chunk });
            }
            ProcessSignal::Exited(record) => {
                info!(
                    target: "supervisor",
                    machine = %self.machine,
                    exit_code = ?record.code,
                    exit_kind = ?record.kind,
                    "machine process exited"
                );
                self.handle = None;
                self.last_exit = Some(record.clone());
                self.dispatch(LifecycleEvent::Exited);
                self.broadcast(SupervisorEvent::Exited(record));
            }
        }
    }

    async fn send_command(&mut self, command: &str) -> std::io::Result<()> {
        let stdin = self
            .handle
            .as_mut()
            .and_then(|h| h.stdin.as_mut())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "control channel closed"))?;
        stdin.write_all(format!("{command}\n").as_bytes()).await?;
        stdin.flush().await
    }

    fn dispatch(&mut self, event: LifecycleEvent) {
        let before = self.state();
        self.lifecycle.handle(&event);
        let after = self.state();
        if before != after {
            debug!(target: "supervisor", machine = %self.machine, ?before, ?after, "state changed");
            self.broadcast(SupervisorEvent::StateChanged(after));
        }
    }

    /// Delivers `event` to every observer, dropping those that went away.
    fn broadcast(&mut self, event: SupervisorEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Machine directory when it exists, else the current directory.
fn existing_dir(config: &MachineConfig) -> PathBuf {
    if config.path().is_dir() {
        config.path().to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

// ---------------------------------------------------------------------------
// Background I/O tasks
// ---------------------------------------------------------------------------

async fn pump_output<R>(mut reader: R, stream: OutputStream, signals: mpsc::UnboundedSender<ProcessSignal>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if signals.send(ProcessSignal::Output { stream, chunk }).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(target: "supervisor", ?stream, error = %e, "output read failed");
                break;
            }
        }
    }
}

/// Waits for the process, lets the readers flush, then reports the exit so
/// that it is always the last signal of a run.
async fn watch_exit(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    signals: mpsc::UnboundedSender<ProcessSignal>,
) {
    let record = match child.wait().await {
        Ok(status) => ExitRecord::from_status(status),
        Err(e) => {
            warn!(target: "supervisor", error = %e, "cannot read emulator exit status");
            ExitRecord::lost()
        }
    };
    for reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            warn!(target: "supervisor", "output reader still open after exit");
        }
    }
    let _ = signals.send(ProcessSignal::Exited(record));
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

/// One supervisor per machine uuid. Guarantees a machine never has two
/// processes at once.
#[derive(Default)]
pub struct Fleet {
    supervisors: HashMap<String, Supervisor>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supervisor for `config`, created on first use.
    pub fn supervisor(&mut self, config: &MachineConfig) -> &mut Supervisor {
        self.supervisors
            .entry(config.uuid().to_string())
            .or_insert_with(|| Supervisor::new(config.name()))
    }

    pub fn get(&self, uuid: &str) -> Option<&Supervisor> {
        self.supervisors.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &str) -> Option<&mut Supervisor> {
        self.supervisors.get_mut(uuid)
    }

    /// Launches `config` unless its machine already has a process.
    pub fn launch(&mut self, config: &MachineConfig, settings: &Settings) -> Result<&mut Supervisor, LaunchError> {
        let supervisor = self.supervisor(config);
        supervisor.run(config, settings)?;
        Ok(supervisor)
    }

    /// Polls every supervisor; returns the total number of applied signals.
    pub fn poll_all(&mut self) -> usize {
        self.supervisors.values_mut().map(Supervisor::poll).sum()
    }

    /// Uuids of machines that currently own a process.
    pub fn running(&self) -> impl Iterator<Item = &str> {
        self.supervisors
            .iter()
            .filter(|(_, s)| s.has_process())
            .map(|(uuid, _)| uuid.as_str())
    }

    /// Removes the supervisor of `uuid` if it has no process left.
    pub fn forget(&mut self, uuid: &str) -> Option<Supervisor> {
        if self.supervisors.get(uuid)?.has_process() {
            return None;
        }
        self.supervisors.remove(uuid)
    }
}
