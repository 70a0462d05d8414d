//! Lifecycle supervision of a single game server process.
//!
//! A [`Supervisor`] owns the server's working directory, its child process, the output
//! monitor and the command transport. Startup runs on a background thread; its outcome
//! and everything the server prints is published as [`SupervisorEvent`]s.
use std::{
    fs,
    io::{BufRead, BufReader, Read},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, ExitStatus},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        mpsc::{self, Receiver, Sender},
    },
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ServerConfig, normalize},
    constants::{
        ADMIN_LISTEN_ADDRESS, BIND_FAILURE_MARKER, EXIT_POLL_INTERVAL, LOG_FILE,
        SPAWN_CONFIRMATION, STREAM_EXIT_GRACE,
    },
    error::{SupervisorError, TransportError},
    monitor::{LogMonitor, MonitorEvent, MonitorSink, ensure_log_file},
    rcon::UdpRconConnector,
    registry::SupervisorRegistry,
    spawn::{CompatShim, SpawnOptions, WineShim, needs_shim, spawn_native, terminate},
    transport::{
        AdminConnection, AdminConnector, AdminEvent, AdminSink, AdminTarget, CommandTransport,
        Delivery, TransportKind,
    },
};

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7777;

/// Where a supervisor is in its start/stop cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Lifecycle {
    /// Nothing is running.
    Idle,
    /// A start was requested and has not been confirmed yet.
    Starting,
    /// The server process is up.
    Started,
    /// A stop is tearing the process down.
    Stopping,
}

impl Lifecycle {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Idle | Stopping, Starting)
                | (Starting, Started)
                | (Idle | Starting | Started, Stopping)
                | (Stopping, Idle)
        )
    }

    /// True while a run is in progress.
    pub fn is_active(self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Started)
    }
}

/// How the supervisor talks to the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum IoMode {
    /// Stdio is piped: output is followed on stdout and commands are written to stdin.
    Console,
    /// Stdio is discarded: output is tailed from the log file and commands go over RCON.
    LogFile,
}

impl IoMode {
    /// The mode the server binary uses natively on this host.
    pub fn host() -> Self {
        if cfg!(windows) {
            IoMode::Console
        } else {
            IoMode::LogFile
        }
    }

    fn transport_kind(self) -> TransportKind {
        match self {
            IoMode::Console => TransportKind::Stream,
            IoMode::LogFile => TransportKind::Admin,
        }
    }
}

/// Notification published to subscribers.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// One line of server output.
    Output(String),
    /// The server survived its spawn confirmation window.
    Started {
        /// PID of the server process.
        pid: u32,
    },
    /// A startup or runtime failure.
    Error(Arc<SupervisorError>),
    /// A stop completed.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum StartupStep {
    InitShim,
    ReadConfig,
    TouchLog,
    TailLog,
}

enum Abort {
    Failed(SupervisorError),
    Superseded,
}

/// Construction options for a [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorOptions {
    binary: PathBuf,
    cwd: Option<PathBuf>,
    ephemeral: bool,
    io_mode: IoMode,
    shim: Option<Arc<dyn CompatShim>>,
    connector: Arc<dyn AdminConnector>,
    registry: Arc<SupervisorRegistry>,
    spawn_confirmation: Duration,
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("binary", &self.binary)
            .field("cwd", &self.cwd)
            .field("ephemeral", &self.ephemeral)
            .field("io_mode", &self.io_mode)
            .field("shim", &self.shim.is_some())
            .field("spawn_confirmation", &self.spawn_confirmation)
            .finish()
    }
}

impl SupervisorOptions {
    /// Options for `binary` with host defaults: working directory next to the binary,
    /// the host I/O mode, the wine shim when the binary needs one, RCON over UDP and
    /// the process-wide registry.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let shim = needs_shim(&binary).then(|| WineShim::shared() as Arc<dyn CompatShim>);
        Self {
            binary,
            cwd: None,
            ephemeral: false,
            io_mode: IoMode::host(),
            shim,
            connector: Arc::new(UdpRconConnector),
            registry: SupervisorRegistry::global(),
            spawn_confirmation: SPAWN_CONFIRMATION,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Deletes the working directory on every stop and once the supervisor is dropped.
    pub fn ephemeral(mut self, ephemeral: bool) -> Self {
        self.ephemeral = ephemeral;
        self
    }

    pub fn io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    /// Overrides the compatibility shim. `None` launches the binary directly.
    pub fn shim(mut self, shim: Option<Arc<dyn CompatShim>>) -> Self {
        self.shim = shim;
        self
    }

    pub fn admin_connector(mut self, connector: Arc<dyn AdminConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn registry(mut self, registry: Arc<SupervisorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// How long a fresh process must stay alive before it counts as started.
    pub fn spawn_confirmation(mut self, window: Duration) -> Self {
        self.spawn_confirmation = window;
        self
    }
}

struct Core {
    lifecycle: Lifecycle,
    /// Bumped on every start and stop; deferred work from an older run is dropped.
    run: u64,
    child: Option<Child>,
    monitor: Option<LogMonitor>,
    transport: CommandTransport,
    cfg: Option<ServerConfig>,
}

impl Core {
    fn transition(&mut self, next: Lifecycle) -> bool {
        if self.lifecycle.can_transition_to(next) {
            debug!("Lifecycle {} -> {next}", self.lifecycle);
            self.lifecycle = next;
            true
        } else {
            debug!("Rejected lifecycle transition {} -> {next}", self.lifecycle);
            false
        }
    }

    fn is_starting(&self, run: u64) -> bool {
        self.run == run && self.lifecycle == Lifecycle::Starting
    }

    fn is_live(&self, run: u64) -> bool {
        self.run == run && self.lifecycle.is_active()
    }

    fn begin_stop(&mut self) -> Option<StopWork> {
        if self.lifecycle == Lifecycle::Stopping {
            debug!("Stop already in progress");
            return None;
        }

        self.transition(Lifecycle::Stopping);
        self.run += 1;
        self.transport.detach();
        Some(StopWork {
            run: self.run,
            child: self.child.take(),
            monitor: self.monitor.take(),
        })
    }
}

struct StopWork {
    run: u64,
    child: Option<Child>,
    monitor: Option<LogMonitor>,
}

struct Inner {
    binary: PathBuf,
    cwd: PathBuf,
    ephemeral: bool,
    io_mode: IoMode,
    shim: Option<Arc<dyn CompatShim>>,
    connector: Arc<dyn AdminConnector>,
    registry: Arc<SupervisorRegistry>,
    spawn_confirmation: Duration,
    core: Mutex<Core>,
    observers: Mutex<Vec<Sender<SupervisorEvent>>>,
}

/// Kills a still-running server once the last handle is gone.
impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        core.transport.detach();
        if let Some(monitor) = core.monitor.take() {
            monitor.close();
        }
        if let Some(child) = core.child.take() {
            info!(
                "Supervisor for {:?} dropped; killing server process {}",
                self.cwd,
                child.id()
            );
            terminate(child, Signal::SIGKILL);
        }

        if self.ephemeral
            && self.cwd.exists()
            && let Err(err) = fs::remove_dir_all(&self.cwd)
        {
            debug!("Ignoring failure to remove workspace {:?}: {err}", self.cwd);
        }
    }
}

/// Handle to a supervised server. Clones share the same server.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("binary", &self.inner.binary)
            .field("cwd", &self.inner.cwd)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

/// Non-owning reference used by the registry.
#[derive(Clone)]
pub(crate) struct WeakSupervisor(Weak<Inner>);

impl WeakSupervisor {
    pub(crate) fn upgrade(&self) -> Option<Supervisor> {
        self.0.upgrade().map(|inner| Supervisor { inner })
    }

    pub(crate) fn points_to(&self, supervisor: &Supervisor) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&supervisor.inner))
    }
}

impl Supervisor {
    /// Creates an idle supervisor. Nothing touches the disk until [`Supervisor::start`].
    pub fn new(options: SupervisorOptions) -> Self {
        let binary = absolute(&options.binary);
        let cwd = match &options.cwd {
            Some(dir) => absolute(dir),
            None => binary
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/")),
        };

        let core = Core {
            lifecycle: Lifecycle::Idle,
            run: 0,
            child: None,
            monitor: None,
            transport: CommandTransport::new(options.io_mode.transport_kind()),
            cfg: None,
        };

        Self {
            inner: Arc::new(Inner {
                binary,
                cwd,
                ephemeral: options.ephemeral,
                io_mode: options.io_mode,
                shim: options.shim,
                connector: options.connector,
                registry: options.registry,
                spawn_confirmation: options.spawn_confirmation,
                core: Mutex::new(core),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.inner.binary
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.ephemeral
    }

    pub fn io_mode(&self) -> IoMode {
        self.inner.io_mode
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core().lifecycle
    }

    /// True while starting or started.
    pub fn is_running(&self) -> bool {
        self.lifecycle().is_active()
    }

    /// PID of the current server process.
    pub fn pid(&self) -> Option<u32> {
        self.core().child.as_ref().map(Child::id)
    }

    /// Config loaded by the current run.
    pub fn config(&self) -> Option<ServerConfig> {
        self.core().cfg.clone()
    }

    /// Commands still waiting for the transport, oldest first.
    pub fn pending_commands(&self) -> Vec<String> {
        self.core().transport.pending().to_vec()
    }

    /// Whether an output monitor is attached to the current run.
    pub fn is_monitoring(&self) -> bool {
        self.core().monitor.as_ref().is_some_and(LogMonitor::is_open)
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> Receiver<SupervisorEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Sends an administrative command, queueing it while the transport is not ready.
    pub fn send_command(&self, command: &str) -> Result<Delivery, TransportError> {
        self.core().transport.send(command)
    }

    /// Starts the server. A run already in progress is killed first.
    ///
    /// Returns immediately; the outcome is published as events.
    pub fn start(&self) -> &Self {
        let busy = {
            let core = self.core();
            core.child.is_some() || core.lifecycle.is_active()
        };
        if busy {
            info!("Restarting server in {:?}", self.inner.cwd);
            self.stop_with(Signal::SIGKILL, true);
        }

        let run = {
            let mut core = self.core();
            if !core.transition(Lifecycle::Starting) {
                warn!(
                    "Ignoring start of {:?} while {}",
                    self.inner.cwd, core.lifecycle
                );
                return self;
            }
            core.run += 1;
            core.cfg = None;
            core.run
        };

        self.inner.registry.register(self);
        info!(
            "Starting server {:?} in {:?} ({} mode)",
            self.inner.binary, self.inner.cwd, self.inner.io_mode
        );

        let supervisor = self.clone();
        let spawned = thread::Builder::new()
            .name("sampd-start".into())
            .spawn(move || supervisor.run_startup(run));
        if let Err(source) = spawned {
            self.abort_run(
                run,
                SupervisorError::Spawn {
                    binary: self.inner.binary.clone(),
                    source,
                },
            );
        }
        self
    }

    /// Stops with SIGTERM, cleaning up the workspace in the background.
    pub fn stop(&self) {
        self.stop_with(Signal::SIGTERM, false);
    }

    /// Stops with `signal` and returns only once the stop has completed.
    pub fn stop_sync(&self, signal: Signal) {
        self.stop_with(signal, true);
    }

    /// Stops the server with `signal`.
    ///
    /// Does nothing while another stop is in progress. Otherwise a `Stopped` event is
    /// published once done, even if nothing was running. With `synchronous` set, an
    /// ephemeral workspace is deleted before this returns and deletion errors are
    /// ignored.
    pub fn stop_with(&self, signal: Signal, synchronous: bool) {
        let work = self.core().begin_stop();
        if let Some(work) = work {
            self.complete_stop(work, signal, synchronous);
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSupervisor {
        WeakSupervisor(Arc::downgrade(&self.inner))
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SupervisorEvent) {
        match &event {
            SupervisorEvent::Output(line) => debug!("[server] {line}"),
            SupervisorEvent::Started { pid } => info!("Server {pid} started"),
            SupervisorEvent::Error(err) => error!("Server in {:?}: {err}", self.inner.cwd),
            SupervisorEvent::Stopped => info!("Server in {:?} stopped", self.inner.cwd),
        }

        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn log_path(&self) -> PathBuf {
        self.inner.cwd.join(LOG_FILE)
    }

    fn startup_steps(&self) -> Vec<StartupStep> {
        let mut steps = vec![StartupStep::ReadConfig];
        if self.inner.io_mode == IoMode::LogFile {
            steps.extend([StartupStep::TouchLog, StartupStep::TailLog]);
        }
        if let Some(shim) = &self.inner.shim
            && !shim.is_initialized()
        {
            steps.insert(0, StartupStep::InitShim);
        }
        steps
    }

    fn run_startup(&self, run: u64) {
        let result = self.startup_steps().into_iter().try_for_each(|step| {
            debug!("Startup step {step} for run {run}");
            self.run_step(run, step)
        });

        match result {
            Ok(()) => self.launch(run),
            Err(Abort::Superseded) => debug!("Startup run {run} was superseded"),
            Err(Abort::Failed(err)) => self.abort_run(run, err),
        }
    }

    fn run_step(&self, run: u64, step: StartupStep) -> Result<(), Abort> {
        if !self.core().is_starting(run) {
            return Err(Abort::Superseded);
        }

        match step {
            StartupStep::InitShim => {
                if let Some(shim) = &self.inner.shim
                    && !shim.is_initialized()
                {
                    shim.init()
                        .map_err(|err| Abort::Failed(SupervisorError::ShimInit(err)))?;
                }
                Ok(())
            }
            StartupStep::ReadConfig => {
                let cfg = ServerConfig::load(&self.inner.cwd).map_err(Abort::Failed)?;
                let mut core = self.core();
                if !core.is_starting(run) {
                    return Err(Abort::Superseded);
                }
                core.cfg = Some(cfg);
                Ok(())
            }
            StartupStep::TouchLog => {
                let path = self.log_path();
                ensure_log_file(&path)
                    .map_err(|source| Abort::Failed(SupervisorError::LogFile { path, source }))
            }
            StartupStep::TailLog => {
                let path = self.log_path();
                let monitor = LogMonitor::tail_file(&path, self.monitor_sink(run))
                    .map_err(|source| Abort::Failed(SupervisorError::LogFile { path, source }))?;

                let mut core = self.core();
                if !core.is_starting(run) {
                    return Err(Abort::Superseded);
                }
                if let Some(previous) = core.monitor.replace(monitor) {
                    previous.close();
                }
                Ok(())
            }
        }
    }

    fn launch(&self, run: u64) {
        let binary = &self.inner.binary;
        let opts = SpawnOptions::server(&self.inner.cwd, self.inner.io_mode == IoMode::Console);
        let spawned = match &self.inner.shim {
            Some(shim) => shim.spawn(binary, &[], &opts),
            None => spawn_native(binary, &[], &opts),
        };

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                self.abort_run(
                    run,
                    SupervisorError::Spawn {
                        binary: binary.clone(),
                        source,
                    },
                );
                return;
            }
        };
        info!("Server process started with PID {}", child.id());

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr);
        }
        let stdout_monitor = match child.stdout.take() {
            Some(stdout) => match LogMonitor::follow_stream(stdout, self.monitor_sink(run)) {
                Ok(monitor) => Some(monitor),
                Err(err) => {
                    terminate(child, Signal::SIGKILL);
                    self.abort_run(
                        run,
                        SupervisorError::LogFile {
                            path: PathBuf::from("stdout"),
                            source: err,
                        },
                    );
                    return;
                }
            },
            None => None,
        };

        // Connecting may fire callbacks synchronously, so it happens outside the lock.
        let admin = match self.inner.io_mode {
            IoMode::LogFile => self.connect_admin(run),
            IoMode::Console => None,
        };

        let flushed = {
            let mut core = self.core();
            if !core.is_starting(run) {
                drop(core);
                debug!("Run {run} was superseded during launch; killing new process");
                if let Some(mut conn) = admin {
                    conn.close();
                }
                terminate(child, Signal::SIGKILL);
                return;
            }

            core.child = Some(child);
            if let Some(monitor) = stdout_monitor
                && let Some(previous) = core.monitor.replace(monitor)
            {
                previous.close();
            }

            match (stdin, admin) {
                (Some(stdin), _) => core.transport.attach_stream(Box::new(stdin)),
                (None, Some(conn)) => core.transport.attach_admin(conn),
                (None, None) => Ok(0),
            }
        };
        if let Err(err) = flushed {
            self.emit(SupervisorEvent::Error(Arc::new(err.into())));
        }

        self.watch_exit(run);
        self.confirm_started(run);
    }

    fn connect_admin(&self, run: u64) -> Option<Box<dyn AdminConnection>> {
        let target = {
            let core = self.core();
            let cfg = core.cfg.as_ref();
            AdminTarget {
                bind: cfg
                    .and_then(ServerConfig::bind)
                    .unwrap_or_else(|| DEFAULT_BIND.to_string()),
                port: cfg.and_then(ServerConfig::port).unwrap_or(DEFAULT_PORT),
                password: cfg.and_then(ServerConfig::rcon_password).unwrap_or_default(),
                listen: ADMIN_LISTEN_ADDRESS.to_string(),
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let events: AdminSink = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                Supervisor { inner }.on_admin_event(run, event);
            }
        });

        match self.inner.connector.connect(&target, events) {
            Ok(conn) => Some(conn),
            Err(err) => {
                self.emit(SupervisorEvent::Error(Arc::new(err.into())));
                None
            }
        }
    }

    fn on_admin_event(&self, run: u64, event: AdminEvent) {
        match event {
            AdminEvent::Ready => {
                let flushed = {
                    let mut core = self.core();
                    if !core.is_live(run) {
                        return;
                    }
                    debug!("Admin connection ready");
                    core.transport.flush()
                };
                if let Err(err) = flushed {
                    self.emit(SupervisorEvent::Error(Arc::new(err.into())));
                }
            }
            AdminEvent::Error(err) => {
                if self.core().is_live(run) {
                    self.emit(SupervisorEvent::Error(Arc::new(err.into())));
                }
            }
        }
    }

    fn monitor_sink(&self, run: u64) -> MonitorSink {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                Supervisor { inner }.on_monitor_event(run, event);
            }
        })
    }

    fn on_monitor_event(&self, run: u64, event: MonitorEvent) {
        match event {
            MonitorEvent::Output(line) => {
                if !self.core().is_live(run) {
                    return;
                }
                let bind_failed = line.contains(BIND_FAILURE_MARKER);
                self.emit(SupervisorEvent::Output(line));
                if bind_failed {
                    self.abort_run(run, SupervisorError::BindFailureDetected);
                }
            }
            MonitorEvent::Failed(err) => {
                if self.core().is_live(run) {
                    warn!("Output monitor for {:?} failed: {err}", self.inner.cwd);
                }
            }
            MonitorEvent::Ended => {
                if !self.core().is_live(run) {
                    return;
                }
                // Stdout closes when the process exits; report the exit instead.
                if self.inner.io_mode == IoMode::Console
                    && let Some(status) = self.await_exit(run, STREAM_EXIT_GRACE)
                {
                    self.handle_exit(run, status);
                    return;
                }
                self.abort_run(run, SupervisorError::StreamTerminatedUnexpectedly);
            }
        }
    }

    fn await_exit(&self, run: u64, grace: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + grace;
        loop {
            {
                let mut core = self.core();
                if core.run != run {
                    return None;
                }
                match core.child.as_mut().map(Child::try_wait) {
                    Some(Ok(Some(status))) => return Some(status),
                    Some(Ok(None)) => {}
                    Some(Err(err)) => {
                        warn!("Failed to probe server process: {err}");
                        return None;
                    }
                    None => return None,
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn confirm_started(&self, run: u64) {
        let deadline = Instant::now() + self.inner.spawn_confirmation;
        let mut seen_running = false;

        loop {
            let exited = {
                let mut core = self.core();
                if !core.is_starting(run) {
                    return;
                }
                let probe = match core.child.as_mut() {
                    Some(child) => child.try_wait(),
                    None => return,
                };

                match probe {
                    Ok(None) => {
                        if seen_running && Instant::now() >= deadline {
                            core.transition(Lifecycle::Started);
                            let pid = core.child.as_ref().map_or(0, Child::id);
                            drop(core);
                            self.emit(SupervisorEvent::Started { pid });
                            return;
                        }
                        seen_running = true;
                        None
                    }
                    Ok(Some(status)) => Some(status),
                    Err(err) => {
                        warn!("Failed to probe server process: {err}");
                        None
                    }
                }
            };

            if let Some(status) = exited {
                self.handle_exit(run, status);
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn watch_exit(&self, run: u64) {
        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("sampd-exit".into())
            .spawn(move || {
                loop {
                    thread::sleep(EXIT_POLL_INTERVAL);
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let supervisor = Supervisor { inner };

                    let status = {
                        let mut core = supervisor.core();
                        if core.run != run {
                            return;
                        }
                        match core.child.as_mut() {
                            Some(child) => child.try_wait(),
                            None => return,
                        }
                    };

                    match status {
                        Ok(Some(status)) => {
                            supervisor.handle_exit(run, status);
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("Exit watcher stopped: {err}");
                            return;
                        }
                    }
                }
            });

        if let Err(err) = spawned {
            warn!("Failed to start exit watcher: {err}");
        }
    }

    fn handle_exit(&self, run: u64, status: ExitStatus) {
        let (state, work) = {
            let mut core = self.core();
            if !core.is_live(run) {
                return;
            }
            let state = core.lifecycle;
            (state, core.begin_stop())
        };
        let Some(work) = work else {
            return;
        };

        if state == Lifecycle::Starting {
            warn!("Server exited during startup with {status}");
            self.emit(SupervisorEvent::Error(Arc::new(
                SupervisorError::ExitedDuringStartup {
                    code: status.code(),
                    signal: status.signal(),
                },
            )));
            self.complete_stop(work, Signal::SIGKILL, false);
        } else {
            info!("Server exited with {status}");
            self.complete_stop(work, Signal::SIGTERM, false);
        }
    }

    /// Reports `err` and force-stops the given run. Stale runs are ignored.
    fn abort_run(&self, run: u64, err: SupervisorError) {
        let work = {
            let mut core = self.core();
            if !core.is_live(run) {
                debug!("Dropping failure of stale run {run}: {err}");
                return;
            }
            core.begin_stop()
        };

        if let Some(work) = work {
            // Reported before `Stopped` so observers that stop listening there see it.
            self.emit(SupervisorEvent::Error(Arc::new(err)));
            self.complete_stop(work, Signal::SIGKILL, false);
        }
    }

    fn complete_stop(&self, work: StopWork, signal: Signal, synchronous: bool) {
        let StopWork {
            run,
            child,
            monitor,
        } = work;

        if let Some(monitor) = monitor {
            monitor.close();
        }
        if let Some(child) = child {
            info!("Stopping server process {} with {signal}", child.id());
            terminate(child, signal);
        }

        if !self.inner.ephemeral {
            self.finish_stop(run);
            return;
        }

        let cwd = self.inner.cwd.clone();
        if synchronous {
            if let Err(err) = fs::remove_dir_all(&cwd) {
                debug!("Ignoring failure to remove workspace {cwd:?}: {err}");
            }
            self.finish_stop(run);
            return;
        }

        let supervisor = self.clone();
        let spawned = thread::Builder::new()
            .name("sampd-cleanup".into())
            .spawn(move || {
                if let Err(err) = fs::remove_dir_all(&cwd) {
                    warn!("Failed to remove workspace {cwd:?}: {err}");
                }
                supervisor.finish_stop(run);
            });
        if let Err(err) = spawned {
            warn!("Failed to start workspace cleanup: {err}");
            self.finish_stop(run);
        }
    }

    fn finish_stop(&self, run: u64) {
        {
            let mut core = self.core();
            if core.run == run && core.lifecycle == Lifecycle::Stopping {
                core.transition(Lifecycle::Idle);
            }
        }
        self.emit(SupervisorEvent::Stopped);
    }
}

fn absolute(path: &Path) -> PathBuf {
    normalize(&std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()))
}

fn drain_stderr<R: Read + Send + 'static>(stderr: R) {
    let spawned = thread::Builder::new()
        .name("sampd-stderr".into())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => debug!("[server stderr] {line}"),
                    Err(_) => break,
                }
            }
        });
    if let Err(err) = spawned {
        warn!("Failed to start stderr reader: {err}");
    }
}
