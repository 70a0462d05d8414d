//! Process spawning, signal delivery and the compatibility shim for foreign binaries.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::constants::SERVER_ENV;

/// How a server process is launched.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Working directory of the process.
    pub cwd: PathBuf,
    /// Pipe stdin/stdout/stderr when true, otherwise attach them to the null device.
    pub piped: bool,
    /// Environment overrides layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    /// Options for a game server rooted at `cwd`.
    pub fn server(cwd: &Path, piped: bool) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            piped,
            env: SERVER_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Applies the options to a command.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.current_dir(&self.cwd);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if self.piped {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
    }
}

/// Launches `binary` directly.
pub fn spawn_native(binary: &Path, args: &[&str], opts: &SpawnOptions) -> io::Result<Child> {
    let mut cmd = Command::new(binary);
    cmd.args(args);
    opts.apply(&mut cmd);
    debug!("Executing command: {cmd:?}");
    cmd.spawn()
}

/// Run layer for binaries built for another platform.
pub trait CompatShim: Send + Sync {
    /// Whether [`CompatShim::init`] already completed.
    fn is_initialized(&self) -> bool;

    /// Prepares the shim. Called at most once while `is_initialized` is false.
    fn init(&self) -> io::Result<()>;

    /// Launches `binary` through the shim.
    fn spawn(&self, binary: &Path, args: &[&str], opts: &SpawnOptions) -> io::Result<Child>;
}

/// Wine-backed shim for Windows server builds.
#[derive(Debug)]
pub struct WineShim {
    wine: PathBuf,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl WineShim {
    /// Shim that invokes the given wine loader.
    pub fn new(wine: impl Into<PathBuf>) -> Self {
        Self {
            wine: wine.into(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Process-wide shim using `wine` from `PATH`.
    pub fn shared() -> Arc<WineShim> {
        static SHARED: OnceLock<Arc<WineShim>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(WineShim::new("wine"))))
    }
}

impl CompatShim for WineShim {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn init(&self) -> io::Result<()> {
        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_initialized() {
            return Ok(());
        }

        info!("Initialising wine prefix via {:?}", self.wine);
        let status = Command::new(&self.wine)
            .args(["wineboot", "--init"])
            .env("WINEDEBUG", "-all")
            .env("DISPLAY", "")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        if !status.success() {
            return Err(io::Error::other(format!("wineboot exited with {status}")));
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn(&self, binary: &Path, args: &[&str], opts: &SpawnOptions) -> io::Result<Child> {
        let mut cmd = Command::new(&self.wine);
        cmd.arg(binary).args(args).env("WINEDEBUG", "-all");
        opts.apply(&mut cmd);
        debug!("Executing command through wine: {cmd:?}");
        cmd.spawn()
    }
}

/// Whether `binary` has to run through the compatibility shim on this host.
pub fn needs_shim(binary: &Path) -> bool {
    if cfg!(windows) {
        return false;
    }

    let is_exe = binary
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"));

    cfg!(target_os = "macos") || is_exe
}

/// Sends `signal` to the child if it is still alive and reaps it in the background.
pub fn terminate(mut child: Child, signal: Signal) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Server process {} already exited with {status}", child.id());
            return;
        }
        Ok(None) => {}
        Err(err) => warn!("Failed to probe server process {}: {err}", child.id()),
    }

    let pid = Pid::from_raw(child.id() as i32);
    match kill(pid, signal) {
        Ok(()) => debug!("Sent {signal} to server process {pid}"),
        Err(Errno::ESRCH) => debug!("Server process {pid} exited before {signal}"),
        Err(err) => warn!("Failed to send {signal} to server process {pid}: {err}"),
    }

    // Reap without blocking the caller so no zombie is left behind.
    let spawned = thread::Builder::new()
        .name(format!("sampd-reap-{pid}"))
        .spawn(move || {
            if let Err(err) = child.wait() {
                warn!("Failed to reap server process {pid}: {err}");
            }
        });

    if let Err(err) = spawned {
        warn!("Failed to start reaper for server process {pid}: {err}");
    }
}
