//! Process-wide bookkeeping of started supervisors.
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use nix::sys::signal::Signal;
use tracing::{debug, info};

use crate::supervisor::{Supervisor, WeakSupervisor};

/// Tracks every supervisor that has been started so they can be stopped together.
///
/// Entries are weak: a registry never keeps a dropped supervisor alive.
#[derive(Default)]
pub struct SupervisorRegistry {
    active: Mutex<Vec<WeakSupervisor>>,
}

impl std::fmt::Debug for SupervisorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every supervisor that was not given its own.
    pub fn global() -> Arc<SupervisorRegistry> {
        static GLOBAL: OnceLock<Arc<SupervisorRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SupervisorRegistry::new())))
    }

    /// Adds `supervisor` unless it is already registered.
    pub fn register(&self, supervisor: &Supervisor) {
        let mut active = self.active();
        active.retain(|entry| entry.upgrade().is_some());
        if active.iter().any(|entry| entry.points_to(supervisor)) {
            return;
        }
        debug!("Registered supervisor for {:?}", supervisor.cwd());
        active.push(supervisor.downgrade());
    }

    /// Number of registered supervisors that are still alive.
    pub fn len(&self) -> usize {
        self.active()
            .iter()
            .filter(|entry| entry.upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every registered supervisor and stops it with `signal`.
    ///
    /// Returns how many supervisors were stopped.
    pub fn stop_all(&self, signal: Signal, synchronous: bool) -> usize {
        let mut stopped = 0;
        loop {
            // The lock is released before stopping so a stop can never block on it.
            let Some(entry) = self.active().pop() else {
                break;
            };
            if let Some(supervisor) = entry.upgrade() {
                supervisor.stop_with(signal, synchronous);
                stopped += 1;
            }
        }

        if stopped > 0 {
            info!("Stopped {stopped} server(s) with {signal}");
        }
        stopped
    }

    /// [`SupervisorRegistry::stop_all`] with synchronous stops.
    pub fn stop_all_sync(&self, signal: Signal) -> usize {
        self.stop_all(signal, true)
    }

    fn active(&self) -> MutexGuard<'_, Vec<WeakSupervisor>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stops every server in `registry` on SIGINT/SIGTERM, then exits the process.
pub fn install_shutdown_hook(registry: Arc<SupervisorRegistry>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("Shutdown requested; stopping all servers");
        registry.stop_all_sync(Signal::SIGTERM);
        std::process::exit(0);
    })
}
