//! sampd supervises SA-MP style game server processes. It reads and writes the server's
//! `server.cfg`, provisions throwaway server workspaces, launches the server (through a
//! compatibility shim when the binary was built for another platform), watches its output
//! for readiness and fatal errors, delivers administrative commands and tears everything
//! down again on stop.

/// CLI interface.
pub mod cli;

/// `server.cfg` codec.
pub mod config;

/// Constants and tunables.
pub mod constants;

/// Error handling.
pub mod error;

/// Log file and output stream monitoring.
pub mod monitor;

/// Ephemeral workspace provisioning.
pub mod provision;

/// UDP RCON client.
pub mod rcon;

/// Process-wide supervisor registry.
pub mod registry;

/// Process spawning and signalling.
pub mod spawn;

/// Server lifecycle state machine.
pub mod supervisor;

/// Queued command delivery.
pub mod transport;
