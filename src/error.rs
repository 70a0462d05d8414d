//! Error handling for sampd.
use std::{io, path::PathBuf};

use thiserror::Error;

/// Defines all possible errors raised while supervising a server process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The `server.cfg` file is missing or could not be read.
    #[error("Failed to read config file {path:?}: {source}")]
    ConfigMissingOrUnreadable {
        /// Path of the config file that was read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The server log file could not be created, opened or tailed.
    #[error("Log file {path:?} is not accessible: {source}")]
    LogFile {
        /// Path of the log file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The compatibility shim failed to initialise.
    #[error("Failed to initialise compatibility shim: {0}")]
    ShimInit(#[source] io::Error),

    /// The OS handed back an unusable port.
    #[error("Unable to allocate a free port: {0}")]
    PortAllocation(String),

    /// Binding the port probe listener failed.
    #[error("Free port probe failed: {0}")]
    PortProbe(#[source] io::Error),

    /// The server process could not be launched.
    #[error("Failed to spawn server binary {binary:?}: {source}")]
    Spawn {
        /// The binary that failed to launch.
        binary: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The server process exited before startup completed.
    #[error(
        "The server process encountered an error; exit code: {code:?}, signal: {signal:?}"
    )]
    ExitedDuringStartup {
        /// Exit code, when the process exited normally.
        code: Option<i32>,
        /// Terminating signal, when the process was killed.
        signal: Option<i32>,
    },

    /// The server reported that it could not bind its listening socket.
    #[error("Unable to start the server. Invalid bind IP or port in use?")]
    BindFailureDetected,

    /// The monitored output stream ended while the server was supposed to be running.
    #[error("Log stream ended unexpectedly")]
    StreamTerminatedUnexpectedly,

    /// The administrative connection failed.
    #[error("Command transport error: {0}")]
    Transport(#[from] TransportError),

    /// Provisioning an ephemeral workspace failed.
    #[error("Failed to prepare workspace {path:?}: {source}")]
    Workspace {
        /// Path that was being written.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A provisioning override had the wrong shape for its key.
    #[error("Override for '{key}' must be {expected}")]
    InvalidOverride {
        /// The offending key.
        key: String,
        /// Human-readable description of the accepted shape.
        expected: &'static str,
    },
}

/// Error type for command transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Writing to the process input stream or the socket failed.
    #[error("Failed to deliver command: {0}")]
    Io(#[from] io::Error),

    /// The channel has no live connection to deliver on.
    #[error("Transport is not connected")]
    NotConnected,

    /// The configured bind address is not usable for the admin protocol.
    #[error("Invalid admin address '{0}'")]
    Address(String),

    /// The admin socket could not be bound on the listen address.
    #[error("Failed to bind admin socket on '{address}': {source}")]
    Bind {
        /// The listen address that was requested.
        address: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}
