//! Constants and tunables for the server supervisor.
//!
//! File names, protocol markers and polling intervals live here so the rest of the
//! crate never hard-codes them.

use std::time::Duration;

// ============================================================================
// Workspace Layout
// ============================================================================

/// Name of the server configuration file inside the working directory.
pub const CONFIG_FILE: &str = "server.cfg";

/// Name of the log file the server writes when it is not attached to a console.
pub const LOG_FILE: &str = "server_log.txt";

/// File name of the compiled gamemode written into ephemeral workspaces.
pub const GAMEMODE_FILE: &str = "gm.amx";

/// Gamemode entry for ephemeral workspaces, relative to `gamemodes/`.
pub const GAMEMODE_ENTRY: &str = "../gm";

/// Prefix used for ephemeral working directories.
pub const WORKSPACE_PREFIX: &str = "samp-";

/// Subdirectory holding gamemode scripts.
pub const GAMEMODES_DIR: &str = "gamemodes";

/// Subdirectory holding filterscripts.
pub const FILTERSCRIPTS_DIR: &str = "filterscripts";

/// Subdirectory holding plugins.
pub const PLUGINS_DIR: &str = "plugins";

// ============================================================================
// Server Output
// ============================================================================

/// Output written by the server when it cannot bind its listening socket.
pub const BIND_FAILURE_MARKER: &str = "Unable to start server on";

/// Environment overrides applied to every spawned server.
pub const SERVER_ENV: &[(&str, &str)] = &[("DISPLAY", "")];

// ============================================================================
// Administrative Protocol
// ============================================================================

/// Local address the admin socket listens on.
pub const ADMIN_LISTEN_ADDRESS: &str = "0.0.0.0";

/// Length of generated RCON passwords.
pub const RCON_PASSWORD_LEN: usize = 10;

// ============================================================================
// Timing
// ============================================================================

/// How long a freshly spawned server must stay alive before it counts as started.
pub const SPAWN_CONFIRMATION: Duration = Duration::from_millis(200);

/// Poll interval of the exit watcher and the spawn confirmation probe.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Poll interval of the log file tail while no new data is available.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period for a child to exit after its output stream closed.
pub const STREAM_EXIT_GRACE: Duration = Duration::from_millis(250);
