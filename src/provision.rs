//! Throwaway server workspaces.
//!
//! A [`Provisioner`] creates a fresh temporary directory holding a compiled gamemode and a
//! generated `server.cfg`, and hands back an ephemeral [`Supervisor`] rooted there. The
//! directory is deleted whenever that supervisor stops.
use std::{
    fmt, fs,
    net::{Ipv4Addr, TcpListener},
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::{Rng, distributions::Alphanumeric};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::{
    config::{
        CfgValue, FILTERSCRIPTS_KEY, GAMEMODES_KEY, Gamemode, PLUGINS_KEY, ServerConfig, resolve,
    },
    constants::{
        GAMEMODE_ENTRY, GAMEMODE_FILE, GAMEMODES_DIR, RCON_PASSWORD_LEN, WORKSPACE_PREFIX,
    },
    error::SupervisorError,
    supervisor::{Supervisor, SupervisorOptions},
};

/// Supplies a free TCP port for servers provisioned without an explicit one.
pub type PortAllocator = Arc<dyn Fn() -> Result<u16, SupervisorError> + Send + Sync>;

/// Where the compiled gamemode comes from.
#[derive(Debug, Clone)]
pub enum GamemodeSource {
    /// Raw `.amx` contents.
    Bytes(Vec<u8>),
    /// A file to copy.
    File(PathBuf),
}

impl GamemodeSource {
    fn read(&self) -> Result<Vec<u8>, SupervisorError> {
        match self {
            GamemodeSource::Bytes(bytes) => Ok(bytes.clone()),
            GamemodeSource::File(path) => {
                fs::read(path).map_err(|source| SupervisorError::Workspace {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
}

/// Builder for ephemeral server workspaces.
#[derive(Clone)]
pub struct Provisioner {
    options: SupervisorOptions,
    gamemode: GamemodeSource,
    overrides: Vec<(String, CfgValue)>,
    port_allocator: PortAllocator,
    workspace_root: Option<PathBuf>,
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioner")
            .field("options", &self.options)
            .field("gamemode", &self.gamemode)
            .field("overrides", &self.overrides)
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

impl Provisioner {
    /// Provisioner for servers launched with `options`, running `gamemode`.
    ///
    /// The working directory and ephemeral flag of `options` are replaced on each
    /// provision.
    pub fn new(options: SupervisorOptions, gamemode: GamemodeSource) -> Self {
        Self {
            options,
            gamemode,
            overrides: Vec::new(),
            port_allocator: Arc::new(free_port),
            workspace_root: None,
        }
    }

    /// Overrides a config key. Keys outside the default key set are ignored.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<CfgValue>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    pub fn port_allocator(mut self, allocator: PortAllocator) -> Self {
        self.port_allocator = allocator;
        self
    }

    /// Creates workspaces under `root` instead of the system temp directory.
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Creates a new workspace and returns an idle ephemeral supervisor for it.
    ///
    /// Nothing is left on disk when this fails.
    pub fn provision(&self) -> Result<Supervisor, SupervisorError> {
        let overrides = self.validated_overrides()?;
        let workspace = self.create_workspace()?;
        let dir = workspace.path().to_path_buf();

        let mut cfg = ServerConfig::defaults();
        cfg.set("query", 0u16);
        cfg.set("announce", 0u16);
        cfg.set(
            GAMEMODES_KEY,
            vec![Gamemode {
                path: resolve(&dir.join(GAMEMODES_DIR), Path::new(GAMEMODE_ENTRY)),
                repeat: 1,
            }],
        );

        let mut port_given = false;
        let mut password_given = false;
        for (key, value) in overrides {
            match key.as_str() {
                "port" => port_given = true,
                "rcon_password" => password_given = !value.to_string().is_empty(),
                _ => {}
            }
            cfg.set(key, value);
        }

        if !password_given {
            cfg.set("rcon_password", random_password());
        }
        if !port_given {
            let port = (self.port_allocator)()?;
            debug!("Allocated port {port} for {dir:?}");
            cfg.set("port", port);
        }

        let gamemode = self.gamemode.read()?;
        let gamemode_path = dir.join(GAMEMODE_FILE);
        fs::write(&gamemode_path, gamemode).map_err(|source| SupervisorError::Workspace {
            path: gamemode_path,
            source,
        })?;
        cfg.write(&dir)
            .map_err(|source| SupervisorError::Workspace {
                path: dir.clone(),
                source,
            })?;

        let dir = workspace.keep();
        info!("Provisioned server workspace {dir:?} on port {:?}", cfg.port());
        Ok(Supervisor::new(
            self.options.clone().cwd(dir).ephemeral(true),
        ))
    }

    fn validated_overrides(&self) -> Result<Vec<(String, CfgValue)>, SupervisorError> {
        let mut accepted = Vec::new();
        for (key, value) in &self.overrides {
            let key = key.to_ascii_lowercase();
            if !ServerConfig::is_known_key(&key) {
                debug!("Ignoring unknown config override '{key}'");
                continue;
            }
            if (key == PLUGINS_KEY || key == FILTERSCRIPTS_KEY)
                && !matches!(value, CfgValue::Paths(_))
            {
                return Err(SupervisorError::InvalidOverride {
                    key,
                    expected: "a list of paths",
                });
            }
            accepted.push((key, value.clone()));
        }
        Ok(accepted)
    }

    fn create_workspace(&self) -> Result<TempDir, SupervisorError> {
        let root = self
            .workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(&root)
            .map_err(|source| SupervisorError::Workspace { path: root, source })
    }
}

/// Asks the OS for a currently free TCP port.
///
/// The probe listener is closed before returning, so the port is only likely, not
/// guaranteed, to still be free when the server binds it.
pub fn free_port() -> Result<u16, SupervisorError> {
    let listener =
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(SupervisorError::PortProbe)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::PortProbe)?
        .port();
    drop(listener);

    if port == 0 {
        return Err(SupervisorError::PortAllocation(
            "the OS returned port 0".into(),
        ));
    }
    Ok(port)
}

fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RCON_PASSWORD_LEN)
        .map(char::from)
        .collect()
}
