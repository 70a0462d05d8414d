//! Command-line interface for sampd.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Levels in the order of their numeric shorthand, each with the names it accepts. The
/// first name is the `EnvFilter` directive.
const LEVELS: [(LevelFilter, &[&str]); 6] = [
    (LevelFilter::OFF, &["off", "quiet"]),
    (LevelFilter::ERROR, &["error", "err"]),
    (LevelFilter::WARN, &["warn", "warning"]),
    (LevelFilter::INFO, &["info"]),
    (LevelFilter::DEBUG, &["debug"]),
    (LevelFilter::TRACE, &["trace", "verbose"]),
];

/// Value of `--log-level`: a level name, or a number from 0 (off) to 5 (trace).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    pub fn level(self) -> LevelFilter {
        self.0
    }

    /// Directive for an `EnvFilter`.
    pub fn directive(self) -> &'static str {
        LEVELS
            .iter()
            .find(|(level, _)| *level == self.0)
            .map_or("info", |(_, names)| names[0])
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Err("log level cannot be empty".into());
        }

        let entry = match wanted.parse::<usize>() {
            Ok(index) => LEVELS.get(index).ok_or_else(|| {
                format!("log level {index} is out of range (0-{})", LEVELS.len() - 1)
            })?,
            Err(_) => LEVELS
                .iter()
                .find(|(_, names)| names.contains(&wanted.as_str()))
                .ok_or_else(|| format!("unknown log level '{}'", value.trim()))?,
        };
        Ok(LogLevelArg(entry.0))
    }
}

/// Command-line interface for sampd.
#[derive(Parser, Debug)]
#[command(name = "sampd", version)]
#[command(about = "Runs and supervises SA-MP game servers", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that launches a server.
#[derive(Args, Debug, Clone)]
pub struct LaunchArgs {
    /// Path to the server binary.
    #[arg(short, long)]
    pub binary: PathBuf,

    /// Attach to the server's stdio instead of tailing its log file.
    #[arg(long)]
    pub console: bool,
}

/// Available commands for sampd.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise a server installed in a directory.
    Run {
        #[command(flatten)]
        launch: LaunchArgs,

        /// Working directory (defaults to the binary's directory).
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Supervise a throwaway server in a fresh temporary directory.
    Temp {
        #[command(flatten)]
        launch: LaunchArgs,

        /// Compiled gamemode (`.amx`) to run.
        #[arg(short, long)]
        gamemode: PathBuf,

        /// Game port (a free one is picked when omitted).
        #[arg(short, long)]
        port: Option<u16>,

        /// Server name shown in the browser.
        #[arg(long)]
        hostname: Option<String>,

        /// Plugin to load; may be repeated.
        #[arg(long = "plugin", value_name = "PATH")]
        plugins: Vec<PathBuf>,
    },

    /// Print a directory's effective `server.cfg` as JSON.
    Config {
        /// Directory containing `server.cfg`.
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
