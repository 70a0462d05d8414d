use std::{
    error::Error,
    io::{self, BufRead},
    thread,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sampd::{
    cli::{Commands, LaunchArgs, LogLevelArg, parse_args},
    config::ServerConfig,
    provision::{GamemodeSource, Provisioner},
    registry::{SupervisorRegistry, install_shutdown_hook},
    supervisor::{IoMode, Supervisor, SupervisorEvent, SupervisorOptions},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(args.log_level);

    match args.command {
        Commands::Run { launch, cwd } => {
            let mut options = launch_options(&launch);
            if let Some(cwd) = cwd {
                options = options.cwd(cwd);
            }
            supervise(Supervisor::new(options))?;
        }
        Commands::Temp {
            launch,
            gamemode,
            port,
            hostname,
            plugins,
        } => {
            let mut provisioner =
                Provisioner::new(launch_options(&launch), GamemodeSource::File(gamemode));
            if let Some(port) = port {
                provisioner = provisioner.set("port", port);
            }
            if let Some(hostname) = hostname {
                provisioner = provisioner.set("hostname", hostname);
            }
            if !plugins.is_empty() {
                provisioner = provisioner.set("plugins", plugins);
            }

            let supervisor = provisioner.provision()?;
            info!("Provisioned temporary server in {:?}", supervisor.cwd());
            supervise(supervisor)?;
        }
        Commands::Config { dir } => {
            let cfg = ServerConfig::load(&dir)?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}

fn init_logging(level: Option<LogLevelArg>) {
    let filter = level
        .map(|level| EnvFilter::new(level.directive()))
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    // Stdout carries server output and JSON.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn launch_options(launch: &LaunchArgs) -> SupervisorOptions {
    let options = SupervisorOptions::new(&launch.binary);
    if launch.console {
        options.io_mode(IoMode::Console)
    } else {
        options
    }
}

/// Runs `supervisor` until the server stops, echoing its output and forwarding stdin.
fn supervise(supervisor: Supervisor) -> Result<(), Box<dyn Error>> {
    install_shutdown_hook(SupervisorRegistry::global())?;

    let events = supervisor.subscribe();
    supervisor.start();
    forward_stdin(supervisor.clone());

    let mut failure = None;
    for event in events {
        match event {
            SupervisorEvent::Output(line) => println!("{line}"),
            SupervisorEvent::Started { pid } => info!("Server is running with PID {pid}"),
            SupervisorEvent::Error(err) => {
                error!("{err}");
                failure = Some(err);
            }
            SupervisorEvent::Stopped => break,
        }
    }

    match failure {
        Some(err) => Err(format!("server stopped after an error: {err}").into()),
        None => Ok(()),
    }
}

fn forward_stdin(supervisor: Supervisor) {
    let spawned = thread::Builder::new()
        .name("sampd-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("Stopped reading commands from stdin: {err}");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match supervisor.send_command(&line) {
                    Ok(delivery) => debug!("Command {line:?}: {delivery:?}"),
                    Err(err) => warn!("Failed to send command {line:?}: {err}"),
                }
            }
        });

    if let Err(err) = spawned {
        warn!("Failed to start stdin forwarder: {err}");
    }
}
