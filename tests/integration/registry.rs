#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{
    ECHO_SERVER, fake_server, test_options, wait_for_process_exit, wait_for_started,
    write_config,
};
use nix::sys::signal::Signal;
use sampd::{
    provision::{GamemodeSource, Provisioner},
    registry::SupervisorRegistry,
    supervisor::{IoMode, Lifecycle, Supervisor},
};
use tempfile::tempdir;

#[test]
fn stop_all_stops_every_started_server() {
    let registry = Arc::new(SupervisorRegistry::new());
    let dirs: Vec<_> = (0..2)
        .map(|_| tempdir().expect("failed to create tempdir"))
        .collect();

    let mut running = Vec::new();
    for dir in &dirs {
        write_config(dir.path(), "port 7777\n");
        let binary = fake_server(dir.path(), ECHO_SERVER);
        let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
        let events = supervisor.subscribe();
        supervisor.start();
        let pid = wait_for_started(&events);
        running.push((supervisor, pid));
    }
    assert_eq!(registry.len(), 2);

    assert_eq!(registry.stop_all_sync(Signal::SIGTERM), 2);
    assert!(registry.is_empty());
    for (supervisor, pid) in &running {
        assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
        wait_for_process_exit(*pid);
        assert!(supervisor.pid().is_none());
    }
}

#[test]
fn synchronous_stop_all_removes_ephemeral_workspaces_before_returning() {
    let registry = Arc::new(SupervisorRegistry::new());
    let bin_dir = tempdir().expect("failed to create tempdir");
    let root = tempdir().expect("failed to create tempdir");
    let binary = fake_server(bin_dir.path(), ECHO_SERVER);

    let supervisor = Provisioner::new(
        test_options(&binary, IoMode::Console, &registry),
        GamemodeSource::Bytes(Vec::new()),
    )
    .workspace_root(root.path())
    .provision()
    .expect("provision failed");
    let workspace = supervisor.cwd().to_path_buf();

    let events = supervisor.subscribe();
    supervisor.start();
    let pid = wait_for_started(&events);

    registry.stop_all_sync(Signal::SIGKILL);
    assert!(!workspace.exists());
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
    wait_for_process_exit(pid);
}

#[test]
fn supervisors_register_on_start_only() {
    let registry = Arc::new(SupervisorRegistry::new());
    let dir = tempdir().expect("failed to create tempdir");
    write_config(dir.path(), "port 7777\n");
    let binary = fake_server(dir.path(), ECHO_SERVER);

    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    assert!(registry.is_empty());

    let events = supervisor.subscribe();
    supervisor.start();
    wait_for_started(&events);
    assert_eq!(registry.len(), 1);

    drop(events);
    supervisor.stop_sync(Signal::SIGKILL);
    // Stopping does not unregister; only stop_all drains the registry.
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.stop_all_sync(Signal::SIGTERM), 1);
    assert!(registry.is_empty());
}
