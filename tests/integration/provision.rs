#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use common::{
    events_until_stopped, fake_server, test_options, wait_for_output, wait_for_path_removed,
    wait_for_started, wait_for_stopped,
};
use sampd::{
    config::ServerConfig,
    error::SupervisorError,
    provision::{GamemodeSource, Provisioner, free_port},
    registry::SupervisorRegistry,
    supervisor::{IoMode, SupervisorEvent},
};
use tempfile::tempdir;

#[test]
fn provisioned_server_runs_from_its_workspace_and_is_cleaned_up() {
    let bin_dir = tempdir().expect("failed to create tempdir");
    let root = tempdir().expect("failed to create tempdir");
    let binary = fake_server(
        bin_dir.path(),
        "cat server.cfg\nls gm.amx\nwhile read line; do echo \"cmd: $line\"; done",
    );
    let registry = Arc::new(SupervisorRegistry::new());

    let supervisor = Provisioner::new(
        test_options(&binary, IoMode::Console, &registry),
        GamemodeSource::Bytes(b"AMX bytes".to_vec()),
    )
    .workspace_root(root.path())
    .set("hostname", "integration")
    .provision()
    .expect("provision failed");

    let workspace = supervisor.cwd().to_path_buf();
    assert!(supervisor.is_ephemeral());
    assert_eq!(fs::read(workspace.join("gm.amx")).unwrap(), b"AMX bytes");

    let events = supervisor.subscribe();
    supervisor.start();
    wait_for_output(&events, "gamemode0 ../gm 1");
    wait_for_output(&events, "gm.amx");
    wait_for_started(&events);

    let cfg = supervisor.config().expect("config not loaded");
    assert_eq!(cfg.get("hostname").map(ToString::to_string).as_deref(), Some("integration"));
    assert_eq!(cfg.gamemodes()[0].path, workspace.join("gm"));

    supervisor.stop();
    wait_for_stopped(&events);
    assert!(!workspace.exists());
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn allocated_port_is_the_one_probed() {
    let root = tempdir().expect("failed to create tempdir");
    let probed = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&probed);
    let registry = Arc::new(SupervisorRegistry::new());

    let supervisor = Provisioner::new(
        test_options(&PathBuf::from("/opt/samp/samp03svr"), IoMode::LogFile, &registry),
        GamemodeSource::Bytes(Vec::new()),
    )
    .workspace_root(root.path())
    .port_allocator(Arc::new(move || {
        let port = free_port()?;
        record.lock().unwrap().push(port);
        Ok(port)
    }))
    .provision()
    .expect("provision failed");

    let probed = probed.lock().unwrap().clone();
    assert_eq!(probed.len(), 1);
    let cfg = ServerConfig::load(supervisor.cwd()).unwrap();
    assert_eq!(cfg.port(), Some(probed[0]));
}

#[test]
fn gamemode_is_copied_from_a_file() {
    let root = tempdir().expect("failed to create tempdir");
    let source = tempdir().expect("failed to create tempdir");
    let amx = source.path().join("bare.amx");
    fs::write(&amx, b"compiled").unwrap();
    let registry = Arc::new(SupervisorRegistry::new());

    let supervisor = Provisioner::new(
        test_options(&PathBuf::from("/opt/samp/samp03svr"), IoMode::LogFile, &registry),
        GamemodeSource::File(amx),
    )
    .workspace_root(root.path())
    .set("port", 7781u16)
    .provision()
    .expect("provision failed");

    assert_eq!(fs::read(supervisor.cwd().join("gm.amx")).unwrap(), b"compiled");
}

#[test]
fn invalid_plugin_override_is_rejected_before_touching_disk() {
    let root = tempdir().expect("failed to create tempdir");
    let registry = Arc::new(SupervisorRegistry::new());

    let err = Provisioner::new(
        test_options(&PathBuf::from("/opt/samp/samp03svr"), IoMode::LogFile, &registry),
        GamemodeSource::Bytes(Vec::new()),
    )
    .workspace_root(root.path())
    .set("filterscripts", 3u16)
    .provision()
    .unwrap_err();

    assert!(matches!(
        err,
        SupervisorError::InvalidOverride { ref key, .. } if key == "filterscripts"
    ));
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
}

#[test]
fn workspace_is_removed_when_the_server_dies_during_startup() {
    let bin_dir = tempdir().expect("failed to create tempdir");
    let root = tempdir().expect("failed to create tempdir");
    let binary = fake_server(bin_dir.path(), "exit 1");
    let registry = Arc::new(SupervisorRegistry::new());

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
    let seen = events_until_stopped(&events);

    assert!(
        seen.iter().any(|e| matches!(
            e,
            SupervisorEvent::Error(err)
                if matches!(**err, SupervisorError::ExitedDuringStartup { .. })
        )),
        "{seen:?}"
    );
    wait_for_path_removed(&workspace);
}

#[test]
fn dropping_an_unstarted_instance_removes_its_workspace() {
    let root = tempdir().expect("failed to create tempdir");
    let registry = Arc::new(SupervisorRegistry::new());

    let supervisor = Provisioner::new(
        test_options(&PathBuf::from("/opt/samp/samp03svr"), IoMode::Console, &registry),
        GamemodeSource::Bytes(Vec::new()),
    )
    .workspace_root(root.path())
    .provision()
    .expect("provision failed");
    let workspace = supervisor.cwd().to_path_buf();
    assert!(workspace.exists());

    drop(supervisor);
    assert!(!workspace.exists());
}
