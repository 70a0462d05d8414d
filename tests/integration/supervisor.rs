#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    io::Write,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use common::{
    ECHO_SERVER, ManualConnector, events_until_stopped, fake_server, is_process_alive,
    test_options, wait_for_event, wait_for_output, wait_for_process_exit, wait_for_started,
    wait_for_stopped, write_config,
};
use nix::sys::signal::Signal;
use sampd::{
    error::SupervisorError,
    registry::SupervisorRegistry,
    supervisor::{IoMode, Lifecycle, Supervisor, SupervisorEvent},
    transport::Delivery,
};
use tempfile::tempdir;

#[test]
fn starting_twice_leaves_exactly_one_live_server() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), ECHO_SERVER);
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    let events = supervisor.subscribe();

    supervisor.start();
    let first = wait_for_started(&events);

    supervisor.start();
    let second = wait_for_started(&events);

    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert!(is_process_alive(second));
    assert_eq!(supervisor.pid(), Some(second));
    assert!(supervisor.is_monitoring());
    assert_eq!(registry.len(), 1);

    supervisor.send_command("say still here").expect("send failed");
    wait_for_output(&events, "cmd: say still here");

    supervisor.stop_sync(Signal::SIGKILL);
    wait_for_process_exit(second);
    assert!(!supervisor.is_monitoring());
}

#[test]
fn commands_sent_while_running_are_written_immediately() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), ECHO_SERVER);
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    let events = supervisor.subscribe();

    supervisor.start();
    wait_for_started(&events);

    assert_eq!(supervisor.send_command("gmx").unwrap(), Delivery::Sent);
    wait_for_output(&events, "cmd: gmx");
    assert_eq!(supervisor.lifecycle(), Lifecycle::Started);

    supervisor.stop();
    wait_for_stopped(&events);
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
}

#[test]
fn server_exiting_after_start_stops_without_error() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "read line\nexit 0");
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    let events = supervisor.subscribe();

    supervisor.start();
    wait_for_started(&events);
    supervisor.send_command("exit").unwrap();

    let seen = events_until_stopped(&events);
    assert!(
        !seen.iter().any(|e| matches!(e, SupervisorEvent::Error(_))),
        "unexpected error: {seen:?}"
    );
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
    assert!(supervisor.pid().is_none());
}

#[test]
fn exit_during_startup_reports_exactly_one_error() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "echo booting\nexit 7");
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(
        test_options(&binary, IoMode::Console, &registry)
            .spawn_confirmation(Duration::from_millis(500)),
    );
    let events = supervisor.subscribe();

    supervisor.start();
    let seen = events_until_stopped(&events);

    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Started { .. })),
        "server must never count as started: {seen:?}"
    );
    let errors: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Error(err) => Some(err),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1, "{seen:?}");
    assert!(matches!(
        **errors[0],
        SupervisorError::ExitedDuringStartup { code: Some(7), .. }
    ));
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn missing_binary_fails_to_spawn() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(
        &temp.path().join("samp03svr"),
        IoMode::Console,
        &registry,
    ));
    let events = supervisor.subscribe();

    supervisor.start();
    match wait_for_event(&events, |e| matches!(e, SupervisorEvent::Error(_))) {
        SupervisorEvent::Error(err) => {
            assert!(matches!(*err, SupervisorError::Spawn { .. }), "{err}")
        }
        _ => unreachable!(),
    }
    wait_for_stopped(&events);
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
}

#[test]
fn log_file_mode_reports_only_new_lines() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\nrcon_password secret\n");
    fs::write(temp.path().join("server_log.txt"), "from a previous run\n").unwrap();
    let binary = fake_server(
        temp.path(),
        "echo 'Loaded 0 filterscripts.' >> server_log.txt\nexec sleep 30",
    );
    let registry = Arc::new(SupervisorRegistry::new());
    let connector = Arc::new(ManualConnector::default());
    let supervisor = Supervisor::new(
        test_options(&binary, IoMode::LogFile, &registry).admin_connector(connector.clone()),
    );
    let events = supervisor.subscribe();

    supervisor.start();
    let mut first_line = None;
    let mut started = None;
    while first_line.is_none() || started.is_none() {
        match wait_for_event(&events, |_| true) {
            SupervisorEvent::Output(line) => {
                first_line.get_or_insert(line);
            }
            SupervisorEvent::Started { pid } => started = Some(pid),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(first_line.as_deref(), Some("Loaded 0 filterscripts."));
    let pid = started.unwrap();

    // The admin connection is opened before the start is confirmed.
    let targets = connector.targets.lock().unwrap().clone();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].port, 7777);
    assert_eq!(targets[0].password, "secret");
    assert_eq!(targets[0].bind, "0.0.0.0");

    supervisor.stop_sync(Signal::SIGTERM);
    wait_for_process_exit(pid);
}

#[test]
fn admin_commands_queued_before_readiness_are_delivered_newest_first() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exec sleep 30");
    let registry = Arc::new(SupervisorRegistry::new());
    let connector = Arc::new(ManualConnector::default());
    let supervisor = Supervisor::new(
        test_options(&binary, IoMode::LogFile, &registry).admin_connector(connector.clone()),
    );
    let events = supervisor.subscribe();

    for command in ["hostname a", "hostname b", "hostname c"] {
        assert_eq!(supervisor.send_command(command).unwrap(), Delivery::Queued);
    }
    supervisor.start();
    wait_for_started(&events);
    assert!(connector.sent().is_empty());
    assert_eq!(supervisor.pending_commands().len(), 3);

    connector.fire_ready();
    connector.fire_ready();
    assert_eq!(
        connector.sent(),
        vec!["hostname c", "hostname b", "hostname a"]
    );
    assert!(supervisor.pending_commands().is_empty());

    supervisor.stop_sync(Signal::SIGKILL);
    assert_eq!(supervisor.send_command("late").unwrap(), Delivery::Queued);
}

#[test]
fn removing_the_log_file_terminates_the_server() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exec sleep 30");
    let registry = Arc::new(SupervisorRegistry::new());
    let connector = Arc::new(ManualConnector::default());
    let supervisor = Supervisor::new(
        test_options(&binary, IoMode::LogFile, &registry).admin_connector(connector),
    );
    let events = supervisor.subscribe();

    supervisor.start();
    let pid = wait_for_started(&events);
    fs::remove_file(temp.path().join("server_log.txt")).unwrap();

    match wait_for_event(&events, |e| matches!(e, SupervisorEvent::Error(_))) {
        SupervisorEvent::Error(err) => assert!(
            matches!(*err, SupervisorError::StreamTerminatedUnexpectedly),
            "{err}"
        ),
        _ => unreachable!(),
    }
    wait_for_stopped(&events);
    wait_for_process_exit(pid);
}

#[test]
fn bind_failure_marker_in_the_log_kills_the_server() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exec sleep 30");
    let registry = Arc::new(SupervisorRegistry::new());
    let connector = Arc::new(ManualConnector::default());
    let supervisor = Supervisor::new(
        test_options(&binary, IoMode::LogFile, &registry).admin_connector(connector),
    );
    let events = supervisor.subscribe();

    supervisor.start();
    let pid = wait_for_started(&events);

    let mut log = fs::OpenOptions::new()
        .append(true)
        .open(temp.path().join("server_log.txt"))
        .unwrap();
    writeln!(log, "Unable to start server on 0.0.0.0:7777. Invalid IP or port in use?").unwrap();
    drop(log);

    match wait_for_event(&events, |e| matches!(e, SupervisorEvent::Error(_))) {
        SupervisorEvent::Error(err) => {
            assert!(matches!(*err, SupervisorError::BindFailureDetected), "{err}")
        }
        _ => unreachable!(),
    }
    wait_for_stopped(&events);
    wait_for_process_exit(pid);
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);

    // Nothing from the dead run leaks out afterwards.
    thread::sleep(Duration::from_millis(200));
    assert!(events.try_recv().is_err());
}

#[test]
fn dropping_the_last_handle_kills_the_server() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exec sleep 30");
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    let events = supervisor.subscribe();

    supervisor.start();
    let pid = wait_for_started(&events);
    drop(supervisor);

    wait_for_process_exit(pid);
    assert_eq!(registry.len(), 0);
    assert_eq!(registry.stop_all_sync(Signal::SIGTERM), 0);
}

#[test]
fn stop_completes_while_the_server_ignores_its_input() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exec sleep 30");
    let registry = Arc::new(SupervisorRegistry::new());
    let supervisor = Supervisor::new(test_options(&binary, IoMode::Console, &registry));
    let events = supervisor.subscribe();

    supervisor.start();
    let pid = wait_for_started(&events);

    // Far more than a pipe buffer holds; nothing ever reads it.
    let sender = supervisor.clone();
    let (sent_tx, sent_rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = sent_tx.send(sender.send_command(&"x".repeat(200_000)));
    });
    let delivery = sent_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("send_command blocked on a full pipe");
    assert_eq!(delivery.expect("send failed"), Delivery::Sent);

    let stopper = supervisor.clone();
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        stopper.stop_sync(Signal::SIGKILL);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("stop blocked behind a pending input write");

    wait_for_process_exit(pid);
    assert_eq!(supervisor.lifecycle(), Lifecycle::Idle);
}
