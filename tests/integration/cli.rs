#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::{fake_server, write_config};
use predicates::str::contains;
use tempfile::tempdir;

#[test]
fn config_prints_the_effective_config_as_json() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(
        temp.path(),
        "# test server\nport 8888\nhostname My Server\nplugins streamer.so\n=broken\n",
    );

    let output = Command::new(assert_cmd::cargo::cargo_bin!("sampd"))
        .arg("config")
        .arg("--dir")
        .arg(temp.path())
        .output()
        .expect("failed to execute config");
    assert!(output.status.success());

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is not JSON");
    assert_eq!(json["port"], 8888.0);
    assert_eq!(json["hostname"], "My Server");
    assert_eq!(json["maxplayers"], 50.0);
    let plugin = json["plugins"][0].as_str().expect("plugins is not a list");
    assert!(plugin.ends_with("plugins/streamer.so"), "{plugin}");
}

#[test]
fn config_fails_without_a_config_file() {
    let temp = tempdir().expect("failed to create tempdir");

    Command::new(assert_cmd::cargo::cargo_bin!("sampd"))
        .arg("config")
        .arg("--dir")
        .arg(temp.path())
        .assert()
        .failure()
        .stderr(contains("ConfigMissingOrUnreadable"));
}

#[test]
fn run_forwards_stdin_and_prints_server_output() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(
        temp.path(),
        "echo 'SA-MP Dedicated Server'\nread line\necho \"got $line\"\nsleep 1\nexit 0",
    );

    Command::new(assert_cmd::cargo::cargo_bin!("sampd"))
        .args(["--log-level", "off", "run", "--console", "--binary"])
        .arg(&binary)
        .write_stdin("say hello\n")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("SA-MP Dedicated Server"))
        .stdout(contains("got say hello"));
}

#[test]
fn temp_serves_from_a_provisioned_workspace() {
    let bin_dir = tempdir().expect("failed to create tempdir");
    let amx = bin_dir.path().join("bare.amx");
    fs::write(&amx, b"amx").unwrap();
    let binary = fake_server(
        bin_dir.path(),
        "cat server.cfg\nread line\nsleep 1\nexit 0",
    );

    Command::new(assert_cmd::cargo::cargo_bin!("sampd"))
        .args(["--log-level", "off", "temp", "--console", "--port", "7801"])
        .args(["--hostname", "ephemeral"])
        .arg("--binary")
        .arg(&binary)
        .arg("--gamemode")
        .arg(&amx)
        .write_stdin("quit\n")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(contains("port 7801"))
        .stdout(contains("hostname ephemeral"))
        .stdout(contains("gamemode0 ../gm 1"));
}

#[test]
fn run_exits_with_an_error_when_the_server_dies_during_startup() {
    let temp = tempdir().expect("failed to create tempdir");
    write_config(temp.path(), "port 7777\n");
    let binary = fake_server(temp.path(), "exit 4");

    Command::new(assert_cmd::cargo::cargo_bin!("sampd"))
        .args(["--log-level", "off", "run", "--console", "--binary"])
        .arg(&binary)
        .write_stdin("")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure()
        .stderr(contains("exit code: Some(4)"));
}
