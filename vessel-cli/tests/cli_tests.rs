use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use std::time::{Duration, Instant};

fn vessel() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_vessel"));
    for var in [
        "VESSEL_STATE_DIR",
        "VESSEL_CGROUP_ROOT",
        "VESSEL_ISOLATION",
        "VESSEL_BRIDGE",
        "VESSEL_SUBNET",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// `vessel` pointed at `state` in simulation mode
fn simulated(state: &Path) -> Command {
    let mut cmd = vessel();
    cmd.arg("--state-dir")
        .arg(state)
        .arg("--isolation")
        .arg("simulated");
    cmd
}

#[test]
fn test_help_command() {
    vessel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Single-host container runtime"))
        .stdout(predicate::str::contains("Commands:"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("ps"))
        .stdout(predicate::str::contains("logs"))
        .stdout(predicate::str::contains("rm"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_version_flag() {
    vessel()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vessel"));
}

#[test]
fn test_version_command() {
    vessel()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("Vessel Container Runtime"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_invalid_command() {
    vessel()
        .arg("invalid")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_run_without_name() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["run", "--", "sleep", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--name is required"));
}

#[test]
fn test_run_without_command() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["run", "--name", "empty"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("a command is required"));
}

#[test]
fn test_run_rejects_bad_port() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["run", "--name", "web", "-p", "0:80", "--", "sleep", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid port"));
}

#[test]
fn test_run_rejects_unknown_restart_policy() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["run", "--name", "web", "--restart", "sometimes", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown restart policy"));
}

#[test]
fn test_unknown_isolation_mode() {
    vessel()
        .args(["--isolation", "sideways", "ps"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown isolation mode"));
}

#[test]
fn test_ps_on_empty_state() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME"))
        .stdout(predicate::str::contains("No containers"));
}

#[test]
fn test_logs_of_unknown_container() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["logs", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such container: ghost"));
}

#[test]
fn test_stop_and_inspect_of_unknown_container() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["stop", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such container: ghost"));

    simulated(state.path())
        .args(["inspect", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No such container: ghost"));
}

/// Status of `name` as reported by `vessel inspect`
fn inspected_status(state: &Path, name: &str) -> Option<String> {
    let output = simulated(state).args(["inspect", name]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    record["status"].as_str().map(str::to_string)
}

#[test]
fn test_stop_reaches_a_container_run_elsewhere() {
    let state = tempfile::tempdir().unwrap();
    let mut supervisor = std::process::Command::new(env!("CARGO_BIN_EXE_vessel"))
        .env_remove("VESSEL_STATE_DIR")
        .env_remove("VESSEL_ISOLATION")
        .arg("--state-dir")
        .arg(state.path())
        .args(["--isolation", "simulated", "run", "--name", "long", "--", "sleep", "60"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    while inspected_status(state.path(), "long").as_deref() != Some("Running") {
        assert!(Instant::now() < deadline, "container never reported Running");
        std::thread::sleep(Duration::from_millis(100));
    }

    simulated(state.path())
        .args(["stop", "long"])
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("long: Stopped"));

    let deadline = Instant::now() + Duration::from_secs(15);
    let exited = loop {
        if let Some(status) = supervisor.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            supervisor.kill().unwrap();
            panic!("supervising process kept running after stop");
        }
        std::thread::sleep(Duration::from_millis(100));
    };
    assert!(exited.success());
    assert_eq!(inspected_status(state.path(), "long").as_deref(), Some("Stopped"));
}

#[test]
fn test_check_reports_host() {
    vessel()
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("cgroup"))
        .stdout(predicate::str::contains("namespace"))
        .stdout(predicate::str::contains("binaries"));
}

#[test]
fn test_run_logs_ps_rm_cycle() {
    let state = tempfile::tempdir().unwrap();

    simulated(state.path())
        .args(["run", "--name", "hello", "-e", "GREETING=hi", "--", "sh", "-c", "echo $GREETING from vessel"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("hello: Stopped"));

    simulated(state.path())
        .args(["logs", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi from vessel"))
        .stdout(predicate::str::contains("exited with code 0"));

    simulated(state.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("Stopped"));

    let output = simulated(state.path())
        .args(["inspect", "hello"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let record: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(record["name"], "hello");
    assert_eq!(record["status"], "Stopped");
    assert_eq!(record["restart_count"], 0);
    assert!(record["id"].as_str().is_some_and(|id| !id.is_empty()));

    simulated(state.path())
        .args(["stop", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello: Stopped"));

    simulated(state.path())
        .args(["rm", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed hello"));

    assert!(!state.path().join("containers/hello").exists());
    simulated(state.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("No containers"));
}

#[test]
fn test_run_reports_missing_command_binary() {
    let state = tempfile::tempdir().unwrap();
    simulated(state.path())
        .args(["run", "--name", "broken", "--", "vessel-no-such-binary"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to start container 'broken'"));

    simulated(state.path())
        .arg("ps")
        .assert()
        .success()
        .stdout(predicate::str::contains("Error"));
}

#[test]
#[ignore = "requires root"]
fn test_isolated_run_as_root() {
    let state = tempfile::tempdir().unwrap();
    vessel()
        .arg("--state-dir")
        .arg(state.path())
        .args(["--isolation", "isolated", "run", "--name", "iso", "--", "/bin/true"])
        .assert()
        .success();
}
