//! Entering a running container's namespaces

use vessel_core::ProcessId;

/// Arguments that run `command` inside the namespaces and root of `pid`
///
/// Joins the PID, mount, network, UTS and IPC namespaces and the target's
/// root directory, then runs the command through `/bin/sh -c`.
#[must_use]
pub fn nsenter_args(pid: ProcessId, command: &str) -> Vec<String> {
    vec![
        "nsenter".to_string(),
        "-t".to_string(),
        pid.to_string(),
        "-p".to_string(),
        "-m".to_string(),
        "-n".to_string(),
        "-u".to_string(),
        "-i".to_string(),
        "-r".to_string(),
        "--".to_string(),
        "/bin/sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}
