//! Background tasks attached to a running container
//!
//! Every task receives the run's cancellation channel and returns once it
//! fires, once the sender is dropped, or once its container moved on to a
//! newer run.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vessel_cgroup::CgroupHandle;
use vessel_core::{
    ContainerStatus, HealthCheckSpec, HealthStatus, LifecycleKind, ProcessId, RestartPolicy,
};

use crate::container::Inner;
use crate::sampler::{CpuSample, ProcStat};

/// Ceiling on `unless-stopped` restarts
pub const MAX_AUTO_RESTARTS: u32 = 10;

/// Sleep for `period`; false if cancelled first
async fn sleep_or_cancel(cancel: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.wait_for(|stop| *stop) => false,
        () = tokio::time::sleep(period) => true,
    }
}

/// Wait for the spawned process and report its exit
pub(crate) async fn watch_exit(
    inner: Arc<Inner>,
    mut child: Child,
    pid: ProcessId,
    generation: u64,
    exited: watch::Sender<Option<i32>>,
) {
    let code = match child.wait().await {
        Ok(status) => status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1),
        Err(e) => {
            warn!(container = %inner.spec.name, pid = %pid, error = %e, "Lost track of process");
            -1
        }
    };

    inner.ctx.platform.children().untrack(pid);
    if let Err(e) = inner.log.exit_marker(code) {
        debug!(container = %inner.spec.name, error = %e, "Cannot write exit marker");
    }
    debug!(container = %inner.spec.name, pid = %pid, code, "Process exited");
    exited.send_replace(Some(code));

    inner.handle_exit(generation, Some(code)).await;
}

/// Poll a process the supervisor did not spawn until it disappears
pub(crate) async fn watch_adopted(
    inner: Arc<Inner>,
    pid: ProcessId,
    generation: u64,
    mut cancel: watch::Receiver<bool>,
) {
    let poll = inner.ctx.timings.sample_interval;
    while pid.is_alive() {
        if !sleep_or_cancel(&mut cancel, poll).await {
            return;
        }
    }
    inner.handle_exit(generation, None).await;
}

/// Sample CPU and memory, enforcing the memory limit
///
/// Memory is what the cgroup charges when there is one, and the RSS summed
/// over the process tree otherwise.
pub(crate) async fn resource_monitor(
    inner: Arc<Inner>,
    generation: u64,
    pid: ProcessId,
    cgroup: Option<CgroupHandle>,
    mut cancel: watch::Receiver<bool>,
) {
    let name = inner.spec.name.clone();
    let memory_limit = inner.spec.memory_limit().as_mb();
    let cpu_limit = inner.spec.cpu_limit().as_f64();
    let mut previous: Option<CpuSample> = None;

    while sleep_or_cancel(&mut cancel, inner.ctx.timings.sample_interval).await {
        if inner.status() == ContainerStatus::Paused {
            continue;
        }
        let Ok(stat) = ProcStat::read_tree(pid) else {
            debug!(container = %name, pid = %pid, "Process gone, resource monitor done");
            return;
        };
        if stat.is_zombie() {
            continue;
        }

        let sample = CpuSample::now(&stat);
        let cpu = previous.map_or(0.0, |before| before.percent_until(&sample));
        previous = Some(sample);
        let charged = match &cgroup {
            Some(handle) => inner.ctx.platform.resources().memory_usage(handle).await.ok(),
            None => None,
        };
        #[allow(clippy::cast_precision_loss)]
        let memory = charged.unwrap_or_else(|| stat.rss_bytes()) as f64 / (1024.0 * 1024.0);
        inner.store_usage(cpu, memory);

        let uptime = inner.uptime().map_or(0, |d| d.as_secs());
        inner.notify(
            &format!("Usage: {memory:.1} MB RAM, {cpu:.1}% CPU, Uptime: {uptime}s"),
            None,
        );

        if memory > memory_limit {
            warn!(container = %name, memory_mb = memory, limit_mb = memory_limit, "Memory limit exceeded");
            inner.notify("Memory limit exceeded! Stopping container.", None);
            inner.enforce_memory_limit(generation).await;
            return;
        }
        if cpu > cpu_limit {
            inner.notify(&format!("CPU usage high ({cpu:.1}%)"), None);
        }
    }
}

/// Outcome of one probe
enum Probe {
    Passed,
    Failed,
    TimedOut,
}

async fn probe(check: &HealthCheckSpec) -> Probe {
    let run = Command::new("/bin/sh")
        .arg("-c")
        .arg(&check.cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(check.timeout, run).await {
        Ok(Ok(status)) if status.success() => Probe::Passed,
        Ok(Ok(_)) => Probe::Failed,
        Ok(Err(e)) => {
            debug!(command = %check.cmd, error = %e, "Health probe could not run");
            Probe::Failed
        }
        Err(_) => Probe::TimedOut,
    }
}

/// Run the health probe on its interval
///
/// `retries` consecutive failures mark the container unhealthy once per
/// streak; under `on-failure` that triggers a single restart.
pub(crate) async fn health_loop(
    inner: Arc<Inner>,
    generation: u64,
    check: HealthCheckSpec,
    mut cancel: watch::Receiver<bool>,
) {
    let mut failures = 0_u32;
    let mut reported = false;

    while sleep_or_cancel(&mut cancel, check.interval).await {
        match inner.status() {
            ContainerStatus::Paused => continue,
            ContainerStatus::Running => {}
            _ => return,
        }

        match probe(&check).await {
            Probe::Passed => {
                failures = 0;
                reported = false;
                if inner.set_health(HealthStatus::Healthy) {
                    inner.notify("Container is healthy", None);
                }
                continue;
            }
            Probe::TimedOut => {
                inner.note_health_probe();
                inner.notify("Health check timed out", None);
            }
            Probe::Failed => inner.note_health_probe(),
        }
        failures += 1;
        debug!(container = %inner.spec.name, failures, retries = check.retries, "Health probe failed");

        if failures < check.retries || reported {
            continue;
        }
        if !inner.is_current(generation) {
            return;
        }
        reported = true;
        inner.set_health(HealthStatus::Unhealthy);
        inner.record_event(LifecycleKind::Unhealthy);
        inner.notify(
            &format!("Container is unhealthy (failed {failures} times)"),
            None,
        );

        if inner.spec.restart_policy == RestartPolicy::OnFailure {
            inner.health_restart(generation).await;
            return;
        }
    }
}

/// Poll cgroup counters for OOM kills and throttling
pub(crate) async fn violation_monitor(
    inner: Arc<Inner>,
    handle: CgroupHandle,
    mut cancel: watch::Receiver<bool>,
) {
    while sleep_or_cancel(&mut cancel, inner.ctx.timings.violation_poll).await {
        match inner.ctx.platform.resources().violations(&handle).await {
            Ok(stats) => {
                if inner.note_violations(stats) {
                    return;
                }
            }
            Err(e) => debug!(container = %inner.spec.name, error = %e, "Cannot read cgroup counters"),
        }
    }
}

/// Restart a stopped container according to its policy
///
/// Runs until cancelled by a user stop or remove. `on-failure` is handled by
/// the health loop and never restarted from here.
pub(crate) async fn restart_monitor(inner: Arc<Inner>, mut cancel: watch::Receiver<bool>) {
    let policy = inner.spec.restart_policy;
    let timings = inner.ctx.timings;

    while sleep_or_cancel(&mut cancel, timings.restart_poll).await {
        match inner.status() {
            ContainerStatus::Stopped => {}
            ContainerStatus::Error => {
                info!(container = %inner.spec.name, "Container in error state, restart policy stands down");
                return;
            }
            _ => continue,
        }

        match policy {
            RestartPolicy::Always => {}
            RestartPolicy::UnlessStopped if inner.restart_count() < MAX_AUTO_RESTARTS => {}
            RestartPolicy::UnlessStopped => {
                inner.notify(
                    &format!("Restart limit reached ({MAX_AUTO_RESTARTS} restarts)"),
                    None,
                );
                return;
            }
            RestartPolicy::OnFailure | RestartPolicy::None => continue,
        }

        inner.notify(&format!("Restarting container ({policy} policy)..."), None);
        if !sleep_or_cancel(&mut cancel, timings.policy_restart_delay).await {
            return;
        }
        inner.policy_restart(&cancel).await;
    }
}
