//! Process supervisor
//!
//! A [`Container`] owns at most one OS process at a time and keeps the
//! state machine below consistent with it:
//!
//! ```text
//! Created ──start──▶ Running ◀──resume── Paused
//!    │                 │  ▲ └───pause────▶ │
//!    │               stop│ │start           │stop
//!    │                 ▼  │                 ▼
//!    └──start fails──▶ Error ──start──▶ ... Stopped
//! ```
//!
//! `start`, `stop`, `pause`, `resume` and `restart` are serialized by a
//! per-container operation lock. Each run gets a generation number and a
//! cancellation channel; monitors belonging to an older run exit as soon as
//! they notice the generation changed or the channel fired.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vessel_cgroup::{CgroupHandle, ResourceLimits, ViolationStats};
use vessel_core::{
    ContainerId, ContainerRecord, ContainerSpec, ContainerStatus, Error, HealthStatus,
    LifecycleEvent, LifecycleKind, LifecycleLog, Metrics, ProcessId, RestartPolicy, Result,
};
use vessel_namespace::{SpawnCommand, namespace_leader, nsenter_args};

use crate::config::SupervisorTimings;
use crate::logfile::ContainerLog;
use crate::monitors;
use crate::observer::Observers;
use crate::platform::Platform;
use crate::sampler;
use crate::store::MetadataStore;

/// How long to wait for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Poll period for processes the supervisor did not spawn itself
const ADOPTED_POLL: Duration = Duration::from_millis(50);

type BoxedStart<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Everything a container needs from the runtime around it
#[derive(Clone)]
pub struct SupervisorContext {
    /// Host strategy
    pub platform: Platform,
    /// Supervisor intervals
    pub timings: SupervisorTimings,
    /// Notification sinks
    pub observers: Observers,
    /// Metadata store updated on every status change
    pub store: Option<Arc<dyn MetadataStore>>,
}

impl std::fmt::Debug for SupervisorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorContext")
            .field("platform", &self.platform)
            .field("timings", &self.timings)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

/// Captured result of [`Container::exec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, `-1` if killed by a signal
    pub exit_code: i32,
    /// Captured stdout (empty for interactive sessions)
    pub stdout: String,
    /// Captured stderr (empty for interactive sessions)
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// SIGTERM, grace period, then SIGKILL
    Graceful,
    /// SIGKILL straight away
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseMethod {
    Freezer,
    Signal,
}

/// Resources held by one run of the process
struct Run {
    generation: u64,
    cancel: watch::Sender<bool>,
    /// Exit code channel; `None` for adopted processes
    exited: Option<watch::Receiver<Option<i32>>>,
    cgroup: Option<CgroupHandle>,
    /// Volume targets bound for this run
    volumes: Vec<PathBuf>,
    netns: bool,
    paused_by: Option<PauseMethod>,
}

impl Run {
    /// Resources an earlier runtime left for `spec`, rebuilt from names
    ///
    /// The cgroup is taken over only if its directory still exists; the
    /// network namespace is registered with the manager so it can be removed.
    fn inherited(
        spec: &ContainerSpec,
        platform: &Platform,
        generation: u64,
    ) -> (Self, watch::Receiver<bool>) {
        let (cancel, cancel_rx) = watch::channel(false);
        let netns = spec.isolation.network_namespace && platform.is_isolated();
        if netns {
            platform.network().adopt_namespace(&spec.name);
        }
        let run = Self {
            generation,
            cancel,
            exited: None,
            cgroup: platform.resources().existing(&spec.name),
            volumes: platform.builder().bound_volumes(spec),
            netns,
            paused_by: None,
        };
        (run, cancel_rx)
    }
}

struct State {
    status: ContainerStatus,
    pid: Option<ProcessId>,
    run: Option<Run>,
    generation: u64,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    running_since: Option<Instant>,
    restart_count: u32,
    health: HealthStatus,
    last_health_check: Option<DateTime<Utc>>,
    metrics: Metrics,
    events: LifecycleLog,
    oom_detected: bool,
    cpu_throttled: bool,
    policy: Option<watch::Sender<bool>>,
    /// Resources of a run whose process died while no runtime watched it
    stale: Option<Run>,
    /// Set once the container is being removed; it can no longer start
    retired: bool,
}

impl State {
    fn new(status: ContainerStatus) -> Self {
        Self {
            status,
            pid: None,
            run: None,
            generation: 0,
            started_at: None,
            stopped_at: None,
            running_since: None,
            restart_count: 0,
            health: HealthStatus::Unknown,
            last_health_check: None,
            metrics: Metrics::default(),
            events: LifecycleLog::new(),
            oom_detected: false,
            cpu_throttled: false,
            policy: None,
            stale: None,
            retired: false,
        }
    }

    fn cancel_policy(&mut self) {
        if let Some(policy) = self.policy.take() {
            let _ = policy.send(true);
        }
    }

    fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.running_since = None;
    }
}

pub(crate) struct Inner {
    pub(crate) id: ContainerId,
    pub(crate) spec: ContainerSpec,
    pub(crate) log: ContainerLog,
    pub(crate) ctx: SupervisorContext,
    created_at: DateTime<Utc>,
    ops: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// Supervisor for one container
///
/// Cheap to clone; clones share the same process and state.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl Container {
    /// Supervisor for a freshly created container
    #[must_use]
    pub fn new(id: ContainerId, spec: ContainerSpec, ctx: SupervisorContext) -> Self {
        let log = ContainerLog::for_rootfs(&spec.rootfs);
        let state = State::new(ContainerStatus::Created);
        let container = Self::assemble(id, spec, log, ctx, Utc::now(), state);

        container.inner.record_event(LifecycleKind::Created);
        container.inner.notify(
            &format!("Container created: {}", container.inner.id),
            Some(ContainerStatus::Created),
        );
        container
    }

    /// Supervisor rebuilt from a persisted record
    ///
    /// A record claiming a live process whose PID is gone is reconciled to
    /// `Stopped`. A process that is still alive is adopted: it can be
    /// stopped, its usage is sampled and its exit is noticed by polling.
    /// Either way the cgroup, volume mounts and network namespace the earlier
    /// run held are taken over so they are released like any other run's.
    #[must_use]
    pub fn restore(record: ContainerRecord, ctx: SupervisorContext) -> Self {
        let adopted = record
            .pid
            .map(ProcessId::from_raw)
            .filter(|pid| record.status.has_process() && pid.is_alive());

        let mut state = State::new(record.status);
        state.started_at = record.started_at;
        state.stopped_at = record.stopped_at;
        state.restart_count = record.restart_count;

        let mut adopted_run = None;
        match adopted {
            Some(pid) => {
                let (mut run, cancel_rx) = Run::inherited(&record.spec, &ctx.platform, 1);
                run.paused_by =
                    (record.status == ContainerStatus::Paused).then_some(PauseMethod::Signal);
                adopted_run = Some((pid, run.cgroup.clone(), cancel_rx));
                state.generation = 1;
                state.pid = Some(pid);
                state.running_since = Some(Instant::now());
                state.run = Some(run);
            }
            None if record.status.has_process() => {
                let (run, _) = Run::inherited(&record.spec, &ctx.platform, 0);
                state.stale = Some(run);
                state.mark_stopped();
            }
            None => {}
        }

        let reconciled = record.status != state.status;
        let log = ContainerLog::new(record.log_file);
        let container = Self::assemble(record.id, record.spec, log, ctx, record.created_at, state);
        let runtime = tokio::runtime::Handle::try_current().ok();

        if let Some((pid, cgroup, cancel)) = adopted_run {
            info!(container = %container.name(), pid = %pid, "Adopted running process");
            if let Some(runtime) = &runtime {
                let inner = &container.inner;
                runtime.spawn(monitors::watch_adopted(
                    Arc::clone(inner),
                    pid,
                    1,
                    cancel.clone(),
                ));
                runtime.spawn(monitors::resource_monitor(
                    Arc::clone(inner),
                    1,
                    pid,
                    cgroup.clone(),
                    cancel.clone(),
                ));
                if let Some(handle) = cgroup {
                    runtime.spawn(monitors::violation_monitor(Arc::clone(inner), handle, cancel));
                }
            }
        }
        if reconciled {
            info!(container = %container.name(), "Process gone, marked stopped");
            container.inner.persist();
            if let Some(runtime) = &runtime {
                let inner = Arc::clone(&container.inner);
                runtime.spawn(async move {
                    let _ops = inner.ops.lock().await;
                    inner.release_stale().await;
                });
            }
        }
        container
    }

    fn assemble(
        id: ContainerId,
        spec: ContainerSpec,
        log: ContainerLog,
        ctx: SupervisorContext,
        created_at: DateTime<Utc>,
        state: State,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                spec,
                log,
                ctx,
                created_at,
                ops: tokio::sync::Mutex::new(()),
                state: Mutex::new(state),
            }),
        }
    }

    /// Container ID
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    /// Container name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Specification the container was created from
    #[must_use]
    pub fn spec(&self) -> &ContainerSpec {
        &self.inner.spec
    }

    /// Path of the log file
    #[must_use]
    pub fn log_path(&self) -> &Path {
        self.inner.log.path()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.inner.status()
    }

    /// PID of the live process
    #[must_use]
    pub fn pid(&self) -> Option<ProcessId> {
        self.inner.state().pid
    }

    /// Automatic restarts performed so far
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count()
    }

    /// Health derived from the most recent probes
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.inner.state().health
    }

    /// Time of the most recent health probe
    #[must_use]
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.inner.state().last_health_check
    }

    /// Latest metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.inner.state().metrics
    }

    /// Whether a kernel OOM kill was seen during the current run
    #[must_use]
    pub fn oom_detected(&self) -> bool {
        self.inner.state().oom_detected
    }

    /// Whether CPU throttling was seen during the current run
    #[must_use]
    pub fn cpu_throttled(&self) -> bool {
        self.inner.state().cpu_throttled
    }

    /// Time since the current run started
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.inner.uptime()
    }

    /// Copy of the lifecycle timeline, oldest first
    #[must_use]
    pub fn lifecycle(&self) -> Vec<LifecycleEvent> {
        self.inner.state().events.snapshot()
    }

    /// Metadata record reflecting the current state
    #[must_use]
    pub fn record(&self) -> ContainerRecord {
        self.inner.record()
    }

    /// Launch the process
    ///
    /// A no-op if a process is already running. Cgroup and network namespace
    /// failures are logged and the container runs without them; any other
    /// failure moves the container to `Error`.
    ///
    /// # Errors
    /// Returns the cause of a failed start (port conflict, missing rootfs,
    /// bad command, spawn failure)
    pub async fn start(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.start_locked().await
    }

    /// Terminate the process and release everything it held
    ///
    /// Also ends the restart-policy monitor: a stopped container stays
    /// stopped until started again.
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub async fn stop(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.state().cancel_policy();
        self.inner.stop_locked(StopMode::Graceful).await
    }

    /// Stop, wait briefly, start again
    ///
    /// # Errors
    /// Returns error if the stop or the start fails
    pub async fn restart(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.notify("Restarting container...", None);
        self.inner.stop_locked(StopMode::Graceful).await?;
        tokio::time::sleep(self.inner.ctx.timings.manual_restart_delay).await;
        self.inner.start_locked().await
    }

    /// Freeze the process
    ///
    /// Uses the cgroup freezer when available and SIGSTOP otherwise.
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub async fn pause(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.pause_locked().await
    }

    /// Thaw a paused process
    ///
    /// # Errors
    /// Returns error if the process cannot be signalled
    pub async fn resume(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.resume_locked().await
    }

    /// Run `command` inside the container's namespaces
    ///
    /// Interactive sessions inherit the caller's terminal and capture nothing.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] in simulation mode,
    /// [`Error::InvalidState`] if the container is not running and
    /// [`Error::Timeout`] if the command outlives the exec timeout
    pub async fn exec(&self, command: &str, interactive: bool) -> Result<ExecOutput> {
        let inner = &self.inner;
        if !inner.ctx.platform.is_isolated() {
            return Err(Error::Unsupported {
                operation: "exec without namespace isolation".to_string(),
            });
        }

        let pid = {
            let state = inner.state();
            state
                .pid
                .filter(|_| state.status == ContainerStatus::Running)
                .ok_or_else(|| Error::InvalidState {
                    message: format!("container {} is not running", inner.spec.name),
                })?
        };

        let argv = nsenter_args(namespace_leader(pid), command);
        let (program, args) = argv.split_first().ok_or_else(|| Error::InvalidCommand {
            message: "empty exec command".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        debug!(container = %inner.spec.name, command, interactive, "Exec");
        let limit = inner.ctx.timings.exec_timeout;
        let timed_out = || Error::Timeout {
            operation: format!("exec '{command}'"),
        };

        if interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = tokio::time::timeout(limit, cmd.status())
                .await
                .map_err(|_| timed_out())??;
            return Ok(ExecOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| timed_out())??;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Refresh the metrics snapshot; a no-op without a live process
    ///
    /// Memory comes from the cgroup when the run has one.
    pub async fn update_metrics(&self) {
        let Some(pid) = self.inner.live_pid() else {
            return;
        };
        let window = self.inner.ctx.timings.cpu_window;
        let mut metrics = match sampler::sample_metrics(pid, window).await {
            Ok(metrics) => metrics,
            Err(e) => {
                debug!(container = %self.name(), error = %e, "Metrics unavailable");
                return;
            }
        };
        if let Some(handle) = self.inner.cgroup() {
            if let Ok(bytes) = self.inner.ctx.platform.resources().memory_usage(&handle).await {
                #[allow(clippy::cast_precision_loss)]
                let memory_mb = bytes as f64 / (1024.0 * 1024.0);
                metrics.memory_mb = memory_mb;
            }
        }
        self.inner.state().metrics = metrics;
    }

    /// Last `tail` lines of the log file
    #[must_use]
    pub fn get_logs(&self, tail: usize) -> String {
        self.inner.log.tail(tail)
    }

    /// Take a container without a process out of service
    ///
    /// Ends the restart-policy monitor, releases anything an earlier runtime
    /// left behind and makes every later start fail. Returns the status seen
    /// under the operation lock; containers that are running or paused are
    /// left alone.
    pub(crate) async fn retire(&self) -> ContainerStatus {
        let _ops = self.inner.ops.lock().await;
        let status = {
            let mut state = self.inner.state();
            if !state.status.has_process() {
                state.cancel_policy();
                state.retired = true;
            }
            state.status
        };
        if !status.has_process() {
            self.inner.release_stale().await;
        }
        status
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("name", &self.inner.spec.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn status(&self) -> ContainerStatus {
        self.state().status
    }

    pub(crate) fn restart_count(&self) -> u32 {
        self.state().restart_count
    }

    pub(crate) fn uptime(&self) -> Option<Duration> {
        self.state().running_since.map(|since| since.elapsed())
    }

    /// PID of a process in `Running` or `Paused`
    fn live_pid(&self) -> Option<ProcessId> {
        let state = self.state();
        state.pid.filter(|_| state.status.has_process())
    }

    /// Cgroup of the current run
    fn cgroup(&self) -> Option<CgroupHandle> {
        self.state().run.as_ref().and_then(|run| run.cgroup.clone())
    }

    /// Whether `generation` is still the current run
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.state()
            .run
            .as_ref()
            .is_some_and(|run| run.generation == generation)
    }

    /// Log line plus observer fan-out
    pub(crate) fn notify(&self, message: &str, status: Option<ContainerStatus>) {
        if let Err(e) = self.log.line(message) {
            debug!(container = %self.spec.name, error = %e, "Cannot write log line");
        }
        self.ctx.observers.emit(&self.spec.name, message, status);
    }

    pub(crate) fn record_event(&self, kind: LifecycleKind) {
        let mut state = self.state();
        let status = state.status;
        state.events.record(kind, status).emit_trace(&self.spec.name);
    }

    fn record(&self) -> ContainerRecord {
        let state = self.state();
        ContainerRecord {
            id: self.id.clone(),
            spec: self.spec.clone(),
            status: state.status,
            created_at: self.created_at,
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            pid: state.pid.map(ProcessId::as_raw),
            restart_count: state.restart_count,
            log_file: self.log.path().to_path_buf(),
        }
    }

    pub(crate) fn persist(&self) {
        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.save(&self.record()) {
                warn!(container = %self.spec.name, error = %e, "Cannot persist container record");
            }
        }
    }

    /// Whether a live process already belongs to this container
    ///
    /// A recorded process that has vanished is cleaned up on the way.
    async fn reconcile_running(&self) -> bool {
        let stale = {
            let mut state = self.state();
            match state.pid {
                Some(pid) if state.status.has_process() => {
                    if pid.is_alive() {
                        return true;
                    }
                    state.mark_stopped();
                    state.run.take()
                }
                _ => None,
            }
        };
        if let Some(run) = stale {
            let _ = run.cancel.send(true);
            self.release(&run).await;
        }
        false
    }

    pub(crate) async fn start_locked(self: &Arc<Self>) -> Result<()> {
        if self.state().retired {
            return Err(Error::InvalidState {
                message: format!("container {} has been removed", self.spec.name),
            });
        }
        self.release_stale().await;
        if self.reconcile_running().await {
            self.notify("Already running!", None);
            return Ok(());
        }

        let name = &self.spec.name;
        let platform = self.ctx.platform.clone();
        self.notify(&format!("Starting container: {}", self.spec.command), None);

        let cgroup = match platform
            .resources()
            .setup(name, &ResourceLimits::from_spec(&self.spec))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(container = %name, error = %e, "Running without resource limits");
                self.notify(&format!("Resource limits not applied: {e}"), None);
                None
            }
        };

        let (child, spawn, pid) = match self.launch().await {
            Ok(launched) => launched,
            Err(e) => {
                if let Some(handle) = &cgroup {
                    platform.resources().teardown(handle).await.log(name, "cgroup");
                }
                return Err(self.fail_start(e));
            }
        };
        platform.children().track(pid);

        if let Some(handle) = &cgroup {
            if let Err(e) = platform.resources().attach(handle, pid).await {
                warn!(container = %name, pid = %pid, error = %e, "Cannot attach process to cgroup");
                self.notify(&format!("Resource limits not applied: {e}"), None);
            }
        }

        let netns = if self.spec.isolation.network_namespace && platform.is_isolated() {
            match platform.network().setup_namespace(name, pid).await {
                Ok(endpoint) => {
                    self.notify(
                        &format!("Network ready: {} in {}", endpoint.ip, endpoint.netns),
                        None,
                    );
                    true
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Running without network namespace");
                    self.notify(&format!("Network isolation not applied: {e}"), None);
                    false
                }
            }
        } else {
            false
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);
        let generation = {
            let mut state = self.state();
            let generation = state.generation + 1;
            state.generation = generation;
            state.status = ContainerStatus::Running;
            state.pid = Some(pid);
            state.started_at = Some(Utc::now());
            state.running_since = Some(Instant::now());
            state.health = if self.spec.health_check.is_some() {
                HealthStatus::Starting
            } else {
                HealthStatus::Unknown
            };
            state.oom_detected = false;
            state.cpu_throttled = false;
            state.metrics = Metrics::default();
            state.run = Some(Run {
                generation,
                cancel,
                exited: Some(exit_rx),
                cgroup: cgroup.clone(),
                volumes: spawn.volumes,
                netns,
                paused_by: None,
            });
            generation
        };

        self.record_event(LifecycleKind::Started);
        self.notify(
            &format!("Container started with PID: {pid}"),
            Some(ContainerStatus::Running),
        );
        self.persist();

        tokio::spawn(monitors::watch_exit(
            Arc::clone(self),
            child,
            pid,
            generation,
            exit_tx,
        ));
        tokio::spawn(monitors::resource_monitor(
            Arc::clone(self),
            generation,
            pid,
            cgroup.clone(),
            cancel_rx.clone(),
        ));
        if let Some(check) = self.spec.health_check.clone() {
            tokio::spawn(monitors::health_loop(
                Arc::clone(self),
                generation,
                check,
                cancel_rx.clone(),
            ));
        }
        if let Some(handle) = cgroup {
            tokio::spawn(monitors::violation_monitor(
                Arc::clone(self),
                handle,
                cancel_rx,
            ));
        }
        platform.ensure_reaper(self.ctx.timings.reaper_poll);
        self.ensure_policy_monitor();

        Ok(())
    }

    /// [`Inner::start_locked`] behind a type-erased future
    ///
    /// Monitors spawned by a start may start the container again; erasing the
    /// type breaks the cycle between the two futures.
    fn start_boxed(self: &Arc<Self>) -> BoxedStart<'_> {
        Box::pin(self.start_locked())
    }

    /// Bind ports, build the command and spawn it, undoing earlier steps on
    /// failure
    async fn launch(&self) -> Result<(Child, SpawnCommand, ProcessId)> {
        let name = &self.spec.name;
        let platform = &self.ctx.platform;

        platform.network().bind_ports(name, &self.spec.ports).await?;

        let spawn = match platform.builder().build(&self.spec) {
            Ok(spawn) => spawn,
            Err(e) => {
                platform.network().release_ports(name).await.log(name, "ports");
                return Err(e);
            }
        };

        match self.spawn_process(&spawn) {
            Ok((child, pid)) => Ok((child, spawn, pid)),
            Err(e) => {
                platform.builder().release(&spawn.volumes).log(name, "volumes");
                platform.network().release_ports(name).await.log(name, "ports");
                Err(e)
            }
        }
    }

    fn spawn_process(&self, spawn: &SpawnCommand) -> Result<(Child, ProcessId)> {
        self.log.banner(&self.id, &self.spec)?;
        let (stdout, stderr) = self.log.child_stdio()?;

        let child = Command::new(&spawn.program)
            .args(&spawn.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()?;

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(ProcessId::from_raw)
            .ok_or_else(|| Error::InvalidState {
                message: "spawned process has no PID".to_string(),
            })?;

        debug!(container = %self.spec.name, pid = %pid, command = %spawn, "Spawned container process");
        Ok((child, pid))
    }

    fn fail_start(&self, error: Error) -> Error {
        {
            let mut state = self.state();
            state.status = ContainerStatus::Error;
            state.pid = None;
        }
        self.record_event(LifecycleKind::StartFailed);
        if let Err(e) = self.log.error_marker(&error.to_string()) {
            debug!(container = %self.spec.name, error = %e, "Cannot write error marker");
        }
        self.notify(
            &format!("Error starting container: {error}"),
            Some(ContainerStatus::Error),
        );
        self.persist();
        error
    }

    fn ensure_policy_monitor(self: &Arc<Self>) {
        if matches!(
            self.spec.restart_policy,
            RestartPolicy::None | RestartPolicy::OnFailure
        ) {
            return;
        }
        let cancel = {
            let mut state = self.state();
            if state.policy.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return;
            }
            let (tx, rx) = watch::channel(false);
            state.policy = Some(tx);
            rx
        };
        tokio::spawn(monitors::restart_monitor(Arc::clone(self), cancel));
    }

    pub(crate) async fn stop_locked(&self, mode: StopMode) -> Result<()> {
        let taken = {
            let mut state = self.state();
            match (state.pid, state.status.has_process()) {
                (Some(pid), true) => state.run.take().map(|run| (run, pid, state.status)),
                _ => None,
            }
        };

        let Some((run, pid, previous)) = taken else {
            self.release_stale().await;
            let changed = {
                let mut state = self.state();
                let changed = state.status != ContainerStatus::Stopped;
                if changed {
                    state.status = ContainerStatus::Stopped;
                    state.pid = None;
                }
                changed
            };
            self.notify("Container already stopped.", None);
            if changed {
                self.persist();
            }
            return Ok(());
        };

        self.notify("Stopping container...", None);
        let _ = run.cancel.send(true);

        if previous == ContainerStatus::Paused {
            self.unfreeze(&run, pid).await;
        }

        let signalled = match mode {
            StopMode::Graceful => {
                let sent = signal_group(pid, Signal::SIGTERM);
                if sent.is_ok() && wait_exit(&run, pid, self.ctx.timings.stop_grace).await {
                    sent
                } else {
                    debug!(container = %self.spec.name, pid = %pid, "Grace period expired, sending SIGKILL");
                    self.kill_and_wait(&run, pid).await
                }
            }
            StopMode::Force => self.kill_and_wait(&run, pid).await,
        };

        self.release(&run).await;
        self.state().mark_stopped();
        self.record_event(LifecycleKind::Stopped);
        self.notify("Container stopped.", Some(ContainerStatus::Stopped));
        self.persist();

        signalled
    }

    async fn kill_and_wait(&self, run: &Run, pid: ProcessId) -> Result<()> {
        signal_group(pid, Signal::SIGKILL)?;
        if !wait_exit(run, pid, KILL_WAIT).await {
            warn!(container = %self.spec.name, pid = %pid, "Process survived SIGKILL");
        }
        Ok(())
    }

    async fn unfreeze(&self, run: &Run, pid: ProcessId) {
        if let (Some(PauseMethod::Freezer), Some(handle)) = (run.paused_by, &run.cgroup) {
            if let Err(e) = self.ctx.platform.resources().thaw(handle).await {
                debug!(container = %self.spec.name, error = %e, "Thaw before stop failed");
            }
        }
        let _ = signal_group(pid, Signal::SIGCONT);
    }

    /// Best-effort release of everything a run held
    async fn release(&self, run: &Run) {
        let name = &self.spec.name;
        let platform = &self.ctx.platform;

        if let Some(handle) = &run.cgroup {
            platform.resources().teardown(handle).await.log(name, "cgroup");
        }
        if !run.volumes.is_empty() {
            platform.builder().release(&run.volumes).log(name, "volumes");
        }
        platform.network().release_ports(name).await.log(name, "ports");
        if run.netns {
            platform
                .network()
                .cleanup_namespace(name)
                .await
                .log(name, "network");
        }
    }

    /// Release what a run that died unwatched still held
    async fn release_stale(&self) {
        let stale = self.state().stale.take();
        if let Some(run) = stale {
            debug!(container = %self.spec.name, "Releasing resources of a vanished process");
            self.release(&run).await;
        }
    }

    /// Called once the process of `generation` has exited on its own
    pub(crate) async fn handle_exit(&self, generation: u64, code: Option<i32>) {
        let _ops = self.ops.lock().await;
        let run = {
            let mut state = self.state();
            if !state
                .run
                .as_ref()
                .is_some_and(|run| run.generation == generation)
            {
                return;
            }
            state.run.take()
        };
        let Some(run) = run else {
            return;
        };

        let _ = run.cancel.send(true);
        self.release(&run).await;
        self.state().mark_stopped();
        self.record_event(LifecycleKind::Exited);

        let message = match code {
            Some(code) => format!("Container process exited with code {code}"),
            None => "Container process exited".to_string(),
        };
        self.notify(&message, Some(ContainerStatus::Stopped));
        self.persist();
    }

    async fn pause_locked(&self) -> Result<()> {
        let target = {
            let state = self.state();
            match (state.status, state.pid, state.run.as_ref()) {
                (ContainerStatus::Running, Some(pid), Some(run)) => Some((pid, run.cgroup.clone())),
                _ => None,
            }
        };
        let Some((pid, cgroup)) = target else {
            self.notify("Cannot pause: container not running.", None);
            return Ok(());
        };

        let frozen = match &cgroup {
            Some(handle) => match self.ctx.platform.resources().freeze(handle).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(container = %self.spec.name, error = %e, "Freezer unavailable, using SIGSTOP");
                    false
                }
            },
            None => false,
        };
        let method = if frozen {
            PauseMethod::Freezer
        } else {
            signal_group(pid, Signal::SIGSTOP)?;
            PauseMethod::Signal
        };

        {
            let mut state = self.state();
            state.status = ContainerStatus::Paused;
            if let Some(run) = state.run.as_mut() {
                run.paused_by = Some(method);
            }
        }
        self.record_event(LifecycleKind::Paused);
        self.notify("Container paused.", Some(ContainerStatus::Paused));
        self.persist();
        Ok(())
    }

    async fn resume_locked(&self) -> Result<()> {
        let target = {
            let state = self.state();
            match (state.status, state.pid, state.run.as_ref()) {
                (ContainerStatus::Paused, Some(pid), Some(run)) => {
                    Some((pid, run.paused_by, run.cgroup.clone()))
                }
                _ => None,
            }
        };
        let Some((pid, method, cgroup)) = target else {
            self.notify("Cannot resume: container not paused.", None);
            return Ok(());
        };

        let thawed = match (method, &cgroup) {
            (Some(PauseMethod::Freezer), Some(handle)) => {
                match self.ctx.platform.resources().thaw(handle).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(container = %self.spec.name, error = %e, "Thaw failed, using SIGCONT");
                        false
                    }
                }
            }
            _ => false,
        };
        if !thawed {
            signal_group(pid, Signal::SIGCONT)?;
        }

        {
            let mut state = self.state();
            state.status = ContainerStatus::Running;
            if let Some(run) = state.run.as_mut() {
                run.paused_by = None;
            }
        }
        self.record_event(LifecycleKind::Resumed);
        self.notify("Container resumed.", Some(ContainerStatus::Running));
        self.persist();
        Ok(())
    }

    /// Kill a run that breached its memory limit
    pub(crate) async fn enforce_memory_limit(&self, generation: u64) {
        let _ops = self.ops.lock().await;
        if !self.is_current(generation) {
            return;
        }
        if let Err(e) = self.stop_locked(StopMode::Force).await {
            warn!(container = %self.spec.name, error = %e, "Forced stop failed");
        }
    }

    /// Stop and start a run declared unhealthy
    pub(crate) async fn health_restart(self: &Arc<Self>, generation: u64) {
        let _ops = self.ops.lock().await;
        if !self.is_current(generation) {
            return;
        }
        self.notify("Restarting container due to health check failure...", None);
        self.state().restart_count += 1;

        if let Err(e) = self.stop_locked(StopMode::Graceful).await {
            warn!(container = %self.spec.name, error = %e, "Stop before health restart failed");
        }
        tokio::time::sleep(self.ctx.timings.health_restart_delay).await;
        let _ = self.start_boxed().await;
    }

    /// Start a stopped container on behalf of its restart policy
    pub(crate) async fn policy_restart(self: &Arc<Self>, cancel: &watch::Receiver<bool>) {
        let _ops = self.ops.lock().await;
        if *cancel.borrow() || self.status() != ContainerStatus::Stopped {
            return;
        }
        self.state().restart_count += 1;
        let _ = self.start_boxed().await;
    }

    /// Update health; returns whether it changed
    pub(crate) fn set_health(&self, health: HealthStatus) -> bool {
        let mut state = self.state();
        state.last_health_check = Some(Utc::now());
        let changed = state.health != health;
        state.health = health;
        changed
    }

    pub(crate) fn note_health_probe(&self) {
        self.state().last_health_check = Some(Utc::now());
    }

    pub(crate) fn store_usage(&self, cpu_percent: f64, memory_mb: f64) {
        let mut state = self.state();
        state.metrics.cpu_percent = cpu_percent;
        state.metrics.memory_mb = memory_mb;
    }

    /// Raise the sticky violation flags; returns true once both are set
    pub(crate) fn note_violations(&self, stats: ViolationStats) -> bool {
        let (oom, throttled, done) = {
            let mut state = self.state();
            let oom = stats.oom_killed() && !state.oom_detected;
            let throttled = stats.throttled() && !state.cpu_throttled;
            state.oom_detected |= oom;
            state.cpu_throttled |= throttled;
            (oom, throttled, state.oom_detected && state.cpu_throttled)
        };

        if oom {
            self.record_event(LifecycleKind::OomKilled);
            self.notify(
                &format!("OOM kill detected ({} kills)", stats.oom_kills),
                None,
            );
        }
        if throttled {
            self.record_event(LifecycleKind::CpuThrottled);
            self.notify(
                &format!("CPU throttled ({} periods)", stats.throttled_periods),
                None,
            );
        }
        done
    }
}

/// Signal the process group led by `pid`, falling back to the process alone
fn signal_group(pid: ProcessId, signal: Signal) -> Result<()> {
    match killpg(pid.as_nix_pid(), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => match kill(pid.as_nix_pid(), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}

/// Wait up to `limit` for the run's process to exit
async fn wait_exit(run: &Run, pid: ProcessId, limit: Duration) -> bool {
    match &run.exited {
        Some(exited) => {
            let mut exited = exited.clone();
            tokio::time::timeout(limit, exited.wait_for(Option::is_some))
                .await
                .is_ok()
        }
        None => tokio::time::timeout(limit, async {
            while pid.is_alive() {
                tokio::time::sleep(ADOPTED_POLL).await;
            }
        })
        .await
        .is_ok(),
    }
}
