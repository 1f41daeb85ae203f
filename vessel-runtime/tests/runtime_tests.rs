use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vessel_cgroup::{CGroupController, CgroupVersion};
use vessel_core::*;
use vessel_namespace::SimulatedBuilder;
use vessel_network::{NetworkConfig, NetworkManager, NoopLinkDriver};
use vessel_runtime::sampler::ProcStat;
use vessel_runtime::*;

fn fast_timings() -> SupervisorTimings {
    SupervisorTimings {
        stop_grace: Duration::from_secs(2),
        sample_interval: Duration::from_millis(50),
        restart_poll: Duration::from_millis(50),
        policy_restart_delay: Duration::from_millis(20),
        manual_restart_delay: Duration::from_millis(20),
        health_restart_delay: Duration::from_millis(20),
        violation_poll: Duration::from_millis(20),
        reaper_poll: Duration::from_millis(50),
        exec_timeout: Duration::from_secs(5),
        cpu_window: Duration::from_millis(20),
    }
}

fn config(state: &TempDir) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_state_dir(state.path())
        .with_isolation(IsolationMode::Simulated)
        .with_network(NetworkConfig::default().with_probe_timeout(Duration::from_millis(200)))
        .with_timings(fast_timings())
}

fn runtime(state: &TempDir) -> Runtime {
    Runtime::new(config(state)).unwrap()
}

/// Simulated launches on a cgroup controller over a fake v2 root
fn cgroup_platform(root: &std::path::Path) -> Platform {
    std::fs::write(root.join("cgroup.controllers"), "cpu memory").unwrap();
    let network = NetworkManager::new(
        NetworkConfig::default().with_probe_timeout(Duration::from_millis(200)),
        Arc::new(NoopLinkDriver),
    )
    .unwrap();
    Platform::new(
        Arc::new(CGroupController::new(root, CgroupVersion::V2)),
        Arc::new(SimulatedBuilder),
        Arc::new(network),
    )
}

/// A `sleep` owned by the test, reaped in the background once killed
fn detached_sleeper() -> i32 {
    let mut sleeper = std::process::Command::new("sleep").arg("100").spawn().unwrap();
    let pid = i32::try_from(sleeper.id()).unwrap();
    std::thread::spawn(move || sleeper.wait());
    pid
}

fn stored_running(state: &TempDir, id: &str, name: &str, pid: i32) {
    let store = JsonFileStore::open(state.path().join("containers.json")).unwrap();
    let mut record = ContainerRecord::new(
        ContainerId::new(id).unwrap(),
        ContainerSpec::new(name, "sleep 100"),
        state.path().join(format!("containers/{name}/container.log")),
    );
    record.status = ContainerStatus::Running;
    record.pid = Some(pid);
    record.started_at = Some(chrono::Utc::now());
    store.save(&record).unwrap();
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or `limit` passes
async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn kinds(container: &Container) -> Vec<LifecycleKind> {
    container.lifecycle().iter().map(|e| e.kind).collect()
}

trait LifecycleCount {
    fn lifecycle_count(&self, kind: LifecycleKind) -> usize;
}

impl LifecycleCount for Container {
    fn lifecycle_count(&self, kind: LifecycleKind) -> usize {
        self.lifecycle().iter().filter(|e| e.kind == kind).count()
    }
}

#[tokio::test]
async fn start_and_stop_web_container() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let port = free_port();
    let web = runtime
        .create(
            ContainerSpec::new("web", "sleep 100")
                .with_memory_mb(50)
                .with_port(port, 80),
        )
        .unwrap();
    assert_eq!(web.status(), ContainerStatus::Created);
    assert_eq!(web.log_path(), state.path().join("containers/web/container.log"));

    runtime.start("web").await.unwrap();
    assert_eq!(web.status(), ContainerStatus::Running);
    let pid = web.pid().expect("running container has a pid");
    assert!(pid.is_alive());
    assert!(web.get_logs(50).contains("started"));
    assert_eq!(runtime.platform().network().port_mappings().await.len(), 1);

    runtime.stop("web").await.unwrap();
    assert_eq!(web.status(), ContainerStatus::Stopped);
    assert!(web.pid().is_none());
    assert!(!pid.is_alive());
    assert!(runtime.platform().network().port_mappings().await.is_empty());
    assert!(web.get_logs(50).contains("Container stopped."));
    assert_eq!(
        kinds(&web),
        vec![
            LifecycleKind::Created,
            LifecycleKind::Started,
            LifecycleKind::Stopped
        ]
    );
}

#[tokio::test]
async fn second_start_keeps_the_running_process() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let app = runtime.create(ContainerSpec::new("app", "sleep 100")).unwrap();

    app.start().await.unwrap();
    let pid = app.pid();
    app.start().await.unwrap();

    assert_eq!(app.pid(), pid);
    assert_eq!(app.lifecycle_count(LifecycleKind::Started), 1);
    assert!(app.get_logs(20).contains("Already running!"));
    app.stop().await.unwrap();
}

#[tokio::test]
async fn port_conflict_fails_start_without_side_effects() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let port = free_port();
    runtime
        .create(ContainerSpec::new("first", "sleep 100").with_port(port, 80))
        .unwrap();
    let second = runtime
        .create(ContainerSpec::new("second", "sleep 100").with_port(port, 8080))
        .unwrap();

    runtime.start("first").await.unwrap();
    let err = runtime.start("second").await.unwrap_err();
    assert!(matches!(err, Error::PortConflict { port: p, .. } if p == port));
    assert_eq!(second.status(), ContainerStatus::Error);
    assert!(second.pid().is_none());
    assert_eq!(second.lifecycle_count(LifecycleKind::StartFailed), 1);
    assert!(second.get_logs(20).contains("Error starting container"));

    let mappings = runtime.platform().network().port_mappings().await;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].1.container, "first");

    runtime.stop("first").await.unwrap();
    runtime.start("second").await.unwrap();
    assert_eq!(second.status(), ContainerStatus::Running);
    runtime.stop("second").await.unwrap();
}

#[tokio::test]
async fn always_policy_restarts_exited_process() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let job = runtime
        .create(ContainerSpec::new("job", "sleep 0.2").with_restart_policy(RestartPolicy::Always))
        .unwrap();

    job.start().await.unwrap();
    assert!(eventually(Duration::from_secs(10), || job.restart_count() >= 1).await);
    assert!(job.lifecycle_count(LifecycleKind::Exited) >= 1);
    assert!(job.get_logs(100).contains("always policy"));

    job.stop().await.unwrap();
    let restarts = job.restart_count();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(job.status(), ContainerStatus::Stopped);
    assert_eq!(job.restart_count(), restarts);
}

#[tokio::test]
async fn unless_stopped_policy_gives_up_after_ten_restarts() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let flaky = runtime
        .create(
            ContainerSpec::new("flaky", "true").with_restart_policy(RestartPolicy::UnlessStopped),
        )
        .unwrap();

    flaky.start().await.unwrap();
    assert!(
        eventually(Duration::from_secs(15), || {
            flaky.get_logs(200).contains("Restart limit reached")
        })
        .await
    );
    assert!(eventually(Duration::from_secs(5), || flaky.status() == ContainerStatus::Stopped).await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(flaky.restart_count(), MAX_AUTO_RESTARTS);
    assert_eq!(
        flaky.lifecycle_count(LifecycleKind::Started),
        MAX_AUTO_RESTARTS as usize + 1
    );
}

#[tokio::test]
async fn failing_health_check_restarts_once_per_streak() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let check = HealthCheckSpec {
        cmd: "false".to_string(),
        interval: Duration::from_millis(50),
        timeout: Duration::from_secs(2),
        retries: 2,
    };
    let api = runtime
        .create(
            ContainerSpec::new("api", "sleep 100")
                .with_health_check(check)
                .with_restart_policy(RestartPolicy::OnFailure),
        )
        .unwrap();

    api.start().await.unwrap();
    assert_eq!(api.health(), HealthStatus::Starting);
    assert!(
        eventually(Duration::from_secs(10), || {
            api.lifecycle_count(LifecycleKind::Unhealthy) >= 2
        })
        .await
    );
    api.stop().await.unwrap();

    let events = kinds(&api);
    let unhealthy: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, kind)| **kind == LifecycleKind::Unhealthy)
        .map(|(i, _)| i)
        .collect();
    let between = &events[unhealthy[0] + 1..unhealthy[1]];
    assert_eq!(between, [LifecycleKind::Stopped, LifecycleKind::Started]);
    assert!(api.restart_count() >= 1);
    assert!(api.get_logs(200).contains("Container is unhealthy (failed 2 times)"));
}

#[tokio::test]
async fn passing_health_check_reports_healthy_once() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let check = HealthCheckSpec {
        cmd: "true".to_string(),
        interval: Duration::from_millis(30),
        timeout: Duration::from_secs(2),
        retries: 3,
    };
    let db = runtime
        .create(ContainerSpec::new("db", "sleep 100").with_health_check(check))
        .unwrap();

    db.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || db.health() == HealthStatus::Healthy).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    db.stop().await.unwrap();

    assert!(db.last_health_check().is_some());
    assert_eq!(db.get_logs(500).matches("Container is healthy").count(), 1);
}

#[tokio::test]
async fn memory_breach_kills_the_container() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let hog = runtime
        .create(
            ContainerSpec::new(
                "hog",
                "sh -c 'x=$(head -c 4000000 /dev/zero | tr \"\\0\" a); sleep 30'",
            )
            .with_memory_mb(1),
        )
        .unwrap();

    hog.start().await.unwrap();
    let pid = hog.pid().unwrap();
    assert!(eventually(Duration::from_secs(10), || hog.status() == ContainerStatus::Stopped).await);

    assert!(!pid.is_alive());
    assert!(hog.get_logs(100).contains("Memory limit exceeded! Stopping container."));
    assert_eq!(hog.lifecycle_count(LifecycleKind::Stopped), 1);
}

#[tokio::test]
async fn memory_of_descendants_counts_toward_the_limit() {
    let state = tempfile::tempdir().unwrap();
    let script = state.path().join("hog.sh");
    std::fs::write(
        &script,
        "x=$(head -c 40000000 /dev/zero | tr '\\0' a)\nsleep 30\n",
    )
    .unwrap();

    let runtime = runtime(&state);
    let command = format!("sh -c 'sh {}; true'", script.display());
    let hog = runtime
        .create(ContainerSpec::new("nested", command).with_memory_mb(16))
        .unwrap();

    hog.start().await.unwrap();
    let pid = hog.pid().unwrap();
    assert!(eventually(Duration::from_secs(15), || hog.status() == ContainerStatus::Stopped).await);

    assert!(!pid.is_alive());
    assert!(hog.get_logs(200).contains("Memory limit exceeded! Stopping container."));
}

#[tokio::test]
async fn cgroup_charge_counts_toward_the_limit() {
    let state = tempfile::tempdir().unwrap();
    let cgroups = tempfile::tempdir().unwrap();
    let runtime = Runtime::with_platform(config(&state), cgroup_platform(cgroups.path())).unwrap();
    let charged = runtime
        .create(ContainerSpec::new("charged", "sleep 100").with_memory_mb(64))
        .unwrap();

    charged.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(charged.status(), ContainerStatus::Running);

    let group = cgroups.path().join("vessel/charged");
    std::fs::write(group.join("memory.current"), (200 * 1024 * 1024).to_string()).unwrap();
    assert!(
        eventually(Duration::from_secs(5), || charged.status() == ContainerStatus::Stopped).await
    );
    assert!(charged.get_logs(100).contains("Memory limit exceeded! Stopping container."));
    assert!(!group.exists());
}

#[tokio::test]
async fn pause_and_resume_use_signals_without_cgroups() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let worker = runtime.create(ContainerSpec::new("worker", "sleep 100")).unwrap();

    worker.pause().await.unwrap();
    assert_eq!(worker.status(), ContainerStatus::Created);
    assert!(worker.get_logs(10).contains("Cannot pause: container not running."));

    worker.start().await.unwrap();
    let pid = worker.pid().unwrap();
    runtime.pause("worker").await.unwrap();
    assert_eq!(worker.status(), ContainerStatus::Paused);
    assert!(
        eventually(Duration::from_secs(2), || {
            ProcStat::read(pid).is_ok_and(|stat| stat.state == 'T')
        })
        .await
    );

    runtime.resume("worker").await.unwrap();
    assert_eq!(worker.status(), ContainerStatus::Running);
    assert!(
        eventually(Duration::from_secs(2), || {
            ProcStat::read(pid).is_ok_and(|stat| stat.state != 'T')
        })
        .await
    );

    runtime.pause("worker").await.unwrap();
    runtime.stop("worker").await.unwrap();
    assert!(!pid.is_alive());
    assert_eq!(
        kinds(&worker),
        vec![
            LifecycleKind::Created,
            LifecycleKind::Started,
            LifecycleKind::Paused,
            LifecycleKind::Resumed,
            LifecycleKind::Paused,
            LifecycleKind::Stopped,
        ]
    );
}

#[tokio::test]
async fn exec_requires_isolation() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    runtime.create(ContainerSpec::new("shell", "sleep 100")).unwrap();
    runtime.start("shell").await.unwrap();

    let err = runtime.exec("shell", "ls /", false).await.unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
    runtime.stop("shell").await.unwrap();
}

#[tokio::test]
async fn metrics_sample_a_live_process() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    runtime.create(ContainerSpec::new("probe", "sleep 100")).unwrap();

    assert_eq!(runtime.metrics("probe").await.unwrap(), Metrics::default());
    runtime.start("probe").await.unwrap();
    let metrics = runtime.metrics("probe").await.unwrap();
    assert!(metrics.memory_mb > 0.0);
    runtime.stop("probe").await.unwrap();
}

#[tokio::test]
async fn remove_requires_a_stopped_container() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    runtime.create(ContainerSpec::new("tmp", "sleep 100")).unwrap();
    let dir = state.path().join("containers/tmp");
    assert!(dir.join("rootfs").is_dir());

    runtime.start("tmp").await.unwrap();
    let err = runtime.remove("tmp").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    runtime.stop("tmp").await.unwrap();
    runtime.remove("tmp").await.unwrap();
    assert!(!dir.exists());
    assert!(matches!(
        runtime.get("tmp").unwrap_err(),
        Error::ContainerNotFound { .. }
    ));
    assert!(runtime.list().is_empty());
}

#[tokio::test]
async fn removed_container_cannot_be_started_again() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let late = runtime.create(ContainerSpec::new("late", "sleep 100")).unwrap();

    runtime.remove("late").await.unwrap();
    let err = late.start().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(late.pid().is_none());
    assert_eq!(late.status(), ContainerStatus::Created);
}

#[tokio::test]
async fn start_racing_remove_never_leaves_an_orphan() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let racer = runtime.create(ContainerSpec::new("racer", "sleep 100")).unwrap();

    let (removed, started) = tokio::join!(runtime.remove("racer"), racer.start());
    match (removed, started) {
        (Ok(()), Err(Error::InvalidState { .. })) => assert!(racer.pid().is_none()),
        (Err(Error::InvalidState { .. }), Ok(())) => {
            assert!(runtime.get("racer").is_ok());
            racer.stop().await.unwrap();
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    runtime.create(ContainerSpec::new("web", "sleep 1")).unwrap();

    let err = runtime.create(ContainerSpec::new("web", "sleep 2")).unwrap_err();
    assert!(matches!(err, Error::ContainerExists { name } if name == "web"));
    assert!(runtime.create(ContainerSpec::new("bad name", "sleep 1")).is_err());
}

#[tokio::test]
async fn notifications_reach_registered_observers() {
    let state = tempfile::tempdir().unwrap();
    let runtime = runtime(&state);
    let (observer, mut rx) = ChannelObserver::new();
    runtime.observe(Arc::new(observer));

    runtime.create(ContainerSpec::new("watched", "sleep 100")).unwrap();
    runtime.start("watched").await.unwrap();
    runtime.stop("watched").await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(note) = rx.try_recv() {
        assert_eq!(note.container, "watched");
        statuses.extend(note.status);
    }
    assert_eq!(
        statuses,
        vec![
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Stopped
        ]
    );
}

#[tokio::test]
async fn state_survives_a_new_runtime() {
    let state = tempfile::tempdir().unwrap();
    let id = {
        let runtime = runtime(&state);
        runtime
            .create(ContainerSpec::new("db", "sleep 100").with_memory_mb(64))
            .unwrap()
            .id()
            .clone()
    };

    let mut exited = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = i32::try_from(exited.id()).unwrap();
    exited.wait().unwrap();

    let store = JsonFileStore::open(state.path().join("containers.json")).unwrap();
    let mut ghost = ContainerRecord::new(
        ContainerId::new("aaaaaaaaaaaa").unwrap(),
        ContainerSpec::new("ghost", "sleep 100"),
        state.path().join("containers/ghost/container.log"),
    );
    ghost.status = ContainerStatus::Running;
    ghost.pid = Some(dead_pid);
    store.save(&ghost).unwrap();
    drop(store);

    let runtime = runtime(&state);
    let records = runtime.list();
    assert_eq!(
        records.iter().map(ContainerRecord::name).collect::<Vec<_>>(),
        vec!["db", "ghost"]
    );

    let db = runtime.get("db").unwrap();
    assert_eq!(db.id(), &id);
    assert_eq!(db.status(), ContainerStatus::Created);
    assert_eq!(db.spec().mem_limit_mb, 64);

    let ghost = runtime.get("ghost").unwrap();
    assert_eq!(ghost.status(), ContainerStatus::Stopped);
    assert!(ghost.pid().is_none());
}

#[tokio::test]
async fn adopted_process_releases_its_cgroup() {
    let state = tempfile::tempdir().unwrap();
    let cgroups = tempfile::tempdir().unwrap();
    let pid = detached_sleeper();
    stored_running(&state, "bbbbbbbbbbbb", "ghost", pid);
    let group = cgroups.path().join("vessel/ghost");
    std::fs::create_dir_all(&group).unwrap();

    let runtime = Runtime::with_platform(config(&state), cgroup_platform(cgroups.path())).unwrap();
    let ghost = runtime.get("ghost").unwrap();
    assert_eq!(ghost.status(), ContainerStatus::Running);
    assert_eq!(ghost.pid(), Some(ProcessId::from_raw(pid)));

    runtime.stop("ghost").await.unwrap();
    assert_eq!(ghost.status(), ContainerStatus::Stopped);
    assert!(!ProcessId::from_raw(pid).is_alive());
    assert!(!group.exists());

    runtime.remove("ghost").await.unwrap();
    assert!(runtime.list().is_empty());
}

#[tokio::test]
async fn vanished_process_releases_its_cgroup() {
    let state = tempfile::tempdir().unwrap();
    let cgroups = tempfile::tempdir().unwrap();
    let mut exited = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = i32::try_from(exited.id()).unwrap();
    exited.wait().unwrap();
    stored_running(&state, "cccccccccccc", "orphan", dead_pid);
    let group = cgroups.path().join("vessel/orphan");
    std::fs::create_dir_all(&group).unwrap();

    let runtime = Runtime::with_platform(config(&state), cgroup_platform(cgroups.path())).unwrap();
    assert_eq!(runtime.get("orphan").unwrap().status(), ContainerStatus::Stopped);

    runtime.remove("orphan").await.unwrap();
    assert!(!group.exists());
}

#[tokio::test]
async fn cgroup_counters_raise_sticky_flags() {
    let state = tempfile::tempdir().unwrap();
    let cgroups = tempfile::tempdir().unwrap();

    let runtime = Runtime::with_platform(config(&state), cgroup_platform(cgroups.path())).unwrap();
    let limited = runtime
        .create(ContainerSpec::new("limited", "sleep 100").with_memory_mb(128))
        .unwrap();

    limited.start().await.unwrap();
    let group = cgroups.path().join("vessel/limited");
    let pid = limited.pid().unwrap();
    assert_eq!(
        std::fs::read_to_string(group.join("memory.max")).unwrap().trim(),
        (128 * 1024 * 1024).to_string()
    );
    assert_eq!(
        std::fs::read_to_string(group.join("cgroup.procs")).unwrap().trim(),
        pid.to_string()
    );

    std::fs::write(group.join("memory.events"), "oom 1\noom_kill 1\n").unwrap();
    std::fs::write(group.join("cpu.stat"), "nr_periods 9\nnr_throttled 5\n").unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            limited.oom_detected() && limited.cpu_throttled()
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(limited.lifecycle_count(LifecycleKind::OomKilled), 1);
    assert_eq!(limited.lifecycle_count(LifecycleKind::CpuThrottled), 1);
    assert!(limited.get_logs(100).contains("OOM kill detected (1 kills)"));

    limited.stop().await.unwrap();
    assert!(!group.exists());
}
