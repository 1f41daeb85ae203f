use std::time::Duration;
use vessel_core::*;

#[test]
fn test_container_id_validation() {
    // Valid IDs
    assert!(ContainerId::new("test").is_ok());
    assert!(ContainerId::new("test-123").is_ok());
    assert!(ContainerId::new("test_456").is_ok());
    assert!(ContainerId::new("ABC-123_xyz").is_ok());

    // Invalid IDs - empty
    assert!(ContainerId::new("").is_err());

    // Invalid IDs - too long
    assert!(ContainerId::new("a".repeat(65)).is_err());

    // Invalid IDs - bad characters
    assert!(ContainerId::new("test@123").is_err());
    assert!(ContainerId::new("test space").is_err());
    assert!(ContainerId::new("test/path").is_err());
    assert!(ContainerId::new("test.dot").is_err());
}

#[test]
fn test_container_id_serialization() {
    let id = ContainerId::new("test-123").unwrap();

    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"test-123\"");

    let deserialized: ContainerId = serde_json::from_str(&json).unwrap();
    assert_eq!(id, deserialized);

    // Invalid IDs are rejected at the serde boundary too
    assert!(serde_json::from_str::<ContainerId>("\"bad id\"").is_err());
}

#[test]
fn test_spec_limits_convert_to_cgroup_units() {
    let spec = ContainerSpec::new("web", "sleep 100")
        .with_memory_mb(50)
        .with_cpu_percent(25.0);

    assert_eq!(spec.memory_limit().as_bytes(), 50 * 1024 * 1024);
    assert_eq!(spec.cpu_limit().to_shares(), 256);
    assert_eq!(spec.cpu_limit().to_quota(), (25_000, 100_000));
}

#[test]
fn test_spec_json_matches_loader_output() {
    let json = r#"{
        "name": "api",
        "command": "python -m http.server 8000",
        "mem_limit_mb": 256,
        "cpu_limit_percent": 75,
        "ports": ["8000:8000", "9443:443"],
        "env": {"DEBUG": "1"},
        "restart_policy": "on-failure",
        "health_check": {"cmd": "curl -f localhost:8000", "interval": 5, "timeout": 2, "retries": 3},
        "isolation": {"network_namespace": true, "drop_capabilities": ["net_raw"]}
    }"#;

    let spec = ContainerSpec::from_json(json).unwrap();
    assert_eq!(spec.restart_policy, RestartPolicy::OnFailure);
    assert_eq!(spec.ports.len(), 2);
    assert_eq!(spec.ports[1], PortMapping::new(9443, 443));
    assert!(spec.isolation.network_namespace);
    assert!(!spec.isolation.user_namespace);
    assert_eq!(spec.isolation.drop_capabilities, vec!["net_raw".to_string()]);

    let check = spec.health_check.unwrap();
    assert_eq!(check.interval, Duration::from_secs(5));
    assert_eq!(check.timeout, Duration::from_secs(2));
}

#[test]
fn test_spec_json_rejects_invalid_values() {
    assert!(ContainerSpec::from_json(r#"{"name": "x"}"#).is_err());
    assert!(ContainerSpec::from_json(r#"{"name": "x", "command": "true", "ports": ["nope"]}"#).is_err());
    assert!(ContainerSpec::from_json(r#"{"name": "bad name", "command": "true"}"#).is_err());
    assert!(
        ContainerSpec::from_json(r#"{"name": "x", "command": "true", "restart_policy": "sometimes"}"#)
            .is_err()
    );
}

#[test]
fn test_lifecycle_log_counts_kinds() {
    let mut log = LifecycleLog::new();
    log.record(LifecycleKind::Created, ContainerStatus::Created);
    for _ in 0..3 {
        log.record(LifecycleKind::Started, ContainerStatus::Running);
        log.record(LifecycleKind::Exited, ContainerStatus::Stopped);
    }

    assert_eq!(log.count(LifecycleKind::Started), 3);
    assert_eq!(log.count(LifecycleKind::Exited), 3);
    assert_eq!(log.len(), 7);
}

#[test]
fn test_metrics_default_is_zero() {
    let metrics = Metrics::default();
    assert_eq!(metrics.disk_read, 0);
    assert_eq!(metrics.network_tx, 0);
    assert!(metrics.memory_mb.abs() < f64::EPSILON);
}

#[test]
fn test_status_process_association() {
    assert!(ContainerStatus::Running.has_process());
    assert!(ContainerStatus::Paused.has_process());
    assert!(!ContainerStatus::Stopped.has_process());
    assert!(!ContainerStatus::Created.has_process());
    assert!(!ContainerStatus::Error.has_process());
}
