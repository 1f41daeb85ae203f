use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vessel_core::*;
use vessel_network::*;

/// Records every `ip` invocation; fails those containing `fail_on`
#[derive(Debug, Default)]
struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    fail_on: Option<&'static str>,
    missing_bridge: bool,
    gone_on_delete: bool,
}

impl RecordingDriver {
    fn failing_on(pattern: &'static str) -> Self {
        Self {
            fail_on: Some(pattern),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkDriver for RecordingDriver {
    async fn ip(&self, args: &[String]) -> Result<String> {
        let line = args.join(" ");
        self.calls.lock().unwrap().push(line.clone());

        if self.missing_bridge && line.starts_with("link show") {
            return Err(Error::network("Device \"vessel0\" does not exist."));
        }
        if self.gone_on_delete && line.contains("delete") {
            return Err(Error::network(format!("ip {line} failed: Cannot find device")));
        }
        if self.fail_on.is_some_and(|p| line.contains(p)) {
            return Err(Error::network(format!(
                "ip {line} failed: RTNETLINK answers: Operation not permitted"
            )));
        }
        Ok(String::new())
    }
}

fn manager(driver: Arc<RecordingDriver>) -> NetworkManager {
    let config = NetworkConfig::default().with_probe_timeout(Duration::from_millis(200));
    NetworkManager::new(config, driver).unwrap()
}

/// A host port nobody listens on
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_bind_and_release_ports() {
    let network = manager(Arc::default());
    let (a, b) = (free_port(), free_port());

    network
        .bind_ports("web", &[PortMapping::new(a, 80), PortMapping::new(b, 443)])
        .await
        .unwrap();

    let mappings = network.port_mappings().await;
    assert_eq!(mappings.len(), 2);
    assert!(mappings.iter().all(|(_, binding)| binding.container == "web"));
    assert!(!network.check_port_available(a).await);

    assert_eq!(network.release_ports("web").await, CleanupOutcome::Done);
    assert_eq!(network.release_ports("web").await, CleanupOutcome::Skipped);
    assert!(network.port_mappings().await.is_empty());
}

#[tokio::test]
async fn test_port_binding_is_all_or_nothing() {
    let network = manager(Arc::default());
    let (first, second) = (free_port(), free_port());

    network
        .bind_ports("db", &[PortMapping::new(second, 81)])
        .await
        .unwrap();

    let err = network
        .bind_ports("web", &[PortMapping::new(first, 80), PortMapping::new(second, 81)])
        .await
        .unwrap_err();

    match err {
        Error::PortConflict { port, .. } => assert_eq!(port, second),
        other => panic!("expected port conflict, got {other}"),
    }
    assert!(network.check_port_available(first).await);
    assert_eq!(network.port_mappings().await.len(), 1);
}

#[tokio::test]
async fn test_listening_host_port_is_rejected() {
    let network = manager(Arc::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let busy = listener.local_addr().unwrap().port();
    let free = free_port();

    assert!(!network.check_port_available(busy).await);

    let err = network
        .bind_ports("web", &[PortMapping::new(free, 80), PortMapping::new(busy, 81)])
        .await
        .unwrap_err();

    assert!(err.to_string().contains(&busy.to_string()));
    assert!(network.port_mappings().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_claims_on_one_port() {
    let network = Arc::new(manager(Arc::default()));
    let port = free_port();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let network = Arc::clone(&network);
            tokio::spawn(async move {
                network
                    .bind_ports(&format!("c{i}"), &[PortMapping::new(port, 80)])
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_setup_namespace_wires_veth_into_netns() {
    let driver = Arc::new(RecordingDriver {
        missing_bridge: true,
        ..RecordingDriver::default()
    });
    let network = manager(Arc::clone(&driver));

    let endpoint = network
        .setup_namespace("web", ProcessId::from_raw(4242))
        .await
        .unwrap();

    assert_eq!(endpoint.ip, Ipv4Addr::new(172, 18, 0, 2));
    assert_eq!(endpoint.netns, "vessel-web");
    assert_eq!(network.identity("web"), Some(endpoint.clone()));

    let calls = driver.calls();
    let host = &endpoint.host_veth;
    let peer = &endpoint.peer_veth;
    let expected = vec![
        "link show vessel0".to_string(),
        "link add vessel0 type bridge".to_string(),
        "addr add 172.18.0.1/16 dev vessel0".to_string(),
        "link set vessel0 up".to_string(),
        "netns attach vessel-web 4242".to_string(),
        format!("link add {host} type veth peer name {peer}"),
        format!("link set {host} master vessel0"),
        format!("link set {host} up"),
        format!("link set {peer} netns vessel-web"),
        format!("-n vessel-web addr add 172.18.0.2/16 dev {peer}"),
        format!("-n vessel-web link set {peer} up"),
        "-n vessel-web link set lo up".to_string(),
        "-n vessel-web route add default via 172.18.0.1".to_string(),
    ];
    assert_eq!(calls, expected);
}

#[tokio::test]
async fn test_bridge_is_created_once() {
    let driver = Arc::new(RecordingDriver {
        missing_bridge: true,
        ..RecordingDriver::default()
    });
    let network = manager(Arc::clone(&driver));

    network.setup_namespace("a", ProcessId::from_raw(10)).await.unwrap();
    network.setup_namespace("b", ProcessId::from_raw(11)).await.unwrap();

    let bridge_adds = driver
        .calls()
        .iter()
        .filter(|c| c.as_str() == "link add vessel0 type bridge")
        .count();
    assert_eq!(bridge_adds, 1);
    assert_eq!(network.identity("b").unwrap().ip, Ipv4Addr::new(172, 18, 0, 3));
}

#[tokio::test]
async fn test_failed_setup_leaves_no_state() {
    let driver = Arc::new(RecordingDriver::failing_on("master"));
    let network = manager(Arc::clone(&driver));

    let err = network
        .setup_namespace("web", ProcessId::from_raw(4242))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Network { .. }));
    assert!(network.identity("web").is_none());

    let calls = driver.calls();
    assert!(calls.iter().any(|c| c.starts_with("link delete vh")));
    assert!(calls.iter().any(|c| c == "netns delete vessel-web"));

    // The address is released; the pool moves on without reusing it yet
    assert_eq!(network.allocate_ip("other").unwrap(), Ipv4Addr::new(172, 18, 0, 3));
    assert_eq!(network.allocate_ip("web").unwrap(), Ipv4Addr::new(172, 18, 0, 4));
}

#[tokio::test]
async fn test_adopted_namespace_is_cleaned_up() {
    let driver = Arc::new(RecordingDriver::default());
    let network = manager(Arc::clone(&driver));

    let endpoint = network.adopt_namespace("web");
    assert_eq!(endpoint.netns, "vessel-web");
    assert_eq!(endpoint.ip, Ipv4Addr::UNSPECIFIED);
    assert!(driver.calls().is_empty());

    assert_eq!(network.cleanup_namespace("web").await, CleanupOutcome::Done);
    let calls = driver.calls();
    assert!(calls.contains(&format!("link delete {}", endpoint.host_veth)));
    assert!(calls.iter().any(|c| c == "netns delete vessel-web"));
    assert!(network.identity("web").is_none());
}

#[tokio::test]
async fn test_cleanup_namespace() {
    let driver = Arc::new(RecordingDriver::default());
    let network = manager(Arc::clone(&driver));

    assert_eq!(network.cleanup_namespace("ghost").await, CleanupOutcome::Skipped);

    let endpoint = network
        .setup_namespace("web", ProcessId::from_raw(7))
        .await
        .unwrap();
    assert_eq!(network.cleanup_namespace("web").await, CleanupOutcome::Done);
    assert!(network.identity("web").is_none());

    let calls = driver.calls();
    assert!(calls.contains(&format!("link delete {}", endpoint.host_veth)));
    assert!(calls.contains(&"netns delete vessel-web".to_string()));
}

#[tokio::test]
async fn test_cleanup_tolerates_missing_links() {
    let driver = Arc::new(RecordingDriver {
        gone_on_delete: true,
        ..RecordingDriver::default()
    });
    let network = manager(Arc::clone(&driver));
    network
        .setup_namespace("web", ProcessId::from_raw(7))
        .await
        .unwrap();

    let outcome = network.cleanup_namespace("web").await;
    assert_eq!(outcome, CleanupOutcome::Skipped);
    assert!(network.identity("web").is_none());
}

#[tokio::test]
async fn test_cleanup_reports_real_failures() {
    let driver = Arc::new(RecordingDriver::failing_on("netns delete"));
    let network = manager(Arc::clone(&driver));
    network
        .setup_namespace("web", ProcessId::from_raw(7))
        .await
        .unwrap();

    assert!(network.cleanup_namespace("web").await.is_failed());
}
