//! Network manager shared by every container on the host
//!
//! Owns the port table, the address pool and the bridge. Port binding is
//! validate-then-commit under one lock: either every requested host port is
//! bound to the container or none is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use vessel_core::{CleanupOutcome, Error, PortMapping, ProcessId, Result};

use crate::driver::{LinkDriver, is_already_gone, is_already_present};
use crate::ip::IpAllocator;
use crate::ports::{PortBinding, PortTable};

/// Bridge and port-probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host bridge device shared by all containers
    pub bridge_name: String,
    /// Subnet containers draw addresses from
    pub subnet: String,
    /// Upper bound for the host listening probe
    #[serde(with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge_name: "vessel0".to_string(),
            subnet: "172.18.0.0/16".to_string(),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

impl NetworkConfig {
    /// Set the bridge device name
    #[must_use]
    pub fn with_bridge(mut self, name: impl Into<String>) -> Self {
        self.bridge_name = name.into();
        self
    }

    /// Set the container subnet
    #[must_use]
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = subnet.into();
        self
    }

    /// Set the listening-probe timeout
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// A container's network identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// Named network namespace
    pub netns: String,
    /// Host side of the veth pair, enslaved to the bridge
    pub host_veth: String,
    /// Container side of the veth pair
    pub peer_veth: String,
    /// Address assigned inside the namespace
    pub ip: Ipv4Addr,
}

impl Endpoint {
    fn for_container(name: &str, ip: Ipv4Addr) -> Self {
        // Interface names are capped at 15 bytes
        let tag = short_tag(name);
        Self {
            netns: format!("vessel-{name}"),
            host_veth: format!("vh{tag}"),
            peer_veth: format!("vc{tag}"),
            ip,
        }
    }
}

/// FNV-1a over the container name, rendered as 8 hex digits
fn short_tag(name: &str) -> String {
    let hash = name.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    format!("{hash:08x}")
}

/// Shared network state for all containers
#[derive(Debug)]
pub struct NetworkManager {
    config: NetworkConfig,
    driver: Arc<dyn LinkDriver>,
    ports: tokio::sync::Mutex<PortTable>,
    ips: Mutex<IpAllocator>,
    endpoints: Mutex<HashMap<String, Endpoint>>,
    bridge: OnceCell<()>,
}

impl NetworkManager {
    /// Create a manager that wires links through `driver`
    ///
    /// # Errors
    /// Returns error if the configured subnet is invalid
    pub fn new(config: NetworkConfig, driver: Arc<dyn LinkDriver>) -> Result<Self> {
        let ips = IpAllocator::new(&config.subnet)?;
        Ok(Self {
            config,
            driver,
            ports: tokio::sync::Mutex::new(PortTable::new()),
            ips: Mutex::new(ips),
            endpoints: Mutex::new(HashMap::new()),
            bridge: OnceCell::new(),
        })
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Bind every requested host port to `container`, or none of them
    ///
    /// Each port must be free in the table and not listening on the host.
    ///
    /// # Errors
    /// Returns [`Error::PortConflict`] naming the first unavailable port
    pub async fn bind_ports(&self, container: &str, ports: &[PortMapping]) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }

        let mut table = self.ports.lock().await;

        if let Some((port, owner)) = table.conflict(container, ports) {
            return Err(Error::PortConflict {
                port,
                reason: format!("already bound by container '{owner}'"),
            });
        }

        for mapping in ports {
            let ours = table
                .owner(mapping.host)
                .is_some_and(|binding| binding.container == container);
            if !ours && self.is_listening(mapping.host).await {
                return Err(Error::PortConflict {
                    port: mapping.host,
                    reason: "already in use on the host".to_string(),
                });
            }
        }

        table.commit(container, ports);
        drop(table);

        for mapping in ports {
            info!(
                container,
                host_port = mapping.host,
                container_port = mapping.container,
                "Port mapping: {} -> {}:{}",
                mapping.host,
                container,
                mapping.container
            );
        }
        Ok(())
    }

    /// Release every host port owned by `container`
    pub async fn release_ports(&self, container: &str) -> CleanupOutcome {
        let freed = self.ports.lock().await.release(container);
        if freed.is_empty() {
            CleanupOutcome::Skipped
        } else {
            debug!(container, ports = ?freed, "Released ports");
            CleanupOutcome::Done
        }
    }

    /// Whether a host port is free in the table and not listening
    pub async fn check_port_available(&self, port: u16) -> bool {
        if self.ports.lock().await.owner(port).is_some() {
            return false;
        }
        !self.is_listening(port).await
    }

    async fn is_listening(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.config.probe_timeout,
                TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Every current port binding, ordered by host port
    pub async fn port_mappings(&self) -> Vec<(u16, PortBinding)> {
        self.ports.lock().await.mappings()
    }

    /// Allocate (or return the existing) address for `container`
    ///
    /// # Errors
    /// Returns error when the subnet is exhausted
    pub fn allocate_ip(&self, container: &str) -> Result<Ipv4Addr> {
        self.ips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(container)
    }

    fn release_ip(&self, container: &str) -> Option<Ipv4Addr> {
        self.ips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(container)
    }

    /// Network identity of a wired container
    #[must_use]
    pub fn identity(&self, container: &str) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
            .cloned()
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.driver.ip(&args).await
    }

    /// Create the bridge once per manager; later calls are no-ops
    async fn ensure_bridge(&self) -> Result<()> {
        self.bridge
            .get_or_try_init(|| async {
                let bridge = self.config.bridge_name.as_str();
                let (gateway, prefix) = {
                    let ips = self.ips.lock().unwrap_or_else(PoisonError::into_inner);
                    (ips.gateway(), ips.prefix())
                };

                if self.ip(&["link", "show", bridge]).await.is_err() {
                    info!(bridge, "Creating bridge");
                    if let Err(e) = self.ip(&["link", "add", bridge, "type", "bridge"]).await {
                        if !is_already_present(&e) {
                            return Err(e);
                        }
                    }
                }

                let cidr = format!("{gateway}/{prefix}");
                if let Err(e) = self.ip(&["addr", "add", &cidr, "dev", bridge]).await {
                    if !is_already_present(&e) {
                        return Err(e);
                    }
                }
                self.ip(&["link", "set", bridge, "up"]).await?;
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Give the process `pid` its own wired network namespace
    ///
    /// The process must already run in a fresh network namespace; it is
    /// named, connected to the bridge through a veth pair and assigned the
    /// container's address. Any failing step undoes the earlier ones.
    ///
    /// # Errors
    /// Returns [`Error::Network`] naming the failed step
    pub async fn setup_namespace(&self, container: &str, pid: ProcessId) -> Result<Endpoint> {
        self.ensure_bridge().await?;

        let ip = self.allocate_ip(container)?;
        let endpoint = Endpoint::for_container(container, ip);

        if let Err(e) = self.wire(&endpoint, pid).await {
            warn!(container, error = %e, "Network namespace setup failed");
            self.unwire(&endpoint).await.log(container, "network");
            self.release_ip(container);
            return Err(Error::network(format!(
                "Network setup for '{container}' failed: {e}"
            )));
        }

        info!(
            container,
            netns = %endpoint.netns,
            ip = %endpoint.ip,
            "Network namespace ready"
        );

        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    async fn wire(&self, endpoint: &Endpoint, pid: ProcessId) -> Result<()> {
        let netns = endpoint.netns.as_str();
        let host = endpoint.host_veth.as_str();
        let peer = endpoint.peer_veth.as_str();
        let bridge = self.config.bridge_name.as_str();
        let (gateway, prefix) = {
            let ips = self.ips.lock().unwrap_or_else(PoisonError::into_inner);
            (ips.gateway().to_string(), ips.prefix())
        };
        let cidr = format!("{}/{prefix}", endpoint.ip);
        let pid = pid.to_string();

        self.ip(&["netns", "attach", netns, &pid]).await?;
        self.ip(&["link", "add", host, "type", "veth", "peer", "name", peer])
            .await?;
        self.ip(&["link", "set", host, "master", bridge]).await?;
        self.ip(&["link", "set", host, "up"]).await?;
        self.ip(&["link", "set", peer, "netns", netns]).await?;
        self.ip(&["-n", netns, "addr", "add", &cidr, "dev", peer])
            .await?;
        self.ip(&["-n", netns, "link", "set", peer, "up"]).await?;
        self.ip(&["-n", netns, "link", "set", "lo", "up"]).await?;
        self.ip(&["-n", netns, "route", "add", "default", "via", &gateway])
            .await?;
        Ok(())
    }

    /// Remove the veth pair and the named namespace, ignoring what is gone
    async fn unwire(&self, endpoint: &Endpoint) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::Skipped;

        for args in [
            vec!["link", "delete", endpoint.host_veth.as_str()],
            vec!["netns", "delete", endpoint.netns.as_str()],
        ] {
            let step = match self.ip(&args).await {
                Ok(_) => CleanupOutcome::Done,
                Err(e) if is_already_gone(&e) => CleanupOutcome::Skipped,
                Err(e) => CleanupOutcome::Failed(e.to_string()),
            };
            outcome = outcome.and(step);
        }
        outcome
    }

    /// Take over the wiring of a container started by an earlier runtime
    ///
    /// The named namespace and veth pair follow from the container name, so
    /// [`NetworkManager::cleanup_namespace`] can remove them later. The
    /// address was never recorded and reads as unspecified.
    pub fn adopt_namespace(&self, container: &str) -> Endpoint {
        let endpoint = Endpoint::for_container(container, Ipv4Addr::UNSPECIFIED);
        debug!(container, netns = %endpoint.netns, "Adopted network namespace");
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container.to_string(), endpoint.clone());
        endpoint
    }

    /// Tear down the container's namespace wiring and release its address
    pub async fn cleanup_namespace(&self, container: &str) -> CleanupOutcome {
        let endpoint = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container);

        let outcome = match endpoint {
            Some(endpoint) => self.unwire(&endpoint).await,
            None => CleanupOutcome::Skipped,
        };
        self.release_ip(container);

        debug!(container, ?outcome, "Network namespace cleaned up");
        outcome
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
