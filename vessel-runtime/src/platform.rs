//! Host strategy selection
//!
//! One resource backend, one spawn builder and one network manager are
//! chosen at startup and shared by every container.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use vessel_cgroup::{CGroupController, ResourceBackend, UnconfinedBackend};
use vessel_core::{Error, Result};
use vessel_namespace::{HostCapabilities, SimulatedBuilder, SpawnBuilder, UnshareBuilder};
use vessel_network::{IpRouteDriver, LinkDriver, NetworkManager, NoopLinkDriver};

use crate::config::{IsolationMode, RuntimeConfig};
use crate::reaper::{ChildRegistry, ZombieReaper};

/// The host-specific collaborators behind every container
#[derive(Clone)]
pub struct Platform {
    resources: Arc<dyn ResourceBackend>,
    builder: Arc<dyn SpawnBuilder>,
    network: Arc<NetworkManager>,
    children: ChildRegistry,
    reaper: Arc<OnceLock<watch::Sender<bool>>>,
}

impl Platform {
    /// Assemble a platform from explicit parts
    #[must_use]
    pub fn new(
        resources: Arc<dyn ResourceBackend>,
        builder: Arc<dyn SpawnBuilder>,
        network: Arc<NetworkManager>,
    ) -> Self {
        Self {
            resources,
            builder,
            network,
            children: ChildRegistry::default(),
            reaper: Arc::new(OnceLock::new()),
        }
    }

    /// Pick the strategy requested by `config`
    ///
    /// `Auto` isolates when the host allows it and simulates otherwise.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] when isolation is forced on a host that
    /// cannot provide it, or an error for an invalid network subnet
    pub fn select(config: &RuntimeConfig) -> Result<Self> {
        match config.isolation {
            IsolationMode::Simulated => Self::simulated(config),
            IsolationMode::Isolated => {
                let caps = HostCapabilities::probe();
                if !caps.supports_isolation() {
                    return Err(Error::Unsupported {
                        operation: format!(
                            "isolated launch (root: {}, missing: {:?})",
                            caps.root,
                            caps.missing_binaries()
                        ),
                    });
                }
                Self::isolated(config)
            }
            IsolationMode::Auto => {
                if HostCapabilities::probe().supports_isolation() {
                    Self::isolated(config)
                } else {
                    warn!("Host cannot isolate containers, running in simulation mode");
                    Self::simulated(config)
                }
            }
        }
    }

    /// Namespaces, cgroups and bridge networking
    ///
    /// A missing cgroup hierarchy is not fatal; containers then run
    /// unconfined.
    ///
    /// # Errors
    /// Returns error for an invalid network subnet
    pub fn isolated(config: &RuntimeConfig) -> Result<Self> {
        let resources: Arc<dyn ResourceBackend> =
            match CGroupController::detect(&config.cgroup_root) {
                Ok(controller) => {
                    info!(version = %controller.version(), root = %config.cgroup_root.display(), "Using cgroup controller");
                    Arc::new(controller)
                }
                Err(e) => {
                    warn!(error = %e, "No usable cgroup hierarchy, resource limits disabled");
                    Arc::new(UnconfinedBackend)
                }
            };
        let driver: Arc<dyn LinkDriver> = Arc::new(IpRouteDriver);
        let network = NetworkManager::new(config.network.clone(), driver)?;

        info!("Platform: isolated");
        Ok(Self::new(resources, Arc::new(UnshareBuilder), Arc::new(network)))
    }

    /// Plain host processes with no kernel isolation
    ///
    /// # Errors
    /// Returns error for an invalid network subnet
    pub fn simulated(config: &RuntimeConfig) -> Result<Self> {
        let driver: Arc<dyn LinkDriver> = Arc::new(NoopLinkDriver);
        let network = NetworkManager::new(config.network.clone(), driver)?;

        info!("Platform: simulated");
        Ok(Self::new(
            Arc::new(UnconfinedBackend),
            Arc::new(SimulatedBuilder),
            Arc::new(network),
        ))
    }

    /// Cgroup backend
    #[must_use]
    pub fn resources(&self) -> &Arc<dyn ResourceBackend> {
        &self.resources
    }

    /// Spawn command builder
    #[must_use]
    pub fn builder(&self) -> &Arc<dyn SpawnBuilder> {
        &self.builder
    }

    /// Shared network manager
    #[must_use]
    pub fn network(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    /// Registry of supervised child PIDs
    #[must_use]
    pub const fn children(&self) -> &ChildRegistry {
        &self.children
    }

    /// Whether containers get kernel isolation
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.builder.isolated()
    }

    /// Start the zombie reaper once, if containers are isolated
    ///
    /// The reaper stops when the last clone of this platform is dropped.
    pub fn ensure_reaper(&self, poll: Duration) {
        if !self.is_isolated() {
            return;
        }
        self.reaper.get_or_init(|| {
            let (tx, rx) = watch::channel(false);
            ZombieReaper::new(self.children.clone()).spawn(poll, rx);
            tx
        });
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("isolated", &self.is_isolated())
            .field("cgroup", &self.resources.version())
            .field("builder", &self.builder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_platform_has_no_isolation() {
        let platform = Platform::simulated(&RuntimeConfig::default()).unwrap();
        assert!(!platform.is_isolated());
        assert!(platform.resources().version().is_none());
    }

    #[test]
    fn invalid_subnet_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.network.subnet = "10.0.0.0/40".to_string();
        assert!(Platform::simulated(&config).is_err());
    }

    #[tokio::test]
    async fn simulated_platform_never_starts_a_reaper() {
        let platform = Platform::simulated(&RuntimeConfig::default()).unwrap();
        platform.ensure_reaper(Duration::from_millis(10));
        assert!(platform.reaper.get().is_none());
    }
}
