//! Runtime façade
//!
//! Maps container names to supervisors and wires in the filesystem and
//! metadata collaborators.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};
use vessel_core::{
    CleanupOutcome, ContainerId, ContainerRecord, ContainerSpec, Error, EventObserver, Metrics,
    Result,
};

use crate::config::RuntimeConfig;
use crate::container::{Container, ExecOutput, SupervisorContext};
use crate::observer::Observers;
use crate::platform::Platform;
use crate::rootfs::{LocalRootfs, RootfsProvider};
use crate::store::{JsonFileStore, MetadataStore};

/// Single-host container runtime
pub struct Runtime {
    config: RuntimeConfig,
    ctx: SupervisorContext,
    rootfs: Arc<dyn RootfsProvider>,
    store: Arc<dyn MetadataStore>,
    containers: RwLock<HashMap<String, Container>>,
}

impl Runtime {
    /// Runtime with the platform picked from `config`
    ///
    /// # Errors
    /// Returns error if the platform cannot be selected or the state
    /// directory cannot be opened
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let platform = Platform::select(&config)?;
        Self::with_platform(config, platform)
    }

    /// Runtime on an explicit platform with the default local collaborators
    ///
    /// # Errors
    /// Returns error if the state directory or metadata file cannot be opened
    pub fn with_platform(config: RuntimeConfig, platform: Platform) -> Result<Self> {
        fs::create_dir_all(&config.state_dir)?;
        let store = Arc::new(JsonFileStore::open(config.metadata_file())?);
        let rootfs = Arc::new(LocalRootfs::new(&config.state_dir));
        Self::from_parts(config, platform, store, rootfs)
    }

    /// Runtime from explicit collaborators, restoring every stored container
    ///
    /// # Errors
    /// Returns error if stored records cannot be loaded
    pub fn from_parts(
        config: RuntimeConfig,
        platform: Platform,
        store: Arc<dyn MetadataStore>,
        rootfs: Arc<dyn RootfsProvider>,
    ) -> Result<Self> {
        let ctx = SupervisorContext {
            platform,
            timings: config.timings,
            observers: Observers::with_tracing(),
            store: Some(Arc::clone(&store)),
        };

        let containers: HashMap<String, Container> = store
            .load_all()?
            .into_iter()
            .map(|record| {
                let container = Container::restore(record, ctx.clone());
                (container.name().to_string(), container)
            })
            .collect();
        if !containers.is_empty() {
            info!(count = containers.len(), "Restored containers");
        }

        Ok(Self {
            config,
            ctx,
            rootfs,
            store,
            containers: RwLock::new(containers),
        })
    }

    /// Add a notification sink for every container
    pub fn observe(&self, observer: Arc<dyn EventObserver>) {
        self.ctx.observers.register(observer);
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Host strategy in use
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.ctx.platform
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Container>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Container>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a container and prepare its root filesystem
    ///
    /// A spec without a rootfs gets one under the state directory, copied
    /// from its image when the image exists locally.
    ///
    /// # Errors
    /// Returns error if the spec is invalid, the name is taken, or the rootfs
    /// cannot be prepared
    pub fn create(&self, mut spec: ContainerSpec) -> Result<Container> {
        spec.validate()?;

        let mut containers = self.write();
        if containers.contains_key(&spec.name) {
            return Err(Error::ContainerExists { name: spec.name });
        }

        if spec.rootfs.as_os_str().is_empty() {
            spec.rootfs = self.rootfs.prepare(&spec.name, spec.image.as_deref())?;
        }

        let container = Container::new(ContainerId::generate(), spec, self.ctx.clone());
        self.store.save(&container.record())?;
        info!(container = %container.name(), id = %container.id(), "Container created");

        containers.insert(container.name().to_string(), container.clone());
        Ok(container)
    }

    /// Supervisor for `name`
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] for unknown names
    pub fn get(&self, name: &str) -> Result<Container> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound {
                name: name.to_string(),
            })
    }

    /// Records of every container, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<ContainerRecord> =
            self.read().values().map(Container::record).collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    /// Start `name`
    ///
    /// # Errors
    /// Returns error if the container is unknown or fails to start
    pub async fn start(&self, name: &str) -> Result<()> {
        self.get(name)?.start().await
    }

    /// Stop `name`
    ///
    /// # Errors
    /// Returns error if the container is unknown or cannot be signalled
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.get(name)?.stop().await
    }

    /// Restart `name`
    ///
    /// # Errors
    /// Returns error if the container is unknown or fails to restart
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.get(name)?.restart().await
    }

    /// Pause `name`
    ///
    /// # Errors
    /// Returns error if the container is unknown or cannot be frozen
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.get(name)?.pause().await
    }

    /// Resume `name`
    ///
    /// # Errors
    /// Returns error if the container is unknown or cannot be thawed
    pub async fn resume(&self, name: &str) -> Result<()> {
        self.get(name)?.resume().await
    }

    /// Run a command inside `name`
    ///
    /// # Errors
    /// See [`Container::exec`]
    pub async fn exec(&self, name: &str, command: &str, interactive: bool) -> Result<ExecOutput> {
        self.get(name)?.exec(command, interactive).await
    }

    /// Fresh metrics for `name`
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] for unknown names
    pub async fn metrics(&self, name: &str) -> Result<Metrics> {
        let container = self.get(name)?;
        container.update_metrics().await;
        Ok(container.metrics())
    }

    /// Last `tail` log lines of `name`
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] for unknown names
    pub fn logs(&self, name: &str, tail: usize) -> Result<String> {
        Ok(self.get(name)?.get_logs(tail))
    }

    /// Delete a container that has no live process, with its files and record
    ///
    /// The container is retired under its operation lock first, so a start
    /// racing with the removal fails instead of spawning a process.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] while the container runs or is paused,
    /// or when its directory cannot be deleted because something is still
    /// mounted inside it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let container = self.get(name)?;
        let status = container.retire().await;
        if status.has_process() {
            return Err(Error::InvalidState {
                message: format!("container {name} is {status}; stop it before removing"),
            });
        }

        if let CleanupOutcome::Failed(reason) = self.rootfs.remove(name) {
            warn!(container = name, reason = %reason, "Container files kept");
            return Err(Error::InvalidState {
                message: format!("container {name} could not be removed: {reason}"),
            });
        }
        self.write().remove(name);
        if let Err(e) = self.store.remove(container.id()) {
            warn!(container = name, error = %e, "Cannot delete container record");
        }
        self.ctx.observers.emit(name, "Container removed", None);
        Ok(())
    }

    /// Stop every container that still has a process
    pub async fn shutdown(&self) {
        let containers: Vec<Container> = self.read().values().cloned().collect();
        for container in containers {
            if !container.status().has_process() {
                continue;
            }
            if let Err(e) = container.stop().await {
                warn!(container = %container.name(), error = %e, "Stop during shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state_dir", &self.config.state_dir)
            .field("platform", &self.ctx.platform)
            .field("containers", &self.read().len())
            .finish_non_exhaustive()
    }
}
