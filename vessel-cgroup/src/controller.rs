//! CGroup controller implementation
//!
//! The controller owns a cgroup filesystem root and creates one group per
//! container below the `vessel` directory of each hierarchy it uses:
//!
//! - v2 (unified): `<root>/vessel/<name>`
//! - v1 (split):   `<root>/memory/vessel/<name>`, `<root>/cpu/vessel/<name>`
//!   and `<root>/freezer/vessel/<name>` when the freezer hierarchy exists

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use vessel_core::{CleanupOutcome, Error, ProcessId, Result};

use crate::backend::ResourceBackend;
use crate::limits::ResourceLimits;
use crate::stats::ViolationStats;

/// Cgroup hierarchy flavour found under the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Split per-controller hierarchies
    V1,
    /// Unified hierarchy
    V2,
}

impl CgroupVersion {
    /// Detect the hierarchy mounted at `root`
    ///
    /// v2 is recognised by `cgroup.controllers` at the root, v1 by a
    /// `memory` controller directory.
    #[must_use]
    pub fn detect(root: &Path) -> Option<Self> {
        if root.join("cgroup.controllers").exists() {
            Some(Self::V2)
        } else if root.join("memory").is_dir() {
            Some(Self::V1)
        } else {
            None
        }
    }
}

impl std::fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

/// A container's cgroup, as created by [`CGroupController::setup`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupHandle {
    pub(crate) name: String,
    pub(crate) version: CgroupVersion,
    pub(crate) memory: PathBuf,
    pub(crate) cpu: PathBuf,
    pub(crate) freezer: Option<PathBuf>,
}

impl CgroupHandle {
    /// Container name the group was created for
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hierarchy flavour
    #[must_use]
    pub const fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Directory holding the memory controls
    #[must_use]
    pub fn memory_path(&self) -> &Path {
        &self.memory
    }

    /// Directory holding the cpu controls
    #[must_use]
    pub fn cpu_path(&self) -> &Path {
        &self.cpu
    }

    /// Freezer directory, when one is available
    ///
    /// On v2 this is the unified group itself.
    #[must_use]
    pub fn freezer_path(&self) -> Option<&Path> {
        match self.version {
            CgroupVersion::V2 => Some(&self.memory),
            CgroupVersion::V1 => self.freezer.as_deref(),
        }
    }

    /// Every distinct directory owned by this group
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        match self.version {
            CgroupVersion::V2 => vec![self.memory.as_path()],
            CgroupVersion::V1 => {
                let mut paths = vec![self.memory.as_path(), self.cpu.as_path()];
                if let Some(freezer) = &self.freezer {
                    paths.push(freezer.as_path());
                }
                paths
            }
        }
    }
}

/// Filesystem-backed cgroup controller
///
/// This struct represents a cgroup hierarchy root. It provides methods to:
/// - Create a per-container group and write its limits
/// - Add processes
/// - Freeze and thaw
/// - Read violation counters
/// - Remove the group on teardown
#[derive(Debug, Clone)]
pub struct CGroupController {
    root: PathBuf,
    version: CgroupVersion,
}

impl CGroupController {
    /// Controller rooted at `root` with an explicit hierarchy version
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, version: CgroupVersion) -> Self {
        Self {
            root: root.into(),
            version,
        }
    }

    /// Controller for whatever hierarchy is mounted at `root`
    ///
    /// # Errors
    ///
    /// Returns [`Error::CGroup`] if neither a v1 nor a v2 hierarchy is found
    pub fn detect(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let version = CgroupVersion::detect(&root).ok_or_else(|| {
            Error::cgroup(format!("No cgroup hierarchy found at {}", root.display()))
        })?;
        debug!(root = %root.display(), %version, "Detected cgroup hierarchy");
        Ok(Self { root, version })
    }

    /// Detected or configured hierarchy version
    #[must_use]
    pub const fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Hierarchy root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths a group named `name` occupies, without touching the filesystem
    #[must_use]
    pub fn handle_for(&self, name: &str) -> CgroupHandle {
        match self.version {
            CgroupVersion::V2 => {
                let path = self.root.join(crate::VESSEL_NAMESPACE).join(name);
                CgroupHandle {
                    name: name.to_string(),
                    version: CgroupVersion::V2,
                    memory: path.clone(),
                    cpu: path,
                    freezer: None,
                }
            }
            CgroupVersion::V1 => {
                let group = |controller: &str| {
                    self.root
                        .join(controller)
                        .join(crate::VESSEL_NAMESPACE)
                        .join(name)
                };
                CgroupHandle {
                    name: name.to_string(),
                    version: CgroupVersion::V1,
                    memory: group("memory"),
                    cpu: group("cpu"),
                    freezer: self
                        .root
                        .join("freezer")
                        .is_dir()
                        .then(|| group("freezer")),
                }
            }
        }
    }

    /// Create every directory of the group
    async fn create(&self, handle: &CgroupHandle) -> Result<()> {
        for path in handle.paths() {
            let parent = path
                .parent()
                .ok_or_else(|| Error::config("Invalid cgroup path"))?;

            if !parent.exists() {
                debug!("Creating parent directory: {}", parent.display());
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::PermissionDenied {
                        operation: format!("Create parent directory: {e}"),
                    })?;
            }

            if self.version == CgroupVersion::V2 {
                self.enable_controllers(parent).await?;
            }

            if !path.exists() {
                debug!("Creating cgroup directory: {}", path.display());
                fs::create_dir(path).await.map_err(|e| {
                    Error::cgroup(format!("Failed to create cgroup directory: {e}"))
                })?;
            }
        }
        Ok(())
    }

    /// Enable the cpu and memory controllers for children of `parent`
    ///
    /// Walks from the root down so each level delegates to the next.
    async fn enable_controllers(&self, parent: &Path) -> Result<()> {
        let mut levels = vec![self.root.clone()];
        if parent != self.root {
            levels.push(parent.to_path_buf());
        }

        for level in levels {
            let control_file = level.join("cgroup.subtree_control");
            let current = fs::read_to_string(&control_file).await.unwrap_or_default();

            let missing: Vec<&str> = ["cpu", "memory"]
                .into_iter()
                .filter(|controller| !current.split_whitespace().any(|c| c == *controller))
                .collect();

            if missing.is_empty() {
                continue;
            }

            let to_enable = missing
                .iter()
                .map(|c| format!("+{c}"))
                .collect::<Vec<_>>()
                .join(" ");

            debug!("Enabling controllers in {}: {}", level.display(), to_enable);

            if let Err(e) = fs::write(&control_file, &to_enable).await {
                // Controllers may be delegated from a higher level
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    debug!("Could not enable controllers in {}: {}", level.display(), e);
                } else {
                    return Err(Error::PermissionDenied {
                        operation: format!("Enable controllers in {}: {e}", level.display()),
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_control(path: &Path, file: &str, value: &str) -> Result<()> {
        fs::write(path.join(file), value)
            .await
            .map_err(|e| Error::PermissionDenied {
                operation: format!("Write {file}: {e}"),
            })
    }

    pub(crate) async fn write_limits(
        &self,
        handle: &CgroupHandle,
        limits: &ResourceLimits,
    ) -> Result<()> {
        for (dir, file, value) in limits.control_writes(handle) {
            debug!(cgroup = %handle.name, file, value = %value, "Writing limit");
            Self::write_control(dir, file, &value).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceBackend for CGroupController {
    async fn setup(&self, name: &str, limits: &ResourceLimits) -> Result<Option<CgroupHandle>> {
        let handle = self.handle_for(name);

        let created = match self.create(&handle).await {
            Ok(()) => self.write_limits(&handle, limits).await,
            Err(e) => Err(e),
        };

        if let Err(e) = created {
            // No half-built group survives a failed setup
            self.teardown(&handle).await.log(name, "cgroup");
            return Err(e);
        }

        info!(
            container = name,
            version = %self.version,
            memory = %limits.memory,
            cpu = %limits.cpu,
            "Cgroup ready"
        );
        Ok(Some(handle))
    }

    async fn attach(&self, handle: &CgroupHandle, pid: ProcessId) -> Result<()> {
        debug!("Adding process {} to cgroup {}", pid, handle.name);
        for path in handle.paths() {
            Self::write_control(path, "cgroup.procs", &pid.as_raw().to_string()).await?;
        }
        Ok(())
    }

    async fn freeze(&self, handle: &CgroupHandle) -> Result<()> {
        crate::freezer::set_frozen(handle, true).await
    }

    async fn thaw(&self, handle: &CgroupHandle) -> Result<()> {
        crate::freezer::set_frozen(handle, false).await
    }

    fn existing(&self, name: &str) -> Option<CgroupHandle> {
        let handle = self.handle_for(name);
        handle
            .paths()
            .iter()
            .any(|path| path.is_dir())
            .then_some(handle)
    }

    async fn memory_usage(&self, handle: &CgroupHandle) -> Result<u64> {
        crate::stats::memory_usage(handle).await
    }

    async fn violations(&self, handle: &CgroupHandle) -> Result<ViolationStats> {
        ViolationStats::read(handle).await
    }

    async fn teardown(&self, handle: &CgroupHandle) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::Skipped;
        for path in handle.paths() {
            outcome = outcome.and(remove_group(path).await);
        }
        outcome
    }

    fn version(&self) -> Option<CgroupVersion> {
        Some(self.version)
    }
}

/// Remove a group directory, children first
///
/// On a real cgroupfs the control files vanish with `rmdir`; anywhere else
/// the remaining plain files are removed too.
async fn remove_group(path: &Path) -> CleanupOutcome {
    if !path.exists() {
        return CleanupOutcome::Skipped;
    }

    let mut pending = vec![path.to_path_buf()];
    let mut ordered = Vec::new();
    while let Some(dir) = pending.pop() {
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                    pending.push(entry.path());
                }
            }
        }
        ordered.push(dir);
    }

    for dir in ordered.iter().rev() {
        match fs::remove_dir(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                if let Err(e) = fs::remove_dir_all(dir).await {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                    return CleanupOutcome::Failed(format!("{}: {e}", dir.display()));
                }
            }
            Err(e) => {
                warn!("Failed to remove {}: {}", dir.display(), e);
                return CleanupOutcome::Failed(format!("{}: {e}", dir.display()));
            }
        }
    }

    debug!("Removed cgroup {}", path.display());
    CleanupOutcome::Done
}
