//! Resource backend trait for pluggable implementations

use async_trait::async_trait;
use tracing::debug;
use vessel_core::{CleanupOutcome, Error, ProcessId, Result};

use crate::controller::{CgroupHandle, CgroupVersion};
use crate::limits::ResourceLimits;
use crate::stats::ViolationStats;

/// Trait for resource management backends
///
/// This allows for different implementations:
/// - [`CGroupController`](crate::CGroupController) - cgroup v1/v2 filesystem
/// - [`UnconfinedBackend`] - hosts without cgroup access
///
/// # Thread Safety
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Create a group for `name` and apply `limits`
    ///
    /// Returns `None` when the backend does not confine processes. A failed
    /// setup leaves no directories behind.
    ///
    /// # Errors
    /// Returns error if the group cannot be created or a limit cannot be written
    async fn setup(&self, name: &str, limits: &ResourceLimits) -> Result<Option<CgroupHandle>>;

    /// Move a process into the group
    ///
    /// # Errors
    /// Returns error if the process cannot be added
    async fn attach(&self, handle: &CgroupHandle, pid: ProcessId) -> Result<()>;

    /// Suspend every task in the group
    ///
    /// # Errors
    /// Returns error if the freezer is unavailable
    async fn freeze(&self, handle: &CgroupHandle) -> Result<()>;

    /// Resume a frozen group
    ///
    /// # Errors
    /// Returns error if the freezer is unavailable
    async fn thaw(&self, handle: &CgroupHandle) -> Result<()>;

    /// Group left behind for `name` by an earlier runtime, if any
    fn existing(&self, name: &str) -> Option<CgroupHandle>;

    /// Memory charged to every task in the group, in bytes
    ///
    /// # Errors
    /// Returns error if the usage file cannot be read
    async fn memory_usage(&self, handle: &CgroupHandle) -> Result<u64>;

    /// Read OOM and throttling counters
    ///
    /// # Errors
    /// Returns error if the counters cannot be read
    async fn violations(&self, handle: &CgroupHandle) -> Result<ViolationStats>;

    /// Remove the group; never fails the caller
    async fn teardown(&self, handle: &CgroupHandle) -> CleanupOutcome;

    /// Hierarchy version, if any
    fn version(&self) -> Option<CgroupVersion>;
}

/// Backend for hosts where processes run without resource confinement
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfinedBackend;

#[async_trait]
impl ResourceBackend for UnconfinedBackend {
    async fn setup(&self, name: &str, _limits: &ResourceLimits) -> Result<Option<CgroupHandle>> {
        debug!(container = name, "Resource limits not enforced");
        Ok(None)
    }

    async fn attach(&self, _handle: &CgroupHandle, _pid: ProcessId) -> Result<()> {
        Ok(())
    }

    async fn freeze(&self, _handle: &CgroupHandle) -> Result<()> {
        Err(Error::Unsupported {
            operation: "cgroup freezer".to_string(),
        })
    }

    async fn thaw(&self, _handle: &CgroupHandle) -> Result<()> {
        Err(Error::Unsupported {
            operation: "cgroup freezer".to_string(),
        })
    }

    fn existing(&self, _name: &str) -> Option<CgroupHandle> {
        None
    }

    async fn memory_usage(&self, _handle: &CgroupHandle) -> Result<u64> {
        Err(Error::Unsupported {
            operation: "cgroup memory accounting".to_string(),
        })
    }

    async fn violations(&self, _handle: &CgroupHandle) -> Result<ViolationStats> {
        Ok(ViolationStats::default())
    }

    async fn teardown(&self, _handle: &CgroupHandle) -> CleanupOutcome {
        CleanupOutcome::Skipped
    }

    fn version(&self) -> Option<CgroupVersion> {
        None
    }
}
