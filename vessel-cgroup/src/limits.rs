//! Resource limit translation
//!
//! Maps a container's memory/CPU limits onto the control files of each
//! hierarchy version:
//!
//! | limit  | v1                              | v2                    |
//! |--------|---------------------------------|-----------------------|
//! | memory | `memory.limit_in_bytes`         | `memory.max`          |
//! | cpu    | `cpu.shares` (1024 == one core) | `cpu.max` quota/period |

use std::path::Path;
use vessel_core::{ContainerSpec, CpuPercent, MemorySize};

use crate::controller::{CgroupHandle, CgroupVersion};

/// Limits applied to a container's cgroup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Hard memory ceiling
    pub memory: MemorySize,
    /// CPU allowance as percent of one core
    pub cpu: CpuPercent,
    /// Explicit v1 shares, overriding the percentage
    pub cpu_shares: Option<u64>,
}

impl ResourceLimits {
    /// Limits with no share override
    #[must_use]
    pub const fn new(memory: MemorySize, cpu: CpuPercent) -> Self {
        Self {
            memory,
            cpu,
            cpu_shares: None,
        }
    }

    /// Limits declared by a container spec
    #[must_use]
    pub const fn from_spec(spec: &ContainerSpec) -> Self {
        Self {
            memory: spec.memory_limit(),
            cpu: spec.cpu_limit(),
            cpu_shares: spec.cpu_shares,
        }
    }

    /// v1 `cpu.shares` value
    #[must_use]
    pub fn shares(&self) -> u64 {
        self.cpu_shares.unwrap_or_else(|| self.cpu.to_shares())
    }

    /// v2 `cpu.max` line
    #[must_use]
    pub fn cpu_max(&self) -> String {
        let (quota, period) = self.cpu.to_quota();
        format!("{quota} {period}")
    }

    /// Control file writes for `handle`, in application order
    pub(crate) fn control_writes<'a>(
        &self,
        handle: &'a CgroupHandle,
    ) -> Vec<(&'a Path, &'static str, String)> {
        let memory = self.memory.as_bytes().to_string();
        match handle.version() {
            CgroupVersion::V1 => vec![
                (handle.memory_path(), "memory.limit_in_bytes", memory),
                (handle.cpu_path(), "cpu.shares", self.shares().to_string()),
            ],
            CgroupVersion::V2 => vec![
                (handle.memory_path(), "memory.max", memory),
                (handle.cpu_path(), "cpu.max", self.cpu_max()),
            ],
        }
    }
}
