//! Violation counters read from cgroup control files
//!
//! The supervisor only needs to know whether the kernel OOM-killed a task
//! or throttled the group; both are cumulative counters.

use tokio::fs;
use tracing::debug;
use vessel_core::{Error, Result};

use crate::controller::{CgroupHandle, CgroupVersion};

/// Cumulative OOM-kill and throttling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViolationStats {
    /// Tasks killed by the OOM killer
    pub oom_kills: u64,
    /// Scheduler periods in which the group was throttled
    pub throttled_periods: u64,
}

impl ViolationStats {
    /// Read the counters for `handle`
    ///
    /// Missing files read as zero: older kernels lack `oom_kill` and a
    /// freshly created group may not expose `cpu.stat` yet.
    pub async fn read(handle: &CgroupHandle) -> Result<Self> {
        let memory_file = match handle.version() {
            CgroupVersion::V1 => "memory.oom_control",
            CgroupVersion::V2 => "memory.events",
        };

        let oom_kills = read_key(&handle.memory_path().join(memory_file), "oom_kill").await;
        let throttled_periods =
            read_key(&handle.cpu_path().join("cpu.stat"), "nr_throttled").await;

        debug!(
            cgroup = handle.name(),
            oom_kills, throttled_periods, "Read violation counters"
        );

        Ok(Self {
            oom_kills,
            throttled_periods,
        })
    }

    /// Whether any OOM kill has been recorded
    #[must_use]
    pub const fn oom_killed(&self) -> bool {
        self.oom_kills > 0
    }

    /// Whether the group has been throttled at least once
    #[must_use]
    pub const fn throttled(&self) -> bool {
        self.throttled_periods > 0
    }
}

/// Bytes currently charged to the group, descendants included
pub async fn memory_usage(handle: &CgroupHandle) -> Result<u64> {
    let file = match handle.version() {
        CgroupVersion::V1 => "memory.usage_in_bytes",
        CgroupVersion::V2 => "memory.current",
    };
    let path = handle.memory_path().join(file);
    let content = fs::read_to_string(&path)
        .await
        .map_err(|e| Error::cgroup(format!("Cannot read {}: {e}", path.display())))?;
    content
        .trim()
        .parse()
        .map_err(|e| Error::cgroup(format!("Bad value in {}: {e}", path.display())))
}

/// Parse a flat keyed file
///
/// Format:
/// ```text
/// nr_periods 456
/// nr_throttled 123
/// throttled_usec 45678
/// ```
pub(crate) fn parse_key(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != key {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

async fn read_key(path: &std::path::Path, key: &str) -> u64 {
    match fs::read_to_string(path).await {
        Ok(content) => parse_key(&content, key).unwrap_or(0),
        Err(_) => 0,
    }
}
