//! Resource value objects with compile-time unit safety

use serde::{Deserialize, Serialize};
use std::fmt;

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Memory size value object with compile-time unit safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MemorySize(u64); // bytes

impl MemorySize {
    /// Create from megabytes
    #[must_use]
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb.saturating_mul(MB))
    }

    /// Get value in bytes
    #[must_use]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get value in megabytes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_mb(self) -> f64 {
        self.0 as f64 / MB as f64
    }
}

impl fmt::Display for MemorySize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= GB {
            write!(f, "{:.2} GB", self.0 as f64 / GB as f64)
        } else if self.0 >= MB {
            write!(f, "{:.2} MB", self.as_mb())
        } else if self.0 >= KB {
            write!(f, "{:.2} KB", self.0 as f64 / KB as f64)
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// CPU limit expressed as a percentage of one core
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct CpuPercent(f64);

impl CpuPercent {
    /// Scheduler period used for `cpu.max`, in microseconds
    pub const PERIOD_US: u64 = 100_000;

    /// `cpu.shares` granted per percent of one core (1024 shares == 100%)
    pub const SHARES_PER_PERCENT: f64 = 10.24;

    /// Create a new percentage value
    #[must_use]
    pub const fn new(percent: f64) -> Self {
        Self(percent)
    }

    /// Get value as f64
    #[must_use]
    pub const fn as_f64(self) -> f64 {
        self.0
    }

    /// Linear conversion to cgroup v1 `cpu.shares`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_shares(self) -> u64 {
        (self.0 * Self::SHARES_PER_PERCENT).max(2.0) as u64
    }

    /// Convert to cgroup v2 `cpu.max` quota/period
    ///
    /// Returns (quota, period) in microseconds
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn to_quota(self) -> (u64, u64) {
        let quota = (self.0 / 100.0 * Self::PERIOD_US as f64) as u64;
        (quota.max(1_000), Self::PERIOD_US)
    }
}

impl fmt::Display for CpuPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

/// Best-effort resource usage snapshot, refreshed by sampling
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// CPU usage as percent of one core
    pub cpu_percent: f64,
    /// Resident memory in MB
    pub memory_mb: f64,
    /// Bytes read from storage
    pub disk_read: u64,
    /// Bytes written to storage
    pub disk_write: u64,
    /// Bytes received on non-loopback interfaces
    pub network_rx: u64,
    /// Bytes sent on non-loopback interfaces
    pub network_tx: u64,
}
