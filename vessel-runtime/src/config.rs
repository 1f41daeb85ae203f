//! Runtime configuration
//!
//! Every fixed interval the supervisor uses lives in [`SupervisorTimings`] so
//! tests can shrink them without touching behaviour.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use vessel_cgroup::CGROUP_ROOT;
use vessel_core::{Error, Result};
use vessel_network::NetworkConfig;

/// Environment variable overriding [`RuntimeConfig::state_dir`]
pub const ENV_STATE_DIR: &str = "VESSEL_STATE_DIR";
/// Environment variable overriding [`RuntimeConfig::cgroup_root`]
pub const ENV_CGROUP_ROOT: &str = "VESSEL_CGROUP_ROOT";
/// Environment variable overriding [`RuntimeConfig::isolation`]
pub const ENV_ISOLATION: &str = "VESSEL_ISOLATION";
/// Environment variable overriding [`NetworkConfig::bridge_name`]
pub const ENV_BRIDGE: &str = "VESSEL_BRIDGE";
/// Environment variable overriding [`NetworkConfig::subnet`]
pub const ENV_SUBNET: &str = "VESSEL_SUBNET";

/// How containers are launched on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Isolate when the host supports it, simulate otherwise
    #[default]
    Auto,
    /// Always isolate; fail at startup if the host cannot
    Isolated,
    /// Run commands directly on the host
    Simulated,
}

impl FromStr for IsolationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "isolated" => Ok(Self::Isolated),
            "simulated" | "simulation" => Ok(Self::Simulated),
            other => Err(Error::config(format!("Unknown isolation mode '{other}'"))),
        }
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Isolated => "isolated",
            Self::Simulated => "simulated",
        };
        f.write_str(s)
    }
}

/// Intervals and deadlines used by the supervisor and its monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorTimings {
    /// Wait between SIGTERM and SIGKILL
    #[serde(with = "millis")]
    pub stop_grace: Duration,
    /// Resource monitor sampling period
    #[serde(with = "millis")]
    pub sample_interval: Duration,
    /// Restart monitor polling period
    #[serde(with = "millis")]
    pub restart_poll: Duration,
    /// Delay before a policy-driven restart
    #[serde(with = "millis")]
    pub policy_restart_delay: Duration,
    /// Delay between stop and start on a manual restart
    #[serde(with = "millis")]
    pub manual_restart_delay: Duration,
    /// Delay between stop and start on a health-driven restart
    #[serde(with = "millis")]
    pub health_restart_delay: Duration,
    /// Cgroup violation polling period
    #[serde(with = "millis")]
    pub violation_poll: Duration,
    /// Zombie reaper polling period
    #[serde(with = "millis")]
    pub reaper_poll: Duration,
    /// Upper bound for `exec`
    #[serde(with = "millis")]
    pub exec_timeout: Duration,
    /// CPU measurement window for on-demand metrics
    #[serde(with = "millis")]
    pub cpu_window: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(3),
            sample_interval: Duration::from_secs(2),
            restart_poll: Duration::from_secs(5),
            policy_restart_delay: Duration::from_secs(2),
            manual_restart_delay: Duration::from_millis(500),
            health_restart_delay: Duration::from_secs(2),
            violation_poll: Duration::from_secs(2),
            reaper_poll: Duration::from_secs(1),
            exec_timeout: Duration::from_secs(30),
            cpu_window: Duration::from_millis(100),
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding metadata, images and container root filesystems
    pub state_dir: PathBuf,
    /// Mount point of the cgroup hierarchy
    pub cgroup_root: PathBuf,
    /// Bridge, subnet and port probe settings
    pub network: NetworkConfig,
    /// Launch strategy
    pub isolation: IsolationMode,
    /// Supervisor intervals
    pub timings: SupervisorTimings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./vessel-state"),
            cgroup_root: PathBuf::from(CGROUP_ROOT),
            network: NetworkConfig::default(),
            isolation: IsolationMode::Auto,
            timings: SupervisorTimings::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `VESSEL_*` environment variables
    ///
    /// # Errors
    /// Returns error if `VESSEL_ISOLATION` holds an unknown mode
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    ///
    /// # Errors
    /// Returns error if the isolation value is not a known mode
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(dir) = var(ENV_STATE_DIR) {
            config = config.with_state_dir(dir);
        }
        if let Some(root) = var(ENV_CGROUP_ROOT) {
            config = config.with_cgroup_root(root);
        }
        if let Some(mode) = var(ENV_ISOLATION) {
            config.isolation = mode.parse()?;
        }
        if let Some(bridge) = var(ENV_BRIDGE) {
            config.network = config.network.with_bridge(bridge);
        }
        if let Some(subnet) = var(ENV_SUBNET) {
            config.network = config.network.with_subnet(subnet);
        }

        Ok(config)
    }

    /// Set the state directory
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set the cgroup mount point
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Set the network settings
    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Set the launch strategy
    #[must_use]
    pub const fn with_isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = mode;
        self
    }

    /// Set the supervisor intervals
    #[must_use]
    pub const fn with_timings(mut self, timings: SupervisorTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Path of the metadata file
    #[must_use]
    pub fn metadata_file(&self) -> PathBuf {
        self.state_dir.join("containers.json")
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
