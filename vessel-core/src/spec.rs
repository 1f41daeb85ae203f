//! Declarative container specification
//!
//! A [`ContainerSpec`] is what the configuration loader hands to the runtime.
//! It is validated once and treated as immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::validate_name;
use crate::{CpuPercent, Error, MemorySize, Result};

const DEFAULT_MEMORY_MB: u64 = 100;
const DEFAULT_CPU_PERCENT: f64 = 50.0;

/// Host path bound into the container's root filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeMapping {
    /// Directory on the host
    pub host: PathBuf,
    /// Absolute path inside the container
    pub container: PathBuf,
}

impl VolumeMapping {
    /// Parse `host:container`, or a single path used on both sides
    ///
    /// # Errors
    /// Returns error if either side is empty or the container side is relative
    pub fn parse(value: &str) -> Result<Self> {
        let (host, container) = value.split_once(':').unwrap_or((value, value));

        if host.is_empty() || container.is_empty() {
            return Err(Error::config(format!("Invalid volume mapping '{value}'")));
        }
        if !container.starts_with('/') {
            return Err(Error::config(format!(
                "Volume target must be absolute: '{container}'"
            )));
        }

        Ok(Self {
            host: PathBuf::from(host),
            container: PathBuf::from(container),
        })
    }

    /// Location of the mount point below `rootfs`
    #[must_use]
    pub fn target_in(&self, rootfs: &std::path::Path) -> PathBuf {
        let relative = self
            .container
            .strip_prefix("/")
            .unwrap_or(self.container.as_path());
        rootfs.join(relative)
    }
}

impl fmt::Display for VolumeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

impl TryFrom<String> for VolumeMapping {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<VolumeMapping> for String {
    fn from(v: VolumeMapping) -> Self {
        v.to_string()
    }
}

/// Host port forwarded to a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    /// Port on the host
    pub host: u16,
    /// Port inside the container
    pub container: u16,
}

impl PortMapping {
    /// Create a mapping
    #[must_use]
    pub const fn new(host: u16, container: u16) -> Self {
        Self { host, container }
    }

    /// Parse `host:container`, or a single port used on both sides
    ///
    /// # Errors
    /// Returns error if a port is not a number in 1..=65535
    pub fn parse(value: &str) -> Result<Self> {
        let parse_port = |s: &str| -> Result<u16> {
            match s.trim().parse::<u16>() {
                Ok(0) | Err(_) => Err(Error::config(format!("Invalid port '{s}'"))),
                Ok(port) => Ok(port),
            }
        };

        match value.split_once(':') {
            Some((host, container)) => Ok(Self::new(parse_port(host)?, parse_port(container)?)),
            None => {
                let port = parse_port(value)?;
                Ok(Self::new(port, port))
            }
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl TryFrom<String> for PortMapping {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<PortMapping> for String {
    fn from(p: PortMapping) -> Self {
        p.to_string()
    }
}

/// Rule governing automatic restart after the process stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart
    #[default]
    #[serde(alias = "no")]
    None,
    /// Restart whenever the container is found stopped
    Always,
    /// Restart when the health check declares the container unhealthy
    OnFailure,
    /// Restart when stopped, up to a fixed ceiling
    UnlessStopped,
}

impl FromStr for RestartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" | "none" => Ok(Self::None),
            "always" => Ok(Self::Always),
            "on-failure" => Ok(Self::OnFailure),
            "unless-stopped" => Ok(Self::UnlessStopped),
            other => Err(Error::config(format!("Unknown restart policy '{other}'"))),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::UnlessStopped => "unless-stopped",
        };
        f.write_str(s)
    }
}

/// Periodic probe deciding container health
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Shell command; exit status 0 means healthy
    pub cmd: String,
    /// Delay between probes
    #[serde(with = "duration_secs", default = "default_interval")]
    pub interval: Duration,
    /// Upper bound for one probe
    #[serde(with = "duration_secs", default = "default_timeout")]
    pub timeout: Duration,
    /// Consecutive failures before the container is unhealthy
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl HealthCheckSpec {
    /// Probe with the default interval (30s), timeout (10s) and retries (3)
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            interval: default_interval(),
            timeout: default_timeout(),
            retries: default_retries(),
        }
    }
}

const fn default_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_retries() -> u32 {
    3
}

/// Optional isolation features layered on top of PID/mount/UTS namespaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationFlags {
    /// New user namespace with root mapped to the caller
    pub user_namespace: bool,
    /// New IPC namespace
    pub ipc_namespace: bool,
    /// New network namespace wired to the host bridge
    pub network_namespace: bool,
    /// Remount the root filesystem read-only
    pub read_only_root: bool,
    /// Capabilities removed from the bounding set (e.g. `net_raw`)
    pub drop_capabilities: Vec<String>,
    /// Run the whole command under a syscall tracer
    pub trace: bool,
}

/// Validated container specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Unique, externally meaningful name
    pub name: String,
    /// Shell command line
    pub command: String,
    /// Image the rootfs was built from
    #[serde(default)]
    pub image: Option<String>,
    /// Root filesystem directory, filled in by the filesystem collaborator
    #[serde(default)]
    pub rootfs: PathBuf,
    /// Memory limit in MB
    #[serde(default = "default_memory_mb")]
    pub mem_limit_mb: u64,
    /// CPU limit in percent of one core
    #[serde(default = "default_cpu_percent")]
    pub cpu_limit_percent: f64,
    /// Volume mappings, applied in order
    #[serde(default)]
    pub volumes: Vec<VolumeMapping>,
    /// Environment variables
    #[serde(default, alias = "env_vars")]
    pub env: BTreeMap<String, String>,
    /// Port mappings, applied in order
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Restart policy
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Optional health check
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    /// Isolation flags
    #[serde(default)]
    pub isolation: IsolationFlags,
    /// Fixed cgroup v1 `cpu.shares`, overriding the percentage
    #[serde(default)]
    pub cpu_shares: Option<u64>,
    /// Scheduling niceness for the container process
    #[serde(default)]
    pub nice: Option<i32>,
}

const fn default_memory_mb() -> u64 {
    DEFAULT_MEMORY_MB
}

const fn default_cpu_percent() -> f64 {
    DEFAULT_CPU_PERCENT
}

impl ContainerSpec {
    /// Create a spec with default limits and no optional features
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            image: None,
            rootfs: PathBuf::new(),
            mem_limit_mb: DEFAULT_MEMORY_MB,
            cpu_limit_percent: DEFAULT_CPU_PERCENT,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            restart_policy: RestartPolicy::None,
            health_check: None,
            isolation: IsolationFlags::default(),
            cpu_shares: None,
            nice: None,
        }
    }

    /// Parse a spec from JSON and validate it
    ///
    /// # Errors
    /// Returns error on malformed JSON or failed validation
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(json)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Set the memory limit in MB
    #[must_use]
    pub const fn with_memory_mb(mut self, mb: u64) -> Self {
        self.mem_limit_mb = mb;
        self
    }

    /// Set the CPU limit in percent of one core
    #[must_use]
    pub const fn with_cpu_percent(mut self, percent: f64) -> Self {
        self.cpu_limit_percent = percent;
        self
    }

    /// Set the restart policy
    #[must_use]
    pub const fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Attach a health check
    #[must_use]
    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Add a port mapping
    #[must_use]
    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping::new(host, container));
        self
    }

    /// Add a volume mapping
    #[must_use]
    pub fn with_volume(mut self, volume: VolumeMapping) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the isolation flags
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationFlags) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the root filesystem path
    #[must_use]
    pub fn with_rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.rootfs = rootfs.into();
        self
    }

    /// Memory limit as a typed size
    #[must_use]
    pub const fn memory_limit(&self) -> MemorySize {
        MemorySize::from_mb(self.mem_limit_mb)
    }

    /// CPU limit as a typed percentage
    #[must_use]
    pub const fn cpu_limit(&self) -> CpuPercent {
        CpuPercent::new(self.cpu_limit_percent)
    }

    /// Check the spec for values the runtime cannot honour
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] naming the first offending field
    pub fn validate(&self) -> Result<()> {
        validate_name("Container name", &self.name)?;

        if self.command.trim().is_empty() {
            return Err(Error::config("Command cannot be empty"));
        }

        if self.mem_limit_mb == 0 {
            return Err(Error::config("Memory limit must be positive"));
        }

        let max_cpu = 100.0 * std::thread::available_parallelism().map_or(1.0, |n| {
            #[allow(clippy::cast_precision_loss)]
            let cores = n.get() as f64;
            cores
        });
        if self.cpu_limit_percent <= 0.0 || self.cpu_limit_percent > max_cpu {
            return Err(Error::config(format!(
                "CPU limit must be in (0, {max_cpu}], got {}",
                self.cpu_limit_percent
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for port in &self.ports {
            if port.host == 0 || port.container == 0 {
                return Err(Error::config(format!("Invalid port mapping {port}")));
            }
            if !seen.insert(port.host) {
                return Err(Error::config(format!(
                    "Host port {} mapped more than once",
                    port.host
                )));
            }
        }

        for volume in &self.volumes {
            if !volume.container.is_absolute() {
                return Err(Error::config(format!(
                    "Volume target must be absolute: {}",
                    volume.container.display()
                )));
            }
        }

        if let Some(check) = &self.health_check {
            if check.cmd.trim().is_empty() {
                return Err(Error::config("Health check command cannot be empty"));
            }
            if check.interval.is_zero() || check.timeout.is_zero() {
                return Err(Error::config(
                    "Health check interval and timeout must be positive",
                ));
            }
            if check.retries == 0 {
                return Err(Error::config("Health check retries must be at least 1"));
            }
        }

        if let Some(nice) = self.nice {
            if !(-20..=19).contains(&nice) {
                return Err(Error::config(format!("Nice value out of range: {nice}")));
            }
        }

        Ok(())
    }
}

/// Parse `KEY=VALUE`; a bare key maps to an empty value
#[must_use]
pub fn parse_env(value: &str) -> (String, String) {
    match value.split_once('=') {
        Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
        None => (value.trim().to_string(), String::new()),
    }
}

// Durations as (fractional) seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
