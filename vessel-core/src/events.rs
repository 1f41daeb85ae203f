//! Container lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use crate::Error;

/// Supervisor state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Constructed, never started
    Created,
    /// Process alive
    Running,
    /// Process frozen
    Paused,
    /// No process
    Stopped,
    /// Last start attempt failed
    Error,
}

impl ContainerStatus {
    /// Whether a live process is associated with this status
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for ContainerStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "Created" => Ok(Self::Created),
            "Running" => Ok(Self::Running),
            "Paused" => Ok(Self::Paused),
            "Stopped" => Ok(Self::Stopped),
            "Error" => Ok(Self::Error),
            other => Err(Error::config(format!("Unknown status '{other}'"))),
        }
    }
}

/// Result of the most recent health probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No probe has completed
    #[default]
    Unknown,
    /// Probing has begun for this run
    Starting,
    /// Last probe succeeded
    Healthy,
    /// Failure threshold reached
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Kinds of lifecycle events recorded per container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// Container constructed
    Created,
    /// Process launched
    Started,
    /// Process stopped on request or by policy
    Stopped,
    /// Process exited on its own
    Exited,
    /// Process frozen
    Paused,
    /// Process thawed
    Resumed,
    /// Kernel OOM killer fired inside the cgroup
    OomKilled,
    /// CPU quota throttled the cgroup
    CpuThrottled,
    /// Health status flipped to unhealthy
    Unhealthy,
    /// Start sequence failed
    StartFailed,
}

impl LifecycleKind {
    /// Stable snake-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::OomKilled => "oom_killed",
            Self::CpuThrottled => "cpu_throttled",
            Self::Unhealthy => "unhealthy",
            Self::StartFailed => "start_failed",
        }
    }

    /// Check if this is a critical event
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::OomKilled | Self::CpuThrottled | Self::Unhealthy | Self::StartFailed
        )
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a container's append-only lifecycle log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened
    pub kind: LifecycleKind,
    /// When it happened
    #[serde(with = "systemtime_serde")]
    pub timestamp: SystemTime,
    /// Container status right after the event
    pub status: ContainerStatus,
}

impl LifecycleEvent {
    /// Emit structured tracing event
    pub fn emit_trace(&self, container: &str) {
        let event = self.kind.as_str();
        match self.kind {
            LifecycleKind::OomKilled | LifecycleKind::CpuThrottled | LifecycleKind::Unhealthy => {
                tracing::warn!(container, event, status = %self.status, "Resource violation");
            }
            LifecycleKind::StartFailed => {
                tracing::error!(container, event, status = %self.status, "Container failed to start");
            }
            _ => {
                tracing::info!(container, event, status = %self.status, "Lifecycle transition");
            }
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.status)
    }
}

/// Append-only, causally ordered lifecycle log
///
/// Timestamps never decrease even if the wall clock steps backwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleLog {
    events: Vec<LifecycleEvent>,
}

impl LifecycleLog {
    /// Empty log
    #[must_use]
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Append an event stamped with the current time
    pub fn record(&mut self, kind: LifecycleKind, status: ContainerStatus) -> &LifecycleEvent {
        let now = SystemTime::now();
        let timestamp = match self.events.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.events.push(LifecycleEvent {
            kind,
            timestamp,
            status,
        });
        &self.events[self.events.len() - 1]
    }

    /// Copy of all events in order
    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleEvent> {
        self.events.clone()
    }

    /// Number of recorded events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing was recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events of one kind
    #[must_use]
    pub fn count(&self, kind: LifecycleKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

/// Receiver of supervisor notifications
///
/// The supervisor reports every significant event as `(name, message, status)`
/// and knows nothing about the transport behind an observer.
pub trait EventObserver: Send + Sync {
    /// Called for every notification
    fn on_event(&self, container: &str, message: &str, status: Option<ContainerStatus>);
}

/// Observer that forwards notifications to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_event(&self, container: &str, message: &str, status: Option<ContainerStatus>) {
        match status {
            Some(status) => tracing::info!(container, status = %status, "{message}"),
            None => tracing::info!(container, "{message}"),
        }
    }
}

// Millisecond-precision SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}
