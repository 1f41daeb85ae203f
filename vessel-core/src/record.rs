//! Persisted container metadata
//!
//! One record per container, keyed by container ID. The metadata store owns
//! persistence; this module only fixes the shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{ContainerId, ContainerSpec, ContainerStatus};

/// Metadata record written by the store on every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container ID
    pub id: ContainerId,
    /// Full specification (name, command, limits, volumes, ...)
    #[serde(flatten)]
    pub spec: ContainerSpec,
    /// Status at the time of writing
    pub status: ContainerStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last start time
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Last stop time
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// PID of the live process
    #[serde(default)]
    pub pid: Option<i32>,
    /// Automatic restarts performed so far
    #[serde(default)]
    pub restart_count: u32,
    /// Path of the container's log file
    pub log_file: PathBuf,
}

impl ContainerRecord {
    /// Record for a freshly created container
    #[must_use]
    pub fn new(id: ContainerId, spec: ContainerSpec, log_file: PathBuf) -> Self {
        Self {
            id,
            spec,
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            pid: None,
            restart_count: 0,
            log_file,
        }
    }

    /// Container name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}
