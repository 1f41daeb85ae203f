//! Vessel Core - Foundation types, events, and utilities
//!
//! This crate provides the core abstractions used throughout Vessel.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod events;
pub mod record;
pub mod resources;
pub mod spec;
pub mod types;

pub use error::{CleanupOutcome, Error, Result};
pub use events::{
    ContainerStatus, EventObserver, HealthStatus, LifecycleEvent, LifecycleKind, LifecycleLog,
    TracingObserver,
};
pub use record::ContainerRecord;
pub use resources::{CpuPercent, MemorySize, Metrics};
pub use spec::{
    ContainerSpec, HealthCheckSpec, IsolationFlags, PortMapping, RestartPolicy, VolumeMapping,
    parse_env,
};
pub use types::{ContainerId, ProcessId};
