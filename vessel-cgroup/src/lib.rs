//! Control-group resource management with pluggable backends
//!
//! This crate bounds a container's memory and CPU through the kernel cgroup
//! hierarchy (v1 split controllers or the v2 unified tree), attaches the
//! container process, freezes/thaws it, and reads the OOM and throttling
//! counters the supervisor watches.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod controller;
pub mod freezer;
pub mod limits;
pub mod stats;

pub use backend::{ResourceBackend, UnconfinedBackend};
pub use controller::{CGroupController, CgroupHandle, CgroupVersion};
pub use limits::ResourceLimits;
pub use stats::ViolationStats;

/// Default cgroup mount point
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Directory grouping all Vessel cgroups below each hierarchy
pub const VESSEL_NAMESPACE: &str = "vessel";
