//! Namespace isolation for container processes
//!
//! This crate turns a container spec into the argument vector that launches
//! it:
//! - PID, mount and UTS namespaces always
//! - IPC, user and network namespaces on request
//! - `chroot` into the container rootfs, optionally remounted read-only
//! - capability bounding-set drops and syscall tracing
//!
//! Hosts without namespace support get [`SimulatedBuilder`], which runs the
//! command directly on the host. That mode offers **no isolation at all**; it
//! exists so supervision behaves the same everywhere.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod builder;
pub mod config;
pub mod exec;
pub mod inspect;
pub mod probe;
pub mod volumes;
pub mod words;

pub use builder::{SimulatedBuilder, SpawnBuilder, SpawnCommand, UnshareBuilder};
pub use config::NamespaceConfig;
pub use exec::nsenter_args;
pub use inspect::{NamespaceInfo, namespace_leader, process_tree};
pub use probe::HostCapabilities;
pub use volumes::{bind_volumes, unbind_volumes};
pub use words::split_command;
