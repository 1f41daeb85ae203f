//! Container supervision engine
//!
//! - [`Runtime`] is the façade: create, start, stop, list and remove
//!   containers by name
//! - [`Container`] supervises one process through its lifecycle and owns
//!   the monitors attached to it
//! - [`Platform`] bundles the cgroup backend, spawn builder and network
//!   manager chosen for the host
//!
//! ```no_run
//! use vessel_core::ContainerSpec;
//! use vessel_runtime::{Runtime, RuntimeConfig};
//!
//! # async fn demo() -> vessel_core::Result<()> {
//! let runtime = Runtime::new(RuntimeConfig::from_env()?)?;
//! runtime.create(ContainerSpec::new("web", "sleep 100").with_memory_mb(50))?;
//! runtime.start("web").await?;
//! runtime.stop("web").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod container;
pub mod logfile;
mod monitors;
pub mod observer;
pub mod platform;
pub mod reaper;
pub mod rootfs;
pub mod runtime;
pub mod sampler;
pub mod store;

pub use config::{IsolationMode, RuntimeConfig, SupervisorTimings};
pub use container::{Container, ExecOutput, SupervisorContext};
pub use logfile::ContainerLog;
pub use monitors::MAX_AUTO_RESTARTS;
pub use observer::{ChannelObserver, Notification, Observers};
pub use platform::Platform;
pub use reaper::{ChildRegistry, ZombieReaper};
pub use rootfs::{LocalRootfs, RootfsProvider};
pub use runtime::Runtime;
pub use store::{JsonFileStore, MetadataStore};
