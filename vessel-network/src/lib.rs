//! Container networking: addresses, host ports and bridge wiring
//!
//! - [`IpAllocator`] hands out addresses from a private subnet
//! - [`PortTable`] tracks which container owns which host port
//! - [`NetworkManager`] binds ports atomically and wires a container's
//!   network namespace to the shared bridge through a [`LinkDriver`]

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod driver;
pub mod ip;
pub mod manager;
pub mod ports;

pub use driver::{IpRouteDriver, LinkDriver, NoopLinkDriver};
pub use ip::IpAllocator;
pub use manager::{Endpoint, NetworkConfig, NetworkManager};
pub use ports::{PortBinding, PortTable};
