//! Link drivers execute iproute2 operations

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use vessel_core::{Error, Result};

/// Runs `ip` subcommands
///
/// Swapping the driver lets the same wiring logic run against the real
/// kernel, a simulation host, or a recorder in tests.
#[async_trait]
pub trait LinkDriver: Send + Sync + std::fmt::Debug {
    /// Run `ip <args>`, returning its stdout
    ///
    /// # Errors
    /// Returns [`Error::Network`] carrying stderr when `ip` fails
    async fn ip(&self, args: &[String]) -> Result<String>;
}

/// Driver backed by the host's `ip` binary
#[derive(Debug, Clone, Copy, Default)]
pub struct IpRouteDriver;

#[async_trait]
impl LinkDriver for IpRouteDriver {
    async fn ip(&self, args: &[String]) -> Result<String> {
        debug!(command = %format!("ip {}", args.join(" ")), "Running iproute2");

        let output = Command::new("ip").args(args).output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(Error::network(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Driver for hosts without network namespaces; every operation succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLinkDriver;

#[async_trait]
impl LinkDriver for NoopLinkDriver {
    async fn ip(&self, _args: &[String]) -> Result<String> {
        Ok(String::new())
    }
}

/// Whether an `ip` failure means the object was already gone
#[must_use]
pub fn is_already_gone(error: &Error) -> bool {
    let message = error.to_string();
    [
        "Cannot find device",
        "No such file or directory",
        "does not exist",
        "not found",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

/// Whether an `ip` failure means the object already exists
#[must_use]
pub fn is_already_present(error: &Error) -> bool {
    let message = error.to_string();
    message.contains("File exists") || message.contains("already exists")
}
