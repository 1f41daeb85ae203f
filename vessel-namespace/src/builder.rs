//! Spawn command construction
//!
//! A [`SpawnBuilder`] is chosen once per host. [`UnshareBuilder`] produces an
//! isolated launch:
//!
//! ```text
//! [strace -f -o <trace> --] [nice -n N] unshare --pid --mount --uts [...] --fork --kill-child
//!     [/bin/sh -c <remount-ro> vessel-ro ROOTFS]
//!     [setpriv --bounding-set -cap,...]
//!     chroot ROOTFS /bin/sh -c COMMAND
//! ```
//!
//! [`SimulatedBuilder`] runs the command directly on the host.

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use vessel_core::{CleanupOutcome, ContainerSpec, Error, Result};

use crate::config::NamespaceConfig;
use crate::volumes::{bind_volumes, unbind_volumes};
use crate::words::split_command;

/// Remounts the rootfs read-only inside the new mount namespace, keeping
/// volume submounts writable, then execs the remaining arguments
const READ_ONLY_SCRIPT: &str =
    r#"r=$1; shift; mount --rbind "$r" "$r" && mount -o remount,bind,ro "$r" && exec "$@""#;

/// Trace output file written next to the rootfs
pub const TRACE_FILE: &str = "trace.log";

/// A ready-to-spawn program with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    /// Program to execute
    pub program: String,
    /// Arguments after the program
    pub args: Vec<String>,
    /// Volume targets bound for this launch, released on stop
    pub volumes: Vec<PathBuf>,
}

impl SpawnCommand {
    fn from_argv(mut argv: Vec<String>, volumes: Vec<PathBuf>) -> Result<Self> {
        if argv.is_empty() {
            return Err(Error::InvalidCommand {
                message: "command is empty".to_string(),
            });
        }
        let program = argv.remove(0);
        Ok(Self {
            program,
            args: argv,
            volumes,
        })
    }

    /// Full argument vector, program first
    #[must_use]
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl std::fmt::Display for SpawnCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}

/// Host-specific way of launching a container process
pub trait SpawnBuilder: Send + Sync + std::fmt::Debug {
    /// Prepare the launch of `spec`
    ///
    /// Any volumes bound along the way are released again if this fails.
    ///
    /// # Errors
    /// Returns error for a missing rootfs, an unparsable command or a volume
    /// that cannot be bound
    fn build(&self, spec: &ContainerSpec) -> Result<SpawnCommand>;

    /// Undo the host-side effects of a launch, given its volume targets
    fn release(&self, volumes: &[PathBuf]) -> CleanupOutcome;

    /// Volume targets a launch of `spec` would have bound
    ///
    /// Used for processes started by an earlier runtime, whose mounts are
    /// still in place but were never recorded.
    fn bound_volumes(&self, spec: &ContainerSpec) -> Vec<PathBuf>;

    /// Whether launched processes get kernel isolation
    fn isolated(&self) -> bool;
}

/// Launches containers through `unshare(1)` and `chroot(1)`
#[derive(Debug, Clone, Copy, Default)]
pub struct UnshareBuilder;

impl UnshareBuilder {
    /// Trace file path for a container rooted at `rootfs`
    #[must_use]
    pub fn trace_file(rootfs: &Path) -> PathBuf {
        rootfs.parent().unwrap_or(rootfs).join(TRACE_FILE)
    }

    /// Compose the argument vector without touching the filesystem
    ///
    /// # Errors
    /// Returns error for an empty command or an invalid capability name
    pub fn compose(spec: &ContainerSpec) -> Result<Vec<String>> {
        if spec.command.trim().is_empty() {
            return Err(Error::InvalidCommand {
                message: "command is empty".to_string(),
            });
        }

        let isolation = &spec.isolation;
        let rootfs = spec.rootfs.display().to_string();
        let mut argv: Vec<String> = Vec::new();

        if isolation.trace {
            argv.extend(["strace", "-f", "-o"].map(String::from));
            argv.push(Self::trace_file(&spec.rootfs).display().to_string());
            argv.push("--".to_string());
        }

        if let Some(nice) = spec.nice {
            argv.extend(["nice", "-n"].map(String::from));
            argv.push(nice.to_string());
        }

        argv.push("unshare".to_string());
        argv.extend(NamespaceConfig::from_isolation(isolation).unshare_args());

        if isolation.read_only_root {
            argv.extend(["/bin/sh", "-c", READ_ONLY_SCRIPT, "vessel-ro"].map(String::from));
            argv.push(rootfs.clone());
        }

        if !isolation.drop_capabilities.is_empty() {
            let dropped = isolation
                .drop_capabilities
                .iter()
                .map(String::as_str)
                .map(capability_arg)
                .collect::<Result<Vec<_>>>()?;
            argv.extend(["setpriv", "--bounding-set"].map(String::from));
            argv.push(dropped.join(","));
        }

        argv.push("chroot".to_string());
        argv.push(rootfs);
        argv.extend(["/bin/sh", "-c"].map(String::from));
        argv.push(spec.command.clone());

        Ok(argv)
    }
}

/// `CAP_NET_RAW`, `cap_net_raw` and `net_raw` all become `-net_raw`
fn capability_arg(name: &str) -> Result<String> {
    let lower = name.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix("cap_").unwrap_or(&lower);

    if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(Error::config(format!("Invalid capability name '{name}'")));
    }

    Ok(format!("-{bare}"))
}

impl SpawnBuilder for UnshareBuilder {
    fn build(&self, spec: &ContainerSpec) -> Result<SpawnCommand> {
        if !spec.rootfs.is_dir() {
            return Err(Error::RootfsMissing {
                path: spec.rootfs.clone(),
            });
        }

        let argv = Self::compose(spec)?;
        let volumes = bind_volumes(&spec.rootfs, &spec.volumes)?;

        info!(
            container = %spec.name,
            namespaces = ?NamespaceConfig::from_isolation(&spec.isolation).enabled_namespaces(),
            volumes = volumes.len(),
            "Prepared isolated launch"
        );

        SpawnCommand::from_argv(argv, volumes)
    }

    fn release(&self, volumes: &[PathBuf]) -> CleanupOutcome {
        unbind_volumes(volumes)
    }

    fn bound_volumes(&self, spec: &ContainerSpec) -> Vec<PathBuf> {
        spec.volumes
            .iter()
            .map(|volume| volume.target_in(&spec.rootfs))
            .collect()
    }

    fn isolated(&self) -> bool {
        true
    }
}

/// Runs the container command directly on the host
///
/// Provides no isolation: no namespaces, no chroot, no volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedBuilder;

impl SpawnBuilder for SimulatedBuilder {
    fn build(&self, spec: &ContainerSpec) -> Result<SpawnCommand> {
        let mut argv = Vec::new();
        if let Some(nice) = spec.nice {
            argv.extend(["nice", "-n"].map(String::from));
            argv.push(nice.to_string());
        }
        argv.extend(split_command(&spec.command)?);

        if !spec.volumes.is_empty() {
            debug!(container = %spec.name, "Volumes are not bound in simulation mode");
        }

        SpawnCommand::from_argv(argv, Vec::new())
    }

    fn release(&self, _volumes: &[PathBuf]) -> CleanupOutcome {
        CleanupOutcome::Skipped
    }

    fn bound_volumes(&self, _spec: &ContainerSpec) -> Vec<PathBuf> {
        Vec::new()
    }

    fn isolated(&self) -> bool {
        false
    }
}
