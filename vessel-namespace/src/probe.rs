//! Host capability probing
//!
//! Decides once, at startup, whether containers can be isolated on this host.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::inspect::NamespaceInfo;

/// External programs an isolated launch depends on
pub const REQUIRED_BINARIES: [&str; 4] = ["unshare", "chroot", "nsenter", "ip"];

/// What the host offers for isolation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Running on Linux
    pub linux: bool,
    /// Effective UID is 0
    pub root: bool,
    /// PID and mount namespaces are visible under `/proc/self/ns`
    pub namespaces: bool,
    /// Each required binary and where it was found
    pub binaries: Vec<(String, Option<PathBuf>)>,
}

impl HostCapabilities {
    /// Inspect the current host
    #[must_use]
    pub fn probe() -> Self {
        let caps = Self {
            linux: cfg!(target_os = "linux"),
            root: nix::unistd::geteuid().is_root(),
            namespaces: NamespaceInfo::current()
                .is_ok_and(|ns| ns.get("pid").is_some() && ns.get("mnt").is_some()),
            binaries: REQUIRED_BINARIES
                .iter()
                .map(|bin| ((*bin).to_string(), find_in_path(bin)))
                .collect(),
        };
        debug!(?caps, "Probed host capabilities");
        caps
    }

    /// Whether a binary was found on `PATH`
    #[must_use]
    pub fn has_binary(&self, name: &str) -> bool {
        self.binaries
            .iter()
            .any(|(bin, path)| bin == name && path.is_some())
    }

    /// Binaries that could not be found
    #[must_use]
    pub fn missing_binaries(&self) -> Vec<&str> {
        self.binaries
            .iter()
            .filter(|(_, path)| path.is_none())
            .map(|(bin, _)| bin.as_str())
            .collect()
    }

    /// Whether containers can be launched with namespace isolation
    #[must_use]
    pub fn supports_isolation(&self) -> bool {
        self.linux
            && self.root
            && self.namespaces
            && self.has_binary("unshare")
            && self.has_binary("chroot")
    }
}

/// Locate an executable on `PATH`
#[must_use]
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}
