//! Namespace configuration

use serde::{Deserialize, Serialize};
use vessel_core::IsolationFlags;

/// Namespace configuration
///
/// PID, mount and UTS isolation are always on for an isolated container;
/// the remaining namespaces follow the container's isolation flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Enable PID namespace
    pub pid: bool,

    /// Enable mount namespace
    pub mount: bool,

    /// Enable UTS namespace (hostname)
    pub uts: bool,

    /// Enable IPC namespace
    pub ipc: bool,

    /// Enable user namespace, mapping the caller to root inside
    pub user: bool,

    /// Enable network namespace
    pub network: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            uts: true,
            ipc: false,
            user: false,
            network: false,
        }
    }
}

impl NamespaceConfig {
    /// Configuration requested by a container's isolation flags
    #[must_use]
    pub fn from_isolation(flags: &IsolationFlags) -> Self {
        Self::default()
            .with_ipc(flags.ipc_namespace)
            .with_user(flags.user_namespace)
            .with_network(flags.network_namespace)
    }

    /// Enable IPC namespace
    #[must_use]
    pub const fn with_ipc(mut self, enable: bool) -> Self {
        self.ipc = enable;
        self
    }

    /// Enable user namespace
    #[must_use]
    pub const fn with_user(mut self, enable: bool) -> Self {
        self.user = enable;
        self
    }

    /// Enable network namespace
    #[must_use]
    pub const fn with_network(mut self, enable: bool) -> Self {
        self.network = enable;
        self
    }

    /// Each namespace with its `/proc/<pid>/ns` name, its `unshare(1)` flags
    /// and whether it is enabled
    fn table(&self) -> [(bool, &'static str, &'static [&'static str]); 6] {
        [
            (self.pid, "pid", &["--pid"]),
            (self.mount, "mnt", &["--mount"]),
            (self.uts, "uts", &["--uts"]),
            (self.ipc, "ipc", &["--ipc"]),
            (self.user, "user", &["--user", "--map-root-user"]),
            (self.network, "net", &["--net"]),
        ]
    }

    /// Arguments for `unshare(1)`, ending with `--fork --kill-child`
    ///
    /// The forked child dies with `unshare` so a killed container leaves no
    /// orphaned init behind.
    #[must_use]
    pub fn unshare_args(&self) -> Vec<String> {
        self.table()
            .into_iter()
            .filter(|(enabled, _, _)| *enabled)
            .flat_map(|(_, _, flags)| flags.iter().copied())
            .chain(["--fork", "--kill-child"])
            .map(String::from)
            .collect()
    }

    /// Enabled namespaces, named as under `/proc/<pid>/ns`
    #[must_use]
    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        self.table()
            .into_iter()
            .filter_map(|(enabled, kind, _)| enabled.then_some(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_isolates_pid_mount_uts() {
        assert_eq!(
            NamespaceConfig::default().enabled_namespaces(),
            vec!["pid", "mnt", "uts"]
        );
    }

    #[test]
    fn test_default_unshare_args() {
        assert_eq!(
            NamespaceConfig::default().unshare_args(),
            vec!["--pid", "--mount", "--uts", "--fork", "--kill-child"]
        );
    }

    #[test]
    fn test_from_isolation_flags() {
        let flags = IsolationFlags {
            user_namespace: true,
            ipc_namespace: true,
            network_namespace: true,
            ..IsolationFlags::default()
        };
        let config = NamespaceConfig::from_isolation(&flags);

        assert_eq!(
            config.unshare_args(),
            vec![
                "--pid",
                "--mount",
                "--uts",
                "--ipc",
                "--user",
                "--map-root-user",
                "--net",
                "--fork",
                "--kill-child"
            ]
        );
    }

    #[test]
    fn test_enabled_namespaces() {
        let enabled = NamespaceConfig::default().with_ipc(true).enabled_namespaces();

        assert!(enabled.contains(&"pid"));
        assert!(enabled.contains(&"mnt"));
        assert!(enabled.contains(&"ipc"));
        assert!(!enabled.contains(&"net"));
    }
}
