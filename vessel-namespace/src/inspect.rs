//! `/proc/<pid>/ns` inspection

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::debug;
use vessel_core::{Error, ProcessId, Result};

use crate::config::NamespaceConfig;

/// Namespace kinds as named under `/proc/<pid>/ns`
pub const KINDS: [&str; 6] = ["pid", "mnt", "uts", "ipc", "net", "user"];

/// Namespace links of one process, keyed by kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceInfo {
    links: BTreeMap<&'static str, String>,
}

impl NamespaceInfo {
    /// Read the namespace links of `pid`
    ///
    /// # Errors
    /// Returns error if the process has no `/proc` entry
    pub fn for_pid(pid: ProcessId) -> Result<Self> {
        Self::read(PathBuf::from(format!("/proc/{pid}/ns")))
    }

    /// Namespace links of the calling process
    ///
    /// # Errors
    /// Returns error if `/proc/self/ns` cannot be read
    pub fn current() -> Result<Self> {
        Self::read(PathBuf::from("/proc/self/ns"))
    }

    fn read(dir: PathBuf) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::namespace(format!(
                "No namespace information at {}",
                dir.display()
            )));
        }
        let links = KINDS
            .into_iter()
            .filter_map(|kind| {
                let link = fs::read_link(dir.join(kind)).ok()?;
                Some((kind, link.to_string_lossy().into_owned()))
            })
            .collect();
        Ok(Self { links })
    }

    /// Link target for `kind`, e.g. `pid:[4026531836]`
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&str> {
        self.links.get(kind).map(String::as_str)
    }

    /// Kinds that could be read
    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.links.keys().copied()
    }

    /// Kinds in which `self` and `other` are in different namespaces
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> Vec<&'static str> {
        KINDS
            .into_iter()
            .filter(|kind| self.get(kind) != other.get(kind))
            .collect()
    }

    /// Kinds `config` asks for that `self` still shares with `host`
    #[must_use]
    pub fn shared_with(&self, host: &Self, config: &NamespaceConfig) -> Vec<&'static str> {
        config
            .enabled_namespaces()
            .into_iter()
            .filter(|kind| self.get(kind).is_some() && self.get(kind) == host.get(kind))
            .collect()
    }
}

impl fmt::Display for NamespaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for link in self.links.values() {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(link)?;
            first = false;
        }
        Ok(())
    }
}

/// Upper bound on processes visited in one tree walk
const MAX_TREE: usize = 4096;

/// Direct children of `pid`, from `/proc/<pid>/task/<pid>/children`
fn children_of(pid: ProcessId) -> Vec<ProcessId> {
    fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .map(|list| {
            list.split_whitespace()
                .filter_map(|raw| raw.parse().ok())
                .map(ProcessId::from_raw)
                .collect()
        })
        .unwrap_or_default()
}

fn walk(pid: ProcessId, children: impl Fn(ProcessId) -> Vec<ProcessId>) -> Vec<ProcessId> {
    let mut tree = vec![pid];
    let mut next = 0;
    while next < tree.len() && tree.len() < MAX_TREE {
        let parent = tree[next];
        next += 1;
        for child in children(parent) {
            if !tree.contains(&child) {
                tree.push(child);
            }
        }
    }
    tree.truncate(MAX_TREE);
    tree
}

/// `pid` and all of its descendants, breadth first
#[must_use]
pub fn process_tree(pid: ProcessId) -> Vec<ProcessId> {
    walk(pid, children_of)
}

fn find_leader(
    pid: ProcessId,
    children: impl Fn(ProcessId) -> Vec<ProcessId>,
    pid_ns: impl Fn(ProcessId) -> Option<String>,
) -> ProcessId {
    let Some(outer) = pid_ns(pid) else {
        return pid;
    };
    walk(pid, children)
        .into_iter()
        .skip(1)
        .find(|candidate| pid_ns(*candidate).is_some_and(|ns| ns != outer))
        .unwrap_or(pid)
}

/// Process that owns a container's namespaces
///
/// `unshare --fork` stays in the caller's PID namespace and runs the command
/// in a forked child, possibly below wrappers such as `strace` or `nice`.
/// The first descendant of `pid` in another PID namespace is returned,
/// otherwise `pid` itself.
#[must_use]
pub fn namespace_leader(pid: ProcessId) -> ProcessId {
    let leader = find_leader(pid, children_of, |candidate| {
        NamespaceInfo::for_pid(candidate)
            .ok()
            .and_then(|info| info.get("pid").map(str::to_string))
    });
    if leader != pid {
        debug!(%pid, %leader, "Resolved namespace leader");
    }
    leader
}
