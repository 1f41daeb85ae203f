//! Zombie reaping for isolated launches
//!
//! Only zombies that are children of this process, not tracked by a
//! supervisor, and still unreaped one poll later are collected. Tracked
//! children and short-lived helper commands are left to their own waiters.

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};
use vessel_core::ProcessId;

use crate::sampler::ProcStat;

/// PIDs of container processes owned by a live supervisor
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    pids: Arc<Mutex<HashSet<i32>>>,
}

impl ChildRegistry {
    /// Mark `pid` as supervised
    pub fn track(&self, pid: ProcessId) {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid.as_raw());
    }

    /// Forget `pid`
    pub fn untrack(&self, pid: ProcessId) {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid.as_raw());
    }

    /// Whether `pid` is supervised
    #[must_use]
    pub fn contains(&self, pid: i32) -> bool {
        self.pids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&pid)
    }
}

/// Collects orphaned zombie children
#[derive(Debug)]
pub struct ZombieReaper {
    registry: ChildRegistry,
    seen: HashSet<i32>,
}

impl ZombieReaper {
    /// Reaper that leaves `registry` PIDs alone
    #[must_use]
    pub fn new(registry: ChildRegistry) -> Self {
        Self {
            registry,
            seen: HashSet::new(),
        }
    }

    /// One pass: reap zombies already seen on the previous pass
    ///
    /// Returns `(pid, exit status)` for every reaped child.
    pub fn scan(&mut self) -> Vec<(i32, i32)> {
        let zombies: HashSet<i32> = zombie_children()
            .into_iter()
            .filter(|pid| !self.registry.contains(*pid))
            .collect();

        let mut reaped = Vec::new();
        for pid in zombies.intersection(&self.seen) {
            match waitpid(nix::unistd::Pid::from_raw(*pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => reaped.push((*pid, code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => reaped.push((*pid, 128 + signal as i32)),
                Ok(_) | Err(Errno::ECHILD) => {}
                Err(e) => debug!(pid, error = %e, "waitpid failed"),
            }
        }

        for (pid, status) in &reaped {
            debug!(pid, status, "Reaped orphaned child");
        }

        self.seen = zombies;
        reaped
    }

    /// Run [`ZombieReaper::scan`] every `poll` until `shutdown` fires or closes
    pub fn spawn(mut self, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!(poll_ms = poll.as_millis(), "Zombie reaper started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    () = tokio::time::sleep(poll) => {}
                }
                self.scan();
            }
            debug!("Zombie reaper stopped");
        });
    }
}

/// Zombie processes whose parent is this process
fn zombie_children() -> Vec<i32> {
    let me = ProcessId::current().as_raw();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            ProcStat::read(ProcessId::from_raw(*pid))
                .is_ok_and(|stat| stat.ppid == me && stat.is_zombie())
        })
        .collect()
}
