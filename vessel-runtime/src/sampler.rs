//! Process sampling via `/proc`
//!
//! Best-effort readers for the numbers the supervisor reports: CPU time and
//! RSS from `stat`, storage I/O from `io`, traffic from `net/dev`.
//!
//! A container's workload usually runs below the spawned process (`unshare
//! --fork`, `strace`, a shell), so CPU and memory are summed over the whole
//! process tree.

use std::fs;
use std::time::{Duration, Instant};
use vessel_core::{Error, Metrics, ProcessId, Result};
use vessel_namespace::process_tree;

/// Fields of `/proc/<pid>/stat` the supervisor uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter scheduler state (`R`, `S`, `Z`, ...)
    pub state: char,
    /// Parent process ID
    pub ppid: i32,
    /// User-mode CPU time in clock ticks
    pub utime: u64,
    /// Kernel-mode CPU time in clock ticks
    pub stime: u64,
    /// Resident set size in pages
    pub rss_pages: u64,
}

impl ProcStat {
    /// Read the stat line of `pid`
    ///
    /// # Errors
    /// Returns error if the process is gone or the line is malformed
    pub fn read(pid: ProcessId) -> Result<Self> {
        let content = fs::read_to_string(format!("/proc/{pid}/stat"))?;
        Self::parse(&content)
    }

    /// Parse a stat line
    ///
    /// The command name may itself contain spaces and parentheses, so fields
    /// are counted from the last `)`.
    ///
    /// # Errors
    /// Returns error if a required field is missing or not numeric
    pub fn parse(content: &str) -> Result<Self> {
        let (_, rest) = content
            .rsplit_once(')')
            .ok_or_else(|| Error::config("Invalid /proc stat format"))?;
        let fields: Vec<&str> = rest.split_whitespace().collect();

        let field = |index: usize, name: &str| -> Result<u64> {
            fields
                .get(index)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::config(format!("Invalid {name} in /proc stat")))
        };

        let state = fields
            .first()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| Error::config("Missing state in /proc stat"))?;
        let ppid = fields
            .get(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::config("Invalid ppid in /proc stat"))?;

        Ok(Self {
            state,
            ppid,
            utime: field(11, "utime")?,
            stime: field(12, "stime")?,
            rss_pages: field(21, "rss")?,
        })
    }

    /// Stat of `pid` with CPU time and RSS summed over its descendants
    ///
    /// State and parent are those of `pid`; descendants that exit while
    /// being read are left out.
    ///
    /// # Errors
    /// Returns error if `pid` itself is gone or its line is malformed
    pub fn read_tree(pid: ProcessId) -> Result<Self> {
        let mut total = Self::read(pid)?;
        for member in process_tree(pid).into_iter().skip(1) {
            if let Ok(stat) = Self::read(member) {
                total.add(&stat);
            }
        }
        Ok(total)
    }

    fn add(&mut self, other: &Self) {
        self.utime = self.utime.saturating_add(other.utime);
        self.stime = self.stime.saturating_add(other.stime);
        self.rss_pages = self.rss_pages.saturating_add(other.rss_pages);
    }

    /// Total CPU time in clock ticks
    #[must_use]
    pub const fn cpu_ticks(&self) -> u64 {
        self.utime + self.stime
    }

    /// Resident set size in bytes
    #[must_use]
    pub fn rss_bytes(&self) -> u64 {
        self.rss_pages.saturating_mul(page_size())
    }

    /// Whether the process is a zombie
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        self.state == 'Z'
    }
}

/// Clock ticks per second
#[must_use]
pub fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100)
}

/// Memory page size in bytes
#[must_use]
pub fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
}

/// A CPU-time reading taken at a known instant
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    ticks: u64,
    at: Instant,
}

impl CpuSample {
    /// Reading taken now from `stat`
    #[must_use]
    pub fn now(stat: &ProcStat) -> Self {
        Self {
            ticks: stat.cpu_ticks(),
            at: Instant::now(),
        }
    }

    /// CPU usage between `self` and `later`, in percent of one core
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_until(&self, later: &Self) -> f64 {
        let elapsed = later.at.saturating_duration_since(self.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let busy = later.ticks.saturating_sub(self.ticks) as f64 / clock_ticks() as f64;
        busy / elapsed * 100.0
    }
}

/// Storage counters from `/proc/<pid>/io`; zero when unreadable
#[must_use]
pub fn io_counters(pid: ProcessId) -> (u64, u64) {
    fs::read_to_string(format!("/proc/{pid}/io"))
        .map(|content| parse_io(&content))
        .unwrap_or_default()
}

fn parse_io(content: &str) -> (u64, u64) {
    let value = |key: &str| {
        content
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    };
    (value("read_bytes:"), value("write_bytes:"))
}

/// Traffic counters summed over non-loopback interfaces; zero when unreadable
#[must_use]
pub fn net_counters(pid: ProcessId) -> (u64, u64) {
    fs::read_to_string(format!("/proc/{pid}/net/dev"))
        .map(|content| parse_net_dev(&content))
        .unwrap_or_default()
}

fn parse_net_dev(content: &str) -> (u64, u64) {
    content
        .lines()
        .skip(2)
        .filter_map(|line| line.split_once(':'))
        .filter(|(iface, _)| iface.trim() != "lo")
        .fold((0, 0), |(rx, tx), (_, counters)| {
            let fields: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            let received = fields.first().copied().unwrap_or(0);
            let sent = fields.get(8).copied().unwrap_or(0);
            (rx + received, tx + sent)
        })
}

/// Full metrics snapshot, measuring CPU over `window`
///
/// # Errors
/// Returns error if the process disappears before the second reading
#[allow(clippy::cast_precision_loss)]
pub async fn sample_metrics(pid: ProcessId, window: Duration) -> Result<Metrics> {
    let first = CpuSample::now(&ProcStat::read_tree(pid)?);
    tokio::time::sleep(window).await;
    let stat = ProcStat::read_tree(pid)?;
    let second = CpuSample::now(&stat);

    let (disk_read, disk_write) = io_counters(pid);
    let (network_rx, network_tx) = net_counters(pid);

    Ok(Metrics {
        cpu_percent: first.percent_until(&second),
        memory_mb: stat.rss_bytes() as f64 / (1024.0 * 1024.0),
        disk_read,
        disk_write,
        network_rx,
        network_tx,
    })
}
