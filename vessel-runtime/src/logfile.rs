//! Per-container log file
//!
//! The process writes stdout and stderr straight into the file; the
//! supervisor interleaves banners, markers and timestamped notifications.

use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use vessel_core::{ContainerId, ContainerSpec, Result};

/// File name of the log, stored next to the rootfs
pub const LOG_FILE: &str = "container.log";

/// Returned by [`ContainerLog::tail`] before anything was written
pub const NO_LOGS: &str = "No logs available";

/// Append-only container log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLog {
    path: PathBuf,
}

impl ContainerLog {
    /// Log kept at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log stored beside a container's rootfs
    #[must_use]
    pub fn for_rootfs(rootfs: &Path) -> Self {
        Self::new(rootfs.parent().unwrap_or(rootfs).join(LOG_FILE))
    }

    /// Location on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }

    fn append(&self, text: &str) -> std::io::Result<()> {
        self.open()?.write_all(text.as_bytes())
    }

    /// Write the start banner for a new run
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn banner(&self, id: &ContainerId, spec: &ContainerSpec) -> Result<()> {
        let mut text = format!(
            "\n=== Container {id} started at {} ===\nCommand: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            spec.command
        );
        if !spec.env.is_empty() {
            let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
            text.push_str(&format!("Environment: {}\n", env.join(", ")));
        }
        if !spec.volumes.is_empty() {
            let volumes: Vec<String> = spec.volumes.iter().map(ToString::to_string).collect();
            text.push_str(&format!("Volumes: {}\n", volumes.join(", ")));
        }
        self.append(&text)?;
        Ok(())
    }

    /// Append a timestamped notification line
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn line(&self, message: &str) -> Result<()> {
        self.append(&format!("[{}] {message}\n", Local::now().format("%H:%M:%S")))?;
        Ok(())
    }

    /// Append the exit marker for a finished run
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn exit_marker(&self, code: i32) -> Result<()> {
        self.append(&format!("\n=== Container exited with code {code} ===\n"))?;
        Ok(())
    }

    /// Append an error marker
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn error_marker(&self, message: &str) -> Result<()> {
        self.append(&format!("\n=== ERROR: {message} ===\n"))?;
        Ok(())
    }

    /// Stdout and stderr handles for a child process, both appending here
    ///
    /// # Errors
    /// Returns error if the file cannot be opened
    pub fn child_stdio(&self) -> Result<(Stdio, Stdio)> {
        let stdout = self.open()?;
        let stderr = stdout.try_clone()?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// Last `lines` lines, or [`NO_LOGS`] if the file does not exist yet
    #[must_use]
    pub fn tail(&self, lines: usize) -> String {
        if !self.path.exists() {
            return NO_LOGS.to_string();
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                let mut tail = all[start..].join("\n");
                if !tail.is_empty() {
                    tail.push('\n');
                }
                tail
            }
            Err(e) => format!("Error reading logs: {e}"),
        }
    }
}
