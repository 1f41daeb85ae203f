//! Freezer control
//!
//! v2 toggles `cgroup.freeze` on the unified group; v1 writes
//! `FROZEN`/`THAWED` to `freezer.state` in the freezer hierarchy.

use tokio::fs;
use tracing::debug;
use vessel_core::{Error, Result};

use crate::controller::{CgroupHandle, CgroupVersion};

/// Freeze or thaw every task in the group
///
/// # Errors
///
/// Returns [`Error::Unsupported`] when the group has no freezer, or
/// [`Error::CGroup`] when the state file cannot be written
pub async fn set_frozen(handle: &CgroupHandle, frozen: bool) -> Result<()> {
    let dir = handle.freezer_path().ok_or_else(|| Error::Unsupported {
        operation: "cgroup freezer".to_string(),
    })?;

    let (file, value) = match (handle.version(), frozen) {
        (CgroupVersion::V2, true) => ("cgroup.freeze", "1"),
        (CgroupVersion::V2, false) => ("cgroup.freeze", "0"),
        (CgroupVersion::V1, true) => ("freezer.state", "FROZEN"),
        (CgroupVersion::V1, false) => ("freezer.state", "THAWED"),
    };

    debug!(cgroup = handle.name(), file, value, "Setting freezer state");

    fs::write(dir.join(file), value)
        .await
        .map_err(|e| Error::cgroup(format!("Failed to write {file}: {e}")))
}
