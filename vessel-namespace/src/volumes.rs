//! Volume bind mounts into a container rootfs

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vessel_core::{CleanupOutcome, Error, Result, VolumeMapping};

/// Bind-mount each volume's host path onto its target under `rootfs`
///
/// Targets are created first. Returns the mounted targets in mount order.
/// If any mount fails, the ones already made are undone before returning.
///
/// # Errors
///
/// Returns [`Error::Namespace`] naming the volume that could not be bound
pub fn bind_volumes(rootfs: &Path, volumes: &[VolumeMapping]) -> Result<Vec<PathBuf>> {
    let mut mounted = Vec::with_capacity(volumes.len());

    for volume in volumes {
        match bind_one(rootfs, volume) {
            Ok(target) => mounted.push(target),
            Err(e) => {
                unbind_volumes(&mounted).log(&rootfs.display().to_string(), "volumes");
                return Err(e);
            }
        }
    }

    Ok(mounted)
}

fn bind_one(rootfs: &Path, volume: &VolumeMapping) -> Result<PathBuf> {
    let target = volume.target_in(rootfs);

    std::fs::create_dir_all(&target).map_err(|e| {
        Error::namespace(format!(
            "Failed to create volume target {}: {e}",
            target.display()
        ))
    })?;

    debug!(
        host = %volume.host.display(),
        target = %target.display(),
        "Binding volume"
    );

    mount(
        Some(volume.host.as_path()),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::namespace(format!("Failed to bind volume {volume}: {e}")))?;

    Ok(target)
}

/// Detach previously bound volume targets, last mounted first
///
/// Targets that are no longer mounted are skipped.
pub fn unbind_volumes(targets: &[PathBuf]) -> CleanupOutcome {
    let mut outcome = CleanupOutcome::Skipped;

    for target in targets.iter().rev() {
        let step = match umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => CleanupOutcome::Done,
            Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => CleanupOutcome::Skipped,
            Err(e) => {
                warn!(target = %target.display(), error = %e, "Failed to unmount volume");
                CleanupOutcome::Failed(format!("{}: {e}", target.display()))
            }
        };
        outcome = outcome.and(step);
    }

    outcome
}
