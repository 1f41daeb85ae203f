//! Root filesystem preparation
//!
//! [`LocalRootfs`] lays containers out under the state directory:
//!
//! ```text
//! <state>/images/<image>/              plain directory images
//! <state>/containers/<name>/rootfs/    per-container root
//! <state>/containers/<name>/container.log
//! ```

use nix::mount::{MntFlags, umount2};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vessel_core::{CleanupOutcome, Error, Result};
use walkdir::WalkDir;

/// Directories every skeleton rootfs gets
const SKELETON_DIRS: [&str; 10] = [
    "bin", "etc", "usr", "lib", "lib64", "tmp", "var", "proc", "sys", "root",
];

/// Builds and removes container root filesystems
pub trait RootfsProvider: Send + Sync + std::fmt::Debug {
    /// Prepare the rootfs for `name`, optionally from `image`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or populated
    fn prepare(&self, name: &str, image: Option<&str>) -> Result<PathBuf>;

    /// Remove everything stored for `name`
    ///
    /// Nothing is deleted while a mount below the container's directory
    /// cannot be detached, so bound host directories are never recursed into.
    fn remove(&self, name: &str) -> CleanupOutcome;
}

/// Directory-copy rootfs provider
#[derive(Debug, Clone)]
pub struct LocalRootfs {
    state_dir: PathBuf,
}

impl LocalRootfs {
    /// Provider rooted at `state_dir`
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// Per-container directory
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join("containers").join(name)
    }

    /// Source directory of a named image
    #[must_use]
    pub fn image_dir(&self, image: &str) -> PathBuf {
        self.state_dir.join("images").join(image)
    }

    fn skeleton(rootfs: &Path, name: &str) -> Result<()> {
        for dir in SKELETON_DIRS {
            fs::create_dir_all(rootfs.join(dir))?;
        }
        write_if_missing(&rootfs.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n")?;
        write_if_missing(&rootfs.join("etc/group"), "root:x:0:\n")?;
        write_if_missing(&rootfs.join("etc/hostname"), &format!("{name}\n"))?;
        Ok(())
    }
}

fn write_if_missing(path: &Path, content: &str) -> Result<()> {
    if !path.exists() {
        fs::write(path, content)?;
    }
    Ok(())
}

/// Mount points listed in a `mountinfo` table
///
/// The fifth field is the mount point, with space, tab, newline and
/// backslash written as octal escapes.
fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
    mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|digits| {
                bytes[i] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
            })
            .and_then(|digits| u8::from_str_radix(std::str::from_utf8(digits).ok()?, 8).ok());
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points at or below `dir`, deepest first
fn mounts_under(dir: &Path) -> Vec<PathBuf> {
    let Ok(mountinfo) = fs::read_to_string("/proc/self/mountinfo") else {
        return Vec::new();
    };
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut mounts: Vec<PathBuf> = parse_mount_points(&mountinfo)
        .into_iter()
        .filter(|point| point.starts_with(&dir))
        .collect();
    mounts.sort_by_key(|point| std::cmp::Reverse(point.components().count()));
    mounts.dedup();
    mounts
}

/// Copy `src` into `dst`, preserving symlinks
fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    let mut files = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| Error::config(format!("Cannot read image: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::config(e.to_string()))?;
        let target = dst.join(relative);
        let kind = entry.file_type();

        if kind.is_dir() {
            fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            let link = fs::read_link(entry.path())?;
            match std::os::unix::fs::symlink(&link, &target) {
                Err(e) if e.kind() != ErrorKind::AlreadyExists => return Err(e.into()),
                _ => {}
            }
        } else {
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}

impl RootfsProvider for LocalRootfs {
    fn prepare(&self, name: &str, image: Option<&str>) -> Result<PathBuf> {
        let rootfs = self.container_dir(name).join("rootfs");
        fs::create_dir_all(&rootfs)?;

        match image.map(|image| (image, self.image_dir(image))) {
            Some((image, source)) if source.is_dir() => {
                let files = copy_tree(&source, &rootfs)?;
                info!(container = name, image, files, "Copied image into rootfs");
            }
            Some((image, _)) => {
                debug!(container = name, image, "Image not found locally, using skeleton");
                Self::skeleton(&rootfs, name)?;
            }
            None => Self::skeleton(&rootfs, name)?,
        }

        Ok(rootfs)
    }

    fn remove(&self, name: &str) -> CleanupOutcome {
        let dir = self.container_dir(name);
        for point in mounts_under(&dir) {
            if let Err(e) = umount2(&point, MntFlags::MNT_DETACH) {
                warn!(
                    container = name,
                    mount = %point.display(),
                    error = %e,
                    "Mount left under container directory"
                );
                return CleanupOutcome::Failed(format!(
                    "{} is still mounted: {e}",
                    point.display()
                ));
            }
            info!(container = name, mount = %point.display(), "Detached leftover mount");
        }

        match fs::remove_dir_all(dir) {
            Ok(()) => CleanupOutcome::Done,
            Err(e) if e.kind() == ErrorKind::NotFound => CleanupOutcome::Skipped,
            Err(e) => CleanupOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skeleton_without_image() {
        let state = tempfile::tempdir().unwrap();
        let provider = LocalRootfs::new(state.path());

        let rootfs = provider.prepare("web", None).unwrap();
        assert_eq!(rootfs, state.path().join("containers/web/rootfs"));
        assert!(rootfs.join("proc").is_dir());
        assert!(
            fs::read_to_string(rootfs.join("etc/passwd"))
                .unwrap()
                .starts_with("root:")
        );
    }

    #[test]
    fn copies_directory_image() {
        let state = tempfile::tempdir().unwrap();
        let provider = LocalRootfs::new(state.path());
        let image = provider.image_dir("alpine");
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::write(image.join("bin/busybox"), "#!").unwrap();
        std::os::unix::fs::symlink("busybox", image.join("bin/sh")).unwrap();

        let rootfs = provider.prepare("app", Some("alpine")).unwrap();
        assert_eq!(fs::read_to_string(rootfs.join("bin/busybox")).unwrap(), "#!");
        assert_eq!(
            fs::read_link(rootfs.join("bin/sh")).unwrap(),
            PathBuf::from("busybox")
        );
        assert!(!rootfs.join("etc/passwd").exists());
    }

    #[test]
    fn mountinfo_points_are_unescaped() {
        let mountinfo = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 8:1 /srv/data /var/lib/vessel/containers/web/rootfs/my\\040data rw - ext4 /dev/sda1 rw
99 22 0:5 / /weird\\134path rw - tmpfs tmpfs rw
";
        assert_eq!(
            parse_mount_points(mountinfo),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/var/lib/vessel/containers/web/rootfs/my data"),
                PathBuf::from("/weird\\path"),
            ]
        );
    }

    #[test]
    fn plain_directory_has_no_mounts() {
        let state = tempfile::tempdir().unwrap();
        let provider = LocalRootfs::new(state.path());
        provider.prepare("web", None).unwrap();
        assert!(mounts_under(&provider.container_dir("web")).is_empty());
    }

    #[test]
    #[ignore = "requires root"]
    fn remove_detaches_volume_before_deleting() {
        use nix::mount::{MsFlags, mount};

        let state = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        fs::write(host.path().join("keep"), "precious").unwrap();

        let provider = LocalRootfs::new(state.path());
        let rootfs = provider.prepare("vol", None).unwrap();
        let target = rootfs.join("data");
        fs::create_dir_all(&target).unwrap();
        mount(
            Some(host.path()),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .unwrap();

        assert_eq!(provider.remove("vol"), CleanupOutcome::Done);
        assert!(!provider.container_dir("vol").exists());
        assert_eq!(fs::read_to_string(host.path().join("keep")).unwrap(), "precious");
    }

    #[test]
    fn remove_reports_missing_as_skipped() {
        let state = tempfile::tempdir().unwrap();
        let provider = LocalRootfs::new(state.path());
        provider.prepare("gone", Some("missing-image")).unwrap();

        assert_eq!(provider.remove("gone"), CleanupOutcome::Done);
        assert_eq!(provider.remove("gone"), CleanupOutcome::Skipped);
    }
}
