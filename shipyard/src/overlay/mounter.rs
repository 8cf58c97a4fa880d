//! Privileged mount primitives.
//!
//! [`Mounter`] is the seam between the overlay manager's ordering logic and
//! the kernel. [`SystemMounter`] performs real mounts through `nix::mount` and
//! answers "is this mounted?" from `/proc/self/mountinfo`.

use std::path::{Path, PathBuf};

use shipyard_shared::errors::{ShipyardError, ShipyardResult};

pub trait Mounter: Send + Sync {
    /// `mkdir -p`: idempotent, succeeds if the directory already exists.
    fn create_dir_all(&self, path: &Path) -> ShipyardResult<()> {
        std::fs::create_dir_all(path).map_err(|e| {
            ShipyardError::Storage(format!("Failed to create directory {}: {}", path.display(), e))
        })
    }

    /// Whether `path` is currently an active mount point.
    fn is_mountpoint(&self, path: &Path) -> ShipyardResult<bool>;

    fn mount_overlay(
        &self,
        lowerdir: &str,
        upper: &Path,
        work: &Path,
        merge: &Path,
    ) -> ShipyardResult<()>;

    /// Bind-mount a host path onto `target`.
    fn bind_mount(&self, source: &Path, target: &Path) -> ShipyardResult<()>;

    /// Mount a fresh devpts instance at `target`.
    fn mount_devpts(&self, target: &Path) -> ShipyardResult<()>;

    fn unmount(&self, target: &Path) -> ShipyardResult<()>;
}

/// Kernel-backed mounter (Linux only, requires CAP_SYS_ADMIN).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMounter;

#[cfg(target_os = "linux")]
impl Mounter for SystemMounter {
    fn is_mountpoint(&self, path: &Path) -> ShipyardResult<bool> {
        let Ok(canonical) = std::fs::canonicalize(path) else {
            return Ok(false);
        };
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
            ShipyardError::Storage(format!("Failed to read /proc/self/mountinfo: {}", e))
        })?;
        Ok(parse_mount_points(&mountinfo).contains(&canonical))
    }

    fn mount_overlay(
        &self,
        lowerdir: &str,
        upper: &Path,
        work: &Path,
        merge: &Path,
    ) -> ShipyardResult<()> {
        use nix::mount::{MsFlags, mount};

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir,
            upper.display(),
            work.display()
        );
        tracing::debug!("Mounting overlayfs with options: {}", data);

        mount(
            Some("overlay"),
            merge,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|e| {
            ShipyardError::Mount(format!("overlay at {}: {}", merge.display(), e))
        })
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> ShipyardResult<()> {
        use nix::mount::{MsFlags, mount};

        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            ShipyardError::Mount(format!(
                "bind {} -> {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })
    }

    fn mount_devpts(&self, target: &Path) -> ShipyardResult<()> {
        use nix::mount::{MsFlags, mount};

        mount(
            Some("devpts"),
            target,
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=0620"),
        )
        .map_err(|e| ShipyardError::Mount(format!("devpts at {}: {}", target.display(), e)))
    }

    fn unmount(&self, target: &Path) -> ShipyardResult<()> {
        nix::mount::umount(target)
            .map_err(|e| ShipyardError::Unmount(format!("{}: {}", target.display(), e)))
    }
}

#[cfg(not(target_os = "linux"))]
impl Mounter for SystemMounter {
    fn is_mountpoint(&self, _path: &Path) -> ShipyardResult<bool> {
        Ok(false)
    }

    fn mount_overlay(&self, _: &str, _: &Path, _: &Path, _: &Path) -> ShipyardResult<()> {
        Err(ShipyardError::Mount("overlayfs requires Linux".into()))
    }

    fn bind_mount(&self, _: &Path, _: &Path) -> ShipyardResult<()> {
        Err(ShipyardError::Mount("bind mounts require Linux".into()))
    }

    fn mount_devpts(&self, _: &Path) -> ShipyardResult<()> {
        Err(ShipyardError::Mount("devpts requires Linux".into()))
    }

    fn unmount(&self, _: &Path) -> ShipyardResult<()> {
        Ok(())
    }
}

/// Mount points listed in a `/proc/self/mountinfo` dump.
///
/// The fifth field is the mount point, with spaces and other specials
/// escaped as three-digit octal (`\040`).
pub fn parse_mount_points(mountinfo: &str) -> Vec<PathBuf> {
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
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        let value = escaped.then(|| {
            bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'))
        });

        if let Some(byte) = value.and_then(|v| u8::try_from(v).ok()) {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
