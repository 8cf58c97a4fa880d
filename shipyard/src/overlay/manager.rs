use std::path::Path;
use std::sync::Arc;

use shipyard_shared::errors::ShipyardResult;

use super::Mounter;
use crate::runtime::layout::{FilesystemLayout, OverlayPaths, RootKind};
use crate::runtime::lock::RootLock;

/// Host paths bind-mounted into every merged root, in mount order.
const VIRTUAL_FILESYSTEMS: [&str; 3] = ["proc", "dev", "sys"];
const DEVPTS: &str = "dev/pts";

/// Mounts and tears down the overlay roots of crates and ships.
///
/// Mount and unmount of the same root are serialized with a [`RootLock`],
/// so concurrent callers (including separate processes) never interleave.
#[derive(Clone)]
pub struct OverlayManager {
    layout: FilesystemLayout,
    mounter: Arc<dyn Mounter>,
}

impl OverlayManager {
    pub fn new(layout: FilesystemLayout, mounter: Arc<dyn Mounter>) -> Self {
        Self { layout, mounter }
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.layout
    }

    pub fn paths(&self, kind: RootKind, name: &str) -> OverlayPaths {
        self.layout.overlay(kind, name)
    }

    /// `lowerdir` option for a resolved chain: layer directories, closest first.
    pub fn lowerdir(&self, layers: &[String]) -> String {
        layers
            .iter()
            .map(|layer| self.layout.layer_dir(layer).display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn is_mounted(&self, kind: RootKind, name: &str) -> ShipyardResult<bool> {
        self.mounter.is_mountpoint(&self.paths(kind, name).merge)
    }

    /// Create the root's directories and mount its overlay plus the virtual
    /// filesystems. Returns the lowerdir that was (or already is) mounted.
    ///
    /// A root whose merge directory is already a mount point is left as is.
    pub fn create_and_mount(
        &self,
        kind: RootKind,
        name: &str,
        layers: &[String],
    ) -> ShipyardResult<String> {
        let paths = self.paths(kind, name);
        let lowerdir = self.lowerdir(layers);

        let _lock = RootLock::acquire(&self.layout.locks_dir(), kind, name)?;

        for dir in [&paths.upper, &paths.work, &paths.merge] {
            self.mounter.create_dir_all(dir)?;
        }

        if self.mounter.is_mountpoint(&paths.merge)? {
            tracing::debug!(%kind, name, "Root already mounted, skipping");
            return Ok(lowerdir);
        }

        self.mounter
            .mount_overlay(&lowerdir, &paths.upper, &paths.work, &paths.merge)?;

        if let Err(e) = self.mount_virtual(&paths.merge) {
            tracing::warn!(%kind, name, error = %e, "Virtual filesystem mount failed, rolling back");
            self.teardown(&paths.merge);
            return Err(e);
        }

        tracing::info!(%kind, name, lowerdir = %lowerdir, "Mounted overlay root");
        Ok(lowerdir)
    }

    fn mount_virtual(&self, merge: &Path) -> ShipyardResult<()> {
        for fs in VIRTUAL_FILESYSTEMS {
            let target = merge.join(fs);
            self.mounter.create_dir_all(&target)?;
            self.mounter.bind_mount(&Path::new("/").join(fs), &target)?;
        }

        let pts = merge.join(DEVPTS);
        self.mounter.create_dir_all(&pts)?;
        self.mounter.mount_devpts(&pts)
    }

    /// Unmount the root. A no-op when it is not mounted.
    ///
    /// Virtual filesystem unmount failures are logged and skipped; the
    /// overlay unmount failure is returned.
    pub fn unmount(&self, kind: RootKind, name: &str) -> ShipyardResult<()> {
        let paths = self.paths(kind, name);
        let _lock = RootLock::acquire(&self.layout.locks_dir(), kind, name)?;

        if !self.mounter.is_mountpoint(&paths.merge)? {
            tracing::debug!(%kind, name, "Root not mounted, nothing to unmount");
            return Ok(());
        }

        self.unmount_virtual(&paths.merge);
        self.mounter.unmount(&paths.merge)?;

        tracing::info!(%kind, name, "Unmounted overlay root");
        Ok(())
    }

    fn unmount_virtual(&self, merge: &Path) {
        let targets = std::iter::once(DEVPTS).chain(VIRTUAL_FILESYSTEMS);
        for target in targets.map(|fs| merge.join(fs)) {
            match self.mounter.is_mountpoint(&target) {
                Ok(false) => continue,
                Ok(true) | Err(_) => {}
            }
            if let Err(e) = self.mounter.unmount(&target) {
                tracing::warn!(target = %target.display(), error = %e, "Failed to unmount");
            }
        }
    }

    fn teardown(&self, merge: &Path) {
        self.unmount_virtual(merge);
        if let Err(e) = self.mounter.unmount(merge) {
            tracing::warn!(merge = %merge.display(), error = %e, "Failed to unmount overlay");
        }
    }

    /// Delete the root's upper, work and merge directories.
    ///
    /// The caller unmounts first; a mounted root is refused.
    pub fn remove_dirs(&self, kind: RootKind, name: &str) -> ShipyardResult<()> {
        let paths = self.paths(kind, name);
        let _lock = RootLock::acquire(&self.layout.locks_dir(), kind, name)?;

        if self.mounter.is_mountpoint(&paths.merge)? {
            return Err(shipyard_shared::ShipyardError::InvalidState(format!(
                "{} '{}' is still mounted at {}",
                kind,
                name,
                paths.merge.display()
            )));
        }

        for dir in [&paths.merge, &paths.work, &paths.upper] {
            remove_tree(dir)?;
        }
        Ok(())
    }
}

fn remove_tree(path: &Path) -> ShipyardResult<()> {
    // merge may be a symlink in test setups; never follow it
    match std::fs::symlink_metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(meta) if meta.is_dir() => Ok(std::fs::remove_dir_all(path)?),
        Ok(_) => Ok(std::fs::remove_file(path)?),
    }
}
