//! High-level runtime: the entry point the CLI and the daemon share.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use shipyard_shared::constants::layers::ROOT_LAYER;
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use crate::build::{self, CrateBuilder};
use crate::db::{CrateRecord, Database, ShipRecord};
use crate::exec::RootExecutor;
use crate::overlay::{Mounter, OverlayManager, SystemMounter};
use crate::runtime::layout::{FilesystemLayout, RootKind};
use crate::runtime::options::ShipyardOptions;

/// Opened home directory: layout, database and overlay manager.
///
/// **Prepare Before Execute**: directories and the schema are in place
/// before `open` returns.
///
/// **Cloning**: cheap; clones share the database connection.
#[derive(Clone)]
pub struct ShipyardRuntime {
    options: ShipyardOptions,
    db: Database,
    overlays: OverlayManager,
}

impl ShipyardRuntime {
    /// Open `options.home_dir` with the real mount primitives.
    pub fn open(options: ShipyardOptions) -> ShipyardResult<Self> {
        Self::with_mounter(options, Arc::new(SystemMounter))
    }

    /// Open with a substitute mounter (tests, unprivileged tooling).
    pub fn with_mounter(options: ShipyardOptions, mounter: Arc<dyn Mounter>) -> ShipyardResult<Self> {
        options.validate()?;

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            ShipyardError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        let db = Database::open(&layout.db_path())?;
        let overlays = OverlayManager::new(layout, mounter);

        tracing::debug!(home = %options.home_dir.display(), "Opened runtime");
        Ok(Self {
            options,
            db,
            overlays,
        })
    }

    pub fn options(&self) -> &ShipyardOptions {
        &self.options
    }

    pub fn layout(&self) -> &FilesystemLayout {
        self.overlays.layout()
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    /// Populate the root layer, optionally from a gzip'd tarball.
    ///
    /// Without a tarball the root layer is an empty directory, which is
    /// enough for `copy_files`-only crates.
    pub fn init_root_layer(&self, rootfs: Option<&Path>) -> ShipyardResult<()> {
        let target = self.layout().layer_dir(ROOT_LAYER);
        std::fs::create_dir_all(&target)?;

        if let Some(tarball) = rootfs {
            let file = File::open(tarball).map_err(|e| {
                ShipyardError::NotFound(format!("rootfs archive {}: {}", tarball.display(), e))
            })?;
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive.set_preserve_permissions(true);
            archive.unpack(&target).map_err(|e| {
                ShipyardError::Storage(format!(
                    "failed to unpack {} into {}: {}",
                    tarball.display(),
                    target.display(),
                    e
                ))
            })?;
            tracing::info!(rootfs = %tarball.display(), target = %target.display(), "Root layer populated");
        }
        Ok(())
    }

    /// Crate builder running steps through `executor`.
    pub fn builder(&self, executor: Arc<dyn RootExecutor>) -> CrateBuilder {
        CrateBuilder::new(
            self.db.clone(),
            self.overlays.clone(),
            executor,
            self.options.log_tail_lines,
        )
    }

    pub fn list_crates(&self) -> ShipyardResult<Vec<CrateRecord>> {
        self.db.crates().list()
    }

    pub fn get_crate(&self, name: &str) -> ShipyardResult<CrateRecord> {
        self.db
            .crates()
            .get_by_name(name)?
            .ok_or_else(|| ShipyardError::NotFound(format!("crate '{}'", name)))
    }

    pub fn remove_crate(&self, name: &str) -> ShipyardResult<()> {
        build::remove_crate(&self.db, &self.overlays, name)
    }

    pub fn list_ships(&self) -> ShipyardResult<Vec<ShipRecord>> {
        self.db.ships().list()
    }

    pub fn get_ship(&self, name: &str) -> ShipyardResult<ShipRecord> {
        self.db
            .ships()
            .get(name)?
            .ok_or_else(|| ShipyardError::NotFound(format!("ship '{}'", name)))
    }

    /// Delete a non-running ship, its overlay mount and its directories.
    /// Log files are kept.
    pub fn remove_ship(&self, name: &str) -> ShipyardResult<()> {
        let record = self.get_ship(name)?;
        if !record.status().can_remove() {
            return Err(ShipyardError::InvalidState(format!(
                "ship '{}' is {}; stop it first",
                name,
                record.status()
            )));
        }

        self.overlays.unmount(RootKind::Ship, name)?;
        if !self.db.ships().delete(name)? {
            return Err(ShipyardError::NotFound(format!("ship '{}'", name)));
        }
        self.overlays.remove_dirs(RootKind::Ship, name)?;
        tracing::info!(ship = %name, "Removed ship");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    #[test]
    fn test_open_prepares_layout() {
        let temp = TempDir::new().unwrap();
        let runtime = ShipyardRuntime::open(ShipyardOptions::with_home(temp.path())).unwrap();

        assert!(runtime.layout().crates_dir().is_dir());
        assert!(runtime.layout().ships_dir().is_dir());
        assert!(runtime.layout().db_path().exists());
        assert!(runtime.list_crates().unwrap().is_empty());
    }

    #[test]
    fn test_relative_home_rejected() {
        let result = ShipyardRuntime::open(ShipyardOptions::with_home("relative/home"));
        assert!(matches!(result, Err(ShipyardError::Config(_))));
    }

    #[test]
    fn test_init_root_layer_from_tarball() {
        let temp = TempDir::new().unwrap();
        let tarball = temp.path().join("rootfs.tar.gz");
        {
            let gz = GzEncoder::new(File::create(&tarball).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(gz);
            let data = b"root:x:0:0::/root:/bin/sh\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "etc/passwd", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let runtime =
            ShipyardRuntime::open(ShipyardOptions::with_home(temp.path().join("home"))).unwrap();
        runtime.init_root_layer(Some(&tarball)).unwrap();

        let passwd = runtime.layout().rootfs_dir().join("etc/passwd");
        assert!(std::fs::read_to_string(passwd).unwrap().starts_with("root:"));
    }

    #[test]
    fn test_missing_ship_and_crate_not_found() {
        let temp = TempDir::new().unwrap();
        let runtime = ShipyardRuntime::open(ShipyardOptions::with_home(temp.path())).unwrap();

        assert!(matches!(runtime.get_ship("web"), Err(ShipyardError::NotFound(_))));
        assert!(matches!(runtime.remove_ship("web"), Err(ShipyardError::NotFound(_))));
        assert!(matches!(runtime.remove_crate("web"), Err(ShipyardError::NotFound(_))));
    }
}
