use shipyard_shared::constants::daemon as daemon_consts;
use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name when running unprivileged
    pub const SHIPYARD_DIR: &str = ".shipyard";

    pub const DB_DIR: &str = "db";

    /// Built crates: upper dirs, work/merge dirs, and archives
    pub const CRATES_DIR: &str = "crates";

    /// Runtime roots for ships
    pub const SHIPS_DIR: &str = "ships";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";

    /// PID files
    pub const RUN_DIR: &str = "run";

    /// Per-root lock files
    pub const LOCKS_DIR: &str = "locks";

    /// Bootstrap filesystem for the root layer
    pub const ROOTFS_DIR: &str = "rootfs";

    /// Suffix for the overlay work directory
    pub const WORK_SUFFIX: &str = "_work";

    /// Suffix for the overlay merge directory
    pub const MERGE_SUFFIX: &str = "_merge";

    /// Suffix for a crate's build log directory under `logs/`
    pub const BUILD_LOG_SUFFIX: &str = ".build";
}

pub const DB_FILE: &str = "shipyard.db";
pub const ARCHIVE_EXT: &str = "tar.gz";

/// Which family of overlay roots a name belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Build-time root under `crates/`
    Crate,
    /// Runtime root under `ships/`
    Ship,
}

impl RootKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootKind::Crate => "crate",
            RootKind::Ship => "ship",
        }
    }
}

impl std::fmt::Display for RootKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that a crate or ship name maps to its own directories and nothing else.
///
/// Names are single path components of `[A-Za-z0-9._-]`, may not start with
/// `.`, and may not end in a suffix reserved for sibling directories or archives.
pub fn validate_name(kind: RootKind, name: &str) -> ShipyardResult<()> {
    let invalid = |why: &str| {
        Err(ShipyardError::Config(format!(
            "invalid {} name '{}': {}",
            kind, name, why
        )))
    };

    if name.is_empty() || name.len() > 128 {
        return invalid("must be 1 to 128 characters");
    }
    if name.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("only letters, digits, '.', '_' and '-' are allowed");
    }
    let archive_suffix = format!(".{}", ARCHIVE_EXT);
    for suffix in [
        dirs::WORK_SUFFIX,
        dirs::MERGE_SUFFIX,
        dirs::BUILD_LOG_SUFFIX,
        archive_suffix.as_str(),
    ] {
        if name.ends_with(suffix) {
            return invalid(&format!("suffix '{}' is reserved", suffix));
        }
    }
    Ok(())
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Every on-disk path the engine uses, derived from one base directory.
///
/// ```text
/// {home}/
/// ├── db/shipyard.db
/// ├── rootfs/                  # bootstrap root layer
/// ├── crates/
/// │   ├── {name}/              # upper dir (also this crate's lowerdir for children)
/// │   ├── {name}_work/
/// │   ├── {name}_merge/
/// │   └── {name}.tar.gz
/// ├── ships/
/// │   ├── {name}/
/// │   ├── {name}_work/
/// │   └── {name}_merge/
/// ├── logs/
/// │   ├── {ship}/{out,err}.log
/// │   └── {crate}.build/{out,err}.log
/// ├── locks/
/// └── run/shipyardd.pid
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::DB_DIR)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join(DB_FILE)
    }

    pub fn crates_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::CRATES_DIR)
    }

    pub fn ships_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::SHIPS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::RUN_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOCKS_DIR)
    }

    /// Bootstrap path the root layer maps to.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::ROOTFS_DIR)
    }

    /// Daemon PID file: {home}/run/shipyardd.pid
    pub fn pid_file(&self) -> PathBuf {
        self.run_dir().join(format!("{}.pid", daemon_consts::NAME))
    }

    /// Per-ship log directory: {home}/logs/{name}
    pub fn log_dir(&self, name: &str) -> PathBuf {
        self.logs_dir().join(name)
    }

    /// Build output of a crate: {home}/logs/{name}.build
    pub fn build_log_dir(&self, name: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}{}", name, dirs::BUILD_LOG_SUFFIX))
    }

    /// Compressed crate artifact: {home}/crates/{name}.tar.gz
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.crates_dir().join(format!("{}.{}", name, ARCHIVE_EXT))
    }

    /// Overlay directory triple for a root.
    pub fn overlay(&self, kind: RootKind, name: &str) -> OverlayPaths {
        let base = match kind {
            RootKind::Crate => self.crates_dir(),
            RootKind::Ship => self.ships_dir(),
        };
        OverlayPaths {
            upper: base.join(name),
            work: base.join(format!("{}{}", name, dirs::WORK_SUFFIX)),
            merge: base.join(format!("{}{}", name, dirs::MERGE_SUFFIX)),
        }
    }

    /// On-disk lowerdir for a layer: the root layer maps to the bootstrap
    /// filesystem, every other layer to its crate's upper directory.
    pub fn layer_dir(&self, layer: &str) -> PathBuf {
        if layer == shipyard_shared::constants::layers::ROOT_LAYER {
            self.rootfs_dir()
        } else {
            self.crates_dir().join(layer)
        }
    }

    /// Initialize the filesystem structure.
    pub fn prepare(&self) -> ShipyardResult<()> {
        for dir in [
            self.home_dir.clone(),
            self.db_dir(),
            self.crates_dir(),
            self.ships_dir(),
            self.logs_dir(),
            self.run_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ShipyardError::Storage(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

/// Upper/work/merge paths of one overlay root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayPaths {
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merge: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_crate_overlay_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/yard"));
        let paths = layout.overlay(RootKind::Crate, "web");

        assert_eq!(paths.upper, PathBuf::from("/srv/yard/crates/web"));
        assert_eq!(paths.work, PathBuf::from("/srv/yard/crates/web_work"));
        assert_eq!(paths.merge, PathBuf::from("/srv/yard/crates/web_merge"));
    }

    #[test]
    fn test_ship_overlay_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/yard"));
        let paths = layout.overlay(RootKind::Ship, "api");

        assert_eq!(paths.upper, PathBuf::from("/srv/yard/ships/api"));
        assert_eq!(paths.merge, PathBuf::from("/srv/yard/ships/api_merge"));
    }

    #[test]
    fn test_root_layer_maps_to_bootstrap() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/yard"));
        assert_eq!(layout.layer_dir("root"), PathBuf::from("/srv/yard/rootfs"));
        assert_eq!(layout.layer_dir("base"), PathBuf::from("/srv/yard/crates/base"));
    }

    #[test]
    fn test_archive_and_pid_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/yard"));
        assert_eq!(
            layout.archive_path("demo"),
            PathBuf::from("/srv/yard/crates/demo.tar.gz")
        );
        assert_eq!(layout.pid_file(), PathBuf::from("/srv/yard/run/shipyardd.pid"));
    }

    #[test]
    fn test_build_logs_apart_from_ship_logs() {
        let layout = FilesystemLayout::new(PathBuf::from("/srv/yard"));
        assert_eq!(layout.log_dir("web"), PathBuf::from("/srv/yard/logs/web"));
        assert_eq!(
            layout.build_log_dir("web"),
            PathBuf::from("/srv/yard/logs/web.build")
        );
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name(RootKind::Crate, "web-1.2_x").is_ok());
        for bad in ["", ".hidden", "a/b", "a b", "web_work", "web_merge", "web.build", "web.tar.gz", ".."] {
            assert!(validate_name(RootKind::Ship, bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_prepare_creates_directories() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().join("home"));
        layout.prepare().unwrap();

        assert!(layout.crates_dir().is_dir());
        assert!(layout.ships_dir().is_dir());
        assert!(layout.run_dir().is_dir());
        assert!(layout.db_dir().is_dir());
    }
}
