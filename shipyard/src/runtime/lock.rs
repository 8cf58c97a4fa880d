//! Per-root lock serializing mount and unmount across threads and processes.
//!
//! Uses `flock` on `{home}/locks/{kind}-{name}.lock`. The CLI (builds, removals)
//! and the daemon (deploy, start, stop) may touch the same root, so an
//! in-process mutex alone is not enough. `flock` locks belong to the open file
//! description, so two acquisitions from the same process also exclude each other.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use crate::runtime::layout::RootKind;

/// Guard holding an exclusive lock on one overlay root.
///
/// The lock is released when this guard is dropped, or when the process exits.
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Block until the lock for `kind`/`name` is acquired.
    pub fn acquire(locks_dir: &Path, kind: RootKind, name: &str) -> ShipyardResult<Self> {
        Self::lock(locks_dir, kind, name, libc::LOCK_EX)
    }

    /// Acquire without blocking; fails if another holder exists.
    pub fn try_acquire(locks_dir: &Path, kind: RootKind, name: &str) -> ShipyardResult<Self> {
        Self::lock(locks_dir, kind, name, libc::LOCK_EX | libc::LOCK_NB)
    }

    fn lock(locks_dir: &Path, kind: RootKind, name: &str, op: libc::c_int) -> ShipyardResult<Self> {
        std::fs::create_dir_all(locks_dir)
            .map_err(|e| ShipyardError::Storage(format!("failed to create locks dir: {}", e)))?;

        let path = locks_dir.join(format!("{}-{}.lock", kind, name));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ShipyardError::Storage(format!("failed to open lock file: {}", e)))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), op) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(ShipyardError::InvalidState(format!(
                    "{} root '{}' is busy with another mount operation",
                    kind, name
                )));
            }
            return Err(ShipyardError::Storage(format!(
                "failed to acquire lock {}: {}",
                path.display(),
                err
            )));
        }

        tracing::trace!(lock_path = %path.display(), "Acquired root lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::trace!(lock_path = %self.path.display(), "Released root lock");
    }
}
