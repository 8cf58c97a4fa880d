//! Process liveness, signalling, and PID file utilities.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use std::path::Path;

/// Result of a signal-0 existence check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Process exists and we may signal it.
    Alive,
    /// No such process (`ESRCH`).
    Dead,
    /// Process exists but belongs to someone else (`EPERM`).
    PermissionDenied,
}

impl Liveness {
    /// Whether a process occupies the PID, ours or not.
    pub fn exists(&self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

/// Outcome of delivering a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The process was already gone (`ESRCH`); treated as terminal, not an error.
    AlreadyGone,
}

/// Check whether `pid` exists using `kill(pid, 0)`.
pub fn probe(pid: u32) -> Liveness {
    let Ok(raw) = i32::try_from(pid) else {
        return Liveness::Dead;
    };
    if raw <= 0 {
        return Liveness::Dead;
    }
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::EPERM) => Liveness::PermissionDenied,
        Err(_) => Liveness::Dead,
    }
}

/// Signal delivery seam used by `stop` and the health probes.
///
/// The daemon uses [`SystemSignals`]; tests substitute a spy to assert that
/// no signal is sent for already-stopped ships.
pub trait SignalSender: Send + Sync {
    fn terminate(&self, pid: u32) -> ShipyardResult<Delivery>;
    fn kill(&self, pid: u32) -> ShipyardResult<Delivery>;
    fn probe(&self, pid: u32) -> Liveness;
}

/// Real signals via `kill(2)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSignals;

impl SystemSignals {
    fn send(pid: u32, sig: Signal) -> ShipyardResult<Delivery> {
        let raw = i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ShipyardError::Internal(format!("invalid pid {}", pid)))?;

        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(Delivery::Delivered),
            Err(Errno::ESRCH) => Ok(Delivery::AlreadyGone),
            Err(e) => Err(ShipyardError::Internal(format!(
                "failed to send {} to pid {}: {}",
                sig, pid, e
            ))),
        }
    }
}

impl SignalSender for SystemSignals {
    fn terminate(&self, pid: u32) -> ShipyardResult<Delivery> {
        Self::send(pid, Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> ShipyardResult<Delivery> {
        Self::send(pid, Signal::SIGKILL)
    }

    fn probe(&self, pid: u32) -> Liveness {
        probe(pid)
    }
}

/// Read PID from file.
///
/// The file contains a PID as a decimal string, optionally with a trailing newline.
pub fn read_pid_file(path: &Path) -> ShipyardResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ShipyardError::Storage(format!("Failed to read PID file {}: {}", path.display(), e))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        ShipyardError::Storage(format!(
            "Invalid PID in file {}: '{}' - {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Write `pid` to `path`, creating parent directories.
pub fn write_pid_file(path: &Path, pid: u32) -> ShipyardResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", pid)).map_err(|e| {
        ShipyardError::Storage(format!("Failed to write PID file {}: {}", path.display(), e))
    })
}

/// Remove a PID file; a missing file is not an error.
pub fn remove_pid_file(path: &Path) -> ShipyardResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ShipyardError::Storage(format!(
            "Failed to remove PID file {}: {}",
            path.display(),
            e
        ))),
    }
}

/// What a PID file on disk says about its process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidFileStatus {
    Missing,
    Live(u32),
    /// File present but the process is gone, or the content is unreadable.
    Stale(Option<u32>),
}

pub fn pid_file_status(path: &Path) -> PidFileStatus {
    if !path.exists() {
        return PidFileStatus::Missing;
    }
    match read_pid_file(path) {
        Ok(pid) if probe(pid).exists() => PidFileStatus::Live(pid),
        Ok(pid) => PidFileStatus::Stale(Some(pid)),
        Err(_) => PidFileStatus::Stale(None),
    }
}

/// Map a child's exit status to a code, `128 + signal` when killed by a signal.
pub fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
