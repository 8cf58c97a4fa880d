//! Error taxonomy shared by the library, the daemon, and the CLI.
//!
//! Variants map onto the ways an operation can fail and how callers are
//! expected to react:
//! - Resolution failures ([`ShipyardError::LayerNotFound`], [`ShipyardError::LayerCycle`])
//!   are fatal to the operation and never retried.
//! - Mount failures are fatal during setup; unmount failures are logged and
//!   skipped during teardown.
//! - [`ShipyardError::BuildStep`] aborts a build and triggers crate cleanup.
//! - [`ShipyardError::Spawn`] is distinct from [`ShipyardError::CommandFailed`]:
//!   the first means the process never ran, the second that it ran and exited non-zero.

use thiserror::Error;

/// Result alias used across the workspace.
pub type ShipyardResult<T> = Result<T, ShipyardError>;

#[derive(Debug, Error)]
pub enum ShipyardError {
    /// A layer in an image chain has no persisted crate record.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// A layer chain revisits a layer or exceeds the hop limit.
    #[error("layer chain for '{0}' does not terminate at the root layer")]
    LayerCycle(String),

    /// Overlay or virtual filesystem mount failed.
    #[error("mount failed: {0}")]
    Mount(String),

    /// Unmount failed.
    #[error("unmount failed: {0}")]
    Unmount(String),

    /// A build step failed; the crate has been cleaned up.
    #[error("build step {step} failed: {reason}")]
    BuildStep { step: usize, reason: String },

    /// A process could not be started at all.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// A process ran and exited with a non-zero code.
    #[error("command `{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    /// The control socket could not be reached.
    #[error("daemon unreachable at {addr}: {reason} (start it with `shipyard daemon start`)")]
    DaemonUnreachable { addr: String, reason: String },

    /// A PID file or mount exists without a live backing process or mount.
    #[error("stale state: {0}")]
    StaleState(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    /// Malformed or unexpected control-protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ShipyardError {
    fn from(err: std::io::Error) -> Self {
        ShipyardError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ShipyardError {
    fn from(err: serde_json::Error) -> Self {
        ShipyardError::Protocol(err.to_string())
    }
}

impl From<String> for ShipyardError {
    fn from(msg: String) -> Self {
        ShipyardError::Internal(msg)
    }
}

impl From<&str> for ShipyardError {
    fn from(msg: &str) -> Self {
        ShipyardError::Internal(msg.to_string())
    }
}
