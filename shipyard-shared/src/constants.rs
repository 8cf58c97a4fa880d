//! Shared constants between the CLI, the library, and the daemon.
//!
//! These must agree on both ends of the control socket.

/// Layer constants
pub mod layers {
    /// Name of the sentinel root layer every chain terminates at.
    pub const ROOT_LAYER: &str = "root";

    /// Upper bound on ancestor hops before a chain is treated as cyclic.
    pub const MAX_LAYER_DEPTH: usize = 64;

    /// Tag given to every built crate.
    pub const DEFAULT_TAG: &str = "latest";
}

/// Control socket constants
pub mod daemon {
    /// Default control socket address.
    pub const DEFAULT_ADDR: &str = "127.0.0.1:7437";

    /// Daemon name, used for the PID file and log file.
    pub const NAME: &str = "shipyardd";

    /// Default reconciliation interval in seconds.
    pub const RECONCILE_INTERVAL_SECS: u64 = 30;

    /// Default per-ship liveness probe interval in seconds.
    pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 5;

    /// Grace period between SIGTERM and the liveness re-check, in seconds.
    pub const STOP_GRACE_SECS: u64 = 2;
}

/// Environment variables
pub mod envs {
    pub const SHIPYARD_HOME: &str = "SHIPYARD_HOME";
    pub const SHIPYARD_DAEMON_ADDR: &str = "SHIPYARD_DAEMON_ADDR";
    pub const SHIPYARD_RECONCILE_SECS: &str = "SHIPYARD_RECONCILE_SECS";
}
