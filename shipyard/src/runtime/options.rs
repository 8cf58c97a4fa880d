//! Configuration for Shipyard.

use crate::runtime::layout::dirs as const_dirs;
use serde::{Deserialize, Serialize};
use shipyard_shared::constants::{daemon as daemon_consts, envs as const_envs};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};
use std::path::PathBuf;
use std::time::Duration;

/// System-wide base directory used when running as root.
pub const SYSTEM_HOME: &str = "/var/lib/shipyard";

/// Default number of lines in the rolling build output view.
pub const DEFAULT_LOG_TAIL_LINES: usize = 10;

/// Configuration options shared by the CLI, the build pipeline, and the daemon.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShipyardOptions {
    /// Base directory for every path in the filesystem layout.
    pub home_dir: PathBuf,

    /// Control socket address (`host:port`).
    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,

    /// How often the daemon reconciles `running` ships against OS liveness.
    #[serde(default = "default_reconcile_interval", with = "secs")]
    pub reconcile_interval: Duration,

    /// How often each supervised ship is probed with signal 0.
    #[serde(default = "default_health_probe_interval", with = "secs")]
    pub health_probe_interval: Duration,

    /// Wait between SIGTERM and the liveness re-check during stop.
    #[serde(default = "default_stop_grace_period", with = "secs")]
    pub stop_grace_period: Duration,

    /// Lines kept in the rolling build output view.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_daemon_addr() -> String {
    std::env::var(const_envs::SHIPYARD_DAEMON_ADDR)
        .unwrap_or_else(|_| daemon_consts::DEFAULT_ADDR.to_string())
}

fn default_reconcile_interval() -> Duration {
    let secs = std::env::var(const_envs::SHIPYARD_RECONCILE_SECS)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(daemon_consts::RECONCILE_INTERVAL_SECS);
    Duration::from_secs(secs)
}

fn default_health_probe_interval() -> Duration {
    Duration::from_secs(daemon_consts::HEALTH_PROBE_INTERVAL_SECS)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(daemon_consts::STOP_GRACE_SECS)
}

fn default_log_tail_lines() -> usize {
    DEFAULT_LOG_TAIL_LINES
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(const_envs::SHIPYARD_HOME) {
        return PathBuf::from(home);
    }

    if nix::unistd::geteuid().is_root() {
        PathBuf::from(SYSTEM_HOME)
    } else {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(const_dirs::SHIPYARD_DIR);
        path
    }
}

impl Default for ShipyardOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            daemon_addr: default_daemon_addr(),
            reconcile_interval: default_reconcile_interval(),
            health_probe_interval: default_health_probe_interval(),
            stop_grace_period: default_stop_grace_period(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl ShipyardOptions {
    /// Options rooted at `home_dir`, everything else default.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Self::default()
        }
    }

    /// Reject configurations the engine cannot operate with.
    pub fn validate(&self) -> ShipyardResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(ShipyardError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if self.reconcile_interval.is_zero() || self.health_probe_interval.is_zero() {
            return Err(ShipyardError::Config(
                "reconcile and health probe intervals must be non-zero".into(),
            ));
        }
        if self.log_tail_lines == 0 {
            return Err(ShipyardError::Config("log_tail_lines must be at least 1".into()));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
