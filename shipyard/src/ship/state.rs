//! Ship lifecycle status and state machine.
//!
//! ```text
//! deploy/start ──► Running ──exit / probe / stop──► Stopped
//!                     └──────wait error────────────► Error
//!
//! start:          Stopped | Error ──► Running
//! failed spawn:   (new) | Stopped | Error ──► Error
//! ```
//!
//! `process_id` is set exactly while the ship is `Running`, and `stopped_at`
//! is stamped on every transition out of `Running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShipStatus {
    /// Process spawned and believed alive.
    Running,

    /// Process exited or was stopped. Overlay torn down, can restart.
    Stopped,

    /// Supervision failed (spawn or wait error). Can restart.
    Error,
}

impl ShipStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ShipStatus::Running)
    }

    /// Stopped and errored ships can be started again.
    pub fn can_start(&self) -> bool {
        matches!(self, ShipStatus::Stopped | ShipStatus::Error)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ShipStatus::Running)
    }

    pub fn can_remove(&self) -> bool {
        !self.is_running()
    }

    pub fn can_transition_to(&self, target: ShipStatus) -> bool {
        use ShipStatus::*;
        matches!(
            (self, target),
            (Running, Stopped)
                | (Running, Error)
                | (Stopped, Running)
                | (Error, Running)
                // a start attempt whose spawn failed
                | (Stopped, Error)
                | (Error, Error)
        )
    }

    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipStatus::Running => "running",
            ShipStatus::Stopped => "stopped",
            ShipStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ShipStatus {
    type Err = ShipyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ShipStatus::Running),
            "stopped" => Ok(ShipStatus::Stopped),
            "error" => Ok(ShipStatus::Error),
            other => Err(ShipyardError::Database(format!("unknown ship status '{}'", other))),
        }
    }
}

impl std::fmt::Display for ShipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable runtime half of a ship row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipState {
    pub status: ShipStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl ShipState {
    /// State of a freshly deployed ship.
    pub fn running(pid: u32) -> Self {
        Self {
            status: ShipStatus::Running,
            pid: Some(pid),
            started_at: Some(Utc::now()),
            stopped_at: None,
            exit_code: None,
        }
    }

    fn transition_to(&mut self, new_status: ShipStatus) -> ShipyardResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(ShipyardError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }
        self.status = new_status;
        Ok(())
    }

    /// Restart with a new process. Clears the previous run's outcome.
    pub fn mark_running(&mut self, pid: u32) -> ShipyardResult<()> {
        self.transition_to(ShipStatus::Running)?;
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
        self.exit_code = None;
        Ok(())
    }

    pub fn mark_stopped(&mut self, exit_code: Option<i32>) -> ShipyardResult<()> {
        self.transition_to(ShipStatus::Stopped)?;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.exit_code = exit_code;
        Ok(())
    }

    pub fn mark_error(&mut self) -> ShipyardResult<()> {
        self.transition_to(ShipStatus::Error)?;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        Ok(())
    }

    /// State of a ship whose process could not be spawned at all.
    pub fn spawn_failed() -> Self {
        Self {
            status: ShipStatus::Error,
            pid: None,
            started_at: None,
            stopped_at: Some(Utc::now()),
            exit_code: None,
        }
    }
}
