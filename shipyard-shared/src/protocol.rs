//! Control protocol between the CLI and the daemon.
//!
//! One JSON request per connection, one JSON response back. Payloads never
//! contain a newline; the sender shuts down its write half to mark the end of
//! the message.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::{ShipyardError, ShipyardResult};

/// Upper bound on a single request or response payload.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Request sent to the daemon.
///
/// Unknown `type` tags fail to deserialize and are answered with an error
/// response rather than being ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    /// Create a new ship and spawn its process.
    Deploy {
        #[serde(rename = "shipID")]
        ship_id: String,
        command: String,
        #[serde(rename = "logDir")]
        log_dir: PathBuf,
        #[serde(rename = "imageId")]
        image_id: i64,
    },

    /// Respawn an existing, non-running ship.
    Start {
        #[serde(rename = "shipName")]
        ship_name: String,
        command: String,
        #[serde(rename = "logDir")]
        log_dir: PathBuf,
        #[serde(rename = "imageId")]
        image_id: i64,
    },

    /// Stop a running ship, escalating to SIGKILL only when `force` is set.
    Stop {
        #[serde(rename = "shipName")]
        ship_name: String,
        #[serde(default)]
        force: bool,
    },
}

impl Request {
    /// Name of the ship this request targets.
    pub fn ship_name(&self) -> &str {
        match self {
            Request::Deploy { ship_id, .. } => ship_id,
            Request::Start { ship_name, .. } | Request::Stop { ship_name, .. } => ship_name,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Deploy { .. } => "deploy",
            Request::Start { .. } => "start",
            Request::Stop { .. } => "stop",
        }
    }

    pub fn to_wire(&self) -> ShipyardResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> ShipyardResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ShipyardError::Protocol(format!("malformed request: {}", e)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Single reply written back on every connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            pid: None,
            message: Some(message.into()),
        }
    }

    pub fn spawned(pid: u32) -> Self {
        Self {
            status: ResponseStatus::Success,
            pid: Some(pid),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            pid: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn to_wire(&self) -> ShipyardResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> ShipyardResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ShipyardError::Protocol(format!("malformed response: {}", e)))
    }

    /// Convert an error reply into a `ShipyardError::Protocol` carrying its message.
    pub fn into_result(self) -> ShipyardResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ShipyardError::Protocol(
                self.message
                    .unwrap_or_else(|| "daemon returned an error".to_string()),
            ))
        }
    }
}
