//! Wire types for the cache protocol
//!
//! One JSON object per line in each direction. Field names follow the
//! parent toolchain's convention (`ID`, `ActionID`, ...); every request
//! carries an integer `ID` that its response echoes, and responses may
//! arrive in any order.

use crate::error::{ProcError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request kinds the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Get,
    Put,
    Close,
}

/// A single request from the parent process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Command")]
    pub command: Command,
    #[serde(rename = "ActionID", default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(rename = "OutputID", default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(rename = "BodySize", default)]
    pub body_size: u64,
    /// Small put bodies travel inline, base64-encoded
    #[serde(rename = "Body", default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Larger put bodies travel out-of-band in a file the parent owns
    #[serde(rename = "BodyFile", default, skip_serializing_if = "Option::is_none")]
    pub body_file: Option<PathBuf>,
}

impl Request {
    /// Check the request shape before dispatch. Violations are protocol
    /// errors and fatal for the whole conversation.
    pub fn validate(&self) -> Result<()> {
        match self.command {
            Command::Get => {
                require_id(self.id, "ActionID", self.action_id.as_deref())?;
            }
            Command::Put => {
                require_id(self.id, "ActionID", self.action_id.as_deref())?;
                require_id(self.id, "OutputID", self.output_id.as_deref())?;
                if self.body_size > 0 && self.body.is_none() && self.body_file.is_none() {
                    return Err(ProcError::protocol(format!(
                        "put request {} declares {} body bytes but carries no Body or BodyFile",
                        self.id, self.body_size
                    )));
                }
            }
            Command::Close => {}
        }
        Ok(())
    }
}

fn require_id(request_id: i64, field: &str, value: Option<&str>) -> Result<()> {
    let Some(value) = value else {
        return Err(ProcError::protocol(format!(
            "request {request_id} is missing required field {field}"
        )));
    };
    if !is_valid_id(value) {
        return Err(ProcError::protocol(format!(
            "request {request_id} field {field} is not a valid hex ID"
        )));
    }
    Ok(())
}

/// IDs are opaque hex strings between 32 and 128 characters.
fn is_valid_id(s: &str) -> bool {
    (32..=128).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A single response to the parent process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID")]
    pub id: i64,
    /// Sent once at startup, before any request is read
    #[serde(rename = "KnownCommands", default, skip_serializing_if = "Option::is_none")]
    pub known_commands: Option<Vec<String>>,
    #[serde(rename = "Miss", default, skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(rename = "OutputID", default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time of the returned body file, nanoseconds since
    /// the Unix epoch
    #[serde(rename = "TimeNanos", default, skip_serializing_if = "Option::is_none")]
    pub time_nanos: Option<i64>,
    /// Absolute path the parent may open directly
    #[serde(rename = "DiskPath", default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<String>,
    #[serde(rename = "Err", default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

impl Response {
    /// Capability handshake emitted before the request loop starts
    #[must_use]
    pub fn hello() -> Self {
        Self {
            id: 0,
            known_commands: Some(vec![
                "get".to_string(),
                "put".to_string(),
                "close".to_string(),
            ]),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn miss(id: i64) -> Self {
        Self {
            id,
            miss: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn hit(
        id: i64,
        output_id: String,
        size: u64,
        time_nanos: i64,
        disk_path: String,
    ) -> Self {
        Self {
            id,
            output_id: Some(output_id),
            size: Some(size),
            time_nanos: Some(time_nanos),
            disk_path: Some(disk_path),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stored(id: i64, disk_path: String) -> Self {
        Self {
            id,
            disk_path: Some(disk_path),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            err: Some(message.into()),
            ..Self::default()
        }
    }

    /// Bare acknowledgement, used for `close`
    #[must_use]
    pub fn ack(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}
