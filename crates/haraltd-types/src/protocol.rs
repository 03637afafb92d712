//! Request and result envelopes exchanged over the daemon socket.
//!
//! Clients write [`Request`] objects; the daemon answers each one with exactly
//! one [`ResultMessage`] and may interleave any number of
//! [`EventMessage`](crate::events::EventMessage)s. Every message is one JSON
//! object followed by a newline.

use serde::{Deserialize, Serialize};

use crate::error_data::ErrorData;
use crate::events::{EventMessage, FileTransfer};

/// A command sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The command line, already split into arguments.
    pub command: Vec<String>,
    /// Client-chosen correlation id. Must be positive.
    pub request_id: i64,
}

impl Request {
    /// Build a request from anything iterable as strings.
    pub fn new<I, S>(request_id: i64, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            request_id,
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Platform description returned by `rpc platform-info`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Name of the Bluetooth backend in use.
    pub stack: String,
    /// Operating system and architecture.
    pub os_info: String,
}

/// Payload of a successful result; serializes as a single-key object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ResultData {
    FileTransfer(FileTransfer),
    Version(String),
    Platform(PlatformInfo),
    Features(Vec<String>),
}

/// The reply to one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub status: Status,
    pub operation_id: u64,
    pub request_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResultData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl ResultMessage {
    /// A successful result. `data` may be empty for commands that only
    /// acknowledge.
    pub fn ok(operation_id: u64, request_id: i64, data: Option<ResultData>) -> Self {
        Self {
            status: Status::Ok,
            operation_id,
            request_id,
            data,
            error: None,
        }
    }

    /// A failed result.
    pub fn error(operation_id: u64, request_id: i64, error: ErrorData) -> Self {
        Self {
            status: Status::Error,
            operation_id,
            request_id,
            data: None,
            error: Some(error),
        }
    }

    /// Returns `true` if the command succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Anything the daemon may write to a client.
///
/// Useful on the client side, where results and events arrive on the same
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Result(ResultMessage),
    Event(EventMessage),
}
