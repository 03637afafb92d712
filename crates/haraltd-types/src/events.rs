//! Asynchronous events pushed to clients.
//!
//! An event travels as
//! `{"event_id": 4, "event_action": "updated", "event": {"file_transfer_event": {...}}}`.
//! The numeric `event_id` is fixed per [`EventKind`]; the single key inside
//! `event` names the payload.

use serde::{Deserialize, Serialize};

use crate::error_data::ErrorData;

/// Reserved event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u8)]
pub enum EventKind {
    None = 0,
    Error = 1,
    Adapter = 2,
    Device = 3,
    FileTransfer = 4,
    MediaPlayer = 5,
    Authentication = 6,
}

impl EventKind {
    /// The numeric id sent as `event_id`.
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }
}

/// What happened to the object an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    #[default]
    None,
    Added,
    Updated,
    Removed,
}

/// Progress state of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    #[default]
    Queued,
    Active,
    Suspended,
    Complete,
    Error,
}

/// A file transfer, either as a command result or as event payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Base name of the file.
    pub name: String,
    /// Address of the remote device.
    pub address: String,
    /// Full local path of the file.
    pub filename: String,
    /// Total size in bytes.
    pub size: u64,
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Current status.
    pub status: TransferStatus,
}

/// Kind of authentication prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    #[default]
    None,
    DisplayPinCode,
    DisplayPasskey,
    ConfirmPasskey,
    AuthorizePairing,
    AuthorizeService,
    AuthorizeTransfer,
}

/// How a prompt expects to be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMethod {
    /// Informational; always accepted.
    #[default]
    ReplyNone,
    /// Accepted iff the reply is `y` or `yes`, case-insensitively.
    ReplyYesNo,
    /// Accepted iff the reply equals the expected text.
    ReplyWithInput,
}

/// Fields shared by every authentication prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuthenticationParameters {
    pub auth_id: u64,
    pub auth_event: AuthEventType,
    pub auth_reply_method: ReplyMethod,
    pub timeout_ms: u64,
}

/// A pairing prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairingParameters {
    #[serde(flatten)]
    pub auth: AuthenticationParameters,
    pub address: String,
    pub pincode: String,
    pub passkey: u32,
}

/// An inbound file transfer authorization prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferParameters {
    #[serde(flatten)]
    pub auth: AuthenticationParameters,
    pub file_transfer: FileTransfer,
}

/// Event payload; serializes as a single-key object naming the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventBody {
    Error(ErrorData),
    FileTransferEvent(FileTransfer),
    PairingAuthEvent(PairingParameters),
    TransferAuthEvent(TransferParameters),
}

impl EventBody {
    /// The reserved id for this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Error(_) => EventKind::Error,
            Self::FileTransferEvent(_) => EventKind::FileTransfer,
            Self::PairingAuthEvent(_) | Self::TransferAuthEvent(_) => EventKind::Authentication,
        }
    }
}

/// The event envelope written to client sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_id: u8,
    pub event_action: EventAction,
    pub event: EventBody,
}

impl EventMessage {
    /// Wrap a payload, deriving `event_id` from it.
    pub fn new(action: EventAction, event: EventBody) -> Self {
        Self {
            event_id: event.kind().id(),
            event_action: action,
            event,
        }
    }

    /// An error event. Errors are always reported as `added`.
    pub fn error(error: ErrorData) -> Self {
        Self::new(EventAction::Added, EventBody::Error(error))
    }

    /// A file transfer progress event.
    pub fn file_transfer(action: EventAction, transfer: FileTransfer) -> Self {
        Self::new(action, EventBody::FileTransferEvent(transfer))
    }
}
