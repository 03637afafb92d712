//! Error types for haraltd-core.
//!
//! Every failure inside the daemon is an [`Error`]. Before it reaches a client
//! it is converted into an [`ErrorData`] through `From<&Error>`, which assigns
//! the stable numeric code and attaches context as metadata.
//!
//! ## Error Classification
//!
//! | Kind | Variants | Code |
//! |------|----------|------|
//! | protocol | [`Error::Protocol`], [`Error::Io`] | session error of the role that hit it |
//! | session conflict | [`Error::SessionExists`], [`Error::NoSession`], [`Error::ControlledByAnotherClient`], [`Error::Session`] | `ERROR_DEVICE_FILE_TRANSFER_SESSION` |
//! | timeout | [`Error::Timeout`] | `ERROR_UNEXPECTED` with `exception` |
//! | resource unavailable | [`Error::AdapterNotFound`], [`Error::DeviceNotFound`] | dedicated codes |
//! | cancelled | [`Error::Cancelled`] | `ERROR_OPERATION_CANCELLED` |
//! | unexpected | [`Error::Unexpected`] | `ERROR_UNEXPECTED` with `exception` |

use std::time::Duration;

use thiserror::Error;

use haraltd_types::{BluetoothAddress, ErrorCode, ErrorData, ParseError};

use crate::obex::CodecError;

/// Errors that can occur inside the daemon.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed OBEX frame.
    #[error(transparent)]
    Protocol(#[from] CodecError),

    /// I/O error on a socket or file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A client or server value could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A session is already registered for the address.
    #[error("A session already exists with this address")]
    SessionExists {
        /// The conflicting address.
        address: BluetoothAddress,
    },

    /// No session is registered for the address.
    #[error("No session exists for {profile}")]
    NoSession {
        /// Human readable profile name, e.g. "Object Push".
        profile: String,
    },

    /// An OBEX session failed or refused the request.
    #[error("{0}")]
    Session(String),

    /// The session belongs to a different socket client.
    #[error("This transfer is controlled by another client")]
    ControlledByAnotherClient,

    /// The remote OBEX service refused the connection.
    #[error("Unable to connect to the target OBEX service (response {response}).")]
    ConnectRejected {
        /// The response opcode, rendered.
        response: String,
    },

    /// A server-side transfer failed.
    #[error("{0}")]
    ServerTransfer(String),

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The remote device is unknown or unreachable.
    #[error("Device not found: {0}")]
    DeviceNotFound(BluetoothAddress),

    /// No usable Bluetooth adapter.
    #[error("No Bluetooth adapter available")]
    AdapterNotFound,

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Another operation of the same kind is running.
    #[error("{message}")]
    InProgress {
        /// The operation that is already running.
        operation: String,
        /// Description.
        message: String,
    },

    /// The agent slot is taken.
    #[error("Authentication agent is already registered")]
    AgentAlreadyRegistered,

    /// No agent kind was given.
    #[error("No authentication agent specified")]
    NoAgentSpecified,

    /// The token has no owning client.
    #[error("No client ID found")]
    NoClientId,

    /// Operation not supported.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// Catch-all with a diagnostic message.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an unexpected error from any message.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Create a missing-session error for a profile.
    pub fn no_session(profile: impl Into<String>) -> Self {
        Self::NoSession {
            profile: profile.into(),
        }
    }

    /// Returns `true` for [`Error::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<&Error> for ErrorData {
    fn from(err: &Error) -> Self {
        let session = || {
            ErrorData::from(ErrorCode::DeviceFileTransferSession)
                .with_metadata("exception", err.to_string())
        };
        match err {
            Error::Cancelled => ErrorCode::OperationCancelled.into(),
            Error::AdapterNotFound => ErrorCode::AdapterNotFound.into(),
            Error::DeviceNotFound(address) => {
                ErrorData::from(ErrorCode::DeviceNotFound).with_metadata("address", address.to_string())
            }
            Error::Unsupported(op) => {
                ErrorData::from(ErrorCode::Unsupported).with_metadata("operation", op.clone())
            }
            Error::InProgress { operation, message } => {
                ErrorData::from(ErrorCode::OperationInProgress)
                    .with_metadata("operation", operation.clone())
                    .with_metadata("exception", message.clone())
            }
            Error::SessionExists { address } => session().with_metadata("address", address.to_string()),
            Error::NoSession { .. }
            | Error::ControlledByAnotherClient
            | Error::NoClientId
            | Error::Session(_) => session(),
            Error::ConnectRejected { .. } => ErrorData::from(ErrorCode::DeviceFileTransferSession)
                .with_metadata("error", err.to_string()),
            Error::Protocol(_) | Error::Io(_) => session(),
            Error::ServerTransfer(_) => ErrorData::from(ErrorCode::DeviceFileTransferServer)
                .with_metadata("exception", err.to_string()),
            Error::Parse(_) => ErrorData::from(ErrorCode::ParsingCommand)
                .with_metadata("exception", err.to_string()),
            _ => ErrorData::from(ErrorCode::Unexpected).with_metadata("exception", err.to_string()),
        }
    }
}

impl From<Error> for ErrorData {
    fn from(err: Error) -> Self {
        ErrorData::from(&err)
    }
}

/// Result type alias using haraltd-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
