//! Error types for parsing haraltd wire values.

use thiserror::Error;

/// Errors that can occur when parsing values received from a client or a peer.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string is not a Bluetooth device address.
    #[error("Invalid Bluetooth address: '{0}'")]
    InvalidAddress(String),

    /// The string does not name an authentication agent kind.
    #[error("Unknown agent kind: '{0}' (expected 'pairing' or 'obex')")]
    UnknownAgentKind(String),

    /// Generic malformed value.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using haraltd-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
