//! OBEX framing.
//!
//! Pure encode/decode of OBEX packets, headers and application parameters.
//! The only I/O is [`ObexPacket::read_from`] and [`ObexPacket::write_to`],
//! which work on any tokio byte stream.
//!
//! A packet on the wire is
//!
//! ```text
//! opcode:u8 | length:u16be | [connect fields:4] | header*
//! ```
//!
//! where `length` covers the whole packet.

mod app_param;
mod header;
mod opcode;
mod packet;

use thiserror::Error;

pub use app_param::{AppParameter, AppParameters, MAX_APP_PARAMETER_LEN};
pub use header::{HeaderEncoding, HeaderId, ObexHeader};
pub use opcode::{ObexOpcode, ObexOperation};
pub use packet::{ConnectFields, ObexPacket};

/// Frame-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// A header's length prefix is shorter than the prefix itself.
    #[error("Malformed header length.")]
    MalformedHeaderLength,

    /// The declared packet length is shorter than the fixed fields.
    #[error("Malformed packet length {0}.")]
    MalformedPacketLength(u16),

    /// The frame ended before a header was complete.
    #[error("Truncated header 0x{id:02X}: need {needed} bytes, {available} available")]
    Truncated {
        /// Header id being decoded.
        id: u8,
        /// Bytes the header claims.
        needed: usize,
        /// Bytes left in the frame.
        available: usize,
    },

    /// The opcode byte is not a known or user-defined operation.
    #[error("Invalid OBEX opcode 0x{0:02X}")]
    InvalidOpcode(u8),

    /// The operation may only be sent with the final bit set.
    #[error("high bit of {0:?} must be set")]
    FinalBitRequired(ObexOperation),

    /// A fixed-size header was given the wrong payload size.
    #[error("Header 0x{id:02X} expects {expected} bytes, got {actual}")]
    InvalidHeaderPayload {
        /// Header id.
        id: u8,
        /// Required payload size.
        expected: usize,
        /// Given payload size.
        actual: usize,
    },

    /// Header payload does not fit the 16-bit length field.
    #[error("Buffer size too large: {0} bytes.")]
    HeaderTooLarge(usize),

    /// Packet does not fit the 16-bit length field.
    #[error("Packet size too large: {0} bytes.")]
    PacketTooLarge(usize),

    /// Application parameter content is over the limit.
    #[error("Content buffer size too large: {0} bytes. Max 126 bytes.")]
    AppParameterTooLarge(usize),

    /// A required header is missing.
    #[error("Header 0x{0:02X} not found")]
    HeaderNotFound(u8),

    /// A header's payload is not what its type requires.
    #[error("Invalid header value: {0}")]
    InvalidValue(String),
}
