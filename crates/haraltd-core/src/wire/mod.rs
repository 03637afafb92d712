//! The daemon's client protocol.
//!
//! Clients write a stream of [`Request`](haraltd_types::Request) objects with
//! no framing between them. The daemon writes one JSON object per line:
//! [`ResultMessage`](haraltd_types::ResultMessage)s to the requesting client,
//! [`EventMessage`](haraltd_types::EventMessage)s to everyone unless they are
//! addressed to one client.

mod decoder;
mod server;

pub use decoder::{DEFAULT_MAX_BUFFER, DecodeError, RequestDecoder};
pub use server::{DEFAULT_MAX_PENDING, SocketServer};
