//! Platform-agnostic wire types for the haraltd Bluetooth daemon.
//!
//! This crate holds everything a client needs to talk to the daemon without
//! pulling in the runtime: request and result envelopes, event payloads,
//! stable error codes and the Bluetooth address type.
//!
//! # Features
//!
//! - [`Request`] / [`ResultMessage`] / [`EventMessage`] envelopes
//! - [`ErrorData`] with stable [`ErrorCode`]s
//! - File transfer and authentication prompt models
//! - Service UUID constants
//!
//! # Example
//!
//! ```
//! use haraltd_types::{Reply, Request};
//!
//! let req = Request::new(1, ["rpc", "version"]);
//! let line = serde_json::to_string(&req).unwrap();
//! assert_eq!(line, r#"{"command":["rpc","version"],"request_id":1}"#);
//!
//! let reply: Reply = serde_json::from_str(
//!     r#"{"status":"ok","operation_id":1,"request_id":1,"data":{"version":"0.1.0"}}"#,
//! )
//! .unwrap();
//! assert!(matches!(reply, Reply::Result(r) if r.is_ok()));
//! ```

pub mod address;
pub mod error;
pub mod error_data;
pub mod events;
pub mod protocol;
pub mod uuids;

pub use address::{BluetoothAddress, ClientId};
pub use error::{ParseError, ParseResult};
pub use error_data::{ErrorCode, ErrorData};
pub use events::{
    AuthEventType, AuthenticationParameters, EventAction, EventBody, EventKind, EventMessage,
    FileTransfer, PairingParameters, ReplyMethod, TransferParameters, TransferStatus,
};
pub use protocol::{PlatformInfo, Reply, Request, ResultData, ResultMessage, Status};
