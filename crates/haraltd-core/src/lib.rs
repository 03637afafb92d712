//! Core runtime of the haraltd Bluetooth daemon.
//!
//! This crate tracks client operations, brokers authentication prompts, speaks
//! the daemon's JSON socket protocol and runs OBEX sessions over whatever
//! Bluetooth backend implements [`BluetoothStack`].
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`token`] | Cancellation handle of one operation |
//! | [`registry`] | Table of live operations, command dispatch |
//! | [`auth`] | Agent slots and pending authentication prompts |
//! | [`wire`] | JSON request decoder and the client socket server |
//! | [`obex`] | OBEX packet, header and application-parameter codec |
//! | [`session`] | One OBEX session per remote device |
//! | [`opp`] | Object Push client and server |
//! | [`transport`] | Traits a platform Bluetooth backend implements |
//! | [`mock`] | In-memory backend and output for tests |
//!
//! # Flow
//!
//! A request read by the [`SocketServer`] gets a token from the
//! [`OperationRegistry`] and runs through a [`CommandHandler`]. Handlers that
//! start a transfer open a session in the [`SessionRegistry`]; inbound
//! transfers ask a client for permission through the
//! [`AuthenticationBroker`]. Results and events go back out through an
//! [`Output`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use haraltd_core::{AuthenticationBroker, OperationRegistry, SocketServer};
//!
//! # async fn example(handler: Arc<dyn haraltd_core::CommandHandler>) -> std::io::Result<()> {
//! let registry = Arc::new(OperationRegistry::new());
//! let broker = Arc::new(AuthenticationBroker::new());
//! let server = SocketServer::new(registry, broker);
//!
//! let listener = tokio::net::UnixListener::bind("/tmp/hd.sock")?;
//! server.serve_unix(listener, handler).await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod error;
pub mod mock;
pub mod obex;
pub mod opp;
pub mod output;
pub mod registry;
pub mod session;
pub mod token;
pub mod transport;
pub mod wire;

// Core exports
pub use auth::{AgentKind, AuthPayload, AuthenticationBroker, AuthenticationEvent};
pub use error::{Error, Result};
pub use opp::{ObjectPush, OppContext};
pub use output::Output;
pub use registry::{CommandHandler, CommandOutcome, OperationRecord, OperationRegistry};
pub use session::{ObexSession, SessionRegistry, SessionRole};
pub use token::OperationToken;
pub use transport::{BluetoothStack, NoStack, Socket, SocketListener};
pub use wire::SocketServer;

pub use mock::{MockPeer, MockPeerBuilder, MockStack, RecordingOutput};

// Re-export from haraltd-types
pub use haraltd_types::{BluetoothAddress, ClientId, ErrorCode, ErrorData, uuids};
