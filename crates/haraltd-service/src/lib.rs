//! The haraltd daemon.
//!
//! This crate wires the core runtime into a running service:
//! - Loads configuration from TOML
//! - Listens for clients on a UNIX socket
//! - Parses client command vectors and runs them
//! - Optionally starts the Object Push server at startup
//! - Cancels outstanding operations on shutdown
//!
//! # Commands
//!
//! - `rpc version | platform-info | feature-flags`
//! - `rpc auth -a <auth_id> -r <response>` - answer a prompt
//! - `rpc agent register|unregister -a <pairing|obex>`
//! - `device opp start-session | send-file | cancel-transfer | stop-session -a <address>`
//! - `adapter opp-server start [-d <dir>] | stop`
//! - `opp send -a <address> <file>` - send, opening a session if needed
//!
//! # Configuration
//!
//! The daemon reads configuration from `~/.config/haraltd/haraltd.toml`:
//!
//! ```toml
//! [server]
//! socket_path = "/run/user/1000/haraltd/hd.sock"
//!
//! [operations]
//! shutdown_grace_ms = 100
//! auth_timeout_ms = 10000
//!
//! [obex]
//! server_enabled = true
//! destination_dir = "~/Downloads/bluetooth"
//!
//! [stack]
//! backend = "mock"
//!
//! [log]
//! level = "haraltd=debug"
//! ```

pub mod commands;
pub mod config;
pub mod daemon;

pub use commands::Commands;
pub use config::{
    Backend, Config, ConfigError, LogConfig, ObexConfig, OperationsConfig, ServerConfig,
    StackConfig, ValidationError,
};
pub use daemon::Daemon;
