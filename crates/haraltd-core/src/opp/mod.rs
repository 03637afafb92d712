//! Object Push profile.
//!
//! [`ObjectPush`] is the entry point the command layer uses. It owns one
//! [`SessionRegistry`] holding outbound client sessions, the local server and
//! the server's per-connection sub-sessions.

mod client;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use haraltd_types::{BluetoothAddress, FileTransfer};

use crate::auth::AuthenticationBroker;
use crate::error::{Error, Result};
use crate::output::Output;
use crate::registry::OperationRegistry;
use crate::session::{ObexSession, SessionHandle, SessionRegistry, SessionRole};
use crate::token::OperationToken;
use crate::transport::BluetoothStack;

pub use client::OppClient;
pub use server::{OppServer, OppSubServer};

/// Profile name used in session errors.
pub const PROFILE: &str = "Object Push";

/// Default time an inbound transfer waits for the agent's answer.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default smallest body chunk an outbound push sends.
pub const DEFAULT_PACKET_FLOOR: u16 = 256;

/// Everything an Object Push session needs from the daemon.
#[derive(Clone)]
pub struct OppContext {
    pub registry: Arc<OperationRegistry>,
    pub broker: Arc<AuthenticationBroker>,
    pub output: Arc<dyn Output>,
    pub stack: Arc<dyn BluetoothStack>,
    /// How long inbound transfer prompts stay open.
    pub auth_timeout: Duration,
    /// Smallest body chunk an outbound push sends, whatever the peer's
    /// packet limit.
    pub packet_floor: u16,
}

/// One Object Push session of any role.
#[derive(Clone)]
pub enum OppSession {
    Client(OppClient),
    Server(OppServer),
    SubServer(OppSubServer),
}

#[async_trait]
impl ObexSession for OppSession {
    fn role(&self) -> SessionRole {
        match self {
            Self::Client(_) => SessionRole::Client,
            Self::Server(_) => SessionRole::Server,
            Self::SubServer(_) => SessionRole::SubServer,
        }
    }

    fn address(&self) -> BluetoothAddress {
        match self {
            Self::Client(s) => s.address(),
            Self::Server(s) => s.address(),
            Self::SubServer(s) => s.address(),
        }
    }

    fn token(&self) -> &OperationToken {
        match self {
            Self::Client(s) => s.token(),
            Self::Server(s) => s.token(),
            Self::SubServer(s) => s.token(),
        }
    }

    async fn start(&self, handle: SessionHandle<Self>) -> Result<()> {
        match self {
            Self::Client(s) => s.start(handle).await,
            Self::Server(s) => s.start(handle).await,
            Self::SubServer(s) => s.start(handle).await,
        }
    }

    async fn stop(&self) {
        match self {
            Self::Client(s) => s.stop().await,
            Self::Server(s) => s.stop().await,
            Self::SubServer(s) => s.stop().await,
        }
    }

    fn cancel_transfer(&self) -> Result<()> {
        match self {
            Self::Client(s) => {
                s.cancel_transfer();
                Ok(())
            }
            Self::SubServer(s) => {
                s.cancel_transfer();
                Ok(())
            }
            Self::Server(_) => Err(Error::no_session(PROFILE)),
        }
    }
}

/// Object Push sessions of the daemon.
pub struct ObjectPush {
    ctx: OppContext,
    sessions: Arc<SessionRegistry<OppSession>>,
    default_destination: PathBuf,
}

impl ObjectPush {
    /// Create the profile. Inbound files go to `default_destination` unless
    /// the server is started with another directory.
    pub fn new(ctx: OppContext, default_destination: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            sessions: SessionRegistry::new(PROFILE),
            default_destination: default_destination.into(),
        }
    }

    /// The session table.
    pub fn sessions(&self) -> &Arc<SessionRegistry<OppSession>> {
        &self.sessions
    }

    /// The client session to `address` owned by `token`'s client.
    pub fn client_session(&self, token: &OperationToken, address: BluetoothAddress) -> Result<OppClient> {
        match self.sessions.owned(token, address)? {
            OppSession::Client(client) => Ok(client),
            _ => Err(Error::no_session(PROFILE)),
        }
    }

    /// Connect to the Object Push service of `address`.
    ///
    /// The session lives under `token` until it is stopped or the client
    /// disconnects.
    pub async fn start_session(&self, token: &OperationToken, address: BluetoothAddress) -> Result<()> {
        if token.client_id().is_none() {
            return Err(Error::NoClientId);
        }
        if self.client_session(token, address).is_ok() {
            return Err(Error::Session(
                "An Object Push Client session is in progress".into(),
            ));
        }

        let client = OppClient::new(token.clone(), address, self.ctx.clone());
        self.sessions
            .start(address, OppSession::Client(client))
            .await
    }

    /// Queue `path` for sending on the client session to `address`.
    pub async fn queue_file(
        &self,
        token: &OperationToken,
        address: BluetoothAddress,
        path: &Path,
    ) -> Result<FileTransfer> {
        self.client_session(token, address)?.queue_file(path).await
    }

    /// Abort the transfer running with `address`, outbound or inbound.
    pub fn cancel_transfer(&self, token: &OperationToken, address: BluetoothAddress) -> Result<()> {
        self.sessions.cancel_transfer(token, address)
    }

    /// End the session with `address`.
    pub async fn stop_session(&self, token: &OperationToken, address: BluetoothAddress) -> Result<()> {
        self.sessions.stop(token, address).await
    }

    /// Start accepting inbound pushes on the local adapter.
    ///
    /// Files land in `destination`, or the default directory. Returns the
    /// adapter address the server is registered under.
    pub async fn start_server(
        &self,
        token: &OperationToken,
        destination: Option<PathBuf>,
    ) -> Result<BluetoothAddress> {
        let adapter = self.ctx.stack.adapter_address().await?;
        if let Some(OppSession::Server(_)) = self.sessions.get(adapter) {
            return Err(Error::InProgress {
                operation: "Object Push Server".into(),
                message: "An Object Push server instance is in progress".into(),
            });
        }

        let destination = destination.unwrap_or_else(|| self.default_destination.clone());
        tokio::fs::create_dir_all(&destination).await?;

        let server = OppServer::new(token.clone(), adapter, destination.clone(), self.ctx.clone());
        self.sessions
            .start(adapter, OppSession::Server(server))
            .await?;
        info!(%adapter, destination = %destination.display(), "Object Push server started");
        Ok(adapter)
    }

    /// Stop the local server.
    pub async fn stop_server(&self, token: &OperationToken) -> Result<()> {
        let adapter = self.ctx.stack.adapter_address().await?;
        match self.sessions.get(adapter) {
            Some(OppSession::Server(_)) => self.sessions.stop(token, adapter).await,
            _ => Err(Error::no_session(PROFILE)),
        }
    }
}
