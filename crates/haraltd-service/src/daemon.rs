//! Daemon assembly, startup and shutdown.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use haraltd_core::opp::OppContext;
use haraltd_core::{
    AuthenticationBroker, BluetoothStack, CommandHandler, MockStack, NoStack, ObjectPush,
    OperationRegistry, Output, SocketServer,
};
use haraltd_types::BluetoothAddress;

use crate::commands::Commands;
use crate::config::{Backend, Config};

/// Adapter address of the mock backend when the config names none.
pub const DEFAULT_MOCK_ADAPTER: BluetoothAddress =
    BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

/// How long shutdown waits for connection tasks to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The daemon's components, wired together.
pub struct Daemon {
    config: Config,
    registry: Arc<OperationRegistry>,
    server: SocketServer,
    opp: Arc<ObjectPush>,
    handler: Arc<Commands>,
}

impl Daemon {
    /// Build the daemon with the backend named in `config`.
    pub fn new(config: Config) -> Self {
        let stack: Arc<dyn BluetoothStack> = match config.stack.backend {
            Backend::None => Arc::new(NoStack),
            Backend::Mock => Arc::new(MockStack::new(
                config.obex.adapter_address.unwrap_or(DEFAULT_MOCK_ADAPTER),
            )),
        };
        Self::with_stack(config, stack)
    }

    /// Build the daemon around an existing backend.
    pub fn with_stack(config: Config, stack: Arc<dyn BluetoothStack>) -> Self {
        let registry = Arc::new(OperationRegistry::new());
        let broker = Arc::new(AuthenticationBroker::new());
        let server = SocketServer::new(Arc::clone(&registry), Arc::clone(&broker));

        let ctx = OppContext {
            registry: Arc::clone(&registry),
            broker: Arc::clone(&broker),
            output: Arc::new(server.clone()) as Arc<dyn Output>,
            stack: Arc::clone(&stack),
            auth_timeout: config.operations.auth_timeout(),
            packet_floor: config.obex.packet_size,
        };
        let opp = Arc::new(ObjectPush::new(ctx, config.obex.destination_dir.clone()));
        let handler = Arc::new(Commands::new(broker, Arc::clone(&opp), stack));

        Self {
            config,
            registry,
            server,
            opp,
            handler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// The socket server, also the daemon's output.
    pub fn server(&self) -> &SocketServer {
        &self.server
    }

    /// The command handler clients are served with.
    pub fn handler(&self) -> Arc<dyn CommandHandler> {
        self.handler.clone()
    }

    /// Start the Object Push server if the config enables it.
    ///
    /// The server runs under a daemon-owned operation that no client can
    /// cancel. Returns `false` if it is disabled.
    pub async fn start_obex_server(&self) -> haraltd_core::Result<bool> {
        if !self.config.obex.server_enabled {
            return Ok(false);
        }
        let token = self.registry.generate_token(0, None);
        match self.opp.start_server(&token, None).await {
            Ok(adapter) => {
                info!(%adapter, "Started Object Push server from config");
                Ok(true)
            }
            Err(e) => {
                self.registry.cancel(token.operation_id());
                Err(e)
            }
        }
    }

    /// Serve clients on the configured socket until `shutdown` resolves,
    /// then shut down.
    #[cfg(unix)]
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let path = self.config.server.socket_path.clone();
        let listener = bind_socket(&path)?;
        info!(socket = %path.display(), "Listening for clients");

        if let Err(e) = self.start_obex_server().await {
            warn!("Object Push server not started: {e}");
        }

        tokio::select! {
            _ = self.server.serve_unix(listener, self.handler()) => {}
            _ = shutdown => info!("Shutdown requested"),
        }

        self.shutdown().await;
        remove_socket(&path);
        Ok(())
    }

    /// Wind down every operation and close client connections.
    ///
    /// Long-running operations get the configured grace period to finish
    /// before everything is cancelled.
    pub async fn shutdown(&self) {
        let grace = self.config.operations.shutdown_grace();
        if tokio::time::timeout(grace, self.registry.wait_for_extended_operations())
            .await
            .is_err()
        {
            info!(
                pending = self.registry.len(),
                "Grace period over, cancelling operations"
            );
        }
        self.registry.cancel_all().await;

        self.server.shutdown();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.server.wait_closed())
            .await
            .is_err()
        {
            warn!("Client connections did not close in time");
        }
    }
}

/// Bind the client socket, creating its directory and replacing a stale
/// socket file.
#[cfg(unix)]
pub fn bind_socket(path: &Path) -> anyhow::Result<tokio::net::UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))
}

#[cfg(unix)]
fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(socket = %path.display(), "Failed to remove socket: {e}");
    }
}
