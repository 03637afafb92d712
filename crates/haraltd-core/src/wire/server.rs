//! Client connections on the daemon socket.
//!
//! Requests come in as concatenated JSON objects; results and events go out
//! as newline-terminated JSON, one writer task per connection.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use haraltd_types::{ClientId, ErrorCode, ErrorData, EventMessage, Request};

use super::decoder::{DEFAULT_MAX_BUFFER, DecodeError, RequestDecoder};
use crate::auth::AuthenticationBroker;
use crate::output::{Output, result_message};
use crate::registry::{CommandHandler, CommandOutcome, OperationRegistry};
use crate::token::OperationToken;

/// Default number of outbound frames queued per connection before the
/// client is disconnected.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Outbound queue of one connection.
struct ClientLink {
    frames: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

struct ServerInner {
    registry: Arc<OperationRegistry>,
    broker: Arc<AuthenticationBroker>,
    clients: RwLock<HashMap<ClientId, ClientLink>>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    max_buffer: usize,
    max_pending: usize,
}

/// The daemon's client-facing socket server.
///
/// Each connection gets a [`ClientId`], a request decoder, and a single
/// writer task so frames never interleave. The server is also the daemon's
/// [`Output`]: results and client events go to one connection, other events
/// to all of them.
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<ServerInner>,
}

impl SocketServer {
    pub fn new(registry: Arc<OperationRegistry>, broker: Arc<AuthenticationBroker>) -> Self {
        Self::with_max_buffer(registry, broker, DEFAULT_MAX_BUFFER)
    }

    /// Create a server that drops pending input beyond `max_buffer` bytes per
    /// connection.
    pub fn with_max_buffer(
        registry: Arc<OperationRegistry>,
        broker: Arc<AuthenticationBroker>,
        max_buffer: usize,
    ) -> Self {
        Self::with_limits(registry, broker, max_buffer, DEFAULT_MAX_PENDING)
    }

    /// Create a server with custom inbound and outbound limits. A client
    /// with more than `max_pending` unwritten frames is disconnected.
    pub fn with_limits(
        registry: Arc<OperationRegistry>,
        broker: Arc<AuthenticationBroker>,
        max_buffer: usize,
        max_pending: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry,
                broker,
                clients: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                connections: TaskTracker::new(),
                max_buffer,
                max_pending: max_pending.max(1),
            }),
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.read().len()
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.connections.close();
    }

    /// Wait for every connection task to finish after [`shutdown`](Self::shutdown).
    pub async fn wait_closed(&self) {
        self.inner.connections.wait().await;
    }

    /// Accept clients on `listener` until shutdown.
    #[cfg(unix)]
    pub async fn serve_unix(
        &self,
        listener: tokio::net::UnixListener,
        handler: Arc<dyn CommandHandler>,
    ) {
        loop {
            let stream = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Failed to accept client: {e}");
                        continue;
                    }
                },
            };
            let server = self.clone();
            let handler = Arc::clone(&handler);
            self.inner
                .connections
                .spawn(async move { server.serve_connection(stream, handler).await });
        }
        debug!("Socket server stopped accepting");
    }

    /// Serve one client until it disconnects or the server shuts down.
    pub async fn serve_connection<S>(&self, stream: S, handler: Arc<dyn CommandHandler>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let client_id = ClientId::new();
        let (mut reader, writer) = tokio::io::split(stream);
        let (frames, pending) = mpsc::channel(self.inner.max_pending);
        let closed = self.inner.shutdown.child_token();

        self.inner
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                client_id,
                ClientLink {
                    frames,
                    closed: closed.clone(),
                },
            );
        let writer_task = tokio::spawn(write_loop(writer, pending, closed.clone(), client_id));
        info!(%client_id, "Client connected");

        let mut decoder = RequestDecoder::new(self.inner.max_buffer);
        loop {
            let read = tokio::select! {
                _ = closed.cancelled() => break,
                read = reader.read_buf(decoder.buffer_mut()) => read,
            };
            match read {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(%client_id, "Read failed: {e}");
                    break;
                }
            }

            while let Some(decoded) = decoder.decode() {
                match decoded {
                    Ok(request) => self.dispatch(client_id, request, Arc::clone(&handler)),
                    Err(e) => self.report_parse_error(client_id, &e),
                }
            }
        }

        // Dropping the queue lets the writer flush what is left and stop.
        self.disconnect(client_id);
        if let Err(e) = writer_task.await {
            warn!(%client_id, "Writer task failed: {e}");
        }
        closed.cancel();
    }

    fn dispatch(&self, client_id: ClientId, request: Request, handler: Arc<dyn CommandHandler>) {
        let server = self.clone();
        let token = self
            .inner
            .registry
            .generate_token(request.request_id, Some(client_id));
        debug!(
            %client_id,
            operation_id = token.operation_id(),
            request_id = request.request_id,
            command = ?request.command,
            "Dispatching command"
        );
        tokio::spawn(async move {
            let outcome = server
                .inner
                .registry
                .execute_handler(&token, &request.command, &*handler)
                .await;
            if let Some(outcome) = outcome {
                if !server.emit_result(&token, outcome) {
                    debug!(operation_id = token.operation_id(), "Result not delivered");
                }
            }
        });
    }

    fn report_parse_error(&self, client_id: ClientId, error: &DecodeError) {
        warn!(%client_id, "Bad request: {error}");
        self.emit_error(
            ErrorData::from(ErrorCode::JsonRequestParse).with_metadata("exception", error.to_string()),
        );
    }

    fn disconnect(&self, client_id: ClientId) {
        self.inner
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id);
        let cancelled = self.inner.registry.cancel_client_operations(client_id);
        self.inner.broker.remove_agents_and_events(client_id);
        info!(%client_id, cancelled, "Client disconnected");
    }

    fn send_to(&self, client_id: ClientId, frame: Bytes) -> bool {
        match self.inner.read().get(&client_id) {
            Some(link) => link.push(client_id, frame),
            None => false,
        }
    }

    fn broadcast(&self, frame: Bytes) {
        for (client_id, link) in self.inner.read().iter() {
            link.push(*client_id, frame.clone());
        }
    }
}

impl ClientLink {
    /// Queue `frame`. A client whose queue is full is not reading and gets
    /// disconnected.
    fn push(&self, client_id: ClientId, frame: Bytes) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%client_id, "Client not reading, disconnecting");
                self.closed.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl ServerInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ClientId, ClientLink>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Output for SocketServer {
    fn emit_result(&self, token: &OperationToken, outcome: CommandOutcome) -> bool {
        let Some(frame) = encode(&result_message(token, outcome)) else {
            return false;
        };
        match token.client_id() {
            Some(client_id) => self.send_to(client_id, frame),
            None => {
                self.broadcast(frame);
                true
            }
        }
    }

    fn emit_event(&self, event: EventMessage) {
        if let Some(frame) = encode(&event) {
            self.broadcast(frame);
        }
    }

    fn emit_client_event(&self, token: &OperationToken, event: EventMessage) -> bool {
        let Some(client_id) = token.client_id() else {
            return false;
        };
        encode(&event).is_some_and(|frame| self.send_to(client_id, frame))
    }
}

/// One JSON object followed by a newline.
fn encode(message: &impl Serialize) -> Option<Bytes> {
    match serde_json::to_vec(message) {
        Ok(mut json) => {
            json.push(b'\n');
            Some(Bytes::from(json))
        }
        Err(e) => {
            warn!(code = ErrorCode::JsonResponseMarshal.value(), "Failed to encode message: {e}");
            None
        }
    }
}

/// Write frames in order until the queue is dropped or `closed` fires. The
/// first failed write closes the connection, since part of the frame may
/// already be on the wire.
async fn write_loop<W>(
    mut writer: W,
    mut pending: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    client_id: ClientId,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = pending.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = closed.cancelled() => break,
            written = write_frame(&mut writer, &frame) => written,
        };
        if let Err(e) = written {
            warn!(%client_id, "Write failed, closing connection: {e}");
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
