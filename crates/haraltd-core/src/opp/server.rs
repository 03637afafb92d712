use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use haraltd_types::{
    BluetoothAddress, ErrorData, EventAction, EventMessage, FileTransfer, TransferStatus, uuids,
};

use super::{OppContext, OppSession};
use crate::auth::AgentKind;
use crate::error::{Error, Result};
use crate::obex::{HeaderId, ObexHeader, ObexOperation, ObexPacket};
use crate::output::confirm_authentication;
use crate::session::{ObexServerConnection, SessionHandle};
use crate::token::OperationToken;
use crate::transport::{ListenerOptions, Socket, SocketListener};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn join(task: Option<JoinHandle<()>>, address: BluetoothAddress) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            warn!(%address, "Object Push server task failed: {e}");
        }
    }
}

// ==================== Listener ====================

struct ServerInner {
    token: OperationToken,
    address: BluetoothAddress,
    destination: PathBuf,
    ctx: OppContext,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Object Push listener on the local adapter.
///
/// Each accepted connection becomes an [`OppSubServer`] registered under the
/// remote address, so one device can push one stream of files at a time.
#[derive(Clone)]
pub struct OppServer {
    inner: Arc<ServerInner>,
}

impl OppServer {
    pub fn new(
        token: OperationToken,
        adapter: BluetoothAddress,
        destination: PathBuf,
        ctx: OppContext,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                token,
                address: adapter,
                destination,
                ctx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> BluetoothAddress {
        self.inner.address
    }

    pub fn token(&self) -> &OperationToken {
        &self.inner.token
    }

    /// Directory inbound files are written to.
    pub fn destination(&self) -> &Path {
        &self.inner.destination
    }

    pub(super) async fn start(&self, handle: SessionHandle<OppSession>) -> Result<()> {
        let inner = &self.inner;
        let mut listener = inner
            .ctx
            .stack
            .listen(&ListenerOptions {
                service_uuid: uuids::OBJECT_PUSH,
                channel: uuids::OBJECT_PUSH_CHANNEL,
            })
            .await?;
        listener.start_advertising().await?;

        inner.ctx.registry.set_properties(&inner.token, true, true);
        let task = tokio::spawn(Arc::clone(inner).accept_loop(listener, handle));
        *lock(&inner.task) = Some(task);
        Ok(())
    }

    pub(super) async fn stop(&self) {
        self.inner.token.release();
        let task = lock(&self.inner.task).take();
        join(task, self.inner.address).await;
    }
}

impl ServerInner {
    async fn accept_loop(
        self: Arc<Self>,
        mut listener: Box<dyn SocketListener>,
        handle: SessionHandle<OppSession>,
    ) {
        let cancel = self.token.cancellation_token();
        loop {
            let socket = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!(adapter = %self.address, "Object Push listener failed: {e}");
                        self.ctx
                            .output
                            .emit_error(ErrorData::from(&Error::ServerTransfer(e.to_string())));
                        break;
                    }
                },
            };
            if let Err(e) = self.spawn_sub_server(socket, &handle).await {
                warn!(adapter = %self.address, "Rejected inbound Object Push connection: {e}");
            }
        }

        self.token.release();
        drop(listener);
        handle.dispose();
        info!(adapter = %self.address, "Object Push server stopped");
    }

    async fn spawn_sub_server(
        &self,
        socket: Socket,
        handle: &SessionHandle<OppSession>,
    ) -> Result<()> {
        let sessions = handle
            .registry()
            .ok_or_else(|| Error::unexpected("Object Push session table is gone"))?;
        let token = self.ctx.registry.generate_linked_token(
            0,
            self.token.client_id(),
            &self.token.cancellation_token(),
        )?;
        self.ctx.registry.set_properties(&token, true, false);

        let address = socket.address();
        debug!(%address, operation_id = token.operation_id(), "Inbound Object Push connection");
        let sub = OppSubServer::new(token, socket, self.destination.clone(), self.ctx.clone());
        sessions.start(address, OppSession::SubServer(sub)).await
    }
}

// ==================== Per-connection session ====================

struct SubInner {
    token: OperationToken,
    address: BluetoothAddress,
    destination: PathBuf,
    ctx: OppContext,
    socket: Mutex<Option<Socket>>,
    transfer_cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// One inbound Object Push connection.
#[derive(Clone)]
pub struct OppSubServer {
    inner: Arc<SubInner>,
}

impl OppSubServer {
    pub fn new(token: OperationToken, socket: Socket, destination: PathBuf, ctx: OppContext) -> Self {
        Self {
            inner: Arc::new(SubInner {
                address: socket.address(),
                token,
                destination,
                ctx,
                socket: Mutex::new(Some(socket)),
                transfer_cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn address(&self) -> BluetoothAddress {
        self.inner.address
    }

    pub fn token(&self) -> &OperationToken {
        &self.inner.token
    }

    pub(super) async fn start(&self, handle: SessionHandle<OppSession>) -> Result<()> {
        let inner = &self.inner;
        let mut socket = lock(&inner.socket)
            .take()
            .ok_or_else(|| Error::unexpected("Object Push sub-session started twice"))?;

        let watcher = socket
            .take_connection_state()
            .map(|state| tokio::spawn(watch_connection(state, inner.token.clone())));
        *lock(&inner.transfer_cancel) = inner.token.linked();

        let conn = ObexServerConnection::new(socket);
        let task = tokio::spawn(Arc::clone(inner).run(conn, watcher, handle));
        *lock(&inner.task) = Some(task);
        Ok(())
    }

    pub(super) async fn stop(&self) {
        self.inner.token.release();
        let task = lock(&self.inner.task).take();
        join(task, self.inner.address).await;
    }

    /// Abort the inbound transfer. The peer is sent `Abort` and the
    /// connection ends.
    pub fn cancel_transfer(&self) {
        lock(&self.inner.transfer_cancel).cancel();
    }
}

/// Release `token` when the remote device reports it disconnected.
async fn watch_connection(mut state: watch::Receiver<bool>, token: OperationToken) {
    let cancel = token.cancellation_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                if !*state.borrow_and_update() {
                    debug!(operation_id = token.operation_id(), "Remote device disconnected");
                    token.release();
                    return;
                }
            }
        }
    }
}

/// A file being received. The temporary file is removed on drop unless the
/// transfer completed.
struct Incoming {
    transfer: FileTransfer,
    file: Option<File>,
    temp_path: Option<PathBuf>,
}

impl Incoming {
    async fn write(&mut self, body: &[u8]) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            file.write_all(body).await?;
        }
        self.transfer.transferred += body.len() as u64;
        Ok(())
    }

    /// Move the finished file into place. An existing file is never
    /// replaced; the name gets a ` (n)` suffix instead.
    async fn persist(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        if let Some(temp) = &self.temp_path {
            let target = available_path(Path::new(&self.transfer.filename)).await?;
            tokio::fs::rename(temp, &target).await?;
            self.transfer.filename = target.to_string_lossy().into_owned();
            self.temp_path = None;
        }
        Ok(())
    }
}

/// `path`, or the first `stem (n).ext` next to it that does not exist yet.
async fn available_path(path: &Path) -> io::Result<PathBuf> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(path.to_path_buf());
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    for n in 1..=u32::MAX {
        let name = match &extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = path.with_file_name(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", path.display()),
    ))
}

impl Drop for Incoming {
    fn drop(&mut self) {
        if let Some(temp) = self.temp_path.take() {
            if let Err(e) = std::fs::remove_file(&temp) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), "Failed to remove partial transfer: {e}");
                }
            }
        }
    }
}

impl SubInner {
    async fn run(
        self: Arc<Self>,
        mut conn: ObexServerConnection,
        watcher: Option<JoinHandle<()>>,
        handle: SessionHandle<OppSession>,
    ) {
        let mut incoming = None;
        let result = self.serve(&mut conn, &mut incoming).await;

        if let Some(mut current) = incoming.take() {
            current.transfer.status = TransferStatus::Error;
            self.emit(EventAction::Updated, &current.transfer);
            self.emit(EventAction::Removed, &current.transfer);
        }
        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                if let Err(e) = conn.respond(ObexOperation::Abort).await {
                    debug!(address = %self.address, "Abort not delivered: {e}");
                }
            }
            Err(e) => {
                warn!(address = %self.address, "Inbound Object Push session failed: {e}");
                let error = match e {
                    Error::ServerTransfer(_) => e,
                    other => Error::ServerTransfer(other.to_string()),
                };
                self.ctx.output.emit_error(ErrorData::from(&error));
            }
        }

        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.token.release();
        drop(conn);
        handle.dispose();
        debug!(address = %self.address, "Inbound Object Push session ended");
    }

    async fn serve(
        &self,
        conn: &mut ObexServerConnection,
        incoming: &mut Option<Incoming>,
    ) -> Result<()> {
        let cancel = lock(&self.transfer_cancel).clone();
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            connected = conn.accept_connect() => { connected?; }
        }

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                request = conn.read_request() => match request {
                    Ok(request) => request,
                    Err(Error::Io(e))
                        if incoming.is_none() && e.kind() == io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };

            match request.opcode.operation() {
                Some(ObexOperation::Put) => {
                    if incoming.is_none() {
                        *incoming = Some(self.begin_transfer(&request, conn).await?);
                    }
                    let Some(current) = incoming.as_mut() else {
                        continue;
                    };

                    if let Some(body) = request.body() {
                        current.write(body).await?;
                    }
                    if request.opcode.is_final() {
                        current.persist().await?;
                        conn.respond(ObexOperation::Success).await?;
                        current.transfer.status = TransferStatus::Complete;
                        self.emit(EventAction::Updated, &current.transfer);
                        self.emit(EventAction::Removed, &current.transfer);
                        info!(
                            address = %self.address,
                            file = %current.transfer.filename,
                            "Inbound transfer complete"
                        );
                        *incoming = None;
                    } else {
                        conn.respond(ObexOperation::Continue).await?;
                        self.emit(EventAction::Updated, &current.transfer);
                    }
                }
                Some(ObexOperation::Abort) => {
                    conn.respond(ObexOperation::Success).await?;
                    debug!(address = %self.address, "Peer aborted the transfer");
                    return Ok(());
                }
                Some(ObexOperation::Disconnect) => {
                    conn.respond(ObexOperation::Success).await?;
                    return Ok(());
                }
                _ => {
                    return Err(Error::ServerTransfer(format!(
                        "Got unexpected operation code during transfer: {}",
                        request.opcode
                    )));
                }
            }
        }
    }

    /// Validate the first Put of a file, ask the agent, and open the
    /// temporary file.
    async fn begin_transfer(
        &self,
        request: &ObexPacket,
        conn: &mut ObexServerConnection,
    ) -> Result<Incoming> {
        let name = request
            .header(HeaderId::NAME)
            .map(ObexHeader::as_unicode)
            .transpose()?
            .unwrap_or_default();
        let size = request
            .header(HeaderId::LENGTH)
            .and_then(ObexHeader::as_u32)
            .unwrap_or(0);
        let file_name = Path::new(&name).file_name().map(ToOwned::to_owned);
        let (Some(file_name), true) = (file_name, size > 0) else {
            conn.respond(ObexOperation::BadRequest).await?;
            return Err(Error::ServerTransfer(
                "The first Put request must carry Name and Length headers".into(),
            ));
        };

        let mut transfer = FileTransfer {
            name: file_name.to_string_lossy().into_owned(),
            address: self.address.to_string(),
            filename: self.destination.join(&file_name).to_string_lossy().into_owned(),
            size: u64::from(size),
            transferred: 0,
            status: TransferStatus::Queued,
        };
        self.emit(EventAction::Added, &transfer);

        // The prompt follows the transfer link, so a cancel ends it early.
        let link = lock(&self.transfer_cancel).clone();
        let accepted = match self
            .ctx
            .registry
            .generate_linked_token(0, self.token.client_id(), &link)
        {
            Ok(auth_token) => {
                let prompt =
                    self.ctx
                        .broker
                        .transfer_event(auth_token, transfer.clone(), self.ctx.auth_timeout);
                confirm_authentication(
                    &*self.ctx.output,
                    &self.ctx.broker,
                    &prompt,
                    AgentKind::ObjectPush,
                )
                .await
            }
            Err(_) => false,
        };
        if link.is_cancelled() {
            transfer.status = TransferStatus::Error;
            self.emit(EventAction::Updated, &transfer);
            self.emit(EventAction::Removed, &transfer);
            return Err(Error::Cancelled);
        }
        if !accepted {
            conn.respond(ObexOperation::Forbidden).await?;
            transfer.status = TransferStatus::Error;
            self.emit(EventAction::Updated, &transfer);
            self.emit(EventAction::Removed, &transfer);
            return Err(Error::ServerTransfer("Access denied".into()));
        }

        let temp_path = self
            .destination
            .join(format!(".haraltd-{:016x}.part", rand::random::<u64>()));
        let file = File::create(&temp_path).await?;
        transfer.status = TransferStatus::Active;
        Ok(Incoming {
            transfer,
            file: Some(file),
            temp_path: Some(temp_path),
        })
    }

    fn emit(&self, action: EventAction, transfer: &FileTransfer) {
        self.ctx
            .output
            .emit_event(EventMessage::file_transfer(action, transfer.clone()));
    }
}
