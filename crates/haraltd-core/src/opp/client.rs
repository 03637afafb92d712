use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use haraltd_types::{BluetoothAddress, ErrorData, EventAction, EventMessage, FileTransfer, TransferStatus, uuids};

use super::{OppContext, OppSession, PROFILE};
use crate::error::{Error, Result};
use crate::obex::{HeaderId, ObexHeader, ObexOpcode, ObexOperation, ObexPacket};
use crate::session::{ObexClient, SessionHandle};
use crate::token::OperationToken;

/// Room left for headers in each packet.
const PACKET_HEADROOM: u16 = 256;
/// How long a best-effort Abort or Disconnect may take.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

struct ClientInner {
    token: OperationToken,
    address: BluetoothAddress,
    ctx: OppContext,
    queue: mpsc::UnboundedSender<FileTransfer>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<FileTransfer>>>,
    transfer_cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Outbound Object Push session: sends queued files one at a time.
#[derive(Clone)]
pub struct OppClient {
    inner: Arc<ClientInner>,
}

impl OppClient {
    pub fn new(token: OperationToken, address: BluetoothAddress, ctx: OppContext) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ClientInner {
                token,
                address,
                ctx,
                queue,
                pending: Mutex::new(Some(pending)),
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
        let cancel = inner.token.cancellation_token();
        let client = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            client = ObexClient::connect(&*inner.ctx.stack, inner.address, uuids::OBJECT_PUSH, None) => client?,
        };

        inner.ctx.registry.set_properties(&inner.token, true, true);
        *lock(&inner.transfer_cancel) = inner.token.linked();

        let pending = lock(&inner.pending)
            .take()
            .ok_or_else(|| Error::unexpected("Object Push client started twice"))?;
        let task = tokio::spawn(Arc::clone(inner).process(client, pending, handle));
        *lock(&inner.task) = Some(task);
        info!(address = %inner.address, "Object Push client session started");
        Ok(())
    }

    pub(super) async fn stop(&self) {
        self.inner.token.release();
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(address = %self.inner.address, "Object Push client task failed: {e}");
            }
        }
    }

    /// Abort the file being sent. Queued files still go out.
    pub fn cancel_transfer(&self) {
        let mut current = lock(&self.inner.transfer_cancel);
        current.cancel();
        *current = self.inner.token.linked();
    }

    /// Validate `path` and queue it for sending.
    pub async fn queue_file(&self, path: &Path) -> Result<FileTransfer> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            )
            .into());
        }
        let full_path = tokio::fs::canonicalize(path).await?;
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let transfer = FileTransfer {
            name,
            address: self.inner.address.to_string(),
            filename: full_path.to_string_lossy().into_owned(),
            size: metadata.len(),
            transferred: 0,
            status: TransferStatus::Queued,
        };
        self.inner
            .queue
            .send(transfer.clone())
            .map_err(|_| Error::no_session(PROFILE))?;
        debug!(address = %self.inner.address, file = %transfer.filename, "File queued");
        Ok(transfer)
    }
}

impl ClientInner {
    async fn process(
        self: Arc<Self>,
        mut client: ObexClient,
        mut pending: mpsc::UnboundedReceiver<FileTransfer>,
        handle: SessionHandle<OppSession>,
    ) {
        let cancel = self.token.cancellation_token();
        let mut graceful = true;
        loop {
            let transfer = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = pending.recv() => match next {
                    Some(transfer) => transfer,
                    None => break,
                },
            };

            let link = lock(&self.transfer_cancel).clone();
            match self.send_file(&mut client, transfer, &link).await {
                Ok(()) => {}
                Err(Error::Cancelled) if !cancel.is_cancelled() => {
                    self.ctx.output.emit_error(ErrorData::from(Error::Cancelled));
                }
                Err(Error::Cancelled) => {
                    graceful = false;
                    break;
                }
                Err(e) => {
                    warn!(address = %self.address, "Object Push transfer failed: {e}");
                    self.ctx.output.emit_error(ErrorData::from(&e));
                    graceful = false;
                    break;
                }
            }
        }

        if graceful {
            let _ = tokio::time::timeout(GOODBYE_TIMEOUT, client.disconnect()).await;
        }
        self.token.release();
        drop(client);
        handle.dispose();
        info!(address = %self.address, "Object Push client session ended");
    }

    async fn send_file(
        &self,
        client: &mut ObexClient,
        mut transfer: FileTransfer,
        link: &CancellationToken,
    ) -> Result<()> {
        self.emit(EventAction::Added, &transfer);
        transfer.status = TransferStatus::Active;

        let result = self.send_chunks(client, &mut transfer, link).await;

        transfer.status = if result.is_ok() {
            TransferStatus::Complete
        } else {
            TransferStatus::Error
        };
        self.emit(EventAction::Updated, &transfer);
        self.emit(EventAction::Removed, &transfer);
        result
    }

    async fn send_chunks(
        &self,
        client: &mut ObexClient,
        transfer: &mut FileTransfer,
        link: &CancellationToken,
    ) -> Result<()> {
        let mut file = File::open(&transfer.filename).await?;
        let length = u32::try_from(transfer.size)
            .map_err(|_| Error::Session(format!("{} is too large to push", transfer.name)))?;
        let mime = mime_guess::from_path(&transfer.filename).first_or_octet_stream();
        let floor = self.ctx.packet_floor;
        let chunk = usize::from(floor.max(client.max_packet_len().saturating_sub(PACKET_HEADROOM)));
        let mut buf = vec![0u8; chunk];
        let mut first = true;

        loop {
            if link.is_cancelled() {
                abort(client).await;
                return Err(Error::Cancelled);
            }

            let n = read_chunk(&mut file, &mut buf).await?;
            let is_last = n < chunk || transfer.transferred + n as u64 >= transfer.size;

            let mut request = ObexPacket::new(ObexOpcode::new(ObexOperation::Put, is_last)?);
            if first {
                if let Some(header) = client.connection_id_header()? {
                    request.set_header(header);
                }
                request.set_header(ObexHeader::from_unicode(HeaderId::NAME, &transfer.name)?);
                request.set_header(ObexHeader::from_ascii(HeaderId::TYPE, mime.essence_str())?);
                request.set_header(ObexHeader::from_u32(HeaderId::LENGTH, length)?);
            }
            let body_id = if is_last {
                HeaderId::END_OF_BODY
            } else {
                HeaderId::BODY
            };
            request.set_header(ObexHeader::new(body_id, Bytes::copy_from_slice(&buf[..n]))?);

            let response = {
                let in_flight = client.request(&request);
                tokio::pin!(in_flight);
                tokio::select! {
                    response = &mut in_flight => Some(response?),
                    _ = link.cancelled() => {
                        // The reply still has to be read to keep the stream in step.
                        match tokio::time::timeout(GOODBYE_TIMEOUT, in_flight).await {
                            Ok(_) => None,
                            Err(_) => return Err(Error::timeout("Object Push put", GOODBYE_TIMEOUT)),
                        }
                    }
                }
            };
            let Some(response) = response else {
                abort(client).await;
                return Err(Error::Cancelled);
            };
            match response.opcode.operation() {
                Some(ObexOperation::Continue) if !is_last => {}
                Some(ObexOperation::Success) => {}
                _ => return Err(Error::Session(format!("Operation code: {}", response.opcode))),
            }

            first = false;
            transfer.transferred += n as u64;
            self.emit(EventAction::Updated, transfer);
            if is_last {
                return Ok(());
            }
        }
    }

    fn emit(&self, action: EventAction, transfer: &FileTransfer) {
        self.ctx
            .output
            .emit_event(EventMessage::file_transfer(action, transfer.clone()));
    }
}

async fn abort(client: &mut ObexClient) {
    match tokio::time::timeout(GOODBYE_TIMEOUT, client.abort()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!("Abort failed: {e}"),
        Err(_) => debug!("Abort timed out"),
    }
}

/// Fill `buf` from `file`, stopping early only at end of file.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
