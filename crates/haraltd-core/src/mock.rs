//! In-memory Bluetooth stack and output for testing.
//!
//! [`MockStack`] stands in for a platform backend: outbound connections reach
//! scripted [`MockPeer`] Object Push sinks over in-process pipes, and inbound
//! connections are injected with [`MockStack::inject_connection`].
//! [`RecordingOutput`] keeps every result and event it is given so tests can
//! assert on them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{Notify, mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use haraltd_types::{
    BluetoothAddress, ClientId, EventAction, EventBody, EventMessage, FileTransfer, ResultMessage,
};

use crate::error::{Error, Result};
use crate::obex::{ConnectFields, HeaderId, ObexHeader, ObexOpcode, ObexOperation, ObexPacket};
use crate::output::{Output, result_message};
use crate::registry::CommandOutcome;
use crate::token::OperationToken;
use crate::transport::{BluetoothStack, ListenerOptions, Socket, SocketListener, SocketOptions};

/// Buffer size of the in-process pipes.
const PIPE_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A file a [`MockPeer`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    /// Value of the `Type` header, if the sender gave one.
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct PeerState {
    reject_connect: bool,
    max_packet_len: u16,
    response_latency_ms: AtomicU64,
    received: Mutex<Vec<ReceivedFile>>,
    aborts: AtomicU32,
    disconnects: AtomicU32,
    puts: AtomicU32,
}

/// A scripted remote device running an Object Push service.
///
/// Cloning shares the recorded state, so a test keeps one handle while the
/// stack serves connections with another.
#[derive(Debug, Clone)]
pub struct MockPeer {
    state: Arc<PeerState>,
}

impl Default for MockPeer {
    fn default() -> Self {
        MockPeerBuilder::new().build()
    }
}

impl MockPeer {
    /// A peer that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Files received so far, in completion order.
    pub fn received(&self) -> Vec<ReceivedFile> {
        lock(&self.state.received).clone()
    }

    /// Number of Abort requests seen.
    pub fn abort_count(&self) -> u32 {
        self.state.aborts.load(Ordering::Relaxed)
    }

    /// Number of Disconnect requests seen.
    pub fn disconnect_count(&self) -> u32 {
        self.state.disconnects.load(Ordering::Relaxed)
    }

    /// Number of Put packets seen.
    pub fn put_count(&self) -> u32 {
        self.state.puts.load(Ordering::Relaxed)
    }

    /// Delay every response by `latency`. `Duration::ZERO` disables it.
    pub fn set_response_latency(&self, latency: Duration) {
        self.state
            .response_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    async fn serve(self, mut stream: DuplexStream) {
        let state = &self.state;
        let mut name = None;
        let mut mime_type = None;
        let mut data = Vec::new();

        loop {
            let request = match ObexPacket::read_request(&mut stream).await {
                Ok(request) => request,
                Err(e) => {
                    debug!("Mock peer stream closed: {e}");
                    return;
                }
            };

            let latency = state.response_latency_ms.load(Ordering::Relaxed);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }

            let (reply, done) = match request.opcode.operation() {
                Some(ObexOperation::Connect) => (self.connect_reply(), state.reject_connect),
                Some(ObexOperation::Put) => {
                    state.puts.fetch_add(1, Ordering::Relaxed);
                    if let Some(header) = request.header(HeaderId::NAME) {
                        name = header.as_unicode().ok();
                    }
                    if let Some(header) = request.header(HeaderId::TYPE) {
                        mime_type = header.as_ascii().ok();
                    }
                    if let Some(body) = request.body() {
                        data.extend_from_slice(body);
                    }
                    if request.opcode.is_final() {
                        lock(&state.received).push(ReceivedFile {
                            name: name.take().unwrap_or_default(),
                            mime_type: mime_type.take(),
                            data: std::mem::take(&mut data),
                        });
                        (reply(ObexOperation::Success), false)
                    } else {
                        (reply(ObexOperation::Continue), false)
                    }
                }
                Some(ObexOperation::Abort) => {
                    state.aborts.fetch_add(1, Ordering::Relaxed);
                    name = None;
                    mime_type = None;
                    data.clear();
                    (reply(ObexOperation::Success), false)
                }
                Some(ObexOperation::Disconnect) => {
                    state.disconnects.fetch_add(1, Ordering::Relaxed);
                    (reply(ObexOperation::Success), true)
                }
                _ => (reply(ObexOperation::BadRequest), false),
            };

            if reply.write_to(&mut stream).await.is_err() || done {
                return;
            }
        }
    }

    fn connect_reply(&self) -> ObexPacket {
        let op = if self.state.reject_connect {
            ObexOperation::Forbidden
        } else {
            ObexOperation::Success
        };
        let mut packet = reply(op);
        packet.connect = Some(ConnectFields {
            max_packet_len: self.state.max_packet_len,
            ..Default::default()
        });
        if !self.state.reject_connect {
            if let Ok(header) = ObexHeader::from_u32(HeaderId::CONNECTION_ID, 1) {
                packet.set_header(header);
            }
        }
        packet
    }
}

fn reply(op: ObexOperation) -> ObexPacket {
    ObexPacket::new(ObexOpcode::final_of(op))
}

/// Builder for [`MockPeer`]s with custom behaviour.
#[derive(Debug)]
pub struct MockPeerBuilder {
    reject_connect: bool,
    max_packet_len: u16,
    response_latency: Duration,
}

impl Default for MockPeerBuilder {
    fn default() -> Self {
        Self {
            reject_connect: false,
            max_packet_len: 1024,
            response_latency: Duration::ZERO,
        }
    }
}

impl MockPeerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the OBEX Connect with `Forbidden`.
    #[must_use]
    pub fn reject_connect(mut self) -> Self {
        self.reject_connect = true;
        self
    }

    /// Set the maximum packet length announced on Connect.
    #[must_use]
    pub fn max_packet_len(mut self, len: u16) -> Self {
        self.max_packet_len = len;
        self
    }

    /// Delay every response.
    #[must_use]
    pub fn response_latency(mut self, latency: Duration) -> Self {
        self.response_latency = latency;
        self
    }

    /// Build the peer.
    #[must_use]
    pub fn build(self) -> MockPeer {
        MockPeer {
            state: Arc::new(PeerState {
                reject_connect: self.reject_connect,
                max_packet_len: self.max_packet_len,
                response_latency_ms: AtomicU64::new(self.response_latency.as_millis() as u64),
                received: Mutex::new(Vec::new()),
                aborts: AtomicU32::new(0),
                disconnects: AtomicU32::new(0),
                puts: AtomicU32::new(0),
            }),
        }
    }
}

/// The far end of an injected inbound connection.
#[derive(Debug)]
pub struct InjectedConnection {
    /// Stream the test drives as the remote device.
    pub stream: DuplexStream,
    /// Connection-state notice seen by the daemon. Send `false` to simulate
    /// the device going away.
    pub state: watch::Sender<bool>,
}

/// In-memory Bluetooth backend.
#[derive(Debug)]
pub struct MockStack {
    adapter: BluetoothAddress,
    peers: Mutex<HashMap<BluetoothAddress, MockPeer>>,
    listeners: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Socket>>>,
    advertising: Arc<Mutex<HashSet<Uuid>>>,
    should_fail: AtomicBool,
    connect_latency_ms: AtomicU64,
    connect_count: AtomicU32,
}

impl MockStack {
    /// Create a stack whose adapter has `adapter` as address.
    pub fn new(adapter: BluetoothAddress) -> Self {
        Self {
            adapter,
            peers: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            advertising: Arc::new(Mutex::new(HashSet::new())),
            should_fail: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            connect_count: AtomicU32::new(0),
        }
    }

    /// Make `peer` reachable at `address`.
    pub fn add_peer(&self, address: BluetoothAddress, peer: MockPeer) {
        lock(&self.peers).insert(address, peer);
    }

    /// Make every call fail until reset.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Delay outbound connects by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Number of outbound connects attempted.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Returns `true` if a listener for `service_uuid` is advertising.
    pub fn is_advertising(&self, service_uuid: Uuid) -> bool {
        lock(&self.advertising).contains(&service_uuid)
    }

    /// Simulate `address` connecting to the local `service_uuid` listener.
    pub fn inject_connection(
        &self,
        service_uuid: Uuid,
        address: BluetoothAddress,
    ) -> Result<InjectedConnection> {
        let listeners = lock(&self.listeners);
        let sender = listeners
            .get(&service_uuid)
            .ok_or_else(|| Error::unexpected(format!("Nothing listens on {service_uuid}")))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let (state, state_rx) = watch::channel(true);
        sender
            .send(Socket::new(address, near).with_connection_state(state_rx))
            .map_err(|_| Error::unexpected(format!("Listener for {service_uuid} is closed")))?;
        Ok(InjectedConnection { stream: far, state })
    }
}

#[async_trait]
impl BluetoothStack for MockStack {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, options: &SocketOptions) -> Result<Socket> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::DeviceNotFound(options.address));
        }

        let peer = lock(&self.peers)
            .get(&options.address)
            .cloned()
            .ok_or(Error::DeviceNotFound(options.address))?;
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(peer.serve(far));
        Ok(Socket::new(options.address, near))
    }

    async fn listen(&self, options: &ListenerOptions) -> Result<Box<dyn SocketListener>> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::AdapterNotFound);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners).insert(options.service_uuid, tx);
        Ok(Box::new(MockListener {
            service_uuid: options.service_uuid,
            incoming: rx,
            advertising: Arc::clone(&self.advertising),
        }))
    }

    async fn adapter_address(&self) -> Result<BluetoothAddress> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::AdapterNotFound);
        }
        Ok(self.adapter)
    }
}

/// Listener handed out by [`MockStack::listen`].
#[derive(Debug)]
pub struct MockListener {
    service_uuid: Uuid,
    incoming: mpsc::UnboundedReceiver<Socket>,
    advertising: Arc<Mutex<HashSet<Uuid>>>,
}

#[async_trait]
impl SocketListener for MockListener {
    async fn start_advertising(&mut self) -> Result<()> {
        lock(&self.advertising).insert(self.service_uuid);
        Ok(())
    }

    async fn accept(&mut self) -> Result<Socket> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| Error::unexpected("Mock listener closed"))
    }
}

impl Drop for MockListener {
    fn drop(&mut self) {
        lock(&self.advertising).remove(&self.service_uuid);
    }
}

#[derive(Debug, Default)]
struct Recorded {
    connected: HashSet<ClientId>,
    results: Vec<ResultMessage>,
    events: Vec<EventMessage>,
    client_events: HashMap<ClientId, VecDeque<EventMessage>>,
}

/// [`Output`] that records everything.
///
/// Results and client events only reach clients registered with
/// [`connect`](Self::connect); broadcast events are always recorded.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    recorded: Mutex<Recorded>,
    changed: Notify,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `client` as connected.
    pub fn connect(&self, client: ClientId) {
        lock(&self.recorded).connected.insert(client);
    }

    /// Mark `client` as gone.
    pub fn disconnect(&self, client: ClientId) {
        let mut recorded = lock(&self.recorded);
        recorded.connected.remove(&client);
        recorded.client_events.remove(&client);
    }

    /// Results emitted so far.
    pub fn results(&self) -> Vec<ResultMessage> {
        lock(&self.recorded).results.clone()
    }

    /// Broadcast events emitted so far.
    pub fn events(&self) -> Vec<EventMessage> {
        lock(&self.recorded).events.clone()
    }

    /// Broadcast file transfer events, in order.
    pub fn transfer_events(&self) -> Vec<(EventAction, FileTransfer)> {
        lock(&self.recorded)
            .events
            .iter()
            .filter_map(|e| match &e.event {
                EventBody::FileTransferEvent(t) => Some((e.event_action, t.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait for the next event addressed to `client` and take it.
    pub async fn wait_for_client_event(&self, client: ClientId) -> EventMessage {
        self.wait_until(|r| {
            r.client_events
                .get_mut(&client)
                .and_then(VecDeque::pop_front)
        })
        .await
    }

    /// Wait until a broadcast event matching `pred` has been recorded and
    /// return the first such event.
    pub async fn wait_for_event(&self, pred: impl Fn(&EventMessage) -> bool) -> EventMessage {
        self.wait_until(|r| r.events.iter().find(|e| pred(e)).cloned())
            .await
    }

    /// Wait until a result matching `pred` has been recorded.
    pub async fn wait_for_result(&self, pred: impl Fn(&ResultMessage) -> bool) -> ResultMessage {
        self.wait_until(|r| r.results.iter().find(|m| pred(m)).cloned())
            .await
    }

    async fn wait_until<T>(&self, mut check: impl FnMut(&mut Recorded) -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = check(&mut lock(&self.recorded)) {
                return found;
            }
            notified.await;
        }
    }
}

impl Output for RecordingOutput {
    fn emit_result(&self, token: &OperationToken, outcome: CommandOutcome) -> bool {
        {
            let mut recorded = lock(&self.recorded);
            if let Some(client) = token.client_id() {
                if !recorded.connected.contains(&client) {
                    return false;
                }
            }
            recorded.results.push(result_message(token, outcome));
        }
        self.changed.notify_waiters();
        true
    }

    fn emit_event(&self, event: EventMessage) {
        lock(&self.recorded).events.push(event);
        self.changed.notify_waiters();
    }

    fn emit_client_event(&self, token: &OperationToken, event: EventMessage) -> bool {
        let Some(client) = token.client_id() else {
            return false;
        };
        {
            let mut recorded = lock(&self.recorded);
            if !recorded.connected.contains(&client) {
                return false;
            }
            recorded
                .client_events
                .entry(client)
                .or_default()
                .push_back(event);
        }
        self.changed.notify_waiters();
        true
    }
}
