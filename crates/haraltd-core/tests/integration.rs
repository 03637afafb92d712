//! Integration tests for haraltd-core
//!
//! Object Push sessions run end to end against the in-memory `MockStack`:
//! outbound pushes go to a scripted `MockPeer`, inbound pushes are driven from
//! the far end of an injected connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use haraltd_core::auth::AuthPayload;
use haraltd_core::mock::InjectedConnection;
use haraltd_core::obex::{HeaderId, ObexHeader, ObexOpcode, ObexOperation, ObexPacket};
use haraltd_core::opp::{DEFAULT_AUTH_TIMEOUT, DEFAULT_PACKET_FLOOR, OppSession};
use haraltd_core::output::confirm_authentication;
use haraltd_core::session::ObexClient;
use haraltd_core::{
    AgentKind, AuthenticationBroker, BluetoothAddress, BluetoothStack, ClientId, Error, ErrorCode,
    MockPeer, MockPeerBuilder, MockStack, ObjectPush, OperationRegistry, OperationToken,
    OppContext, Output, RecordingOutput, Socket, uuids,
};
use haraltd_types::{
    AuthEventType, EventAction, EventBody, EventMessage, ReplyMethod, TransferStatus,
};

const ADAPTER: BluetoothAddress = BluetoothAddress::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
const PEER: BluetoothAddress = BluetoothAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
const OTHER_PEER: BluetoothAddress = BluetoothAddress::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

/// Upper bound for anything the tests wait on.
const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    registry: Arc<OperationRegistry>,
    broker: Arc<AuthenticationBroker>,
    output: Arc<RecordingOutput>,
    stack: Arc<MockStack>,
    opp: ObjectPush,
    client: ClientId,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(OperationRegistry::new());
        let broker = Arc::new(AuthenticationBroker::new());
        let output = Arc::new(RecordingOutput::new());
        let stack = Arc::new(MockStack::new(ADAPTER));
        let ctx = OppContext {
            registry: registry.clone(),
            broker: broker.clone(),
            output: output.clone() as Arc<dyn Output>,
            stack: stack.clone() as Arc<dyn BluetoothStack>,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            packet_floor: DEFAULT_PACKET_FLOOR,
        };
        let client = ClientId::new();
        output.connect(client);
        Self {
            registry,
            broker,
            output,
            stack,
            opp: ObjectPush::new(ctx, std::env::temp_dir()),
            client,
        }
    }

    fn token(&self) -> OperationToken {
        self.registry.generate_token(1, Some(self.client))
    }

    async fn wait_for_status(&self, status: TransferStatus) -> EventMessage {
        timeout(
            WAIT,
            self.output.wait_for_event(move |e| {
                matches!(&e.event, EventBody::FileTransferEvent(t) if t.status == status)
            }),
        )
        .await
        .expect("transfer status not reached")
    }

    async fn wait_for_error(&self, code: ErrorCode) -> EventMessage {
        timeout(
            WAIT,
            self.output.wait_for_event(move |e| {
                matches!(&e.event, EventBody::Error(err) if err.code == code.value())
            }),
        )
        .await
        .expect("error event not emitted")
    }

    async fn wait_until_gone(&self, address: BluetoothAddress) {
        timeout(WAIT, async {
            while self.opp.sessions().get(address).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session not disposed");
    }

    /// Answer the next transfer prompt sent to the agent.
    async fn answer_prompt(&self, response: &str) -> u64 {
        let prompt = timeout(WAIT, self.output.wait_for_client_event(self.client))
            .await
            .expect("no prompt");
        let EventBody::TransferAuthEvent(params) = prompt.event else {
            panic!("unexpected prompt {prompt:?}");
        };
        assert_eq!(params.auth.auth_event, AuthEventType::AuthorizeTransfer);
        assert!(self.broker.set_event_response(self.client, params.auth.auth_id, response));
        params.auth.auth_id
    }
}

fn write_file(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

/// Push one file over an injected connection as a remote device would.
/// Returns the server's reply to the final Put.
async fn push_file(conn: InjectedConnection, name: &str, data: &[u8]) -> ObexOperation {
    let mut client = ObexClient::handshake(Socket::new(PEER, conn.stream), None)
        .await
        .unwrap();
    let request = ObexPacket::new(ObexOpcode::final_of(ObexOperation::Put))
        .with_header(ObexHeader::from_unicode(HeaderId::NAME, name).unwrap())
        .with_header(ObexHeader::from_u32(HeaderId::LENGTH, data.len() as u32).unwrap())
        .with_header(ObexHeader::new(HeaderId::END_OF_BODY, data.to_vec()).unwrap());
    let reply = client.request(&request).await.unwrap();
    let _ = client.disconnect().await;
    reply.opcode.operation().unwrap()
}

// =============================================================================
// Outbound transfers
// =============================================================================

#[tokio::test]
async fn test_push_file_happy_path() {
    let h = Harness::new();
    let peer = MockPeerBuilder::new().max_packet_len(1024).build();
    h.stack.add_peer(PEER, peer.clone());
    let dir = tempfile::tempdir().unwrap();
    let (path, data) = write_file(dir.path(), "file.txt", 3000);

    let token = h.token();
    h.opp.start_session(&token, PEER).await.unwrap();
    let record = h.registry.get(token.operation_id()).unwrap();
    assert!(record.is_extended_task);
    assert!(record.cancel_on_disconnect);

    let queued = h.opp.queue_file(&token, PEER, &path).await.unwrap();
    assert_eq!(queued.status, TransferStatus::Queued);
    assert_eq!(queued.name, "file.txt");
    assert_eq!(queued.size, 3000);

    h.wait_for_status(TransferStatus::Complete).await;
    timeout(
        WAIT,
        h.output.wait_for_event(|e| e.event_action == EventAction::Removed),
    )
    .await
    .unwrap();

    // 768-byte chunks: three full ones and a short last one.
    let events = h.output.transfer_events();
    let statuses: Vec<(EventAction, TransferStatus)> =
        events.iter().map(|(a, t)| (*a, t.status)).collect();
    assert_eq!(
        statuses,
        [
            (EventAction::Added, TransferStatus::Queued),
            (EventAction::Updated, TransferStatus::Active),
            (EventAction::Updated, TransferStatus::Active),
            (EventAction::Updated, TransferStatus::Active),
            (EventAction::Updated, TransferStatus::Active),
            (EventAction::Updated, TransferStatus::Complete),
            (EventAction::Removed, TransferStatus::Complete),
        ]
    );
    assert_eq!(events.last().unwrap().1.transferred, 3000);
    assert_eq!(peer.put_count(), 4);
    assert_eq!(peer.received().len(), 1);
    assert_eq!(peer.received()[0].name, "file.txt");
    assert_eq!(peer.received()[0].mime_type.as_deref(), Some("text/plain"));
    assert_eq!(peer.received()[0].data, data);

    h.opp.stop_session(&token, PEER).await.unwrap();
    assert!(h.opp.sessions().is_empty());
    assert_eq!(peer.disconnect_count(), 1);
    assert!(token.is_released());
    assert!(h.registry.get(token.operation_id()).is_none());
}

#[tokio::test]
async fn test_queued_files_sent_in_order() {
    let h = Harness::new();
    let peer = MockPeer::new();
    h.stack.add_peer(PEER, peer.clone());
    let dir = tempfile::tempdir().unwrap();
    let (first, _) = write_file(dir.path(), "a.bin", 100);
    let (second, _) = write_file(dir.path(), "b.bin", 200);

    let token = h.token();
    h.opp.start_session(&token, PEER).await.unwrap();
    h.opp.queue_file(&token, PEER, &first).await.unwrap();
    h.opp.queue_file(&token, PEER, &second).await.unwrap();

    timeout(WAIT, async {
        while peer.received().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let names: Vec<String> = peer.received().into_iter().map(|f| f.name).collect();
    assert_eq!(names, ["a.bin", "b.bin"]);
    h.opp.stop_session(&token, PEER).await.unwrap();
}

#[tokio::test]
async fn test_queue_rejects_directory_and_missing_file() {
    let h = Harness::new();
    h.stack.add_peer(PEER, MockPeer::new());
    let dir = tempfile::tempdir().unwrap();

    let token = h.token();
    h.opp.start_session(&token, PEER).await.unwrap();
    assert!(matches!(
        h.opp.queue_file(&token, PEER, dir.path()).await,
        Err(Error::Io(_))
    ));
    assert!(matches!(
        h.opp.queue_file(&token, PEER, &dir.path().join("missing")).await,
        Err(Error::Io(_))
    ));
    h.opp.stop_session(&token, PEER).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_session_rejected() {
    let h = Harness::new();
    h.stack.add_peer(PEER, MockPeer::new());
    let first = h.token();
    h.opp.start_session(&first, PEER).await.unwrap();

    let err = h.opp.start_session(&h.token(), PEER).await.unwrap_err();
    assert_eq!(err.to_string(), "An Object Push Client session is in progress");

    let stranger = h.registry.generate_token(1, Some(ClientId::new()));
    let err = h.opp.start_session(&stranger, PEER).await.unwrap_err();
    assert!(matches!(err, Error::SessionExists { address } if address == PEER));
    assert!(stranger.is_released());
    assert!(matches!(
        h.opp.stop_session(&stranger, PEER).await,
        Err(Error::ControlledByAnotherClient)
    ));

    // The original session is untouched.
    assert!(!first.is_released());
    assert_eq!(h.stack.connect_count(), 1);
    h.opp.stop_session(&first, PEER).await.unwrap();
    assert!(h.opp.sessions().is_empty());
}

#[tokio::test]
async fn test_session_needs_client_id() {
    let h = Harness::new();
    h.stack.add_peer(PEER, MockPeer::new());
    let token = h.registry.generate_token(1, None);
    assert!(matches!(
        h.opp.start_session(&token, PEER).await,
        Err(Error::NoClientId)
    ));
}

#[tokio::test]
async fn test_rejected_connect_leaves_no_session() {
    let h = Harness::new();
    h.stack
        .add_peer(PEER, MockPeerBuilder::new().reject_connect().build());
    let token = h.token();
    let err = h.opp.start_session(&token, PEER).await.unwrap_err();
    assert!(matches!(err, Error::ConnectRejected { .. }));
    assert!(h.opp.sessions().is_empty());
    assert!(token.is_released());
}

#[tokio::test]
async fn test_unknown_device_not_found() {
    let h = Harness::new();
    let err = h.opp.start_session(&h.token(), OTHER_PEER).await.unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound(a) if a == OTHER_PEER));
    assert!(h.opp.sessions().is_empty());
}

#[tokio::test]
async fn test_cancel_transfer_keeps_session() {
    let h = Harness::new();
    let peer = MockPeerBuilder::new()
        .max_packet_len(512)
        .response_latency(Duration::from_millis(20))
        .build();
    h.stack.add_peer(PEER, peer.clone());
    let dir = tempfile::tempdir().unwrap();
    let (big, _) = write_file(dir.path(), "big.bin", 256 * 100);
    let (small, small_data) = write_file(dir.path(), "small.bin", 10);

    let token = h.token();
    h.opp.start_session(&token, PEER).await.unwrap();
    h.opp.queue_file(&token, PEER, &big).await.unwrap();
    h.wait_for_status(TransferStatus::Active).await;

    h.opp.cancel_transfer(&token, PEER).unwrap();
    h.wait_for_error(ErrorCode::OperationCancelled).await;
    h.wait_for_status(TransferStatus::Error).await;
    assert_eq!(peer.abort_count(), 1);
    assert!(peer.received().is_empty());

    peer.set_response_latency(Duration::ZERO);
    h.opp.queue_file(&token, PEER, &small).await.unwrap();
    h.wait_for_status(TransferStatus::Complete).await;
    assert_eq!(peer.received()[0].data, small_data);
    h.opp.stop_session(&token, PEER).await.unwrap();
}

#[tokio::test]
async fn test_client_release_ends_session() {
    let h = Harness::new();
    h.stack.add_peer(PEER, MockPeer::new());
    let token = h.token();
    h.opp.start_session(&token, PEER).await.unwrap();

    // As if the owning client disconnected.
    assert_eq!(h.registry.cancel_client_operations(h.client), 1);
    h.wait_until_gone(PEER).await;
}

// =============================================================================
// Inbound transfers
// =============================================================================

#[tokio::test]
async fn test_receive_file_accepted() {
    let h = Harness::new();
    h.broker
        .register_agent(AgentKind::ObjectPush, Some(h.client))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    let adapter = h
        .opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();
    assert_eq!(adapter, ADAPTER);
    assert!(h.stack.is_advertising(uuids::OBJECT_PUSH));

    let conn = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    let pusher = tokio::spawn(push_file(conn, "photo.jpg", b"jpeg bytes"));
    h.answer_prompt("yes").await;

    assert_eq!(
        timeout(WAIT, pusher).await.unwrap().unwrap(),
        ObexOperation::Success
    );
    h.wait_for_status(TransferStatus::Complete).await;
    assert_eq!(
        std::fs::read(dir.path().join("photo.jpg")).unwrap(),
        b"jpeg bytes"
    );
    h.wait_until_gone(PEER).await;

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());

    // The listener outlives the sub-session.
    assert!(matches!(h.opp.sessions().get(ADAPTER), Some(OppSession::Server(_))));
    h.opp.stop_server(&server_token).await.unwrap();
    assert!(h.opp.sessions().is_empty());
    assert!(!h.stack.is_advertising(uuids::OBJECT_PUSH));
}

#[tokio::test]
async fn test_receive_file_denied() {
    let h = Harness::new();
    h.broker
        .register_agent(AgentKind::ObjectPush, Some(h.client))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    h.opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    let conn = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    let pusher = tokio::spawn(push_file(conn, "virus.exe", b"nope"));
    h.answer_prompt("no").await;

    assert_eq!(
        timeout(WAIT, pusher).await.unwrap().unwrap(),
        ObexOperation::Forbidden
    );
    h.wait_for_error(ErrorCode::DeviceFileTransferServer).await;
    h.wait_until_gone(PEER).await;
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    h.opp.stop_server(&server_token).await.unwrap();
}

#[tokio::test]
async fn test_cancel_transfer_interrupts_pending_prompt() {
    let h = Harness::new();
    h.broker
        .register_agent(AgentKind::ObjectPush, Some(h.client))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    h.opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    let conn = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    let pusher = tokio::spawn(push_file(conn, "slow.txt", b"data"));
    timeout(WAIT, h.output.wait_for_client_event(h.client))
        .await
        .expect("no prompt");

    // Well inside the 10s prompt timeout.
    h.opp.cancel_transfer(&server_token, PEER).unwrap();
    let reply = timeout(Duration::from_secs(2), pusher)
        .await
        .expect("cancel waited for the prompt")
        .unwrap();
    assert_eq!(reply, ObexOperation::Abort);
    h.wait_until_gone(PEER).await;
    assert_eq!(h.broker.pending_events(h.client), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    h.opp.stop_server(&server_token).await.unwrap();
}

#[tokio::test]
async fn test_receive_without_agent_denied() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    h.opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    let conn = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    let reply = timeout(WAIT, push_file(conn, "x.txt", b"x")).await.unwrap();
    assert_eq!(reply, ObexOperation::Forbidden);
    h.opp.stop_server(&server_token).await.unwrap();
}

#[tokio::test]
async fn test_second_server_rejected() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let token = h.token();
    h.opp
        .start_server(&token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();
    let err = h.opp.start_server(&h.token(), None).await.unwrap_err();
    assert!(matches!(err, Error::InProgress { .. }));
    h.opp.stop_server(&token).await.unwrap();
    assert!(matches!(
        h.opp.stop_server(&token).await,
        Err(Error::NoSession { .. })
    ));
}

#[tokio::test]
async fn test_malformed_frame_ends_only_that_session() {
    let h = Harness::new();
    h.broker
        .register_agent(AgentKind::ObjectPush, Some(h.client))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    h.opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    // A well-behaved session from another device, parked after Connect.
    let healthy = h
        .stack
        .inject_connection(uuids::OBJECT_PUSH, OTHER_PEER)
        .unwrap();
    let healthy_client = ObexClient::handshake(Socket::new(OTHER_PEER, healthy.stream), None)
        .await
        .unwrap();

    let mut bad = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    ObexPacket::connect(None)
        .unwrap()
        .write_to(&mut bad.stream)
        .await
        .unwrap();
    let reply = ObexPacket::read_from(&mut bad.stream, true).await.unwrap();
    assert!(reply.opcode.is(ObexOperation::Success));
    // Put|final, 8 bytes, Name header claiming 0x20 bytes.
    let frame = [0x82, 0x00, 0x08, 0x01, 0x00, 0x20, 0x00, 0x00];
    bad.stream.write_all(&frame).await.unwrap();

    h.wait_for_error(ErrorCode::DeviceFileTransferServer).await;
    h.wait_until_gone(PEER).await;

    assert!(h.opp.sessions().get(OTHER_PEER).is_some());
    assert!(matches!(h.opp.sessions().get(ADAPTER), Some(OppSession::Server(_))));
    drop(healthy_client);
    h.opp.stop_server(&server_token).await.unwrap();
}

#[tokio::test]
async fn test_device_disconnect_ends_inbound_session() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let server_token = h.token();
    h.opp
        .start_server(&server_token, Some(dir.path().to_path_buf()))
        .await
        .unwrap();

    let mut conn = h.stack.inject_connection(uuids::OBJECT_PUSH, PEER).unwrap();
    timeout(WAIT, async {
        while h.opp.sessions().get(PEER).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    conn.state.send(false).unwrap();
    h.wait_until_gone(PEER).await;
    conn.stream.shutdown().await.ok();
    h.opp.stop_server(&server_token).await.unwrap();
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unanswered_prompt_denied_after_timeout() {
    let h = Harness::new();
    h.broker
        .register_agent(AgentKind::Pairing, Some(h.client))
        .unwrap();
    let event = h.broker.new_event(
        h.registry.generate_token(0, None),
        AuthEventType::ConfirmPasskey,
        ReplyMethod::ReplyYesNo,
        "",
        Duration::from_secs(1),
        AuthPayload::Pairing {
            address: PEER.to_string(),
            pincode: String::new(),
            passkey: 123456,
        },
    );

    let started = tokio::time::Instant::now();
    let accepted = confirm_authentication(&*h.output, &h.broker, &event, AgentKind::Pairing).await;
    assert!(!accepted);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.broker.pending_events(h.client), 0);
    assert!(h.registry.is_empty());
}
