//! OBEX sessions.
//!
//! A [`SessionRegistry`] holds at most one session per Bluetooth address. It
//! is the only admission gate: the check-and-insert for an address happens
//! under one lock, so two concurrent starts for the same address cannot both
//! win.
//!
//! Sessions come in three roles. A *client* connects out to a remote
//! service. A *server* listens on the local adapter and is keyed by the
//! adapter address. Every inbound connection the server accepts becomes a
//! *sub-server* keyed by the remote address.
//!
//! A session tears itself down in a fixed order: stop watching the remote
//! device, release its token, close the socket, then leave the registry.

mod client;
mod server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tracing::debug;

use haraltd_types::BluetoothAddress;

use crate::error::{Error, Result};
use crate::token::OperationToken;

pub use client::ObexClient;
pub use server::ObexServerConnection;

/// The part a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Outbound connection to a remote service.
    Client,
    /// Listener on the local adapter.
    Server,
    /// One inbound connection accepted by a server.
    SubServer,
}

/// Common interface of every session role.
///
/// Implementations are cheap handles (usually an `Arc` inside) so the
/// registry can hand out clones.
#[async_trait]
pub trait ObexSession: Clone + Send + Sync + 'static {
    /// The session's role.
    fn role(&self) -> SessionRole;

    /// The key this session is registered under.
    fn address(&self) -> BluetoothAddress;

    /// The operation that owns the session.
    fn token(&self) -> &OperationToken;

    /// Connect or listen, then start background work.
    ///
    /// The session must call [`SessionHandle::dispose`] when its background
    /// work ends.
    async fn start(&self, handle: SessionHandle<Self>) -> Result<()>;

    /// End the session and wait for its background work to finish.
    async fn stop(&self);

    /// Abort the transfer in flight without ending the session.
    fn cancel_transfer(&self) -> Result<()>;
}

/// A session's way back into its registry.
pub struct SessionHandle<S> {
    registry: Weak<SessionRegistry<S>>,
    address: BluetoothAddress,
    token: OperationToken,
}

impl<S> Clone for SessionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Weak::clone(&self.registry),
            address: self.address,
            token: self.token.clone(),
        }
    }
}

impl<S: ObexSession> SessionHandle<S> {
    /// The address the session is registered under.
    pub fn address(&self) -> BluetoothAddress {
        self.address
    }

    /// The registry, unless it is gone.
    pub fn registry(&self) -> Option<Arc<SessionRegistry<S>>> {
        self.registry.upgrade()
    }

    /// Remove the session from the registry.
    ///
    /// Only removes the entry if it still belongs to this session, so a late
    /// dispose never evicts a newer session for the same address.
    pub fn dispose(&self) {
        if let Some(registry) = self.registry() {
            registry.remove(self.address, &self.token);
        }
    }
}

/// At-most-one-session-per-address table.
pub struct SessionRegistry<S> {
    profile: &'static str,
    sessions: Mutex<HashMap<BluetoothAddress, S>>,
}

impl<S: ObexSession> SessionRegistry<S> {
    /// Create an empty registry. `profile` names the sessions in errors.
    pub fn new(profile: &'static str) -> Arc<Self> {
        Arc::new(Self {
            profile,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BluetoothAddress, S>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `session` under `address` and start it.
    ///
    /// Fails without touching the existing session if `address` is taken;
    /// the rejected session's token is released. If the session fails to
    /// start it is removed again.
    pub async fn start(self: &Arc<Self>, address: BluetoothAddress, session: S) -> Result<()> {
        {
            let mut sessions = self.lock();
            if sessions.contains_key(&address) {
                drop(sessions);
                session.token().release();
                return Err(Error::SessionExists { address });
            }
            sessions.insert(address, session.clone());
        }

        let handle = SessionHandle {
            registry: Arc::downgrade(self),
            address,
            token: session.token().clone(),
        };
        if let Err(e) = session.start(handle.clone()).await {
            debug!(%address, profile = self.profile, "Session failed to start: {e}");
            session.token().release();
            handle.dispose();
            return Err(e);
        }
        debug!(%address, profile = self.profile, role = ?session.role(), "Session started");
        Ok(())
    }

    /// Look up the session at `address` on behalf of `token`'s client.
    ///
    /// Client and server sessions may only be driven by the client that
    /// started them.
    pub fn owned(&self, token: &OperationToken, address: BluetoothAddress) -> Result<S> {
        let session = self.get(address).ok_or_else(|| Error::no_session(self.profile))?;
        if session.role() != SessionRole::SubServer
            && session.token().client_id() != token.client_id()
        {
            return Err(Error::ControlledByAnotherClient);
        }
        Ok(session)
    }

    /// Stop the session at `address`.
    pub async fn stop(&self, token: &OperationToken, address: BluetoothAddress) -> Result<()> {
        let session = self.owned(token, address)?;
        session.stop().await;
        Ok(())
    }

    /// Abort the transfer running in the session at `address`.
    pub fn cancel_transfer(&self, token: &OperationToken, address: BluetoothAddress) -> Result<()> {
        self.owned(token, address)?.cancel_transfer()
    }

    /// The session at `address`.
    pub fn get(&self, address: BluetoothAddress) -> Option<S> {
        self.lock().get(&address).cloned()
    }

    /// The first session matching `predicate`.
    pub fn find(&self, mut predicate: impl FnMut(&S) -> bool) -> Option<S> {
        self.lock().values().find(|s| predicate(s)).cloned()
    }

    /// Every registered session.
    pub fn sessions(&self) -> Vec<S> {
        self.lock().values().cloned().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove(&self, address: BluetoothAddress, token: &OperationToken) {
        let mut sessions = self.lock();
        if sessions.get(&address).is_some_and(|s| s.token() == token) {
            sessions.remove(&address);
            debug!(%address, profile = self.profile, "Session removed");
        }
    }

    /// Stop every session.
    pub async fn stop_all(&self) {
        for session in self.sessions() {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use haraltd_types::ClientId;

    #[derive(Clone)]
    struct FakeSession {
        role: SessionRole,
        address: BluetoothAddress,
        token: OperationToken,
        fail_start: bool,
        handle: Arc<Mutex<Option<SessionHandle<FakeSession>>>>,
        stops: Arc<AtomicUsize>,
    }

    impl FakeSession {
        fn new(role: SessionRole, address: BluetoothAddress, client: Option<ClientId>) -> Self {
            Self {
                role,
                address,
                token: OperationToken::new(rand::random::<u32>().into(), 1, client),
                fail_start: false,
                handle: Arc::new(Mutex::new(None)),
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ObexSession for FakeSession {
        fn role(&self) -> SessionRole {
            self.role
        }

        fn address(&self) -> BluetoothAddress {
            self.address
        }

        fn token(&self) -> &OperationToken {
            &self.token
        }

        async fn start(&self, handle: SessionHandle<Self>) -> Result<()> {
            if self.fail_start {
                return Err(Error::AdapterNotFound);
            }
            *self.handle.lock().unwrap() = Some(handle);
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.token.release();
            if let Some(handle) = self.handle.lock().unwrap().take() {
                handle.dispose();
            }
        }

        fn cancel_transfer(&self) -> Result<()> {
            Ok(())
        }
    }

    const ADDR: BluetoothAddress = BluetoothAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    #[tokio::test]
    async fn test_duplicate_start_keeps_existing_session() {
        let registry = SessionRegistry::new("Object Push");
        let client = ClientId::new();
        let first = FakeSession::new(SessionRole::Client, ADDR, Some(client));
        registry.start(ADDR, first.clone()).await.unwrap();

        let second = FakeSession::new(SessionRole::Client, ADDR, Some(client));
        let err = registry.start(ADDR, second.clone()).await.unwrap_err();
        assert!(matches!(err, Error::SessionExists { address } if address == ADDR));
        assert!(second.token.is_released());
        assert!(!first.token.is_released());

        registry.stop(&first.token, ADDR).await.unwrap();
        assert_eq!(first.stops.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_removed() {
        let registry = SessionRegistry::new("Object Push");
        let mut session = FakeSession::new(SessionRole::Client, ADDR, None);
        session.fail_start = true;
        assert!(registry.start(ADDR, session.clone()).await.is_err());
        assert!(registry.get(ADDR).is_none());
        assert!(session.token.is_released());
    }

    #[tokio::test]
    async fn test_stop_refuses_other_client() {
        let registry = SessionRegistry::new("Object Push");
        let owner = ClientId::new();
        let session = FakeSession::new(SessionRole::Client, ADDR, Some(owner));
        registry.start(ADDR, session.clone()).await.unwrap();

        let intruder = OperationToken::new(99, 1, Some(ClientId::new()));
        assert!(matches!(
            registry.stop(&intruder, ADDR).await,
            Err(Error::ControlledByAnotherClient)
        ));
        assert_eq!(session.stops.load(Ordering::SeqCst), 0);
        assert!(registry.get(ADDR).is_some());
    }

    #[tokio::test]
    async fn test_sub_server_stoppable_by_any_client() {
        let registry = SessionRegistry::new("Object Push");
        let session = FakeSession::new(SessionRole::SubServer, ADDR, Some(ClientId::new()));
        registry.start(ADDR, session.clone()).await.unwrap();

        let other = OperationToken::new(99, 1, Some(ClientId::new()));
        registry.stop(&other, ADDR).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_missing_session() {
        let registry: Arc<SessionRegistry<FakeSession>> = SessionRegistry::new("Object Push");
        let err = registry
            .stop(&OperationToken::NONE, ADDR)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No session exists for Object Push");
    }

    #[tokio::test]
    async fn test_stale_dispose_leaves_newer_session() {
        let registry = SessionRegistry::new("Object Push");
        let first = FakeSession::new(SessionRole::Client, ADDR, None);
        registry.start(ADDR, first.clone()).await.unwrap();
        let stale = first.handle.lock().unwrap().clone().unwrap();
        first.stop().await;

        let second = FakeSession::new(SessionRole::Client, ADDR, None);
        registry.start(ADDR, second.clone()).await.unwrap();
        stale.dispose();
        assert_eq!(registry.get(ADDR).unwrap().token, second.token);
    }
}
