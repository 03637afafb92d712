//! Authentication broker.
//!
//! Pairing confirmations and inbound transfer authorizations need an answer
//! from a user. The broker routes each prompt to the client registered as the
//! agent for that kind of prompt (or to the client that started the
//! operation), keeps it pending until a reply arrives, and resolves it exactly
//! once.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use haraltd_types::{
    AuthEventType, AuthenticationParameters, ClientId, EventAction, EventBody, EventMessage,
    FileTransfer, PairingParameters, ParseError, ReplyMethod, TransferParameters,
};

use crate::error::{Error, Result};
use crate::token::OperationToken;

/// Which agent slot a prompt is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AgentKind {
    /// Route to the client that owns the operation.
    #[default]
    None,
    /// Pairing prompts.
    Pairing,
    /// Object Push transfer prompts.
    ObjectPush,
}

impl FromStr for AgentKind {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pairing" => Ok(Self::Pairing),
            "obex" | "opp" => Ok(Self::ObjectPush),
            _ => Err(ParseError::UnknownAgentKind(s.to_string())),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Pairing => write!(f, "pairing"),
            Self::ObjectPush => write!(f, "obex"),
        }
    }
}

/// Prompt-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPayload {
    /// A pairing request from a device.
    Pairing {
        address: String,
        pincode: String,
        passkey: u32,
    },
    /// An inbound file transfer.
    Transfer(FileTransfer),
}

/// One pending prompt.
pub struct AuthenticationEvent {
    auth_id: u64,
    auth_event: AuthEventType,
    reply_method: ReplyMethod,
    expected: String,
    timeout: Duration,
    token: OperationToken,
    payload: AuthPayload,
    result: OnceLock<bool>,
}

impl AuthenticationEvent {
    /// The prompt id clients reply with.
    pub fn auth_id(&self) -> u64 {
        self.auth_id
    }

    /// The reply policy.
    pub fn reply_method(&self) -> ReplyMethod {
        self.reply_method
    }

    /// The token the prompt is bound to.
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// How long the prompt stays open; zero means no limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The outcome, once resolved.
    pub fn result(&self) -> Option<bool> {
        self.result.get().copied()
    }

    fn accepts(&self, response: &str) -> bool {
        match self.reply_method {
            ReplyMethod::ReplyNone => true,
            ReplyMethod::ReplyYesNo => {
                let response = response.to_lowercase();
                response == "y" || response == "yes"
            }
            ReplyMethod::ReplyWithInput => response == self.expected,
        }
    }

    /// Resolve the prompt with `response` and release its token.
    ///
    /// Only the first call decides the outcome; later calls return it.
    pub fn resolve(&self, response: &str) -> bool {
        let accepted = *self.result.get_or_init(|| self.accepts(response));
        self.token.release();
        accepted
    }

    /// Resolve the prompt as denied.
    pub fn deny(&self) -> bool {
        self.resolve("")
    }

    /// Wait for the prompt to be answered, timed out or cancelled.
    ///
    /// Informational prompts (`ReplyNone`) do not wait. A prompt that ends
    /// without an answer is denied.
    pub async fn wait_for_response(&self) -> bool {
        if !self.timeout.is_zero() && !self.token.release_after(self.timeout) {
            return self.result().unwrap_or(false);
        }
        if self.reply_method != ReplyMethod::ReplyNone {
            self.token.wait().await;
        }
        match self.result() {
            Some(accepted) => accepted,
            None => self.deny(),
        }
    }

    /// The event announcing this prompt to a client.
    pub fn to_event(&self) -> EventMessage {
        let auth = AuthenticationParameters {
            auth_id: self.auth_id,
            auth_event: self.auth_event,
            auth_reply_method: self.reply_method,
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let body = match &self.payload {
            AuthPayload::Pairing {
                address,
                pincode,
                passkey,
            } => EventBody::PairingAuthEvent(PairingParameters {
                auth,
                address: address.clone(),
                pincode: pincode.clone(),
                passkey: *passkey,
            }),
            AuthPayload::Transfer(transfer) => EventBody::TransferAuthEvent(TransferParameters {
                auth,
                file_transfer: transfer.clone(),
            }),
        };
        EventMessage::new(EventAction::Added, body)
    }
}

impl fmt::Debug for AuthenticationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationEvent")
            .field("auth_id", &self.auth_id)
            .field("auth_event", &self.auth_event)
            .field("reply_method", &self.reply_method)
            .field("timeout", &self.timeout)
            .field("operation_id", &self.token.operation_id())
            .field("result", &self.result())
            .finish()
    }
}

type EventTable = HashMap<ClientId, HashMap<u64, Arc<AuthenticationEvent>>>;

/// Routes prompts to agents and correlates their replies.
pub struct AuthenticationBroker {
    pairing_agent: Mutex<Option<ClientId>>,
    object_push_agent: Mutex<Option<ClientId>>,
    events: RwLock<EventTable>,
    next_auth_id: AtomicU64,
}

impl Default for AuthenticationBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthenticationBroker {
    /// Create a broker with no agents.
    pub fn new() -> Self {
        Self {
            pairing_agent: Mutex::new(None),
            object_push_agent: Mutex::new(None),
            events: RwLock::new(HashMap::new()),
            next_auth_id: AtomicU64::new(1),
        }
    }

    fn slot(&self, kind: AgentKind) -> Option<&Mutex<Option<ClientId>>> {
        match kind {
            AgentKind::None => None,
            AgentKind::Pairing => Some(&self.pairing_agent),
            AgentKind::ObjectPush => Some(&self.object_push_agent),
        }
    }

    /// Build a prompt with a fresh auth id.
    pub fn new_event(
        &self,
        token: OperationToken,
        auth_event: AuthEventType,
        reply_method: ReplyMethod,
        expected: impl Into<String>,
        timeout: Duration,
        payload: AuthPayload,
    ) -> Arc<AuthenticationEvent> {
        Arc::new(AuthenticationEvent {
            auth_id: self.next_auth_id.fetch_add(1, Ordering::Relaxed),
            auth_event,
            reply_method,
            expected: expected.into(),
            timeout,
            token,
            payload,
            result: OnceLock::new(),
        })
    }

    /// A yes/no prompt authorizing an inbound transfer.
    pub fn transfer_event(
        &self,
        token: OperationToken,
        transfer: FileTransfer,
        timeout: Duration,
    ) -> Arc<AuthenticationEvent> {
        self.new_event(
            token,
            AuthEventType::AuthorizeTransfer,
            ReplyMethod::ReplyYesNo,
            "",
            timeout,
            AuthPayload::Transfer(transfer),
        )
    }

    /// Claim the agent slot for `kind`.
    pub fn register_agent(&self, kind: AgentKind, client_id: Option<ClientId>) -> Result<()> {
        let client_id = client_id.ok_or(Error::NoClientId)?;
        let slot = self.slot(kind).ok_or(Error::NoAgentSpecified)?;
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::AgentAlreadyRegistered);
        }
        *slot = Some(client_id);
        info!(%client_id, agent = %kind, "Authentication agent registered");
        Ok(())
    }

    /// Free the agent slot for `kind` if `client_id` holds it.
    pub fn unregister_agent(&self, kind: AgentKind, client_id: Option<ClientId>) -> Result<()> {
        let client_id = client_id.ok_or(Error::NoClientId)?;
        let slot = self.slot(kind).ok_or(Error::NoAgentSpecified)?;
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *slot == Some(client_id) {
            *slot = None;
            info!(%client_id, agent = %kind, "Authentication agent unregistered");
        }
        Ok(())
    }

    /// The client holding the slot for `kind`.
    pub fn agent(&self, kind: AgentKind) -> Option<ClientId> {
        self.slot(kind)
            .and_then(|s| *s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns `true` if `client_id` holds the slot for `kind`.
    pub fn is_agent(&self, client_id: ClientId, kind: AgentKind) -> bool {
        self.agent(kind) == Some(client_id)
    }

    /// Store a prompt for the client that should answer it.
    ///
    /// The answering client is the agent for `kind`, or the token's own
    /// client for [`AgentKind::None`]. The token is rebound to that client. If
    /// no client can be found the prompt is denied and `false` returned.
    pub fn add_event(&self, event: &Arc<AuthenticationEvent>, kind: AgentKind) -> bool {
        let client_id = match kind {
            AgentKind::None => event.token.client_id(),
            kind => self.agent(kind),
        };
        let Some(client_id) = client_id else {
            debug!(auth_id = event.auth_id, agent = %kind, "No client to answer prompt");
            event.deny();
            return false;
        };

        event.token.set_client_id(Some(client_id));
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let pending = events.entry(client_id).or_default();
        if pending.contains_key(&event.auth_id) {
            return false;
        }
        pending.insert(event.auth_id, Arc::clone(event));
        debug!(auth_id = event.auth_id, %client_id, "Prompt pending");
        true
    }

    /// Answer a pending prompt. Returns `false` if none matched.
    pub fn set_event_response(&self, client_id: ClientId, auth_id: u64, response: &str) -> bool {
        let Some(event) = self.take_event(client_id, auth_id) else {
            return false;
        };
        let accepted = event.resolve(response);
        debug!(auth_id, %client_id, accepted, "Prompt answered");
        true
    }

    /// Forget a prompt after it finished waiting.
    pub fn remove_event(&self, event: &AuthenticationEvent) {
        if let Some(client_id) = event.token.client_id() {
            self.take_event(client_id, event.auth_id);
        }
    }

    fn take_event(&self, client_id: ClientId, auth_id: u64) -> Option<Arc<AuthenticationEvent>> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let pending = events.get_mut(&client_id)?;
        let event = pending.remove(&auth_id);
        if pending.is_empty() {
            events.remove(&client_id);
        }
        event
    }

    /// Number of prompts pending for `client_id`.
    pub fn pending_events(&self, client_id: ClientId) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_id)
            .map_or(0, HashMap::len)
    }

    /// Drop every agent slot and deny every prompt held by a disconnected
    /// client.
    pub fn remove_agents_and_events(&self, client_id: ClientId) {
        for kind in [AgentKind::Pairing, AgentKind::ObjectPush] {
            if let Err(e) = self.unregister_agent(kind, Some(client_id)) {
                warn!("Failed to unregister {kind} agent: {e}");
            }
        }

        let pending = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id);
        for event in pending.into_iter().flat_map(HashMap::into_values) {
            event.deny();
        }
    }
}
