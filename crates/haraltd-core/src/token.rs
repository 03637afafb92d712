//! Operation tokens.
//!
//! An [`OperationToken`] identifies one logical operation (a client command or
//! a background task) and carries its cancellation signal. Tokens are cheap to
//! clone; all clones share the same state. Equality and hashing use only the
//! operation id.
//!
//! Releasing a token is idempotent. The first release runs the registry hook
//! (which removes the operation's record), then cancels every linked signal
//! and finally the token's own signal.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use haraltd_types::ClientId;

use crate::error::{Error, Result};

type ReleaseHook = Box<dyn FnOnce(u64) + Send>;

struct TokenInner {
    operation_id: u64,
    request_id: i64,
    client_id: RwLock<Option<ClientId>>,
    cancel: CancellationToken,
    linked: Mutex<Vec<CancellationToken>>,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseHook>>,
}

/// Handle to one tracked operation.
#[derive(Clone)]
pub struct OperationToken {
    inner: Option<Arc<TokenInner>>,
}

impl OperationToken {
    /// The "no operation" token, used for broadcasts and untracked work.
    ///
    /// It has id 0, no client and can never be released or waited on.
    pub const NONE: OperationToken = OperationToken { inner: None };

    /// Create a token with a fresh cancellation signal.
    pub fn new(operation_id: u64, request_id: i64, client_id: Option<ClientId>) -> Self {
        Self::build(operation_id, request_id, client_id, CancellationToken::new())
    }

    /// Create a token whose signal is also cancelled when `parent` is.
    ///
    /// Fails if `parent` is already cancelled; the resulting token would be
    /// dead on arrival.
    pub fn with_parent(
        operation_id: u64,
        request_id: i64,
        client_id: Option<ClientId>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        if parent.is_cancelled() {
            return Err(Error::unexpected(format!(
                "cannot derive operation {operation_id} from a cancelled signal"
            )));
        }
        Ok(Self::build(
            operation_id,
            request_id,
            client_id,
            parent.child_token(),
        ))
    }

    fn build(
        operation_id: u64,
        request_id: i64,
        client_id: Option<ClientId>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Some(Arc::new(TokenInner {
                operation_id,
                request_id,
                client_id: RwLock::new(client_id),
                cancel,
                linked: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
                on_release: Mutex::new(None),
            })),
        }
    }

    /// Returns `true` for [`OperationToken::NONE`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.inner.is_none()
    }

    /// The daemon-assigned operation id.
    #[must_use]
    pub fn operation_id(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.operation_id)
    }

    /// The client-chosen request id.
    #[must_use]
    pub fn request_id(&self) -> i64 {
        self.inner.as_ref().map_or(0, |i| i.request_id)
    }

    /// The socket client that owns this operation, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        let inner = self.inner.as_ref()?;
        *inner
            .client_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebind the token to another client.
    pub fn set_client_id(&self, client_id: Option<ClientId>) {
        if let Some(inner) = &self.inner {
            *inner
                .client_id
                .write()
                .unwrap_or_else(PoisonError::into_inner) = client_id;
        }
    }

    /// Returns `true` once [`release`](Self::release) has run.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|i| i.released.load(Ordering::Acquire))
    }

    /// Returns `true` if the signal fired, by release or through a parent.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.as_ref().is_none_or(|i| i.cancel.is_cancelled())
    }

    /// A clone of the token's own signal.
    ///
    /// For [`OperationToken::NONE`] this is a fresh signal that nothing
    /// cancels.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner
            .as_ref()
            .map_or_else(CancellationToken::new, |i| i.cancel.clone())
    }

    /// Derive a signal that fires when this token is released.
    ///
    /// Cancelling the derived signal does not affect the token.
    #[must_use]
    pub fn linked(&self) -> CancellationToken {
        let Some(inner) = &self.inner else {
            return CancellationToken::new();
        };
        let child = inner.cancel.child_token();
        let mut linked = inner.linked.lock().unwrap_or_else(PoisonError::into_inner);
        linked.retain(|t| !t.is_cancelled());
        linked.push(child.clone());
        child
    }

    pub(crate) fn set_release_hook(&self, hook: ReleaseHook) {
        if let Some(inner) = &self.inner {
            *inner
                .on_release
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(hook);
        }
    }

    /// Release the operation. Subsequent calls are no-ops.
    pub fn release(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let hook = inner
            .on_release
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(inner.operation_id);
        }

        let linked =
            std::mem::take(&mut *inner.linked.lock().unwrap_or_else(PoisonError::into_inner));
        for token in linked {
            token.cancel();
        }
        inner.cancel.cancel();
        debug!(operation_id = inner.operation_id, "Operation released");
    }

    /// Release the operation after `timeout` unless it is released first.
    ///
    /// Returns `false` if the token is already released or no runtime is
    /// available to arm the timer.
    pub fn release_after(&self, timeout: Duration) -> bool {
        if self.is_released() {
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime available to arm release timer");
            return false;
        };

        let token = self.clone();
        let cancel = self.cancellation_token();
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    debug!(operation_id = token.operation_id(), ?timeout, "Operation timed out");
                    token.release();
                }
            }
        });
        true
    }

    /// Wait until the operation is cancelled.
    ///
    /// Returns `false` immediately if the token was already cancelled (or is
    /// [`OperationToken::NONE`]), `true` after waiting otherwise.
    pub async fn wait(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        if inner.released.load(Ordering::Acquire) || inner.cancel.is_cancelled() {
            return false;
        }
        inner.cancel.cancelled().await;
        true
    }

    /// Wrap the token in a guard that releases it on drop.
    #[must_use]
    pub fn release_on_drop(self) -> ReleaseGuard {
        ReleaseGuard {
            token: self,
            armed: true,
        }
    }
}

impl Default for OperationToken {
    fn default() -> Self {
        Self::NONE
    }
}

impl PartialEq for OperationToken {
    fn eq(&self, other: &Self) -> bool {
        self.operation_id() == other.operation_id()
    }
}

impl Eq for OperationToken {}

impl Hash for OperationToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.operation_id().hash(state);
    }
}

impl fmt::Debug for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationToken")
            .field("operation_id", &self.operation_id())
            .field("request_id", &self.request_id())
            .field("client_id", &self.client_id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Releases the wrapped token when dropped.
///
/// Call [`disarm`](ReleaseGuard::disarm) to keep the operation alive.
#[must_use = "dropping the guard releases the token immediately"]
pub struct ReleaseGuard {
    token: OperationToken,
    armed: bool,
}

impl ReleaseGuard {
    /// The guarded token.
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// Give the token back without releasing it.
    pub fn disarm(mut self) -> OperationToken {
        self.armed = false;
        self.token.clone()
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.token.release();
        }
    }
}
