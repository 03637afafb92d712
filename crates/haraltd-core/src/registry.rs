//! Registry of in-flight operations.
//!
//! Every command a client sends becomes an [`OperationRecord`] keyed by its
//! operation id. Records are removed exactly once, by the release hook the
//! registry installs on each token. Operation ids come from a single counter
//! that starts at 1; a `u64` is never exhausted within a process lifetime, so
//! wraparound is not handled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use haraltd_types::{ClientId, ErrorData, ResultData};

use crate::error::Result;
use crate::token::OperationToken;

/// Default time [`OperationRegistry::cancel_all`] waits for release
/// callbacks to settle.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_millis(100);

/// Outcome of one command: optional result data, or the error to report.
pub type CommandOutcome = std::result::Result<Option<ResultData>, ErrorData>;

/// Parses and runs client commands.
///
/// Implemented outside the core; the registry only decides when a handler
/// runs and when its token is released.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run `command` on behalf of `token`.
    async fn handle(&self, token: &OperationToken, command: &[String]) -> CommandOutcome;
}

/// Bookkeeping for one live operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    /// The operation's token.
    pub token: OperationToken,
    /// Shutdown waits for extended tasks, and the handler does not release
    /// them on return.
    pub is_extended_task: bool,
    /// Release the operation when its client disconnects.
    pub cancel_on_disconnect: bool,
}

type Records = RwLock<HashMap<u64, OperationRecord>>;

/// Tracks every live operation.
pub struct OperationRegistry {
    records: Arc<Records>,
    next_id: AtomicU64,
    cancel_grace: Duration,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_cancel_grace(DEFAULT_CANCEL_GRACE)
    }

    /// Create an empty registry with a custom [`cancel_all`](Self::cancel_all)
    /// grace period.
    pub fn with_cancel_grace(cancel_grace: Duration) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            cancel_grace,
        }
    }

    fn next_operation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Mint and store a token for a new operation.
    pub fn generate_token(&self, request_id: i64, client_id: Option<ClientId>) -> OperationToken {
        let token = OperationToken::new(self.next_operation_id(), request_id, client_id);
        self.admit(&token);
        token
    }

    /// Mint and store a token whose signal also follows `parent`.
    pub fn generate_linked_token(
        &self,
        request_id: i64,
        client_id: Option<ClientId>,
        parent: &CancellationToken,
    ) -> Result<OperationToken> {
        let token =
            OperationToken::with_parent(self.next_operation_id(), request_id, client_id, parent)?;
        self.admit(&token);
        Ok(token)
    }

    /// Store a record for `token`. Returns `false` if the id is already
    /// tracked, the token is already released, or it is
    /// [`OperationToken::NONE`].
    pub fn admit(&self, token: &OperationToken) -> bool {
        if token.is_none() || token.is_released() {
            return false;
        }
        let id = token.operation_id();
        {
            let mut records = self.write();
            if records.contains_key(&id) {
                return false;
            }
            records.insert(
                id,
                OperationRecord {
                    token: token.clone(),
                    is_extended_task: false,
                    cancel_on_disconnect: false,
                },
            );
        }

        let weak: Weak<Records> = Arc::downgrade(&self.records);
        token.set_release_hook(Box::new(move |id| {
            if let Some(records) = weak.upgrade() {
                records
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        }));

        // A release that raced the hook installation found no hook to run.
        if token.is_released() {
            self.write().remove(&id);
            return false;
        }
        true
    }

    /// Run `command` through `handler` under `token`.
    ///
    /// Returns `None` without running the handler if the token is already
    /// released. Otherwise the token is admitted if it is not tracked yet.
    /// Unless the handler marked the operation as an extended task, the token
    /// is released when the handler returns or the returned future is dropped.
    pub async fn execute_handler(
        &self,
        token: &OperationToken,
        command: &[String],
        handler: &dyn CommandHandler,
    ) -> Option<CommandOutcome> {
        if token.is_released() {
            debug!(operation_id = token.operation_id(), "Skipping released operation");
            return None;
        }
        self.admit(token);

        let _guard = HandlerGuard {
            registry: self,
            token,
        };
        Some(handler.handle(token, command).await)
    }

    /// Update the flags of a tracked operation. Returns `false` if the
    /// operation is not tracked.
    pub fn set_properties(
        &self,
        token: &OperationToken,
        is_extended_task: bool,
        cancel_on_disconnect: bool,
    ) -> bool {
        let mut records = self.write();
        match records.get_mut(&token.operation_id()) {
            Some(record) => {
                record.is_extended_task = is_extended_task;
                record.cancel_on_disconnect = cancel_on_disconnect;
                true
            }
            None => false,
        }
    }

    /// Look up a tracked operation.
    pub fn get(&self, operation_id: u64) -> Option<OperationRecord> {
        self.read().get(&operation_id).cloned()
    }

    /// Number of tracked operations.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove and release one operation. Returns `false` if it was not
    /// tracked.
    pub fn cancel(&self, operation_id: u64) -> bool {
        let removed = self.write().remove(&operation_id);
        match removed {
            Some(record) => {
                record.token.release();
                true
            }
            None => false,
        }
    }

    /// Release every operation, then give release callbacks a short grace
    /// period.
    pub async fn cancel_all(&self) {
        let tokens: Vec<OperationToken> = self
            .write()
            .drain()
            .map(|(_, record)| record.token)
            .collect();
        info!(count = tokens.len(), "Cancelling all operations");
        for token in &tokens {
            token.release();
        }
        tokio::time::sleep(self.cancel_grace).await;
    }

    /// Release the operations of a disconnected client that opted into
    /// cancel-on-disconnect.
    pub fn cancel_client_operations(&self, client_id: ClientId) -> usize {
        let tokens: Vec<OperationToken> = self
            .read()
            .values()
            .filter(|r| r.cancel_on_disconnect && r.token.client_id() == Some(client_id))
            .map(|r| r.token.clone())
            .collect();
        for token in &tokens {
            token.release();
        }
        if !tokens.is_empty() {
            debug!(%client_id, count = tokens.len(), "Cancelled client operations");
        }
        tokens.len()
    }

    /// Wait until every extended task has been cancelled.
    pub async fn wait_for_extended_operations(&self) {
        loop {
            let pending: Vec<OperationToken> = self
                .read()
                .values()
                .filter(|r| r.is_extended_task && !r.token.is_cancelled())
                .map(|r| r.token.clone())
                .collect();
            if pending.is_empty() {
                return;
            }
            debug!(count = pending.len(), "Waiting for extended operations");
            join_all(pending.iter().map(OperationToken::wait)).await;
        }
    }

    fn is_extended(&self, operation_id: u64) -> bool {
        self.read()
            .get(&operation_id)
            .is_some_and(|r| r.is_extended_task)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, OperationRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, OperationRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

struct HandlerGuard<'a> {
    registry: &'a OperationRegistry,
    token: &'a OperationToken,
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        if !self.registry.is_extended(self.token.operation_id()) {
            self.token.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, _token: &OperationToken, command: &[String]) -> CommandOutcome {
            Ok(Some(ResultData::Version(command.join(" "))))
        }
    }

    struct Extended<'a>(&'a OperationRegistry);

    #[async_trait]
    impl CommandHandler for Extended<'_> {
        async fn handle(&self, token: &OperationToken, _command: &[String]) -> CommandOutcome {
            self.0.set_properties(token, true, true);
            Ok(None)
        }
    }

    // ==================== Token allocation ====================

    #[test]
    fn test_generate_token_is_monotonic_and_stored() {
        let registry = OperationRegistry::new();
        let a = registry.generate_token(1, None);
        let b = registry.generate_token(1, None);
        assert!(b.operation_id() > a.operation_id());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a.operation_id()).is_some());
    }

    #[test]
    fn test_release_removes_record_once() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(1, None);
        token.release();
        token.release();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_admit_rejects_duplicates_and_none() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(1, None);
        assert!(!registry.admit(&token));
        assert!(!registry.admit(&OperationToken::NONE));
    }

    #[test]
    fn test_generate_linked_token_follows_parent() {
        let registry = OperationRegistry::new();
        let parent = CancellationToken::new();
        let token = registry.generate_linked_token(1, None, &parent).unwrap();
        parent.cancel();
        assert!(token.is_cancelled());

        assert!(registry.generate_linked_token(2, None, &parent).is_err());
    }

    // ==================== Handler execution ====================

    #[tokio::test]
    async fn test_execute_handler_releases_plain_operations() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(3, None);
        let outcome = registry
            .execute_handler(&token, &["a".into(), "b".into()], &Echo)
            .await;
        assert_eq!(outcome, Some(Ok(Some(ResultData::Version("a b".into())))));
        assert!(token.is_released());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_handler_keeps_extended_operations() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(3, None);
        let outcome = registry
            .execute_handler(&token, &[], &Extended(&registry))
            .await;
        assert_eq!(outcome, Some(Ok(None)));
        assert!(!token.is_released());
        assert!(registry.get(token.operation_id()).unwrap().is_extended_task);
    }

    #[tokio::test]
    async fn test_execute_handler_admits_foreign_token() {
        let registry = OperationRegistry::new();
        let token = OperationToken::new(999, 1, None);
        let outcome = registry.execute_handler(&token, &[], &Echo).await;
        assert!(outcome.is_some());
        assert!(token.is_released());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_handler_skips_released_token() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(1, None);
        token.release();
        assert!(registry.execute_handler(&token, &[], &Echo).await.is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute_handler_does_not_track_released_foreign_token() {
        let registry = OperationRegistry::new();
        let token = OperationToken::new(42, 1, None);
        token.release();
        assert!(registry.execute_handler(&token, &[], &Echo).await.is_none());
        assert!(registry.is_empty());
        assert!(registry.get(42).is_none());
    }

    #[test]
    fn test_admit_rejects_released_token() {
        let registry = OperationRegistry::new();
        let token = OperationToken::new(7, 1, None);
        token.release();
        assert!(!registry.admit(&token));
        assert!(registry.is_empty());
    }

    // ==================== Cancellation ====================

    #[test]
    fn test_cancel_single_operation() {
        let registry = OperationRegistry::new();
        let token = registry.generate_token(1, None);
        assert!(registry.cancel(token.operation_id()));
        assert!(token.is_released());
        assert!(!registry.cancel(token.operation_id()));
    }

    #[test]
    fn test_cancel_client_operations_respects_flag() {
        let registry = OperationRegistry::new();
        let client = ClientId::new();
        let other = ClientId::new();

        let flagged = registry.generate_token(1, Some(client));
        let unflagged = registry.generate_token(2, Some(client));
        let foreign = registry.generate_token(3, Some(other));
        registry.set_properties(&flagged, true, true);
        registry.set_properties(&foreign, true, true);

        assert_eq!(registry.cancel_client_operations(client), 1);
        assert!(flagged.is_released());
        assert!(!unflagged.is_released());
        assert!(!foreign.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_releases_everything() {
        let registry = OperationRegistry::new();
        let tokens: Vec<_> = (0..5).map(|i| registry.generate_token(i, None)).collect();
        registry.cancel_all().await;
        assert!(tokens.iter().all(OperationToken::is_released));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_extended_operations() {
        let registry = Arc::new(OperationRegistry::new());
        let token = registry.generate_token(1, None);
        registry.set_properties(&token, true, false);
        let plain = registry.generate_token(2, None);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_extended_operations().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.release();
        waiter.await.unwrap();
        assert!(!plain.is_released());
    }

    #[tokio::test]
    async fn test_wait_for_extended_operations_returns_when_none() {
        let registry = OperationRegistry::new();
        registry.generate_token(1, None);
        registry.wait_for_extended_operations().await;
    }
}
