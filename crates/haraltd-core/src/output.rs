//! Where results and events go.
//!
//! Sessions and command handlers never touch client sockets directly; they
//! emit through an [`Output`]. The socket server is the production
//! implementation, [`RecordingOutput`](crate::mock::RecordingOutput) the test
//! one.

use std::sync::Arc;

use tracing::debug;

use haraltd_types::{ErrorData, EventMessage, ResultMessage};

use crate::auth::{AgentKind, AuthenticationBroker, AuthenticationEvent};
use crate::registry::CommandOutcome;
use crate::token::OperationToken;

/// Sink for messages addressed to clients.
pub trait Output: Send + Sync {
    /// Deliver the result of `token`'s command to its client, or to every
    /// client if the token has none. Returns `false` if it was not sent.
    fn emit_result(&self, token: &OperationToken, outcome: CommandOutcome) -> bool;

    /// Send an event to every client.
    fn emit_event(&self, event: EventMessage);

    /// Send an event only to the client that owns `token`. Returns `false` if
    /// that client is gone or the token has none.
    fn emit_client_event(&self, token: &OperationToken, event: EventMessage) -> bool;

    /// Broadcast an error event.
    fn emit_error(&self, error: ErrorData) {
        self.emit_event(EventMessage::error(error));
    }
}

impl<T: Output + ?Sized> Output for Arc<T> {
    fn emit_result(&self, token: &OperationToken, outcome: CommandOutcome) -> bool {
        (**self).emit_result(token, outcome)
    }

    fn emit_event(&self, event: EventMessage) {
        (**self).emit_event(event);
    }

    fn emit_client_event(&self, token: &OperationToken, event: EventMessage) -> bool {
        (**self).emit_client_event(token, event)
    }
}

/// Build the result envelope for `token`.
pub fn result_message(token: &OperationToken, outcome: CommandOutcome) -> ResultMessage {
    match outcome {
        Ok(data) => ResultMessage::ok(token.operation_id(), token.request_id(), data),
        Err(error) if error.is_none() => {
            ResultMessage::ok(token.operation_id(), token.request_id(), None)
        }
        Err(error) => ResultMessage::error(token.operation_id(), token.request_id(), error),
    }
}

/// Ask a client to confirm `event` and wait for the answer.
///
/// The prompt goes to the agent for `kind` (or the token's client). A prompt
/// that cannot be delivered is denied.
pub async fn confirm_authentication(
    output: &dyn Output,
    broker: &AuthenticationBroker,
    event: &Arc<AuthenticationEvent>,
    kind: AgentKind,
) -> bool {
    if !broker.add_event(event, kind) {
        return false;
    }

    if !output.emit_client_event(event.token(), event.to_event()) {
        debug!(auth_id = event.auth_id(), "Prompt could not be delivered");
        if let Some(client_id) = event.token().client_id() {
            broker.set_event_response(client_id, event.auth_id(), "");
        }
    }

    let accepted = event.wait_for_response().await;
    broker.remove_event(event);
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use haraltd_types::{ClientId, ErrorCode, FileTransfer, ResultData, Status};

    use crate::mock::RecordingOutput;

    #[test]
    fn test_result_message_from_outcome() {
        let token = OperationToken::new(7, 3, None);
        let ok = result_message(&token, Ok(Some(ResultData::Version("1".into()))));
        assert_eq!(ok.status, Status::Ok);
        assert_eq!((ok.operation_id, ok.request_id), (7, 3));

        let none = result_message(&token, Err(ErrorData::none()));
        assert_eq!(none.status, Status::Ok);
        assert!(none.data.is_none());

        let err = result_message(&token, Err(ErrorCode::Unsupported.into()));
        assert_eq!(err.status, Status::Error);
        assert_eq!(err.error.unwrap().code, -100);
    }

    #[tokio::test]
    async fn test_confirm_denies_when_client_unreachable() {
        let output = RecordingOutput::new();
        let broker = AuthenticationBroker::new();
        let client = ClientId::new();
        broker
            .register_agent(AgentKind::ObjectPush, Some(client))
            .unwrap();

        let event = broker.transfer_event(
            OperationToken::new(1, 0, None),
            FileTransfer::default(),
            Duration::from_secs(30),
        );
        let accepted = confirm_authentication(&output, &broker, &event, AgentKind::ObjectPush).await;
        assert!(!accepted);
        assert_eq!(broker.pending_events(client), 0);
    }

    #[tokio::test]
    async fn test_confirm_accepts_reply() {
        let output = Arc::new(RecordingOutput::new());
        let broker = Arc::new(AuthenticationBroker::new());
        let client = ClientId::new();
        output.connect(client);
        broker
            .register_agent(AgentKind::ObjectPush, Some(client))
            .unwrap();

        let event = broker.transfer_event(
            OperationToken::new(1, 0, None),
            FileTransfer::default(),
            Duration::from_secs(30),
        );
        let task = {
            let (output, broker, event) = (output.clone(), broker.clone(), event.clone());
            tokio::spawn(async move {
                confirm_authentication(&*output, &broker, &event, AgentKind::ObjectPush).await
            })
        };

        let prompt = output.wait_for_client_event(client).await;
        assert_eq!(prompt.event_id, 6);
        assert!(broker.set_event_response(client, event.auth_id(), "yes"));
        assert!(task.await.unwrap());
    }
}
