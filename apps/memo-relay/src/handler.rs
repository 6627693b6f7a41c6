//! Per-connection protocol state machine.
//!
//! A connection moves `Connecting -> Authenticating -> Authenticated -> Closed`.
//! Authentication happens during the upgrade handshake; once authenticated,
//! each inbound envelope is dispatched here and any failure is answered with
//! an `ERROR` envelope to the sender alone.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as Frame};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::AuthError;
use crate::bridge::{BridgeError, MemoBackend, MemoMutation};
use crate::broadcast::{broadcast_to_all, broadcast_to_group};
use crate::protocol::{self, DecodeError, Envelope, GroupTarget, Message, MessageKind};
use crate::registry::{Admission, ConnectionHandle, SessionRegistry};

pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Authenticated,
    Closed,
}

/// Protocol state owned by one socket task.
pub struct Session {
    state: ConnectionState,
    outbound: mpsc::Sender<Frame>,
    connection: Option<Arc<ConnectionHandle>>,
}

impl Session {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            outbound,
            connection: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_authentication(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Authenticating;
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.connection.as_ref().map(|conn| conn.identity())
    }

    pub fn connection(&self) -> Option<&Arc<ConnectionHandle>> {
        self.connection.as_ref()
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
    }

    fn authenticated(&self) -> Option<&Arc<ConnectionHandle>> {
        match self.state {
            ConnectionState::Authenticated => self.connection.as_ref(),
            _ => None,
        }
    }

    async fn reply(&self, envelope: &Envelope) {
        if self
            .outbound
            .send(Frame::Text(protocol::encode(envelope)))
            .await
            .is_err()
        {
            debug!(
                identity = self.identity().unwrap_or("-"),
                kind = %envelope.kind(),
                "reply dropped; connection writer gone"
            );
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("authentication required")]
    Unauthenticated,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{0} requires a groupId")]
    MissingGroup(MessageKind),
    #[error("{0} requires a memo id")]
    MissingMemoId(MessageKind),
    #[error("{0} cannot be sent by clients")]
    ServerOnly(MessageKind),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl HandlerError {
    /// Machine-readable `code` carried in the ERROR payload.
    pub fn code(&self) -> &'static str {
        match self {
            HandlerError::Unauthenticated => "UNAUTHENTICATED",
            HandlerError::Decode(DecodeError::UnknownType(_)) => "UNKNOWN_TYPE",
            HandlerError::Decode(_) => "DECODE_ERROR",
            HandlerError::MissingGroup(_) | HandlerError::MissingMemoId(_) => "VALIDATION_ERROR",
            HandlerError::ServerOnly(_) => "UNSUPPORTED_DIRECTION",
            HandlerError::Bridge(_) => "BACKEND_ERROR",
        }
    }

    pub fn client_message(&self) -> String {
        match self {
            HandlerError::Bridge(err) => err.client_message(),
            other => other.to_string(),
        }
    }

    fn to_envelope(&self) -> Envelope {
        Envelope::error(self.client_message(), Some(self.code()))
    }
}

/// Dispatches decoded envelopes against the shared registry and the backend.
#[derive(Clone)]
pub struct ProtocolHandler {
    registry: SessionRegistry,
    backend: Arc<dyn MemoBackend>,
    bridge_timeout: Duration,
}

impl ProtocolHandler {
    pub fn new(
        registry: SessionRegistry,
        backend: Arc<dyn MemoBackend>,
        bridge_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            bridge_timeout,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Completes the handshake for a verified identity: registers the
    /// connection (superseding any earlier one for the same identity) and
    /// confirms with `AUTH_SUCCESS`.
    pub async fn authenticate(&self, session: &mut Session, identity: String) -> Admission {
        let connection = Arc::new(ConnectionHandle::new(
            identity.clone(),
            session.outbound.clone(),
        ));
        let (admission, previous) = self.registry.admit_scoped(Arc::clone(&connection));
        if let Some(previous) = previous {
            info!(
                identity = %identity,
                previous_connection = %previous.id(),
                connection_id = %connection.id(),
                "identity reconnected; superseding previous connection"
            );
        }

        session.connection = Some(connection);
        session.state = ConnectionState::Authenticated;
        counter!("memo_relay_handshakes_total", 1, "outcome" => "accepted");
        session.reply(&Envelope::auth_success(identity)).await;
        admission
    }

    /// Fails the handshake. The returned frame carries the policy-violation
    /// close code and should be the only thing sent on the socket.
    pub fn reject(&self, session: &mut Session, err: &AuthError) -> CloseFrame<'static> {
        session.close();
        counter!(
            "memo_relay_handshakes_total",
            1,
            "outcome" => "rejected",
            "reason" => err.metric_label()
        );
        CloseFrame {
            code: close_code::POLICY,
            reason: Cow::Borrowed(err.close_reason()),
        }
    }

    pub async fn handle_text(&self, session: &Session, raw: &str) {
        let result = match session.authenticated() {
            Some(connection) => match protocol::decode(raw) {
                Ok(envelope) => self.dispatch(connection, envelope).await,
                Err(err) => Err(err.into()),
            },
            None => Err(HandlerError::Unauthenticated),
        };
        self.finish(session, result).await;
    }

    pub async fn handle_binary(&self, session: &Session, raw: &[u8]) {
        let result = match session.authenticated() {
            Some(connection) => match protocol::decode_bytes(raw) {
                Ok(envelope) => self.dispatch(connection, envelope).await,
                Err(err) => Err(err.into()),
            },
            None => Err(HandlerError::Unauthenticated),
        };
        self.finish(session, result).await;
    }

    async fn finish(&self, session: &Session, result: Result<(), HandlerError>) {
        if let Err(err) = result {
            warn!(
                identity = session.identity().unwrap_or("-"),
                code = err.code(),
                error = %err,
                "rejecting client message"
            );
            counter!("memo_relay_message_errors_total", 1, "code" => err.code());
            session.reply(&err.to_envelope()).await;
        }
    }

    async fn dispatch(
        &self,
        connection: &Arc<ConnectionHandle>,
        envelope: Envelope,
    ) -> Result<(), HandlerError> {
        let kind = envelope.kind();
        counter!("memo_relay_messages_total", 1, "type" => kind.as_str());

        match &envelope.message {
            Message::MemoCreate(_) | Message::MemoUpdate(_) | Message::MemoDelete(_) => {
                self.relay_mutation(connection, &envelope).await
            }
            Message::GroupJoin(target) => {
                let group_id = group_for(kind, target, &envelope)?;
                let added = connection.membership().join(&group_id);
                info!(
                    identity = %connection.identity(),
                    group_id = %group_id,
                    added,
                    "joined group"
                );
                Ok(())
            }
            Message::GroupLeave(target) => {
                let group_id = group_for(kind, target, &envelope)?;
                let removed = connection.membership().leave(&group_id);
                info!(
                    identity = %connection.identity(),
                    group_id = %group_id,
                    removed,
                    "left group"
                );
                Ok(())
            }
            Message::Broadcast(_) => {
                let identity = connection.identity();
                broadcast_to_all(&self.registry, &envelope.stamped(identity), Some(identity));
                Ok(())
            }
            Message::Ping => {
                connection.send(&Envelope::pong()).await;
                Ok(())
            }
            Message::AuthSuccess(_) | Message::Pong | Message::Error(_) => {
                Err(HandlerError::ServerOnly(kind))
            }
        }
    }

    /// Commits a memo mutation through the backend, then relays the envelope
    /// to the rest of the group. Nothing is relayed if the backend refuses.
    async fn relay_mutation(
        &self,
        connection: &Arc<ConnectionHandle>,
        envelope: &Envelope,
    ) -> Result<(), HandlerError> {
        let kind = envelope.kind();
        let group_id = envelope
            .group_id
            .as_ref()
            .filter(|group| !group.is_blank())
            .ok_or(HandlerError::MissingGroup(kind))?;
        let mutation = MemoMutation::from_message(&envelope.message, group_id)
            .ok_or(HandlerError::MissingMemoId(kind))?;
        let identity = connection.identity();
        let operation = mutation.operation();

        let outcome = match timeout(self.bridge_timeout, self.backend.apply(identity, &mutation))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.bridge_timeout)),
        };
        if let Err(err) = outcome {
            counter!(
                "memo_relay_bridge_calls_total",
                1,
                "op" => operation.as_str(),
                "outcome" => err.metric_label()
            );
            return Err(err.into());
        }
        counter!(
            "memo_relay_bridge_calls_total",
            1,
            "op" => operation.as_str(),
            "outcome" => "ok"
        );

        let group_key = group_id.to_string();
        let metrics = broadcast_to_group(
            &self.registry,
            &group_key,
            &envelope.stamped(identity),
            Some(identity),
        );
        info!(
            identity = %identity,
            group_id = %group_key,
            %operation,
            memo_id = %mutation.memo_id().map(|id| id.to_string()).unwrap_or_default(),
            delivered = metrics.delivered,
            "memo mutation relayed"
        );
        Ok(())
    }
}

/// Group named by a join/leave payload, falling back to the envelope field.
fn group_for(
    kind: MessageKind,
    target: &GroupTarget,
    envelope: &Envelope,
) -> Result<String, HandlerError> {
    target
        .group_id
        .as_ref()
        .or(envelope.group_id.as_ref())
        .filter(|group| !group.is_blank())
        .map(|group| group.to_string())
        .ok_or(HandlerError::MissingGroup(kind))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::StatusCode;
    use serde_json::{json, Value};

    use super::*;
    use crate::bridge::MemoOperation;

    /// Backend double that records calls and answers with a fixed outcome.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<(String, MemoMutation)>>,
        reject_with: Option<(StatusCode, Option<String>)>,
        stall: bool,
    }

    impl ScriptedBackend {
        fn accepting() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn rejecting(status: StatusCode, message: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                reject_with: Some((status, message.map(str::to_string))),
                ..Self::default()
            })
        }

        fn stalling() -> Arc<Self> {
            Arc::new(Self {
                stall: true,
                ..Self::default()
            })
        }

        fn calls(&self) -> Vec<(String, MemoMutation)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MemoBackend for ScriptedBackend {
        async fn apply(
            &self,
            identity: &str,
            mutation: &MemoMutation,
        ) -> Result<(), BridgeError> {
            self.calls
                .lock()
                .push((identity.to_string(), mutation.clone()));
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            match &self.reject_with {
                Some((status, message)) => Err(BridgeError::Rejected {
                    operation: mutation.operation(),
                    status: *status,
                    message: message.clone(),
                }),
                None => Ok(()),
            }
        }
    }

    struct Peer {
        session: Session,
        rx: mpsc::Receiver<Frame>,
        _admission: Option<Admission>,
    }

    impl Peer {
        fn frames(&mut self) -> Vec<Value> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Frame::Text(text) = frame {
                    frames.push(serde_json::from_str(&text).expect("json frame"));
                }
            }
            frames
        }

        async fn send(&self, handler: &ProtocolHandler, value: Value) {
            handler.handle_text(&self.session, &value.to_string()).await;
        }
    }

    fn handler(backend: Arc<dyn MemoBackend>) -> ProtocolHandler {
        ProtocolHandler::new(SessionRegistry::new(), backend, DEFAULT_BRIDGE_TIMEOUT)
    }

    async fn connect(handler: &ProtocolHandler, identity: &str) -> Peer {
        let (tx, rx) = mpsc::channel(16);
        let mut session = Session::new(tx);
        session.begin_authentication();
        let admission = handler.authenticate(&mut session, identity.to_string()).await;
        let mut peer = Peer {
            session,
            rx,
            _admission: Some(admission),
        };
        let hello = peer.frames();
        assert_eq!(hello.len(), 1);
        assert_eq!(hello[0]["type"], "AUTH_SUCCESS");
        assert_eq!(hello[0]["payload"]["userId"], identity);
        peer
    }

    async fn join(handler: &ProtocolHandler, peer: &mut Peer, group: &str) {
        peer.send(handler, json!({ "type": "GROUP_JOIN", "payload": { "groupId": group } }))
            .await;
        assert!(peer.frames().is_empty());
    }

    fn memo_create(group: Option<&str>) -> Value {
        let mut value = json!({
            "type": "MEMO_CREATE",
            "payload": {
                "title": "Retro",
                "content": "went well",
                "tags": ["team"],
                "isPrivate": false,
                "authorId": "alice"
            }
        });
        if let Some(group) = group {
            value["groupId"] = json!(group);
        }
        value
    }

    #[test_timeout::tokio_timeout_test]
    async fn authenticate_moves_session_to_authenticated() {
        let handler = handler(ScriptedBackend::accepting());
        let peer = connect(&handler, "alice").await;
        assert_eq!(peer.session.state(), ConnectionState::Authenticated);
        assert_eq!(peer.session.identity(), Some("alice"));
        assert!(handler.registry().get("alice").is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_handshake_closes_with_policy_code() {
        let handler = handler(ScriptedBackend::accepting());
        let (tx, _rx) = mpsc::channel(4);
        let mut session = Session::new(tx);
        session.begin_authentication();
        assert_eq!(session.state(), ConnectionState::Authenticating);

        let frame = handler.reject(&mut session, &AuthError::MissingCredential);
        assert_eq!(frame.code, close_code::POLICY);
        assert_eq!(frame.reason, "unauthorized: no credential");
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(handler.registry().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn messages_before_authentication_are_rejected_without_effect() {
        let backend = ScriptedBackend::accepting();
        let handler = handler(backend.clone());
        let (tx, mut rx) = mpsc::channel(4);
        let session = Session::new(tx);

        handler
            .handle_text(&session, &memo_create(Some("g1")).to_string())
            .await;
        handler
            .handle_text(
                &session,
                &json!({ "type": "GROUP_JOIN", "payload": { "groupId": "g1" } }).to_string(),
            )
            .await;

        for _ in 0..2 {
            match rx.try_recv() {
                Ok(Frame::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).expect("json");
                    assert_eq!(value["type"], "ERROR");
                    assert_eq!(value["payload"]["message"], "authentication required");
                    assert_eq!(value["payload"]["code"], "UNAUTHENTICATED");
                }
                other => panic!("expected error frame, got {other:?}"),
            }
        }
        assert!(backend.calls().is_empty());
        assert!(handler.registry().is_empty());
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_and_leave_update_membership() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;
        let membership = || {
            handler
                .registry()
                .get("alice")
                .map(|conn| conn.membership().groups())
                .unwrap_or_default()
        };

        join(&handler, &mut alice, "g1").await;
        join(&handler, &mut alice, "g1").await;
        assert_eq!(membership(), vec!["g1".to_string()]);

        alice
            .send(&handler, json!({ "type": "GROUP_LEAVE", "payload": { "groupId": "g1" } }))
            .await;
        assert!(alice.frames().is_empty());
        assert!(membership().is_empty());

        alice
            .send(&handler, json!({ "type": "GROUP_LEAVE", "payload": { "groupId": "g1" } }))
            .await;
        assert!(alice.frames().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_without_group_is_a_validation_error() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;

        alice
            .send(&handler, json!({ "type": "GROUP_JOIN", "payload": {} }))
            .await;
        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ERROR");
        assert_eq!(frames[0]["payload"]["code"], "VALIDATION_ERROR");
        assert_eq!(frames[0]["payload"]["message"], "GROUP_JOIN requires a groupId");

        alice
            .send(&handler, json!({ "type": "GROUP_JOIN", "payload": {}, "groupId": "g3" }))
            .await;
        assert!(alice.frames().is_empty());
        let conn = handler.registry().get("alice").expect("registered");
        assert!(conn.membership().has("g3"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn mutation_without_group_never_reaches_backend() {
        let backend = ScriptedBackend::accepting();
        let handler = handler(backend.clone());
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        join(&handler, &mut bob, "g1").await;

        for message in [
            memo_create(None),
            json!({ "type": "MEMO_DELETE", "payload": { "id": "m1" } }),
            json!({
                "type": "MEMO_UPDATE",
                "payload": { "id": "m1", "title": "t", "content": "c" }
            }),
        ] {
            alice.send(&handler, message).await;
            let frames = alice.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "ERROR");
            assert_eq!(frames[0]["payload"]["code"], "VALIDATION_ERROR");
        }

        assert!(backend.calls().is_empty());
        assert!(bob.frames().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn successful_mutation_reaches_other_group_members_only() {
        let backend = ScriptedBackend::accepting();
        let handler = handler(backend.clone());
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        let mut carol = connect(&handler, "carol").await;
        let mut dave = connect(&handler, "dave").await;
        join(&handler, &mut alice, "g1").await;
        join(&handler, &mut bob, "g1").await;
        join(&handler, &mut carol, "g1").await;
        join(&handler, &mut dave, "g2").await;

        alice.send(&handler, memo_create(Some("g1"))).await;

        assert!(alice.frames().is_empty());
        assert!(dave.frames().is_empty());
        for peer in [&mut bob, &mut carol] {
            let frames = peer.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "MEMO_CREATE");
            assert_eq!(frames[0]["groupId"], "g1");
            assert_eq!(frames[0]["senderId"], "alice");
            assert_eq!(frames[0]["payload"]["title"], "Retro");
        }

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "alice");
        assert_eq!(calls[0].1.operation(), MemoOperation::Create);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_mutation_reports_backend_message_and_withholds_broadcast() {
        let backend =
            ScriptedBackend::rejecting(StatusCode::BAD_REQUEST, Some("title must not be empty"));
        let handler = handler(backend.clone());
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        join(&handler, &mut alice, "g1").await;
        join(&handler, &mut bob, "g1").await;

        alice.send(&handler, memo_create(Some("g1"))).await;

        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ERROR");
        assert_eq!(frames[0]["payload"]["message"], "title must not be empty");
        assert_eq!(frames[0]["payload"]["code"], "BACKEND_ERROR");
        assert!(bob.frames().is_empty());
        assert_eq!(backend.calls().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_backend_times_out_as_failure() {
        let backend = ScriptedBackend::stalling();
        let handler = ProtocolHandler::new(
            SessionRegistry::new(),
            backend.clone(),
            Duration::from_millis(50),
        );
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        join(&handler, &mut bob, "g1").await;

        alice
            .send(
                &handler,
                json!({ "type": "MEMO_DELETE", "payload": { "id": 5 }, "groupId": "g1" }),
            )
            .await;

        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["payload"]["message"], "Backend timed out");
        assert!(bob.frames().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn broadcast_message_skips_sender() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        let mut carol = connect(&handler, "carol").await;

        alice
            .send(
                &handler,
                json!({ "type": "BROADCAST_MESSAGE", "payload": { "text": "hi all" } }),
            )
            .await;

        assert!(alice.frames().is_empty());
        for peer in [&mut bob, &mut carol] {
            let frames = peer.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "BROADCAST_MESSAGE");
            assert_eq!(frames[0]["payload"]["text"], "hi all");
            assert_eq!(frames[0]["senderId"], "alice");
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_input_keeps_connection_usable() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;
        join(&handler, &mut alice, "g1").await;

        handler.handle_text(&alice.session, "not json").await;
        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "ERROR");
        assert_eq!(frames[0]["payload"]["code"], "DECODE_ERROR");

        handler.handle_binary(&alice.session, &[0xc3, 0x28]).await;
        assert_eq!(alice.frames()[0]["payload"]["code"], "DECODE_ERROR");

        let conn = handler.registry().get("alice").expect("still registered");
        assert_eq!(conn.membership().groups(), vec!["g1".to_string()]);

        alice.send(&handler, json!({ "type": "PING" })).await;
        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "PONG");
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_and_server_only_types_are_rejected() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;

        alice
            .send(&handler, json!({ "type": "PRESENCE_UPDATE", "payload": {} }))
            .await;
        let frames = alice.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["payload"]["code"], "UNKNOWN_TYPE");
        assert_eq!(
            frames[0]["payload"]["message"],
            "unknown message type: PRESENCE_UPDATE"
        );

        alice
            .send(
                &handler,
                json!({ "type": "AUTH_SUCCESS", "payload": { "userId": "root" } }),
            )
            .await;
        let frames = alice.frames();
        assert_eq!(frames[0]["payload"]["code"], "UNSUPPORTED_DIRECTION");
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnected_member_is_not_reached() {
        let handler = handler(ScriptedBackend::accepting());
        let mut alice = connect(&handler, "alice").await;
        let mut bob = connect(&handler, "bob").await;
        join(&handler, &mut alice, "g1").await;
        join(&handler, &mut bob, "g1").await;

        alice.session.close();
        drop(alice._admission.take());
        assert!(handler.registry().get("alice").is_none());

        bob.send(&handler, memo_create(Some("g1"))).await;
        assert!(bob.frames().is_empty());
        assert!(alice.frames().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reconnect_supersedes_previous_connection() {
        let handler = handler(ScriptedBackend::accepting());
        let mut first = connect(&handler, "alice").await;
        let mut second = connect(&handler, "alice").await;
        let bob = connect(&handler, "bob").await;

        bob.send(
            &handler,
            json!({ "type": "BROADCAST_MESSAGE", "payload": { "text": "ping" } }),
        )
        .await;
        assert!(first.frames().is_empty());
        assert_eq!(second.frames().len(), 1);

        drop(first._admission.take());
        assert!(handler.registry().get("alice").is_some());
    }
}
