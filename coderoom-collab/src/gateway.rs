//! Routes decoded client messages to the room components.
//!
//! The gateway is transport-agnostic: the WebSocket server owns the socket
//! and a [`ConnectionState`] per connection, feeds every decoded
//! [`ClientMessage`] through [`ConnectionGateway::handle`], writes back the
//! direct replies, and forwards room deliveries addressed to it.
//!
//! Direct replies are only `Snapshot`, `Rejected` and `Pong`. Everything
//! else, including the sender's own `EditAck` and `RunAccepted`, arrives
//! through the room channel so it is ordered with the rest of the room.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::broadcast::{Delivery, DeliveryReceiver};
use crate::error::RoomError;
use crate::execution::ExecutionDispatcher;
use crate::presence::{JoinRequest, Joined, PresenceTracker};
use crate::protocol::{Action, ClientMessage, ConnectionId, ErrorCode, RoomId, ServerMessage};
use crate::reconcile::{EditOperation, EditReconciler};

/// Per-connection routing state, owned by the connection task.
#[derive(Debug)]
pub struct ConnectionState {
    id: ConnectionId,
    room: Option<RoomId>,
    receiver: Option<DeliveryReceiver>,
}

impl ConnectionState {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            room: None,
            receiver: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    /// Room channel of the joined room, if any.
    pub fn receiver_mut(&mut self) -> Option<&mut DeliveryReceiver> {
        self.receiver.as_mut()
    }

    /// Whether `delivery` should be forwarded to this connection.
    pub fn accepts(&self, delivery: &Delivery) -> bool {
        delivery.audience.includes(self.id)
    }

    fn bind(&mut self, room_id: RoomId, joined: Joined) -> ServerMessage {
        self.room = Some(room_id);
        self.receiver = Some(joined.receiver);
        ServerMessage::Snapshot(joined.snapshot)
    }

    fn unbind(&mut self) -> Option<RoomId> {
        self.receiver = None;
        self.room.take()
    }
}

#[derive(Clone)]
pub struct ConnectionGateway {
    presence: PresenceTracker,
    reconciler: EditReconciler,
    dispatcher: ExecutionDispatcher,
    /// connection → room it is bound to
    bindings: Arc<RwLock<HashMap<ConnectionId, RoomId>>>,
}

impl ConnectionGateway {
    pub fn new(presence: PresenceTracker, reconciler: EditReconciler, dispatcher: ExecutionDispatcher) -> Self {
        Self {
            presence,
            reconciler,
            dispatcher,
            bindings: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn reconciler(&self) -> &EditReconciler {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.dispatcher
    }

    /// Handle one request and return the replies addressed only to it.
    pub async fn handle(&self, state: &mut ConnectionState, message: ClientMessage) -> Vec<ServerMessage> {
        let action = message.action();
        let result = match message {
            ClientMessage::Join {
                room_id,
                display_name,
                token,
            } => self.join(state, room_id, JoinRequest { display_name, token }).await,
            ClientMessage::Leave { room_id } => {
                self.leave(state, &room_id).await;
                Ok(None)
            }
            ClientMessage::EditSubmit {
                room_id,
                base_revision,
                payload,
                client_timestamp,
            } => self
                .reconciler
                .apply_edit(EditOperation {
                    room_id,
                    origin: state.id,
                    base_revision,
                    payload,
                    client_timestamp,
                })
                .await
                .map(|_| None),
            ClientMessage::LanguageChange { room_id, language } => self
                .reconciler
                .change_language(&room_id, state.id, language)
                .await
                .map(|_| None),
            ClientMessage::RunRequest { room_id } => self
                .dispatcher
                .run_request(&room_id, state.id)
                .await
                .map(|_| None),
            ClientMessage::Typing { room_id, is_typing } => {
                // Best effort: typing hints are never answered.
                if let Err(e) = self.presence.set_typing(&room_id, state.id, is_typing).await {
                    log::trace!("Dropped typing hint from {} for {room_id}: {e}", state.id);
                }
                Ok(None)
            }
            ClientMessage::Resync { room_id } => self.resync(state, &room_id).await.map(Some),
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        };

        match result {
            Ok(reply) => reply.into_iter().collect(),
            Err(e) => {
                log::debug!("Rejected {action:?} from {}: {e}", state.id);
                vec![e.to_rejection(action)]
            }
        }
    }

    async fn join(
        &self,
        state: &mut ConnectionState,
        room_id: RoomId,
        request: JoinRequest,
    ) -> Result<Option<ServerMessage>, RoomError> {
        // One room per connection: joining elsewhere leaves the current room.
        if let Some(current) = state.room.clone() {
            if current != room_id {
                self.leave(state, &current).await;
            }
        }

        let joined = self.presence.join(&room_id, state.id, request).await?;
        self.bindings.write().await.insert(state.id, room_id.clone());
        Ok(Some(state.bind(room_id, joined)))
    }

    async fn leave(&self, state: &mut ConnectionState, room_id: &RoomId) {
        self.presence.leave(room_id, state.id).await;
        if state.room.as_ref() == Some(room_id) {
            state.unbind();
            self.bindings.write().await.remove(&state.id);
        }
    }

    async fn resync(&self, state: &mut ConnectionState, room_id: &RoomId) -> Result<ServerMessage, RoomError> {
        let joined = self.presence.resync(room_id, state.id).await?;
        Ok(state.bind(room_id.clone(), joined))
    }

    /// Recover from a lagged room channel: resubscribe and resend a
    /// snapshot. `None` if the connection is no longer in a room.
    pub async fn recover_lag(&self, state: &mut ConnectionState) -> Option<ServerMessage> {
        let room_id = state.room.clone()?;
        match self.resync(state, &room_id).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                log::warn!("Could not resync {} in {room_id}: {e}", state.id);
                state.unbind();
                self.bindings.write().await.remove(&state.id);
                None
            }
        }
    }

    /// The physical connection is gone.
    pub async fn disconnect(&self, state: &mut ConnectionState) {
        if let Some(room_id) = state.unbind() {
            self.presence.disconnect(&room_id, state.id).await;
        }
        self.bindings.write().await.remove(&state.id);
    }

    pub async fn binding(&self, connection_id: ConnectionId) -> Option<RoomId> {
        self.bindings.read().await.get(&connection_id).cloned()
    }

    pub async fn bound_connections(&self) -> usize {
        self.bindings.read().await.len()
    }
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGateway")
            .field("presence", &self.presence)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Reply for a frame that could not be decoded.
pub fn malformed(detail: impl std::fmt::Display) -> ServerMessage {
    ServerMessage::Rejected {
        action: Action::Decode,
        code: ErrorCode::Malformed,
        message: format!("Malformed message: {detail}"),
        current_revision: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RejectAllVerifier;
    use crate::execution::ExecutionConfig;
    use crate::ot::TextOperation;
    use crate::presence::PresenceConfig;
    use crate::protocol::{EditPayload, Language};
    use crate::sandbox::{ExecutionOutput, ExecutorError, SandboxExecutor};
    use crate::session::{SessionConfig, SessionStore};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullExecutor;

    #[async_trait]
    impl SandboxExecutor for NullExecutor {
        async fn execute(&self, _code: &str, _language: Language) -> Result<ExecutionOutput, ExecutorError> {
            Ok(ExecutionOutput::default())
        }
    }

    fn gateway() -> ConnectionGateway {
        let store = SessionStore::new(SessionConfig::default());
        let presence = PresenceTracker::new(
            store.clone(),
            Arc::new(RejectAllVerifier),
            PresenceConfig {
                reconnect_window: Duration::ZERO,
                ..PresenceConfig::default()
            },
        );
        ConnectionGateway::new(
            presence,
            EditReconciler::new(store.clone()),
            ExecutionDispatcher::new(store, Arc::new(NullExecutor), ExecutionConfig::default()),
        )
    }

    fn id(raw: &str) -> RoomId {
        RoomId::parse(raw).unwrap()
    }

    fn join(room: &str, name: &str) -> ClientMessage {
        ClientMessage::Join {
            room_id: id(room),
            display_name: name.into(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_join_replies_with_snapshot() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        let replies = gateway.handle(&mut state, join("R1", "Alice")).await;

        assert_eq!(replies.len(), 1);
        let ServerMessage::Snapshot(snapshot) = &replies[0] else {
            panic!("expected snapshot");
        };
        assert_eq!(snapshot.you, state.id());
        assert_eq!(state.room(), Some(&id("R1")));
        assert!(state.receiver_mut().is_some());
        assert_eq!(gateway.binding(state.id()).await, Some(id("R1")));
    }

    #[tokio::test]
    async fn test_stale_edit_rejected_with_revision() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        gateway.handle(&mut state, join("R1", "Alice")).await;

        let edit = |base_revision, text: &str| ClientMessage::EditSubmit {
            room_id: id("R1"),
            base_revision,
            payload: EditPayload::Replace { text: text.into() },
            client_timestamp: None,
        };
        assert!(gateway.handle(&mut state, edit(0, "a")).await.is_empty());
        let replies = gateway.handle(&mut state, edit(0, "b")).await;
        assert_eq!(
            replies,
            vec![ServerMessage::Rejected {
                action: Action::Edit,
                code: ErrorCode::StaleRevision,
                message: "Edit based on revision 0 is stale, room is at 1".into(),
                current_revision: Some(1),
            }]
        );
    }

    #[tokio::test]
    async fn test_edit_from_outside_room() {
        let gateway = gateway();
        let mut alice = ConnectionState::new(ConnectionId::new());
        let mut mallory = ConnectionState::new(ConnectionId::new());
        gateway.handle(&mut alice, join("R1", "Alice")).await;

        let mut op = TextOperation::new();
        op.insert("x");
        let replies = gateway
            .handle(
                &mut mallory,
                ClientMessage::EditSubmit {
                    room_id: id("R1"),
                    base_revision: 0,
                    payload: EditPayload::Delta { operation: op },
                    client_timestamp: None,
                },
            )
            .await;
        assert!(matches!(
            &replies[0],
            ServerMessage::Rejected { code: ErrorCode::NotInRoom, .. }
        ));
    }

    #[tokio::test]
    async fn test_switching_rooms_leaves_previous() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        gateway.handle(&mut state, join("R1", "Alice")).await;
        gateway.handle(&mut state, join("R2", "Alice")).await;

        assert_eq!(gateway.presence().participant_count(&id("R1")).await, 0);
        assert_eq!(gateway.presence().participant_count(&id("R2")).await, 1);
        assert_eq!(state.room(), Some(&id("R2")));
    }

    #[tokio::test]
    async fn test_leave_unbinds() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        gateway.handle(&mut state, join("R1", "Alice")).await;
        let replies = gateway
            .handle(&mut state, ClientMessage::Leave { room_id: id("R1") })
            .await;
        assert!(replies.is_empty());
        assert!(state.room().is_none());
        assert_eq!(gateway.bound_connections().await, 0);

        // Leaving again is fine.
        let replies = gateway
            .handle(&mut state, ClientMessage::Leave { room_id: id("R1") })
            .await;
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_typing_never_answered() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        let typing = |room: &str| ClientMessage::Typing {
            room_id: id(room),
            is_typing: true,
        };

        assert!(gateway.handle(&mut state, typing("nowhere")).await.is_empty());
        gateway.handle(&mut ConnectionState::new(ConnectionId::new()), join("R1", "Bob")).await;
        assert!(gateway.handle(&mut state, typing("R1")).await.is_empty());

        gateway.handle(&mut state, join("R1", "Alice")).await;
        assert!(gateway.handle(&mut state, typing("R1")).await.is_empty());
    }

    #[tokio::test]
    async fn test_ping() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        assert_eq!(gateway.handle(&mut state, ClientMessage::Ping).await, vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_participant() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        gateway.handle(&mut state, join("R1", "Alice")).await;
        gateway.disconnect(&mut state).await;
        assert_eq!(gateway.presence().participant_count(&id("R1")).await, 0);
        assert_eq!(gateway.binding(state.id()).await, None);
    }

    #[tokio::test]
    async fn test_recover_lag_resubscribes() {
        let gateway = gateway();
        let mut state = ConnectionState::new(ConnectionId::new());
        assert!(gateway.recover_lag(&mut state).await.is_none());

        gateway.handle(&mut state, join("R1", "Alice")).await;
        let reply = gateway.recover_lag(&mut state).await;
        assert!(matches!(reply, Some(ServerMessage::Snapshot(_))));
    }

    #[test]
    fn test_malformed_reply() {
        let ServerMessage::Rejected { action, code, .. } = malformed("eof") else {
            panic!("expected rejection");
        };
        assert_eq!(action, Action::Decode);
        assert_eq!(code, ErrorCode::Malformed);
    }
}
