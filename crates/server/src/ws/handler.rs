use super::protocol as ws_protocol;
use super::session::{SessionStore, OUTBOUND_QUEUE_DEPTH};
use crate::auth::jwt::AccessTokenService;
use crate::engine::{DocRegistry, EngineError};
use crate::metrics;
use crate::presence::PresenceRegistry;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use coedit_common::ot::Operation;
use coedit_common::protocol::ws::WsMessage;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 262_144;
/// Minimum gap between peer cursor broadcasts per session; the presence
/// registry still sees every update.
pub const CURSOR_COALESCE: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct CollabState {
    pub sessions: SessionStore,
    pub registry: Arc<DocRegistry>,
    pub presence: Arc<PresenceRegistry>,
    pub jwt_service: Arc<AccessTokenService>,
}

pub fn router(state: CollabState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(default)]
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<CollabState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let identity =
        query.token.as_deref().and_then(|token| state.jwt_service.verify_token(token).ok());

    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        match identity {
            Some(identity) => handle_socket(state, identity.user_id, socket).await,
            None => close_policy_violation(socket).await,
        }
    })
}

async fn close_policy_violation(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "missing or invalid bearer token".into(),
        })))
        .await;
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("frame exceeds maximum size of {MAX_FRAME_BYTES} bytes").into(),
        })))
        .await;
}

async fn handle_socket(state: CollabState, user_id: String, mut socket: WebSocket) {
    let session_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE_DEPTH);
    state.sessions.insert(session_id, user_id, outbound_sender).await;

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if
    // no pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut last_cursor_broadcast = Instant::now() - CURSOR_COALESCE;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(session_id = %session_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                if ws_protocol::send_ws_message(
                                    &mut socket,
                                    &ws_protocol::malformed_message_error(),
                                )
                                .await
                                .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        let dispatched = dispatch_inbound(
                            &state,
                            session_id,
                            inbound,
                            &mut socket,
                            &mut last_cursor_broadcast,
                        )
                        .await;
                        if dispatched.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    disconnect(&state, session_id).await;
}

/// Route one decoded inbound frame. `Err(())` means the transport is dead
/// and the socket loop should end.
async fn dispatch_inbound(
    state: &CollabState,
    session_id: Uuid,
    inbound: WsMessage,
    socket: &mut WebSocket,
    last_cursor_broadcast: &mut Instant,
) -> Result<(), ()> {
    match inbound {
        WsMessage::JoinDocument { doc_id } => {
            let started_at = Instant::now();
            match handle_join(state, session_id, doc_id).await {
                Ok(outcome) => {
                    metrics::record_ws_request(
                        "join_document",
                        false,
                        started_at.elapsed().as_millis() as u64,
                    );
                    if let Some((previous_doc, left_message)) = outcome.left_previous {
                        state
                            .sessions
                            .broadcast_to_doc(previous_doc, left_message, Some(session_id))
                            .await;
                    }
                    // The sync frame goes out before any broadcast this
                    // session could observe for the document.
                    ws_protocol::send_ws_message(socket, &outcome.sync).await?;
                    state
                        .sessions
                        .broadcast_to_doc(doc_id, outcome.joined_broadcast, Some(session_id))
                        .await;
                }
                Err(error_message) => {
                    metrics::record_ws_request(
                        "join_document",
                        true,
                        started_at.elapsed().as_millis() as u64,
                    );
                    ws_protocol::send_ws_message(socket, &error_message).await?;
                }
            }
        }
        WsMessage::ApplyOp { op } => {
            let started_at = Instant::now();
            let doc_id = op.doc_id;
            match handle_apply_op(state, session_id, op).await {
                Ok(outcome) => {
                    let elapsed_ms = started_at.elapsed().as_millis() as u64;
                    metrics::observe_ack_latency_ms(elapsed_ms);
                    metrics::record_ws_request("apply_op", false, elapsed_ms);
                    ws_protocol::send_ws_message(socket, &outcome.ack).await?;
                    if let Some(broadcast_message) = outcome.broadcast {
                        state
                            .sessions
                            .broadcast_to_doc(doc_id, broadcast_message, Some(session_id))
                            .await;
                    }
                }
                Err(error_message) => {
                    metrics::record_ws_request(
                        "apply_op",
                        true,
                        started_at.elapsed().as_millis() as u64,
                    );
                    ws_protocol::send_ws_message(socket, &error_message).await?;
                }
            }
        }
        WsMessage::CursorUpdate { position, .. } => {
            match handle_cursor_update(state, session_id, position).await {
                Ok((doc_id, broadcast_message)) => {
                    if last_cursor_broadcast.elapsed() >= CURSOR_COALESCE {
                        *last_cursor_broadcast = Instant::now();
                        state
                            .sessions
                            .broadcast_to_doc(doc_id, broadcast_message, Some(session_id))
                            .await;
                    }
                }
                Err(error_message) => {
                    ws_protocol::send_ws_message(socket, &error_message).await?;
                }
            }
        }
        _ => {
            ws_protocol::send_ws_message(
                socket,
                &WsMessage::Error {
                    kind: "MALFORMED_MESSAGE".to_string(),
                    message: "unexpected server-to-client message".to_string(),
                },
            )
            .await?;
        }
    }

    Ok(())
}

#[derive(Debug)]
pub struct JoinOutcome {
    /// `SYNC_STATE` for the origin session.
    pub sync: WsMessage,
    /// `USER_JOINED` for the document's other sessions.
    pub joined_broadcast: WsMessage,
    /// `USER_LEFT` for the previously joined document, if any.
    pub left_previous: Option<(Uuid, WsMessage)>,
}

pub async fn handle_join(
    state: &CollabState,
    session_id: Uuid,
    doc_id: Uuid,
) -> Result<JoinOutcome, WsMessage> {
    let Some(user_id) = state.sessions.user_for_session(session_id).await else {
        return Err(session_gone_error());
    };

    let authority =
        state.registry.load_or_attach(doc_id).await.map_err(engine_error_message)?;

    // Joining a new document implicitly leaves the previous one.
    let left_previous = match state.sessions.doc_for_session(session_id).await {
        Some(previous_doc) if previous_doc != doc_id => {
            state.presence.leave(previous_doc, &user_id).await;
            Some((previous_doc, WsMessage::UserLeft { user_id: user_id.clone() }))
        }
        _ => None,
    };

    if !state.sessions.set_doc(session_id, doc_id).await {
        return Err(session_gone_error());
    }
    state.presence.join(doc_id, &user_id).await;

    let (content, version) = authority.snapshot().await;
    let cursors = state.presence.cursors(doc_id).await;

    Ok(JoinOutcome {
        sync: WsMessage::SyncState { content, version, cursors },
        joined_broadcast: WsMessage::UserJoined { user_id },
        left_previous,
    })
}

#[derive(Debug)]
pub struct ApplyOutcome {
    /// `ACK_OP` for the origin session; sent for no-op transforms too.
    pub ack: WsMessage,
    /// `BROADCAST_OP` for peers; `None` for no-op transforms.
    pub broadcast: Option<WsMessage>,
}

pub async fn handle_apply_op(
    state: &CollabState,
    session_id: Uuid,
    mut op: Operation,
) -> Result<ApplyOutcome, WsMessage> {
    let Some(user_id) = state.sessions.user_for_session(session_id).await else {
        return Err(session_gone_error());
    };

    if state.sessions.doc_for_session(session_id).await != Some(op.doc_id) {
        return Err(WsMessage::Error {
            kind: "INVALID_OPERATION".to_string(),
            message: "join the document before submitting operations".to_string(),
        });
    }

    // Identity comes from the verified token, never from the payload.
    op.user_id = user_id;

    let authority =
        state.registry.load_or_attach(op.doc_id).await.map_err(engine_error_message)?;
    let (new_version, transformed) =
        authority.apply_operation(op).await.map_err(engine_error_message)?;

    let ack = WsMessage::AckOp { op_id: transformed.op_id.clone(), new_version };
    let broadcast =
        (!transformed.is_noop()).then(|| WsMessage::BroadcastOp { op: transformed });

    Ok(ApplyOutcome { ack, broadcast })
}

pub async fn handle_cursor_update(
    state: &CollabState,
    session_id: Uuid,
    position: u64,
) -> Result<(Uuid, WsMessage), WsMessage> {
    let Some(user_id) = state.sessions.user_for_session(session_id).await else {
        return Err(session_gone_error());
    };
    let Some(doc_id) = state.sessions.doc_for_session(session_id).await else {
        return Err(WsMessage::Error {
            kind: "INVALID_OPERATION".to_string(),
            message: "join a document before sending cursor updates".to_string(),
        });
    };

    state.presence.update_cursor(doc_id, &user_id, position).await;

    Ok((doc_id, WsMessage::CursorUpdate { user_id: Some(user_id), position }))
}

/// Tear the session down: presence leave, `USER_LEFT` to peers, removal.
/// Idempotent; a session already dropped for queue overflow is left to the
/// presence TTL.
pub async fn disconnect(state: &CollabState, session_id: Uuid) {
    let Some((user_id, doc_id)) = state.sessions.remove(session_id).await else {
        return;
    };

    if let Some(doc_id) = doc_id {
        state.presence.leave(doc_id, &user_id).await;
        state.sessions.broadcast_to_doc(doc_id, WsMessage::UserLeft { user_id }, None).await;
    }
}

fn engine_error_message(error: EngineError) -> WsMessage {
    WsMessage::Error { kind: error.kind().to_string(), message: error.to_string() }
}

fn session_gone_error() -> WsMessage {
    WsMessage::Error {
        kind: "INTERNAL_ERROR".to_string(),
        message: "session is not available".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        handle_apply_op, handle_cursor_update, handle_join, CollabState,
    };
    use crate::auth::jwt::AccessTokenService;
    use crate::engine::{DocRegistry, EngineConfig};
    use crate::presence::PresenceRegistry;
    use crate::store::DocumentStore;
    use crate::ws::session::{SessionStore, OUTBOUND_QUEUE_DEPTH};
    use coedit_common::ot::{EditKind, Operation};
    use coedit_common::protocol::ws::WsMessage;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const TEST_SECRET: &str = "coedit_test_secret_that_is_definitely_long_enough";

    fn test_state() -> CollabState {
        CollabState {
            sessions: SessionStore::default(),
            registry: Arc::new(DocRegistry::new(
                DocumentStore::in_memory(),
                EngineConfig::default(),
            )),
            presence: Arc::new(PresenceRegistry::default()),
            jwt_service: Arc::new(
                AccessTokenService::new(TEST_SECRET).expect("service should initialize"),
            ),
        }
    }

    async fn connect(
        state: &CollabState,
        user_id: &str,
    ) -> (Uuid, mpsc::Receiver<WsMessage>) {
        let session_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        state.sessions.insert(session_id, user_id.to_string(), sender).await;
        (session_id, receiver)
    }

    fn insert_op(doc_id: Uuid, base_version: u64, position: u64, text: &str) -> Operation {
        Operation {
            op_id: format!("op-{base_version}-{position}"),
            doc_id,
            user_id: "from-payload".to_string(),
            base_version,
            position,
            edit: EditKind::Insert { text: text.to_string() },
        }
    }

    #[tokio::test]
    async fn join_returns_snapshot_with_own_cursor() {
        let state = test_state();
        let doc_id = state
            .registry
            .create_document("hello".to_string())
            .await
            .expect("create should succeed");
        let (session_id, _receiver) = connect(&state, "alice").await;

        let outcome =
            handle_join(&state, session_id, doc_id).await.expect("join should succeed");

        let WsMessage::SyncState { content, version, cursors } = &outcome.sync else {
            panic!("expected SYNC_STATE, got {:?}", outcome.sync);
        };
        assert_eq!(content, "hello");
        assert_eq!(*version, 0);
        assert_eq!(cursors.get("alice"), Some(&0));
        assert_eq!(
            outcome.joined_broadcast,
            WsMessage::UserJoined { user_id: "alice".to_string() }
        );
        assert!(outcome.left_previous.is_none());
    }

    #[tokio::test]
    async fn join_unknown_document_fails_with_not_found() {
        let state = test_state();
        let (session_id, _receiver) = connect(&state, "alice").await;

        let error = handle_join(&state, session_id, Uuid::new_v4())
            .await
            .expect_err("unknown document must fail");
        let WsMessage::Error { kind, .. } = error else {
            panic!("expected ERROR frame");
        };
        assert_eq!(kind, "NOT_FOUND");
    }

    #[tokio::test]
    async fn switching_documents_leaves_the_previous_one() {
        let state = test_state();
        let first =
            state.registry.create_document(String::new()).await.expect("create should succeed");
        let second =
            state.registry.create_document(String::new()).await.expect("create should succeed");
        let (session_id, _receiver) = connect(&state, "alice").await;

        handle_join(&state, session_id, first).await.expect("first join should succeed");
        let outcome =
            handle_join(&state, session_id, second).await.expect("second join should succeed");

        let (left_doc, left_message) =
            outcome.left_previous.expect("switching must leave the previous doc");
        assert_eq!(left_doc, first);
        assert_eq!(left_message, WsMessage::UserLeft { user_id: "alice".to_string() });
        assert!(state.presence.list_users(first).await.is_empty());
        assert_eq!(state.presence.list_users(second).await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn apply_op_overwrites_payload_identity() {
        let state = test_state();
        let doc_id =
            state.registry.create_document("abc".to_string()).await.expect("create should succeed");
        let (session_id, _receiver) = connect(&state, "alice").await;
        handle_join(&state, session_id, doc_id).await.expect("join should succeed");

        let outcome = handle_apply_op(&state, session_id, insert_op(doc_id, 0, 0, "x"))
            .await
            .expect("apply should succeed");

        let WsMessage::BroadcastOp { op } =
            outcome.broadcast.expect("an applied op must broadcast")
        else {
            panic!("expected BROADCAST_OP");
        };
        assert_eq!(op.user_id, "alice", "identity must come from the session, not the payload");
        assert_eq!(outcome.ack, WsMessage::AckOp { op_id: "op-0-0".to_string(), new_version: 1 });
    }

    #[tokio::test]
    async fn apply_op_without_joining_is_rejected() {
        let state = test_state();
        let doc_id =
            state.registry.create_document("abc".to_string()).await.expect("create should succeed");
        let (session_id, _receiver) = connect(&state, "alice").await;

        let error = handle_apply_op(&state, session_id, insert_op(doc_id, 0, 0, "x"))
            .await
            .expect_err("unjoined apply must fail");
        let WsMessage::Error { kind, .. } = error else {
            panic!("expected ERROR frame");
        };
        assert_eq!(kind, "INVALID_OPERATION");
    }

    #[tokio::test]
    async fn cursor_update_requires_a_joined_document() {
        let state = test_state();
        let (session_id, _receiver) = connect(&state, "alice").await;

        let error = handle_cursor_update(&state, session_id, 3)
            .await
            .expect_err("cursor update without a document must fail");
        assert!(matches!(error, WsMessage::Error { .. }));
    }

    #[tokio::test]
    async fn cursor_update_records_presence_and_names_the_user() {
        let state = test_state();
        let doc_id =
            state.registry.create_document("abc".to_string()).await.expect("create should succeed");
        let (session_id, _receiver) = connect(&state, "alice").await;
        handle_join(&state, session_id, doc_id).await.expect("join should succeed");

        let (broadcast_doc, broadcast) = handle_cursor_update(&state, session_id, 2)
            .await
            .expect("cursor update should succeed");

        assert_eq!(broadcast_doc, doc_id);
        assert_eq!(
            broadcast,
            WsMessage::CursorUpdate { user_id: Some("alice".to_string()), position: 2 }
        );
        assert_eq!(state.presence.cursors(doc_id).await.get("alice"), Some(&2));
    }
}
