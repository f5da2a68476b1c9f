use crate::auth::validate_token;
use crate::db::{AuthRepo, Role, UserInfo};
use crate::ephemeral::{BlockLockManager, IdempotencyGuard, PresenceStore};
use crate::error::SubmitError;
use crate::sequencer::OperationSequencer;
use crate::sync::protocol::{
    AwarenessBroadcast, AwarenessData, BlockEvent, BlockRef, ClientEnvelope, ClientMessage,
    CursorBroadcast, CursorData, InitialSync, JoinedUser, OperationBroadcast, OperationSubmit,
    RelayedOperation, ServerMessage, TypingEvent, TypingRef, UserRef,
};
use crate::sync::{ClientConnection, RoomRegistry, Session};
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Close code for a connection that failed authentication
const CLOSE_UNAUTHENTICATED: u16 = 4001;
/// Close code for an authenticated user without view access
const CLOSE_FORBIDDEN: u16 = 4003;
/// Close code for a server-side failure during connection setup
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Presentation colors assigned to sessions
const SESSION_COLORS: [&str; 8] = [
    "#ef4444", "#f59e0b", "#10b981", "#3b82f6", "#6366f1", "#8b5cf6", "#ec4899", "#f97316",
];

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Document id to attach to
    pub doc: String,
    /// Auth token
    pub token: Option<String>,
}

/// Shared state for the WebSocket gateway
#[derive(Clone)]
pub struct WsState {
    pub auth: Arc<AuthRepo>,
    pub sequencer: Arc<OperationSequencer>,
    pub presence: Arc<PresenceStore>,
    pub locks: Arc<BlockLockManager>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub rooms: Arc<RoomRegistry>,
    pub idle_timeout: Duration,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Handle an established WebSocket connection through its whole lifecycle:
/// authenticate, authorize, join, serve, tear down.
async fn handle_socket(mut socket: WebSocket, state: WsState, query: WsQuery) {
    let (user, role) = match authorize(&state, &query) {
        Ok(ok) => ok,
        Err((code, reason)) => {
            warn!(
                "WebSocket rejected for document {}: {}",
                query.doc, reason
            );
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };
    let document_id = query.doc;

    let color = pick_color();
    let session = Session::new(&document_id, &user.id, &user.display_name, &color);
    let session_id = session.id.clone();

    // Subscribe before reading document state so no committed operation can
    // fall between the initial sync and the first relayed frame.
    let room = state.rooms.get_or_create_room(&document_id).await;
    let mut connection = ClientConnection::new(session, room.clone());

    let document_state = match state.sequencer.document_state(&document_id) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load state for document {}: {}", document_id, e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INTERNAL_ERROR,
                    reason: "internal error".into(),
                })))
                .await;
            drop(connection);
            state.rooms.maybe_remove_room(&document_id).await;
            return;
        }
    };

    state
        .presence
        .join(&document_id, &user.id, &user.display_name, &color);
    let active_users = state.presence.list_active(&document_id);

    info!(
        "WebSocket connected: user={}, document={}, connections={}",
        user.id,
        document_id,
        room.connection_count()
    );

    let established = ServerMessage::ConnectionEstablished {
        data: InitialSync {
            session_id,
            user_color: color,
            document_state,
            active_users,
        },
    };
    run_session(&state, &mut connection, role, socket, established).await;

    // Teardown. Held block locks are deliberately not released here; they
    // lapse at lease expiry.
    state.presence.leave(&document_id, &user.id);
    connection.publish(&ServerMessage::UserLeft {
        data: UserRef {
            user_id: user.id.clone(),
        },
    });

    info!(
        "WebSocket disconnected: user={}, document={}",
        user.id, document_id
    );

    drop(connection);
    state.rooms.maybe_remove_room(&document_id).await;
}

/// Resolve the connecting client to a user and a document role
fn authorize(state: &WsState, query: &WsQuery) -> Result<(UserInfo, Role), (u16, &'static str)> {
    let user = query
        .token
        .as_deref()
        .and_then(|token| validate_token(&state.auth, token))
        .ok_or((CLOSE_UNAUTHENTICATED, "unauthenticated"))?;

    // A missing document and a missing membership are indistinguishable to
    // the client: both are forbidden.
    let role = state
        .auth
        .document_role(&query.doc, &user.id)
        .ok()
        .flatten()
        .ok_or((CLOSE_FORBIDDEN, "forbidden"))?;

    Ok((user, role))
}

/// Serve one connection until it closes, errors, or idles out
async fn run_session(
    state: &WsState,
    connection: &mut ClientConnection,
    role: Role,
    socket: WebSocket,
    established: ServerMessage,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if send_message(&mut ws_tx, &established).await.is_err() {
        error!("Failed to send initial sync to {}", connection.session.id);
        return;
    }

    let session = &connection.session;
    connection.publish(&ServerMessage::UserJoined {
        data: JoinedUser {
            user_id: session.user_id.clone(),
            display_name: session.display_name.clone(),
            color: session.color.clone(),
            session_id: session.id.clone(),
        },
    });

    let idle = tokio::time::sleep(state.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Inbound messages, processed strictly in arrival order
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        connection.session.touch();
                        idle.as_mut().reset(tokio::time::Instant::now() + state.idle_timeout);
                        for reply in handle_frame(state, connection, role, text.as_str()).await {
                            if send_message(&mut ws_tx, &reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        connection.session.touch();
                        idle.as_mut().reset(tokio::time::Instant::now() + state.idle_timeout);
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        return;
                    }
                    Err(e) => {
                        debug!("WebSocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }

            // Frames fanned out by other sessions in the room
            Some(frame) = connection.recv_broadcast() => {
                if ws_tx.send(Message::Text(frame.as_str().into())).await.is_err() {
                    return;
                }
            }

            _ = &mut idle => {
                info!(
                    "Closing idle session {} ({}s since last activity)",
                    connection.session.id,
                    connection.session.idle_seconds()
                );
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }

            else => return,
        }
    }
}

/// Parse and dispatch one inbound frame, returning the replies for the sender
async fn handle_frame(
    state: &WsState,
    connection: &ClientConnection,
    role: Role,
    text: &str,
) -> Vec<ServerMessage> {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(
                "Malformed message from session {}: {}",
                connection.session.id, e
            );
            return vec![ServerMessage::error(format!("Invalid message: {e}"))];
        }
    };

    // At-least-once absorption: a retransmitted message id is dropped
    // silently, not answered with an error.
    if let Some(id) = envelope.id.as_deref() {
        if state.idempotency.is_duplicate(id) {
            debug!("Duplicate message {} ignored", id);
            return Vec::new();
        }
        state.idempotency.mark_processed(id);
    }

    match envelope.message {
        ClientMessage::Operation(submit) => {
            handle_operation(state, connection, role, envelope.id, submit).await
        }
        ClientMessage::Cursor(cursor) => handle_cursor(state, connection, cursor),
        ClientMessage::Awareness(awareness) => handle_awareness(state, connection, awareness),
        ClientMessage::BlockLock(block) => handle_block_lock(state, connection, role, block),
        ClientMessage::BlockUnlock(block) => handle_block_unlock(state, connection, role, block),
        ClientMessage::TypingStart(typing) => handle_typing(connection, typing, true),
        ClientMessage::TypingStop(typing) => handle_typing(connection, typing, false),
        ClientMessage::Ping => handle_ping(state, connection),
    }
}

/// Sequence an operation, relay it to the group, and ack the sender
async fn handle_operation(
    state: &WsState,
    connection: &ClientConnection,
    role: Role,
    message_id: Option<String>,
    submit: OperationSubmit,
) -> Vec<ServerMessage> {
    if !role.can_edit() {
        return vec![ServerMessage::error(
            "You do not have edit access to this document",
        )];
    }

    let session = &connection.session;
    let result = state
        .sequencer
        .submit(
            &session.document_id,
            &session.user_id,
            &submit.operation,
            message_id.as_deref(),
        )
        .await;

    match result {
        Ok(committed) => {
            connection.publish(&ServerMessage::Operation {
                data: OperationBroadcast {
                    operation: RelayedOperation {
                        id: committed.operation_id,
                        payload: committed.payload_hex,
                    },
                    version: committed.version,
                    user_id: session.user_id.clone(),
                },
            });
            vec![ServerMessage::OperationAck {
                id: message_id,
                version: committed.version,
            }]
        }
        Err(SubmitError::InvalidOperation(message)) => vec![ServerMessage::error(message)],
        Err(SubmitError::DuplicateOperation) => {
            // Replay of an already-sequenced operation
            debug!(
                "Duplicate operation from user {} on document {}",
                session.user_id, session.document_id
            );
            vec![ServerMessage::error("Duplicate operation")]
        }
        Err(SubmitError::DocumentNotFound) => vec![ServerMessage::error("Document not found")],
        Err(SubmitError::Storage(e)) => {
            error!(
                "Operation storage failure on document {}: {}",
                session.document_id, e
            );
            vec![ServerMessage::error("Failed to process operation")]
        }
    }
}

fn handle_cursor(
    state: &WsState,
    connection: &ClientConnection,
    cursor: CursorData,
) -> Vec<ServerMessage> {
    let session = &connection.session;
    let blob = serde_json::to_value(&cursor).unwrap_or_default();
    state
        .presence
        .update_cursor(&session.document_id, &session.user_id, blob);

    connection.publish(&ServerMessage::CursorUpdate {
        data: CursorBroadcast {
            user_id: session.user_id.clone(),
            cursor,
        },
    });
    Vec::new()
}

fn handle_awareness(
    state: &WsState,
    connection: &ClientConnection,
    awareness: AwarenessData,
) -> Vec<ServerMessage> {
    let session = &connection.session;
    state
        .presence
        .update_awareness(&session.document_id, &session.user_id, awareness.state.clone());

    connection.publish(&ServerMessage::Awareness {
        data: AwarenessBroadcast {
            user_id: session.user_id.clone(),
            state: awareness.state,
        },
    });
    Vec::new()
}

fn handle_block_lock(
    state: &WsState,
    connection: &ClientConnection,
    role: Role,
    block: BlockRef,
) -> Vec<ServerMessage> {
    if !role.can_edit() {
        return vec![ServerMessage::error(
            "You do not have edit access to this document",
        )];
    }

    let session = &connection.session;
    if state
        .locks
        .acquire(&session.document_id, &block.block_id, &session.user_id)
    {
        let event = BlockEvent {
            block_id: block.block_id,
            user_id: session.user_id.clone(),
        };
        connection.publish(&ServerMessage::BlockLocked { data: event.clone() });
        vec![ServerMessage::BlockLocked { data: event }]
    } else {
        vec![ServerMessage::error(format!(
            "Block {} is already locked",
            block.block_id
        ))]
    }
}

fn handle_block_unlock(
    state: &WsState,
    connection: &ClientConnection,
    role: Role,
    block: BlockRef,
) -> Vec<ServerMessage> {
    if !role.can_edit() {
        return vec![ServerMessage::error(
            "You do not have edit access to this document",
        )];
    }

    let session = &connection.session;
    // Owner-checked release: someone else's lock (or an expired one) stays
    // untouched and nothing is announced.
    if state
        .locks
        .release(&session.document_id, &block.block_id, &session.user_id)
    {
        let event = BlockEvent {
            block_id: block.block_id,
            user_id: session.user_id.clone(),
        };
        connection.publish(&ServerMessage::BlockUnlocked { data: event.clone() });
        vec![ServerMessage::BlockUnlocked { data: event }]
    } else {
        Vec::new()
    }
}

fn handle_typing(
    connection: &ClientConnection,
    typing: TypingRef,
    started: bool,
) -> Vec<ServerMessage> {
    let event = TypingEvent {
        user_id: connection.session.user_id.clone(),
        block_id: typing.block_id,
    };
    let message = if started {
        ServerMessage::TypingStart { data: event }
    } else {
        ServerMessage::TypingStop { data: event }
    };
    connection.publish(&message);
    Vec::new()
}

fn handle_ping(state: &WsState, connection: &ClientConnection) -> Vec<ServerMessage> {
    let session = &connection.session;
    state
        .presence
        .update_activity(&session.document_id, &session.user_id);

    vec![ServerMessage::Pong {
        timestamp: Utc::now().to_rfc3339(),
    }]
}

fn pick_color() -> String {
    SESSION_COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("#6366f1")
        .to_string()
}

async fn send_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}
