//! WebSocket handler: one connection, one room.
//!
//! DESIGN
//! ======
//! The upgrade consumes a one-time room ticket, so by the time a socket is
//! live the user is authenticated and authorized for exactly one board. The
//! connection joins that board's room and enters a `select!` loop:
//! - Incoming client frames → decode + dispatch by syscall prefix
//! - Frames fanned out by the room actor → forward to client
//! - Keepalive ping on a fixed interval; a peer silent for `idle_timeout`
//!   (no frames, no pongs) is treated as gone
//!
//! Handler functions validate input and talk to the room; they return an
//! `Outcome` and never write to the socket. Peer fan-out happens inside the
//! room actor.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → join room → send `session:connected` with the room snapshot
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch turns the Outcome into a reply (or nothing)
//! 4. Close or idle timeout → leave room (peers get `presence:left`) → cleanup

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use frames::document::{DocOp, SharedDocument};
use frames::event::{EventEnvelope, RoomEvent};
use frames::presence::{Participant, Presence, PresencePatch};
use frames::{Data, ErrorCode, Frame, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::services::access::{SessionUser, TicketClaims};
use crate::services::room::RoomHandle;
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide what the sender receives.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Fire-and-forget request; the sender gets nothing on success.
    Silent,
}

#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl ErrorCode for WsError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownSyscall(_) => "E_UNKNOWN_SYSCALL",
            Self::InvalidPayload(_) => "E_INVALID_PAYLOAD",
            Self::InvalidEvent(_) => "E_INVALID_EVENT",
        }
    }
}

/// Per-socket identity and room membership.
struct Connection {
    client_id: Uuid,
    user: SessionUser,
    room: RoomHandle,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let claims = match state.directory.consume_ticket(ticket).await {
        Ok(Some(claims)) => claims,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            error!(error = %e, "room ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, claims))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, claims: TicketClaims) {
    let client_id = Uuid::new_v4();
    let TicketClaims { user, room_id } = claims;

    // Per-connection queue for frames fanned out by the room.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_channel_capacity);

    let participant = Participant { client_id, user: user.participant_user(), presence: Presence::default() };
    let (room, snapshot) = match state.rooms.join(&room_id, participant.clone(), client_tx).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(%client_id, room_id, error = %e, "ws: room join failed");
            return;
        }
    };

    let welcome = Frame::request("session:connected", Data::new())
        .with_room_id(room_id.clone())
        .with_data("client_id", client_id.to_string())
        .with_data("user", to_json(&participant.user))
        .with_data("room_id", room_id.clone())
        .with_data("participants", to_json(&snapshot.participants))
        .with_data("document", to_json(&snapshot.document));

    info!(%client_id, user_id = %user.id, room_id, "ws: client connected");
    let conn = Connection { client_id, user, room };

    if send_frame(&mut socket, &welcome).await.is_ok() {
        let mut ping = tokio::time::interval(state.config.ping_interval);
        ping.tick().await;
        let mut last_seen = Instant::now();

        'conn: loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    last_seen = Instant::now();
                    let decoded = match msg {
                        Message::Binary(bytes) => frames::decode_frame(&bytes).map_err(|e| e.to_string()),
                        Message::Text(text) => serde_json::from_str::<Frame>(text.as_str()).map_err(|e| e.to_string()),
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    let replies = match decoded {
                        Ok(req) => process_frame(&state, &conn, req).await,
                        Err(e) => {
                            warn!(%client_id, error = %e, "ws: invalid inbound frame");
                            vec![Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid frame: {e}"))]
                        }
                    };
                    for frame in &replies {
                        if send_frame(&mut socket, frame).await.is_err() {
                            break 'conn;
                        }
                    }
                }
                Some(frame) = client_rx.recv() => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() >= state.config.idle_timeout {
                        warn!(%client_id, room_id, idle_ms = last_seen.elapsed().as_millis(), "ws: idle peer dropped");
                        break;
                    }
                    if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    state.rooms.leave(&room_id, client_id).await;
    state.rate_limiter.forget(client_id);
    info!(%client_id, room_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Dispatch one inbound frame and return the frames for the sender.
///
/// Kept separate from the socket so tests can drive dispatch directly.
async fn process_frame(state: &AppState, conn: &Connection, mut req: Frame) -> Vec<Frame> {
    // Stamp the authenticated identity and room; client values are not trusted.
    req.from = Some(conn.user.id.to_string());
    req.room_id = Some(conn.room.room_id().to_owned());

    let prefix = req.prefix();
    if prefix == "presence" {
        debug!(client_id = %conn.client_id, syscall = %req.syscall, "ws: recv frame");
    } else {
        info!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let result = match prefix {
        "presence" => handle_presence(conn, &req).await,
        "event" => handle_event(state, conn, &req).await,
        "room" => handle_room(conn, &req).await,
        "doc" => handle_doc(state, conn, &req).await,
        _ => Err(req.error_from(&WsError::UnknownSyscall(req.syscall.clone()))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

fn parse<T: DeserializeOwned>(req: &Frame, value: Option<&Value>) -> Result<T, Frame> {
    let value = value.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| req.error_from(&WsError::InvalidPayload(e.to_string())))
}

fn reply_of(key: &str, value: &impl Serialize) -> Outcome {
    let mut data = Data::new();
    data.insert(key.into(), to_json(value));
    Outcome::Reply(data)
}

fn to_json(value: &impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}

fn check_rate(state: &AppState, conn: &Connection, req: &Frame) -> Result<(), Frame> {
    state
        .rate_limiter
        .check_and_record(conn.client_id)
        .map_err(|e| req.error_from(&e))
}

// =============================================================================
// PRESENCE
// =============================================================================

async fn handle_presence(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "update" => {
            let patch: PresencePatch = parse(req, Some(&req.data))?;
            patch.validate().map_err(|e| req.error_from(&e))?;
            if !patch.is_empty() {
                conn.room
                    .update_presence(conn.client_id, patch)
                    .await
                    .map_err(|e| req.error_from(&e))?;
            }
            Ok(Outcome::Silent)
        }
        _ => Err(req.error_from(&WsError::UnknownSyscall(req.syscall.clone()))),
    }
}

// =============================================================================
// EVENTS
// =============================================================================

async fn handle_event(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "publish" => {
            check_rate(state, conn, req)?;
            let event: RoomEvent = serde_json::from_value(req.data.clone())
                .map_err(|e| req.error_from(&WsError::InvalidEvent(e.to_string())))?;
            let envelope = EventEnvelope::new(event, conn.user.id, frames::now_ms());
            debug!(client_id = %conn.client_id, kind = envelope.event.kind(), "ws: event published");
            conn.room
                .publish(conn.client_id, envelope)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Silent)
        }
        _ => Err(req.error_from(&WsError::UnknownSyscall(req.syscall.clone()))),
    }
}

// =============================================================================
// ROOM
// =============================================================================

async fn handle_room(conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "snapshot" => {
            let snapshot = conn.room.snapshot().await.map_err(|e| req.error_from(&e))?;
            let mut data = Data::new();
            data.insert("participants".into(), to_json(&snapshot.participants));
            data.insert("document".into(), to_json(&snapshot.document));
            Ok(Outcome::Reply(data))
        }
        _ => Err(req.error_from(&WsError::UnknownSyscall(req.syscall.clone()))),
    }
}

// =============================================================================
// SHARED DOCUMENT
// =============================================================================

async fn handle_doc(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.op() {
        "get" => {
            let snapshot = conn.room.snapshot().await.map_err(|e| req.error_from(&e))?;
            Ok(reply_of("document", &snapshot.document))
        }
        "seed" => {
            check_rate(state, conn, req)?;
            let document: SharedDocument = parse(req, req.field("document"))?;
            let document = conn
                .room
                .seed(conn.client_id, document)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(reply_of("document", &document))
        }
        "apply" => {
            check_rate(state, conn, req)?;
            let op: DocOp = parse(req, req.field("op"))?;
            let change = conn
                .room
                .apply(conn.client_id, op)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(reply_of("change", &change))
        }
        _ => Err(req.error_from(&WsError::UnknownSyscall(req.syscall.clone()))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    if frame.status == Status::Error {
        let code = frame.field_str(frames::FRAME_CODE).unwrap_or("-");
        let message = frame.field_str(frames::FRAME_MESSAGE).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else if frame.prefix() == "presence" {
        debug!(id = %frame.id, syscall = %frame.syscall, "ws: send frame");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }

    socket
        .send(Message::Binary(frames::encode_frame(frame).into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
