//! Room registry and per-room actors.
//!
//! ARCHITECTURE
//! ============
//! One room per board id. Each room is a task that exclusively owns its
//! participants, their presence, and the shared document; connections talk
//! to it through a `RoomHandle` (an `mpsc` command queue). Commands from one
//! connection are processed in the order they were sent, which gives the
//! per-sender ordering presence and events promise.
//!
//! Fan-out goes to each connection's bounded outbound queue via `try_send`.
//! A peer whose queue is full misses that frame; the room never waits on a
//! slow socket.
//!
//! LIFECYCLE
//! =========
//! 1. First `RoomRegistry::join` for a board spawns the actor
//! 2. Joins and leaves are announced to the remaining peers
//! 3. The leave that empties the room stops the actor and unregisters it
//!
//! The registry lock is held across join and leave so a join can never land
//! on an actor that is shutting down.

use std::collections::HashMap;
use std::sync::Arc;

use frames::document::{DocChange, DocError, DocOp, SharedDocument};
use frames::event::EventEnvelope;
use frames::presence::{Participant, PresencePatch};
use frames::{Data, ErrorCode, Frame};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ROOM_COMMAND_CAPACITY: usize = 1024;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room is closed")]
    Closed,
    #[error(transparent)]
    Doc(#[from] DocError),
}

impl ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "E_ROOM_CLOSED",
            Self::Doc(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Everything a newly joined connection needs to render the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoomSnapshot {
    pub participants: Vec<Participant>,
    pub document: SharedDocument,
}

enum RoomCommand {
    Join {
        participant: Participant,
        tx: mpsc::Sender<Frame>,
        reply: oneshot::Sender<RoomSnapshot>,
    },
    Leave {
        client_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
    UpdatePresence {
        client_id: Uuid,
        patch: PresencePatch,
    },
    Publish {
        client_id: Uuid,
        envelope: EventEnvelope,
    },
    ApplyOp {
        client_id: Uuid,
        op: DocOp,
        reply: oneshot::Sender<Result<DocChange, DocError>>,
    },
    Seed {
        client_id: Uuid,
        document: SharedDocument,
        reply: oneshot::Sender<SharedDocument>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable address of one room actor.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: Arc<str>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.tx.send(command).await.map_err(|_| RoomError::Closed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| RoomError::Closed)
    }

    async fn join(&self, participant: Participant, tx: mpsc::Sender<Frame>) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Join { participant, tx, reply })
            .await
    }

    async fn leave(&self, client_id: Uuid) -> Result<usize, RoomError> {
        self.request(|reply| RoomCommand::Leave { client_id, reply })
            .await
    }

    /// Merge a presence patch into the sender's record and fan it out.
    ///
    /// # Errors
    ///
    /// [`RoomError::Closed`] if the room has shut down.
    pub async fn update_presence(&self, client_id: Uuid, patch: PresencePatch) -> Result<(), RoomError> {
        self.send(RoomCommand::UpdatePresence { client_id, patch })
            .await
    }

    /// Deliver an event to every participant except the sender.
    ///
    /// # Errors
    ///
    /// [`RoomError::Closed`] if the room has shut down.
    pub async fn publish(&self, client_id: Uuid, envelope: EventEnvelope) -> Result<(), RoomError> {
        self.send(RoomCommand::Publish { client_id, envelope })
            .await
    }

    /// Apply a document op; peers receive the resulting change.
    ///
    /// # Errors
    ///
    /// [`RoomError::Doc`] when the op is rejected, [`RoomError::Closed`] if
    /// the room has shut down.
    pub async fn apply(&self, client_id: Uuid, op: DocOp) -> Result<DocChange, RoomError> {
        let result = self
            .request(|reply| RoomCommand::ApplyOp { client_id, op, reply })
            .await?;
        Ok(result?)
    }

    /// Seed the document if it is still empty. Returns the resulting document.
    ///
    /// # Errors
    ///
    /// [`RoomError::Closed`] if the room has shut down.
    pub async fn seed(&self, client_id: Uuid, document: SharedDocument) -> Result<SharedDocument, RoomError> {
        self.request(|reply| RoomCommand::Seed { client_id, document, reply })
            .await
    }

    /// # Errors
    ///
    /// [`RoomError::Closed`] if the room has shut down.
    pub async fn snapshot(&self) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply })
            .await
    }
}

// =============================================================================
// ACTOR
// =============================================================================

struct Member {
    participant: Participant,
    tx: mpsc::Sender<Frame>,
}

struct Room {
    room_id: Arc<str>,
    /// Join order. Rooms are small, so lookups are linear.
    members: Vec<Member>,
    document: SharedDocument,
}

fn data_of(key: &str, value: &impl Serialize) -> Data {
    let mut data = Data::new();
    data.insert(key.into(), serde_json::to_value(value).unwrap_or_default());
    data
}

impl Room {
    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            participants: self.members.iter().map(|m| m.participant.clone()).collect(),
            document: self.document.clone(),
        }
    }

    fn member_mut(&mut self, client_id: Uuid) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.participant.client_id == client_id)
    }

    fn user_of(&self, client_id: Uuid) -> Option<Uuid> {
        self.members
            .iter()
            .find(|m| m.participant.client_id == client_id)
            .map(|m| m.participant.user.id)
    }

    /// Best-effort fan-out of a server notification.
    fn notify(&self, syscall: &str, data: Data, from: Option<Uuid>, exclude: Option<Uuid>) {
        let mut frame = Frame::request(syscall, data).with_room_id(&*self.room_id);
        if let Some(user_id) = from {
            frame = frame.with_from(user_id.to_string());
        }

        for member in &self.members {
            let client_id = member.participant.client_id;
            if exclude == Some(client_id) {
                continue;
            }
            match member.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(room_id = %self.room_id, %client_id, syscall, "room: peer queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(room_id = %self.room_id, %client_id, syscall, "room: peer queue closed");
                }
            }
        }
    }

    /// Returns `false` once the room is empty and the actor should stop.
    fn handle(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join { participant, tx, reply } => {
                let client_id = participant.client_id;
                self.members
                    .retain(|m| m.participant.client_id != client_id);
                self.notify(
                    "presence:joined",
                    data_of("participant", &participant),
                    Some(participant.user.id),
                    Some(client_id),
                );
                self.members.push(Member { participant, tx });
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Leave { client_id, reply } => {
                if let Some(index) = self
                    .members
                    .iter()
                    .position(|m| m.participant.client_id == client_id)
                {
                    let member = self.members.remove(index);
                    let user_id = member.participant.user.id;
                    let mut data = Data::new();
                    data.insert("client_id".into(), Value::String(client_id.to_string()));
                    data.insert("user_id".into(), Value::String(user_id.to_string()));
                    self.notify("presence:left", data, Some(user_id), None);
                }
                let remaining = self.members.len();
                let _ = reply.send(remaining);
                if remaining == 0 {
                    return false;
                }
            }
            RoomCommand::UpdatePresence { client_id, patch } => {
                let Some(member) = self.member_mut(client_id) else {
                    return true;
                };
                member.participant.presence.apply(patch);
                let participant = member.participant.clone();
                self.notify(
                    "presence:updated",
                    data_of("participant", &participant),
                    Some(participant.user.id),
                    Some(client_id),
                );
            }
            RoomCommand::Publish { client_id, envelope } => {
                let Value::Object(data) = serde_json::to_value(&envelope).unwrap_or_default() else {
                    return true;
                };
                self.notify("room:event", data, Some(envelope.user_id), Some(client_id));
            }
            RoomCommand::ApplyOp { client_id, op, reply } => {
                let result = self.document.apply(op);
                if let Ok(change) = &result {
                    self.notify("doc:changed", data_of("change", change), self.user_of(client_id), Some(client_id));
                }
                let _ = reply.send(result);
            }
            RoomCommand::Seed { client_id, document, reply } => {
                if self.document.is_empty() {
                    self.document.seed(document);
                    self.notify(
                        "doc:seeded",
                        data_of("document", &self.document),
                        self.user_of(client_id),
                        Some(client_id),
                    );
                }
                let _ = reply.send(self.document.clone());
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        true
    }
}

async fn run_room(mut room: Room, mut rx: mpsc::Receiver<RoomCommand>) {
    while let Some(command) = rx.recv().await {
        if !room.handle(command) {
            break;
        }
    }
    info!(room_id = %room.room_id, "room: actor stopped");
}

fn spawn_room(room_id: &str) -> RoomHandle {
    let (tx, rx) = mpsc::channel(ROOM_COMMAND_CAPACITY);
    let room_id: Arc<str> = Arc::from(room_id);
    let room = Room { room_id: room_id.clone(), members: Vec::new(), document: SharedDocument::default() };
    tokio::spawn(run_room(room, rx));
    info!(%room_id, "room: actor started");
    RoomHandle { room_id, tx }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Live rooms keyed by board id.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, RoomHandle>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `room_id`, spawning its actor if needed.
    ///
    /// # Errors
    ///
    /// [`RoomError::Closed`] if the actor died before acknowledging.
    pub async fn join(
        &self,
        room_id: &str,
        participant: Participant,
        tx: mpsc::Sender<Frame>,
    ) -> Result<(RoomHandle, RoomSnapshot), RoomError> {
        let mut rooms = self.rooms.lock().await;
        let handle = match rooms.get(room_id) {
            Some(handle) if !handle.tx.is_closed() => handle.clone(),
            _ => {
                let handle = spawn_room(room_id);
                rooms.insert(room_id.to_owned(), handle.clone());
                handle
            }
        };

        let client_id = participant.client_id;
        let snapshot = handle.join(participant, tx).await?;
        info!(room_id, %client_id, participants = snapshot.participants.len(), "room: client joined");
        Ok((handle, snapshot))
    }

    /// Remove a connection. Tears the room down when it was the last one.
    pub async fn leave(&self, room_id: &str, client_id: Uuid) {
        let mut rooms = self.rooms.lock().await;
        let Some(handle) = rooms.get(room_id).cloned() else {
            return;
        };

        let remaining = handle.leave(client_id).await.unwrap_or(0);
        info!(room_id, %client_id, remaining, "room: client left");
        if remaining == 0 {
            rooms.remove(room_id);
            info!(room_id, "room: torn down");
        }
    }

    /// Current participants, empty if the room is not live.
    pub async fn participants(&self, room_id: &str) -> Vec<Participant> {
        let handle = self.rooms.lock().await.get(room_id).cloned();
        let Some(handle) = handle else {
            return Vec::new();
        };
        handle
            .snapshot()
            .await
            .map(|s| s.participants)
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
