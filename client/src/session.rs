//! Room session: one live connection to a board room.
//!
//! DESIGN
//! ======
//! `connect` trades the caller's session for a grant, opens the socket, and
//! waits for `session:connected`. It then spawns one IO task that owns the
//! socket and returns a `RoomSession` handle. The handle mirrors room state
//! (peers, own presence, shared document) behind a mutex so reads are
//! synchronous, and talks to the IO task over an unbounded channel so no
//! publish ever blocks the caller.
//!
//! Presence pushes are throttled in the IO task: the first change goes out
//! immediately, later changes inside the throttle window are merged and sent
//! once at the window's end, so the latest state always reaches peers.
//!
//! RECONNECT
//! =========
//! On transport loss the IO task clears peers, then retries with exponential
//! backoff, fetching a fresh grant each time. After reconnecting it re-pushes
//! the full local presence and fires a `RefreshTarget::All` refresh, since
//! events sent while offline are never replayed. An `Unauthorized` grant or
//! an exhausted attempt budget ends the session with `SessionEvent::Closed`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::document::{DocChange, DocOp, SharedDocument};
use frames::event::{EventEnvelope, RoomEvent};
use frames::presence::{DragState, Participant, ParticipantUser, Point, Presence, PresencePatch};
use frames::{Data, Frame, Status};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::refresh::{CallbackId, RefreshRequest, RefreshRouter};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Everything observable about a session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { client_id: Uuid },
    /// Transport lost; presence and events are unavailable until reconnect.
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ParticipantJoined(Participant),
    PresenceUpdated(Participant),
    ParticipantLeft { client_id: Uuid, user_id: Uuid },
    Event(EventEnvelope),
    DocumentChanged(DocChange),
    /// The local document was replaced wholesale (seed or resync).
    DocumentReplaced,
    /// A local op was refused by the room; the document is being resynced.
    OpRejected { code: String, message: String },
    /// The session is over and will not reconnect.
    Closed { reason: String },
}

enum Command {
    Presence(PresencePatch),
    Publish(RoomEvent),
    Apply(DocOp),
    Seed(SharedDocument),
    Resync,
    Close,
}

// =============================================================================
// SHARED STATE
// =============================================================================

#[derive(Default)]
struct SessionState {
    client_id: Option<Uuid>,
    user: Option<ParticipantUser>,
    connected: bool,
    /// Peers in join order. Never contains this connection.
    peers: Vec<Participant>,
    presence: Presence,
    document: SharedDocument,
}

struct Shared {
    state: Mutex<SessionState>,
    router: RefreshRouter,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        self.events.send(event).unwrap_or_default();
    }

    /// Adopt a fresh `session:connected` snapshot. Local presence survives.
    /// Returns the local document when the room lost its copy and should be
    /// re-seeded.
    fn install(&self, welcome: Welcome) -> Option<SharedDocument> {
        let mut state = self.lock();
        state.client_id = Some(welcome.client_id);
        state.user = Some(welcome.user);
        state.connected = true;
        state.peers = welcome
            .participants
            .into_iter()
            .filter(|p| p.client_id != welcome.client_id)
            .collect();

        if welcome.document.is_empty() && !state.document.is_empty() {
            return Some(state.document.clone());
        }
        state.document = welcome.document;
        None
    }

    fn mark_lost(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.peers.clear();
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

struct Welcome {
    client_id: Uuid,
    user: ParticipantUser,
    participants: Vec<Participant>,
    document: SharedDocument,
}

fn field<T: DeserializeOwned>(frame: &Frame, key: &'static str) -> Result<T, ClientError> {
    let value = frame.field(key).cloned().ok_or(ClientError::MissingField(key))?;
    Ok(serde_json::from_value(value)?)
}

fn parse_welcome(frame: &Frame) -> Result<Welcome, ClientError> {
    Ok(Welcome {
        client_id: field(frame, "client_id")?,
        user: field(frame, "user")?,
        participants: field(frame, "participants")?,
        document: field(frame, "document")?,
    })
}

async fn recv_frame(stream: &mut WsStream) -> Result<Frame, ClientError> {
    loop {
        let Some(message) = stream.next().await else {
            return Err(ClientError::WsClosed);
        };
        match message.map_err(|e| ClientError::WsConnect(Box::new(e)))? {
            Message::Binary(bytes) => return frames::decode_frame(&bytes).map_err(ClientError::from),
            Message::Text(text) => return serde_json::from_str(text.as_str()).map_err(ClientError::from),
            Message::Close(_) => return Err(ClientError::WsClosed),
            _ => {}
        }
    }
}

async fn open_room(
    config: &ClientConfig,
    auth: &dyn AuthProvider,
    room_id: &str,
) -> Result<(WsStream, Welcome), ClientError> {
    let grant = auth.grant(room_id).await?;
    let url = config.ws_url(&grant.ticket)?;
    let (mut stream, _) = connect_async(url).await.map_err(ClientError::from_ws)?;

    let welcome = tokio::time::timeout(config.connect_timeout, async {
        loop {
            let frame = recv_frame(&mut stream).await?;
            if frame.syscall == "session:connected" {
                return parse_welcome(&frame);
            }
        }
    })
    .await
    .map_err(|_| ClientError::Timeout)??;

    Ok((stream, welcome))
}

// =============================================================================
// CONNECT
// =============================================================================

/// Join `room_id`. Fails without retrying when access is refused.
///
/// # Errors
///
/// [`ClientError::Unauthorized`] when the grant or upgrade is rejected;
/// transport errors when the server cannot be reached.
pub async fn connect(
    config: ClientConfig,
    room_id: &str,
    auth: Arc<dyn AuthProvider>,
) -> Result<RoomSession, ClientError> {
    let (stream, welcome) = open_room(&config, auth.as_ref(), room_id).await?;
    let client_id = welcome.client_id;

    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let shared = Arc::new(Shared { state: Mutex::new(SessionState::default()), router: RefreshRouter::new(), events });
    shared.install(welcome);
    info!(room_id, %client_id, peers = shared.lock().peers.len(), "session: connected");

    let (commands, rx) = mpsc::unbounded_channel();
    let io = SessionIo { config, room_id: room_id.to_owned(), auth, shared: shared.clone() };
    let task = tokio::spawn(io.run(stream, rx));

    Ok(RoomSession { room_id: room_id.to_owned(), shared, commands, task })
}

// =============================================================================
// HANDLE
// =============================================================================

/// Handle to a live room. Pass it explicitly to whatever needs the room.
pub struct RoomSession {
    room_id: String,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RoomSession {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// This connection's client id. Changes after a reconnect.
    #[must_use]
    pub fn self_id(&self) -> Option<Uuid> {
        self.shared.lock().client_id
    }

    #[must_use]
    pub fn user(&self) -> Option<ParticipantUser> {
        self.shared.lock().user.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Snapshot of every other participant, in join order.
    #[must_use]
    pub fn others(&self) -> Vec<Participant> {
        self.shared.lock().peers.clone()
    }

    #[must_use]
    pub fn presence(&self) -> Presence {
        self.shared.lock().presence.clone()
    }

    #[must_use]
    pub fn document(&self) -> SharedDocument {
        self.shared.lock().document.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Register a refresh callback. Runs on the session's IO task.
    pub fn on_refresh(&self, callback: impl Fn(&RefreshRequest) + Send + Sync + 'static) -> CallbackId {
        self.shared.router.register(callback)
    }

    pub fn off_refresh(&self, id: CallbackId) -> bool {
        self.shared.router.unregister(id)
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    /// Apply a presence patch locally and queue it for peers. Invalid or
    /// offline updates are dropped.
    pub fn update_presence(&self, patch: PresencePatch) {
        if patch.is_empty() {
            return;
        }
        if let Err(e) = patch.validate() {
            debug!(error = %e, "session: presence patch dropped");
            return;
        }
        self.shared.lock().presence.apply(patch.clone());
        self.send(Command::Presence(patch));
    }

    pub fn move_cursor(&self, cursor: Option<Point>) {
        self.update_presence(PresencePatch { cursor: Some(cursor), ..PresencePatch::default() });
    }

    pub fn select_card(&self, card_id: Option<&str>) {
        self.update_presence(PresencePatch {
            selected_card_id: Some(card_id.map(ToOwned::to_owned)),
            ..PresencePatch::default()
        });
    }

    pub fn start_editing(&self, card_id: &str, field: &str) {
        self.update_presence(PresencePatch {
            editing_card_id: Some(Some(card_id.to_owned())),
            editing_field: Some(Some(field.to_owned())),
            ..PresencePatch::default()
        });
    }

    pub fn stop_editing(&self) {
        self.update_presence(PresencePatch {
            editing_card_id: Some(None),
            editing_field: Some(None),
            ..PresencePatch::default()
        });
    }

    pub fn start_drag(&self, drag: DragState) {
        self.update_presence(PresencePatch { drag: Some(Some(drag)), ..PresencePatch::default() });
    }

    pub fn end_drag(&self) {
        self.update_presence(PresencePatch { drag: Some(None), ..PresencePatch::default() });
    }

    // -------------------------------------------------------------------------
    // Events and document
    // -------------------------------------------------------------------------

    /// Fire-and-forget broadcast to every other participant.
    pub fn publish(&self, event: RoomEvent) {
        self.send(Command::Publish(event));
    }

    /// Apply `op` to the local document now and send it to the room.
    ///
    /// # Errors
    ///
    /// [`ClientError::Doc`] when the op does not apply locally; nothing is sent.
    pub fn apply(&self, op: DocOp) -> Result<DocChange, ClientError> {
        let change = self.shared.lock().document.apply(op.clone())?;
        self.send(Command::Apply(op));
        Ok(change)
    }

    /// Offer `document` as the room's initial content. Ignored by the room
    /// unless its document is empty; the reply replaces the local copy.
    pub fn seed(&self, document: SharedDocument) {
        self.send(Command::Seed(document));
    }

    /// Replace the local document with the room's copy.
    pub fn resync(&self) {
        self.send(Command::Resync);
    }

    /// Leave the room and stop the IO task.
    pub async fn disconnect(self) {
        self.commands.send(Command::Close).unwrap_or_default();
        if tokio::time::timeout(Duration::from_secs(2), self.task).await.is_err() {
            warn!(room_id = %self.room_id, "session: io task did not stop in time");
        }
    }

    fn send(&self, command: Command) {
        if !self.is_connected() {
            debug!(room_id = %self.room_id, "session: not connected, dropping");
            return;
        }
        if self.commands.send(command).is_err() {
            debug!(room_id = %self.room_id, "session: io task gone, dropping");
        }
    }
}

// =============================================================================
// IO TASK
// =============================================================================

enum Exit {
    Closed,
    Lost(String),
}

struct SessionIo {
    config: ClientConfig,
    room_id: String,
    auth: Arc<dyn AuthProvider>,
    shared: Arc<Shared>,
}

fn request(syscall: &str, key: &str, value: &impl Serialize) -> Frame {
    let mut data = Data::new();
    data.insert(key.into(), serde_json::to_value(value).unwrap_or_default());
    Frame::request(syscall, data)
}

fn presence_frame(patch: &PresencePatch) -> Frame {
    match serde_json::to_value(patch) {
        Ok(Value::Object(data)) => Frame::request("presence:update", data),
        _ => Frame::request("presence:update", Data::new()),
    }
}

fn publish_frame(event: &RoomEvent) -> Frame {
    match serde_json::to_value(event) {
        Ok(Value::Object(data)) => Frame::request("event:publish", data),
        _ => Frame::request("event:publish", Data::new()),
    }
}

async fn send_frame(stream: &mut WsStream, frame: &Frame) -> Result<(), ClientError> {
    stream
        .send(Message::Binary(frames::encode_frame(frame).into()))
        .await
        .map_err(|e| ClientError::WsConnect(Box::new(e)))
}

/// Sleep for `delay`, discarding commands. `false` if the session was closed.
async fn wait_or_close(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None | Some(Command::Close) => return false,
                Some(_) => {}
            },
        }
    }
}

impl SessionIo {
    async fn run(self, mut stream: WsStream, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            match self.drive(&mut stream, &mut commands).await {
                Exit::Closed => {
                    if let Err(e) = stream.close(None).await {
                        debug!(error = %e, "session: close handshake failed");
                    }
                    self.shared.mark_lost();
                    info!(room_id = %self.room_id, "session: disconnected");
                    self.shared.emit(SessionEvent::Closed { reason: "disconnected".to_owned() });
                    return;
                }
                Exit::Lost(reason) => {
                    warn!(room_id = %self.room_id, reason, "session: connection lost");
                    self.shared.mark_lost();
                    self.shared.emit(SessionEvent::Disconnected);
                }
            }

            match self.reconnect(&mut commands).await {
                Ok(next) => stream = next,
                Err(reason) => {
                    warn!(room_id = %self.room_id, reason, "session: giving up");
                    self.shared.emit(SessionEvent::Closed { reason });
                    return;
                }
            }
        }
    }

    /// Pump one connection until it is lost or the session is closed.
    async fn drive(&self, stream: &mut WsStream, commands: &mut mpsc::UnboundedReceiver<Command>) -> Exit {
        let throttle = self.config.presence_throttle;
        let mut pending: Option<PresencePatch> = None;
        let mut last_push: Option<Instant> = None;
        let mut flush_at: Option<Instant> = None;

        loop {
            let deadline = flush_at.unwrap_or_else(Instant::now);
            let mut outbox: Vec<Frame> = Vec::new();

            tokio::select! {
                msg = stream.next() => {
                    let decoded = match msg {
                        Some(Ok(Message::Binary(bytes))) => frames::decode_frame(&bytes).map_err(|e| e.to_string()),
                        Some(Ok(Message::Text(text))) => serde_json::from_str::<Frame>(text.as_str()).map_err(|e| e.to_string()),
                        Some(Ok(Message::Close(_))) | None => return Exit::Lost("closed by server".to_owned()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Exit::Lost(e.to_string()),
                    };
                    match decoded {
                        Ok(frame) => self.dispatch_frame(&frame, &mut outbox),
                        Err(e) => warn!(error = %e, "session: undecodable frame"),
                    }
                }
                cmd = commands.recv() => {
                    let frame = match cmd {
                        None | Some(Command::Close) => return Exit::Closed,
                        Some(Command::Presence(patch)) => {
                            match &mut pending {
                                Some(merged) => merged.merge(patch),
                                None => pending = Some(patch),
                            }
                            let now = Instant::now();
                            if let Some(at) = last_push {
                                if now.duration_since(at) < throttle {
                                    flush_at.get_or_insert(at + throttle);
                                    continue;
                                }
                            }
                            last_push = Some(now);
                            flush_at = None;
                            let Some(patch) = pending.take() else { continue };
                            presence_frame(&patch)
                        }
                        Some(Command::Publish(event)) => publish_frame(&event),
                        Some(Command::Apply(op)) => request("doc:apply", "op", &op),
                        Some(Command::Seed(document)) => request("doc:seed", "document", &document),
                        Some(Command::Resync) => Frame::request("doc:get", Data::new()),
                    };
                    outbox.push(frame);
                }
                () = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                    flush_at = None;
                    if let Some(patch) = pending.take() {
                        last_push = Some(Instant::now());
                        outbox.push(presence_frame(&patch));
                    }
                }
            }

            for frame in &outbox {
                if let Err(e) = send_frame(stream, frame).await {
                    return Exit::Lost(e.to_string());
                }
            }
        }
    }

    async fn reconnect(&self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<WsStream, String> {
        let policy = self.config.reconnect;
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            if !policy.allows(attempt) {
                return Err(format!("reconnect failed after {} attempts", attempt - 1));
            }
            let delay = policy.delay(attempt);
            self.shared.emit(SessionEvent::Reconnecting { attempt, delay });
            if !wait_or_close(delay, commands).await {
                return Err("disconnected".to_owned());
            }

            let (mut stream, welcome) = match open_room(&self.config, self.auth.as_ref(), &self.room_id).await {
                Ok(opened) => opened,
                Err(e) if e.is_fatal() => return Err(e.to_string()),
                Err(e) => {
                    warn!(room_id = %self.room_id, attempt, error = %e, "session: reconnect attempt failed");
                    continue;
                }
            };

            let client_id = welcome.client_id;
            let reseed = self.shared.install(welcome);
            let presence = self.shared.lock().presence.clone();

            let mut resume = Vec::new();
            if presence != Presence::default() {
                resume.push(presence_frame(&PresencePatch::replace_with(&presence)));
            }
            if let Some(document) = reseed {
                resume.push(request("doc:seed", "document", &document));
            }
            let mut resumed = true;
            for frame in &resume {
                if send_frame(&mut stream, frame).await.is_err() {
                    resumed = false;
                    break;
                }
            }
            if !resumed {
                self.shared.mark_lost();
                continue;
            }

            info!(room_id = %self.room_id, %client_id, attempt, "session: reconnected");
            self.shared.router.route_reconnect();
            self.shared.emit(SessionEvent::Connected { client_id });
            return Ok(stream);
        }
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    fn dispatch_frame(&self, frame: &Frame, outbox: &mut Vec<Frame>) {
        if self.handle_presence_frame(frame) {
            return;
        }
        if self.handle_event_frame(frame) {
            return;
        }
        if self.handle_doc_frame(frame, outbox) {
            return;
        }
        if frame.status == Status::Error {
            let code = frame.field_str(frames::FRAME_CODE).unwrap_or("-");
            warn!(syscall = %frame.syscall, code, message = frame.error_message().unwrap_or("-"), "session: request failed");
        } else if frame.syscall == "gateway:error" {
            warn!(data = %frame.data, "session: gateway error");
        }
    }

    fn handle_presence_frame(&self, frame: &Frame) -> bool {
        if frame.prefix() != "presence" || frame.status != Status::Request {
            return false;
        }

        match frame.op() {
            "joined" | "updated" => {
                let Ok(participant) = field::<Participant>(frame, "participant") else {
                    warn!(syscall = %frame.syscall, "session: presence frame without participant");
                    return true;
                };
                {
                    let mut state = self.shared.lock();
                    if state.client_id == Some(participant.client_id) {
                        return true;
                    }
                    match state.peers.iter_mut().find(|p| p.client_id == participant.client_id) {
                        Some(existing) => *existing = participant.clone(),
                        None => state.peers.push(participant.clone()),
                    }
                }
                if frame.op() == "joined" {
                    self.shared.emit(SessionEvent::ParticipantJoined(participant));
                } else {
                    self.shared.emit(SessionEvent::PresenceUpdated(participant));
                }
            }
            "left" => {
                let (client_id, user_id) = match (field::<Uuid>(frame, "client_id"), field::<Uuid>(frame, "user_id")) {
                    (Ok(client_id), Ok(user_id)) => (client_id, user_id),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "session: presence:left without valid ids");
                        return true;
                    }
                };
                self.shared.lock().peers.retain(|p| p.client_id != client_id);
                self.shared.emit(SessionEvent::ParticipantLeft { client_id, user_id });
            }
            _ => return false,
        }
        true
    }

    fn handle_event_frame(&self, frame: &Frame) -> bool {
        if frame.syscall != "room:event" || frame.status != Status::Request {
            return false;
        }
        if let Some(envelope) = self.shared.router.route_value(&frame.data) {
            self.shared.emit(SessionEvent::Event(envelope));
        }
        true
    }

    fn handle_doc_frame(&self, frame: &Frame, outbox: &mut Vec<Frame>) -> bool {
        match (frame.syscall.as_str(), frame.status) {
            ("doc:changed", Status::Request) => {
                let Ok(change) = field::<DocChange>(frame, "change") else {
                    warn!("session: doc:changed without change");
                    return true;
                };
                self.shared.lock().document.apply_remote(&change);
                self.shared.emit(SessionEvent::DocumentChanged(change));
            }
            ("doc:apply", Status::Done) => {
                // Reconcile the optimistic apply with the room's versions.
                if let Ok(change) = field::<DocChange>(frame, "change") {
                    self.shared.lock().document.apply_remote(&change);
                }
            }
            ("doc:apply", Status::Error) => {
                let code = frame.field_str(frames::FRAME_CODE).unwrap_or("-").to_owned();
                let message = frame.error_message().unwrap_or("-").to_owned();
                warn!(code, message, "session: doc op rejected, resyncing");
                self.shared.emit(SessionEvent::OpRejected { code, message });
                outbox.push(Frame::request("doc:get", Data::new()));
            }
            ("doc:seeded", Status::Request) | ("doc:seed" | "doc:get", Status::Done) => {
                let Ok(document) = field::<SharedDocument>(frame, "document") else {
                    warn!(syscall = %frame.syscall, "session: frame without document");
                    return true;
                };
                self.shared.lock().document = document;
                self.shared.emit(SessionEvent::DocumentReplaced);
            }
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
