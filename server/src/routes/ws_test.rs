use futures_util::{SinkExt, StreamExt};
use frames::document::DocChange;
use serde_json::json;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::*;
use crate::config::Config;
use crate::rate_limit::RateLimitConfig;
use crate::services::access::AccessDirectory;
use crate::state::test_helpers;

// =============================================================================
// DISPATCH HELPERS
// =============================================================================

async fn connect(state: &AppState, room_id: &str, name: &str) -> (Connection, mpsc::Receiver<Frame>) {
    let user = SessionUser { id: Uuid::new_v4(), name: name.to_owned(), avatar_url: None };
    let client_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(32);
    let participant = Participant { client_id, user: user.participant_user(), presence: Presence::default() };
    let (room, _snapshot) = state.rooms.join(room_id, participant, tx).await.expect("join");
    (Connection { client_id, user, room }, rx)
}

fn request(syscall: &str, data: Value) -> Frame {
    let Value::Object(map) = data else {
        panic!("request data must be an object");
    };
    Frame::request(syscall, map)
}

async fn recv_peer(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("peer frame timed out")
        .expect("peer channel closed")
}

async fn recv_peer_syscall(rx: &mut mpsc::Receiver<Frame>, syscall: &str) -> Frame {
    loop {
        let frame = recv_peer(rx).await;
        if frame.syscall == syscall {
            return frame;
        }
    }
}

fn single(replies: Vec<Frame>) -> Frame {
    assert_eq!(replies.len(), 1, "expected exactly one reply: {replies:?}");
    replies.into_iter().next().expect("one reply")
}

fn error_code(frame: &Frame) -> &str {
    assert_eq!(frame.status, Status::Error, "expected error frame: {frame:?}");
    frame.field_str(frames::FRAME_CODE).unwrap_or_default()
}

fn doc_with_list() -> Value {
    json!({
        "document": {
            "lists": { "l1": { "id": "l1", "title": "Todo", "position": 1.0 } },
            "cards": { "c1": { "id": "c1", "listId": "l1", "title": "Ship", "position": 1.0 } },
            "revision": 0
        }
    })
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn unknown_syscall_returns_structured_error() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let reply = single(process_frame(&state, &conn, request("board:list", json!({}))).await);
    assert_eq!(error_code(&reply), "E_UNKNOWN_SYSCALL");
    assert_eq!(reply.syscall, "board:list");
}

#[tokio::test]
async fn presence_update_is_silent_and_reaches_peers() {
    let (state, _directory) = test_helpers::test_app_state();
    let (alice, _alice_rx) = connect(&state, "b1", "alice").await;
    let (_bob, mut bob_rx) = connect(&state, "b1", "bob").await;

    let replies = process_frame(
        &state,
        &alice,
        request("presence:update", json!({ "cursor": { "x": 10.0, "y": 20.0 } })),
    )
    .await;
    assert!(replies.is_empty());

    let update = recv_peer_syscall(&mut bob_rx, "presence:updated").await;
    assert_eq!(update.from.as_deref(), Some(alice.user.id.to_string().as_str()));
    let participant: Participant =
        serde_json::from_value(update.field("participant").cloned().expect("participant")).expect("decode");
    assert_eq!(participant.client_id, alice.client_id);
    assert_eq!(participant.presence.cursor, Some(frames::presence::Point::new(10.0, 20.0)));
}

#[tokio::test]
async fn oversized_presence_is_rejected() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let long = "x".repeat(frames::presence::MAX_PRESENCE_ID_LEN + 1);
    let reply = single(
        process_frame(&state, &conn, request("presence:update", json!({ "selectedCardId": long }))).await,
    );
    assert_eq!(error_code(&reply), "E_INVALID_PRESENCE");
}

#[tokio::test]
async fn event_publish_stamps_sender_and_skips_echo() {
    let (state, _directory) = test_helpers::test_app_state();
    let (alice, mut alice_rx) = connect(&state, "b1", "alice").await;
    let (_bob, mut bob_rx) = connect(&state, "b1", "bob").await;
    let spoofed = Uuid::new_v4();

    let replies = process_frame(
        &state,
        &alice,
        request(
            "event:publish",
            json!({ "type": "CARD_CREATED", "cardId": "c9", "listId": "l1", "userId": spoofed, "timestamp": 1 }),
        ),
    )
    .await;
    assert!(replies.is_empty());

    let event = recv_peer_syscall(&mut bob_rx, "room:event").await;
    assert_eq!(event.field_str("type"), Some("CARD_CREATED"));
    assert_eq!(event.field_str("cardId"), Some("c9"));
    assert_eq!(event.field_str("userId"), Some(alice.user.id.to_string().as_str()));
    assert!(event.field("timestamp").and_then(Value::as_i64).is_some_and(|ts| ts > 1));

    // Alice saw bob join, nothing else.
    let joined = recv_peer(&mut alice_rx).await;
    assert_eq!(joined.syscall, "presence:joined");
    assert!(timeout(Duration::from_millis(80), alice_rx.recv()).await.is_err());
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let reply = single(process_frame(&state, &conn, request("event:publish", json!({ "type": "TELEPORTED" }))).await);
    assert_eq!(error_code(&reply), "E_INVALID_EVENT");
}

#[tokio::test]
async fn doc_seed_then_apply_replies_with_change() {
    let (state, _directory) = test_helpers::test_app_state();
    let (alice, _alice_rx) = connect(&state, "b1", "alice").await;
    let (_bob, mut bob_rx) = connect(&state, "b1", "bob").await;

    let seeded = single(process_frame(&state, &alice, request("doc:seed", doc_with_list())).await);
    assert_eq!(seeded.status, Status::Done);
    let document: SharedDocument =
        serde_json::from_value(seeded.field("document").cloned().expect("document")).expect("decode");
    assert_eq!(document.cards["c1"].version, 1);
    recv_peer_syscall(&mut bob_rx, "doc:seeded").await;

    let op = json!({ "op": { "op": "MOVE_CARD", "cardId": "c1", "listId": "l1", "position": 2.5, "version": 1 } });
    let applied = single(process_frame(&state, &alice, request("doc:apply", op)).await);
    assert_eq!(applied.status, Status::Done);
    assert!(applied.field("change").is_some());

    let changed = recv_peer_syscall(&mut bob_rx, "doc:changed").await;
    assert_eq!(changed.field("change"), applied.field("change"));
}

#[tokio::test]
async fn stale_doc_apply_is_rejected() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;
    process_frame(&state, &conn, request("doc:seed", doc_with_list())).await;

    let fresh = json!({ "op": { "op": "MOVE_CARD", "cardId": "c1", "listId": "l1", "position": 2.0, "version": 1 } });
    assert_eq!(single(process_frame(&state, &conn, request("doc:apply", fresh)).await).status, Status::Done);

    let stale = json!({ "op": { "op": "MOVE_CARD", "cardId": "c1", "listId": "l1", "position": 3.0, "version": 1 } });
    let reply = single(process_frame(&state, &conn, request("doc:apply", stale)).await);
    assert_eq!(error_code(&reply), "E_DOC_STALE");
}

#[tokio::test]
async fn seeded_version_at_limit_keeps_room_alive() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let seed = json!({
        "document": {
            "lists": { "l1": { "id": "l1", "title": "Todo", "position": 1.0, "version": u64::MAX } },
            "cards": {},
            "revision": 0
        }
    });
    let seeded = single(process_frame(&state, &conn, request("doc:seed", seed)).await);
    assert_eq!(seeded.status, Status::Done);

    let op = json!({ "op": { "op": "MOVE_LIST", "listId": "l1", "position": 2.0, "version": u64::MAX } });
    let applied = single(process_frame(&state, &conn, request("doc:apply", op)).await);
    assert_eq!(applied.status, Status::Done, "apply failed: {applied:?}");
    let change: DocChange =
        serde_json::from_value(applied.field("change").cloned().expect("change")).expect("decode change");
    assert!(matches!(change.op, DocOp::MoveList { version: 2, .. }));

    let snapshot = single(process_frame(&state, &conn, request("room:snapshot", json!({}))).await);
    assert_eq!(snapshot.status, Status::Done);
}

#[tokio::test]
async fn malformed_doc_op_is_invalid_payload() {
    let (state, _directory) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let reply = single(process_frame(&state, &conn, request("doc:apply", json!({ "op": { "op": "EXPLODE" } }))).await);
    assert_eq!(error_code(&reply), "E_INVALID_PAYLOAD");
}

#[tokio::test]
async fn mutations_are_rate_limited_per_connection() {
    let mut config = Config::defaults_from_env();
    config.rate_limit = RateLimitConfig { per_client_limit: 2, ..RateLimitConfig::default() };
    let (state, _directory) = test_helpers::test_app_state_with(config);
    let (conn, _rx) = connect(&state, "b1", "alice").await;

    let publish = || request("event:publish", json!({ "type": "LIST_CREATED", "listId": "l1" }));
    assert!(process_frame(&state, &conn, publish()).await.is_empty());
    assert!(process_frame(&state, &conn, publish()).await.is_empty());

    let reply = single(process_frame(&state, &conn, publish()).await);
    assert_eq!(error_code(&reply), "E_RATE_LIMITED");
    assert_eq!(reply.field("retryable"), Some(&Value::Bool(true)));

    // Presence bypasses the limiter.
    let presence = request("presence:update", json!({ "cursor": null }));
    assert!(process_frame(&state, &conn, presence).await.is_empty());
}

#[tokio::test]
async fn room_snapshot_lists_everyone() {
    let (state, _directory) = test_helpers::test_app_state();
    let (alice, _alice_rx) = connect(&state, "b1", "alice").await;
    let (_bob, _bob_rx) = connect(&state, "b1", "bob").await;

    let reply = single(process_frame(&state, &alice, request("room:snapshot", json!({}))).await);
    let participants = reply
        .field("participants")
        .and_then(Value::as_array)
        .expect("participants");
    assert_eq!(participants.len(), 2);
    assert_eq!(reply.room_id.as_deref(), Some("b1"));
}

// =============================================================================
// LIVE SOCKET
// =============================================================================

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn serve(state: AppState) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, crate::routes::app(state)).await;
    });
    addr
}

async fn open(addr: std::net::SocketAddr, ticket: &str) -> Client {
    let url = format!("ws://{addr}/api/ws?ticket={ticket}");
    let (client, _response) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    client
}

async fn recv_client(client: &mut Client) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("ws receive timed out")
            .expect("ws stream ended")
            .expect("ws error");
        match msg {
            WsMessage::Binary(bytes) => return frames::decode_frame(&bytes).expect("decode"),
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            _ => {}
        }
    }
}

async fn recv_client_syscall(client: &mut Client, syscall: &str) -> Frame {
    loop {
        let frame = recv_client(client).await;
        if frame.syscall == syscall {
            return frame;
        }
    }
}

#[tokio::test]
async fn socket_rejects_missing_or_reused_ticket() {
    let (state, directory) = test_helpers::test_app_state();
    let user = test_helpers::seed_member(&directory, "tok", "Ada", "b1");
    let ticket = directory
        .issue_ticket(&user, "b1", Duration::from_secs(30))
        .await
        .expect("ticket");
    let addr = serve(state).await;

    assert!(tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws")).await.is_err());

    let _first = open(addr, &ticket).await;
    let reuse = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?ticket={ticket}")).await;
    assert!(reuse.is_err(), "ticket must be single use");
}

#[tokio::test]
async fn socket_session_presence_and_disconnect() {
    let (state, directory) = test_helpers::test_app_state();
    let ada = test_helpers::seed_member(&directory, "tok-a", "Ada", "b1");
    let bob = test_helpers::seed_member(&directory, "tok-b", "Bob", "b1");
    let ttl = Duration::from_secs(30);
    let ticket_a = directory.issue_ticket(&ada, "b1", ttl).await.expect("ticket");
    let ticket_b = directory.issue_ticket(&bob, "b1", ttl).await.expect("ticket");
    let addr = serve(state.clone()).await;

    let mut a = open(addr, &ticket_a).await;
    let connected = recv_client_syscall(&mut a, "session:connected").await;
    assert_eq!(connected.field_str("room_id"), Some("b1"));
    let a_client_id = connected.field_str("client_id").expect("client id").to_owned();

    let mut b = open(addr, &ticket_b).await;
    let connected_b = recv_client_syscall(&mut b, "session:connected").await;
    let participants = connected_b
        .field("participants")
        .and_then(Value::as_array)
        .expect("participants");
    assert_eq!(participants.len(), 2);

    let joined = recv_client_syscall(&mut a, "presence:joined").await;
    assert_eq!(joined.from.as_deref(), Some(bob.id.to_string().as_str()));

    // Text JSON is accepted alongside binary frames.
    let update = request("presence:update", json!({ "selectedCardId": "c1" }));
    a.send(WsMessage::Text(serde_json::to_string(&update).expect("json").into()))
        .await
        .expect("send");
    let updated = recv_client_syscall(&mut b, "presence:updated").await;
    assert_eq!(updated.field("participant").and_then(|p| p.get("clientId")).and_then(Value::as_str), Some(a_client_id.as_str()));

    let bad = request("nope:thing", json!({}));
    b.send(WsMessage::Binary(frames::encode_frame(&bad).into())).await.expect("send");
    let reply = recv_client_syscall(&mut b, "nope:thing").await;
    assert_eq!(reply.parent_id.as_deref(), Some(bad.id.as_str()));
    assert_eq!(error_code(&reply), "E_UNKNOWN_SYSCALL");

    a.close(None).await.expect("close");
    let left = recv_client_syscall(&mut b, "presence:left").await;
    assert_eq!(left.field_str("client_id"), Some(a_client_id.as_str()));
    assert_eq!(left.field_str("user_id"), Some(ada.id.to_string().as_str()));

    b.close(None).await.expect("close");
    timeout(Duration::from_secs(2), async {
        while state.rooms.room_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room torn down after last leave");
}

#[tokio::test]
async fn silent_socket_is_dropped_and_its_drag_released() {
    let mut config = Config::defaults_from_env();
    config.ping_interval = Duration::from_millis(100);
    config.idle_timeout = Duration::from_millis(300);
    let (state, directory) = test_helpers::test_app_state_with(config);
    let ada = test_helpers::seed_member(&directory, "tok-a", "Ada", "b1");
    let ticket = directory.issue_ticket(&ada, "b1", Duration::from_secs(30)).await.expect("ticket");
    let addr = serve(state.clone()).await;

    let (_watcher, mut watcher_rx) = connect(&state, "b1", "watcher").await;

    let mut a = open(addr, &ticket).await;
    let connected = recv_client_syscall(&mut a, "session:connected").await;
    let a_client_id = connected.field_str("client_id").expect("client id").to_owned();

    let drag = request(
        "presence:update",
        json!({ "drag": { "kind": "card", "entityId": "c1", "offset": { "x": 1.5, "y": 2.5 } } }),
    );
    a.send(WsMessage::Binary(frames::encode_frame(&drag).into())).await.expect("send drag");
    recv_peer_syscall(&mut watcher_rx, "presence:updated").await;
    let participants = state.rooms.participants("b1").await;
    assert!(participants.iter().any(|p| p.presence.is_dragging_entity(None, "c1")));

    // From here on the socket is never read, so no pong ever goes back.
    let left = timeout(Duration::from_secs(3), async {
        loop {
            match watcher_rx.recv().await {
                Some(frame) if frame.syscall == "presence:left" => return frame,
                Some(_) => {}
                None => panic!("watcher channel closed"),
            }
        }
    })
    .await
    .expect("idle peer reaped");
    assert_eq!(left.field_str("client_id"), Some(a_client_id.as_str()));

    let participants = state.rooms.participants("b1").await;
    assert_eq!(participants.len(), 1);
    assert!(!participants.iter().any(|p| p.presence.is_dragging()));
    drop(a);
}
