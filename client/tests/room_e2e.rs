//! Client against a real room server over loopback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use frames::document::{CardEntry, DocOp, ListEntry, SharedDocument};
use frames::event::{RefreshTarget, RoomEvent};
use frames::presence::{DragKind, DragState, Point};
use room_client::indicators::{is_dragging_by_others, is_editing_by_others, user_dragging_card, user_editing};
use room_client::{
    ClientConfig, ClientError, HttpAuthProvider, ReconnectPolicy, RefreshRequest, RoomSession, SessionEvent, connect,
};
use room_server::config::Config;
use room_server::services::access::SessionUser;
use room_server::services::memory::MemoryDirectory;
use room_server::state::AppState;
use tokio::time::timeout;
use uuid::Uuid;

const BOARD: &str = "b1";

struct Harness {
    base_url: String,
    directory: Arc<MemoryDirectory>,
    state: AppState,
}

impl Harness {
    async fn start() -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let state = AppState::new(directory.clone(), Config::defaults_from_env());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = room_server::routes::app(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Self { base_url: format!("http://{addr}"), directory, state }
    }

    fn user(&self, token: &str, name: &str, member: bool) -> SessionUser {
        let user = SessionUser { id: Uuid::new_v4(), name: name.to_owned(), avatar_url: None };
        self.directory.add_session(token, user.clone());
        if member {
            self.directory.add_member(user.id, BOARD);
        }
        user
    }

    fn config(&self) -> ClientConfig {
        ClientConfig::new(&self.base_url).with_reconnect(ReconnectPolicy::disabled())
    }

    async fn try_join(&self, token: &str) -> Result<RoomSession, ClientError> {
        let auth = Arc::new(HttpAuthProvider::new(self.config(), token));
        connect(self.config(), BOARD, auth).await
    }

    async fn join(&self, token: &str, name: &str) -> RoomSession {
        self.user(token, name, true);
        self.try_join(token).await.expect("join room")
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let waited = timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for: {what}");
}

fn counting(session: &RoomSession) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    session.on_refresh(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

fn drag(kind: DragKind, entity_id: &str) -> DragState {
    DragState {
        kind,
        entity_id: entity_id.to_owned(),
        offset: Point::new(3.0, 4.0),
        source_list_id: None,
        source_position: None,
    }
}

// =============================================================================
// ACCESS
// =============================================================================

#[tokio::test]
async fn non_member_is_refused() {
    let harness = Harness::start().await;
    harness.user("outsider", "Eve", false);

    let result = harness.try_join("outsider").await;
    assert!(matches!(result, Err(ClientError::Unauthorized(_))));
    assert_eq!(harness.state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn unknown_session_is_refused() {
    let harness = Harness::start().await;
    let result = harness.try_join("nobody").await;
    assert!(matches!(result, Err(ClientError::Unauthorized(_))));
}

// =============================================================================
// PRESENCE
// =============================================================================

#[tokio::test]
async fn editing_indicator_follows_peer_lifecycle() {
    let harness = Harness::start().await;
    let a = harness.join("tok-a", "Ada").await;
    let b = harness.join("tok-b", "Bob").await;

    a.start_editing("c1", "title");
    eventually("B sees A editing c1", || is_editing_by_others(&b.others(), "c1")).await;
    let others = b.others();
    assert_eq!(user_editing(&others, "c1").map(|u| u.name.as_str()), Some("Ada"));
    assert!(!is_editing_by_others(&a.others(), "c1"));

    a.disconnect().await;
    eventually("B sees A gone", || !is_editing_by_others(&b.others(), "c1")).await;
    assert!(b.others().is_empty());
}

#[tokio::test]
async fn peers_converge_on_last_presence_update() {
    let harness = Harness::start().await;
    let a = harness.join("tok-a", "Ada").await;
    let b = harness.join("tok-b", "Bob").await;

    for i in 1..=100 {
        a.move_cursor(Some(Point::new(f64::from(i), f64::from(i) * 2.0)));
    }

    eventually("B sees A's final cursor", || {
        b.others()
            .first()
            .and_then(|p| p.presence.cursor)
            .is_some_and(|c| c == Point::new(100.0, 200.0))
    })
    .await;
}

#[tokio::test]
async fn concurrent_drags_keep_their_owners() {
    let harness = Harness::start().await;
    let a = harness.join("tok-a", "Ada").await;
    let b = harness.join("tok-b", "Bob").await;
    let c = harness.join("tok-c", "Cy").await;

    a.start_drag(drag(DragKind::Card, "c1"));
    b.start_drag(drag(DragKind::Card, "c2"));

    eventually("C sees both drags", || {
        let others = c.others();
        is_dragging_by_others(&others, "c1") && is_dragging_by_others(&others, "c2")
    })
    .await;
    let others = c.others();
    assert_eq!(user_dragging_card(&others, "c1").map(|u| u.name.as_str()), Some("Ada"));
    assert_eq!(user_dragging_card(&others, "c2").map(|u| u.name.as_str()), Some("Bob"));

    a.end_drag();
    eventually("C sees A drop", || !is_dragging_by_others(&c.others(), "c1")).await;
    assert_eq!(user_dragging_card(&c.others(), "c2").map(|u| u.name.as_str()), Some("Bob"));
}

// =============================================================================
// EVENTS
// =============================================================================

#[tokio::test]
async fn published_event_refreshes_peer_once_and_never_sender() {
    let harness = Harness::start().await;
    let a = harness.join("tok-a", "Ada").await;
    let b = harness.join("tok-b", "Bob").await;
    let a_count = counting(&a);
    let b_count = counting(&b);

    let seen = Arc::new(Mutex::new(Vec::<RefreshRequest>::new()));
    let sink = seen.clone();
    b.on_refresh(move |request| sink.lock().expect("lock").push(request.clone()));

    a.publish(RoomEvent::CardMoved {
        card_id: "c1".into(),
        from_list_id: Some("l1".into()),
        to_list_id: Some("l2".into()),
        position: Some(2.0),
    });

    eventually("B refreshed", || b_count.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b_count.load(Ordering::SeqCst), 1);
    assert_eq!(a_count.load(Ordering::SeqCst), 0);

    let seen = seen.lock().expect("lock");
    assert!(seen[0].targets.contains(&RefreshTarget::Card("c1".into())));
}

#[tokio::test]
async fn event_carries_server_stamped_sender() {
    let harness = Harness::start().await;
    let ada = harness.user("tok-a", "Ada", true);
    let a = harness.try_join("tok-a").await.expect("join");
    let b = harness.join("tok-b", "Bob").await;
    let mut events = b.subscribe();

    a.publish(RoomEvent::CommentAdded { card_id: "c1".into(), comment_id: "m1".into() });

    let envelope = timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(SessionEvent::Event(envelope)) = events.recv().await {
                return envelope;
            }
        }
    })
    .await
    .expect("event delivered");
    assert_eq!(envelope.user_id, ada.id);
    assert!(envelope.timestamp > 0);
}

// =============================================================================
// SHARED DOCUMENT
// =============================================================================

#[tokio::test]
async fn shared_document_converges_across_peers() {
    let harness = Harness::start().await;
    let a = harness.join("tok-a", "Ada").await;
    let b = harness.join("tok-b", "Bob").await;

    let mut seed = SharedDocument::default();
    seed.lists.insert("l1".into(), ListEntry { id: "l1".into(), title: "Todo".into(), position: 1.0, version: 0 });
    seed.lists.insert("l2".into(), ListEntry { id: "l2".into(), title: "Done".into(), position: 2.0, version: 0 });
    seed.cards.insert(
        "c1".into(),
        CardEntry { id: "c1".into(), list_id: "l1".into(), title: "Ship".into(), position: 1.0, version: 0 },
    );
    a.seed(seed);

    eventually("both hold the seeded document", || {
        let doc = b.document();
        !doc.is_empty() && doc == a.document()
    })
    .await;

    let version = a.document().cards["c1"].version;
    a.apply(DocOp::MoveCard { card_id: "c1".into(), list_id: "l2".into(), position: 1.5, version })
        .expect("local move");
    assert_eq!(a.document().cards_in_list("l2").len(), 1);

    eventually("B sees the move and both agree", || {
        let doc = b.document();
        doc.cards.get("c1").is_some_and(|c| c.list_id == "l2") && doc == a.document()
    })
    .await;

    // A late joiner gets the current document in its welcome.
    let c = harness.join("tok-c", "Cy").await;
    assert_eq!(c.document(), b.document());
}
