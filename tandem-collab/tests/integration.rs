//! Integration tests for replication through a relay.
//!
//! Sessions connect through the in-process connector unless a test says
//! otherwise; one test runs the full WebSocket path.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Duration};

use tandem_collab::relay::{LocalConnector, Relay, RelayConfig};
use tandem_collab::session::{Session, SessionConfig};
use tandem_collab::storage::MemoryStore;
use tandem_collab::transport::{
    BackoffPolicy, Connection, ConnectionState, Connector, Link, TransportConfig, TransportError,
    WebSocketConnector,
};
use tandem_collab::SyncMessage;
use tandem_core::{Document, EditIntent, ReplicaId, UndoMode};

const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> SessionConfig {
    SessionConfig {
        autosave_interval: Duration::from_millis(50),
        transport: TransportConfig {
            backoff: BackoffPolicy {
                initial: Duration::from_millis(20),
                max: Duration::from_millis(100),
                multiplier: 2.0,
            },
            ..TransportConfig::default()
        },
        ..SessionConfig::default()
    }
}

fn relay() -> Arc<Relay> {
    Arc::new(Relay::new(RelayConfig::default()).unwrap())
}

async fn join(relay: &Arc<Relay>, room: &str) -> (Session, Arc<LocalConnector>) {
    let connector = Arc::new(LocalConnector::new(relay.clone()));
    let session = Session::open(
        room,
        Arc::new(MemoryStore::new()),
        Some(connector.clone() as Arc<dyn Connector>),
        fast_config(),
    )
    .await;
    assert!(
        session.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await,
        "session should sync"
    );
    (session, connector)
}

async fn wait_for_text(session: &Session, expected: &str) -> bool {
    for _ in 0..250 {
        if session.text().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_converged(a: &Session, b: &Session) -> bool {
    for _ in 0..250 {
        if a.content().await == b.content().await && a.state_vector().await == b.state_vector().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_two_sessions_exchange_edits() {
    let relay = relay();
    let (mut alice, _c1) = join(&relay, "doc").await;
    let (mut bob, _c2) = join(&relay, "doc").await;

    alice.apply_local(EditIntent::insert_text(0, "Hello")).await.unwrap();
    assert!(wait_for_text(&bob, "Hello").await);

    bob.apply_local(EditIntent::insert_text(5, " world")).await.unwrap();
    assert!(wait_for_text(&alice, "Hello world").await);
    assert!(wait_converged(&alice, &bob).await);
    assert_eq!(relay.room_content("doc").await.unwrap().text(), "Hello world");
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let relay = relay();
    let (mut alice, _c1) = join(&relay, "doc").await;
    alice.apply_local(EditIntent::insert_text(0, "first")).await.unwrap();
    alice.apply_local(EditIntent::insert_block(5, "heading")).await.unwrap();
    alice.apply_local(EditIntent::insert_text(6, "second")).await.unwrap();

    let (bob, _c2) = join(&relay, "doc").await;
    assert!(wait_converged(&alice, &bob).await);
    let content = bob.content().await;
    assert_eq!(content.blocks.len(), 2);
    assert_eq!(content.blocks[1].kind, "heading");
    assert_eq!(content.text(), "first\nsecond");
}

#[tokio::test]
async fn test_concurrent_edits_converge() {
    let relay = relay();
    let (mut alice, _c1) = join(&relay, "doc").await;
    let (mut bob, _c2) = join(&relay, "doc").await;

    alice.apply_local(EditIntent::insert_text(0, "AAA")).await.unwrap();
    bob.apply_local(EditIntent::insert_text(0, "BBB")).await.unwrap();

    assert!(wait_converged(&alice, &bob).await);
    let text = alice.text().await;
    assert_eq!(text.len(), 6);
    // Runs are never interleaved
    assert!(text == "AAABBB" || text == "BBBAAA", "got {text}");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let relay = relay();
    let (mut alice, _c1) = join(&relay, "one").await;
    let (bob, _c2) = join(&relay, "two").await;

    alice.apply_local(EditIntent::insert_text(0, "private")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.text().await, "");
    assert_eq!(relay.room_count().await, 2);
}

#[tokio::test]
async fn test_out_of_order_delivery_through_relay() {
    let relay = relay();
    let (bob, _c) = join(&relay, "doc").await;

    // A raw peer that sends its operations backwards
    let mut writer = Document::new(ReplicaId::random());
    let first = writer.apply_local(EditIntent::insert_text(0, "x")).unwrap();
    let second = writer.apply_local(EditIntent::insert_text(1, "y")).unwrap();

    let connector = LocalConnector::new(relay.clone());
    let link = connector.connect("doc").await.unwrap();
    let frames = [
        SyncMessage::join(writer.replica(), "doc"),
        SyncMessage::update(writer.replica(), "doc", &second).unwrap(),
        SyncMessage::update(writer.replica(), "doc", &first).unwrap(),
    ];
    for frame in frames {
        link.outgoing.send(frame.encode().unwrap()).await.unwrap();
    }

    assert!(wait_for_text(&bob, "xy").await);
    assert_eq!(bob.document().lock().await.pending_len(), 0);
}

#[tokio::test]
async fn test_reconnect_after_outage() {
    let relay = relay();
    let (mut alice, alice_link) = join(&relay, "doc").await;
    let (mut bob, _c2) = join(&relay, "doc").await;

    alice_link.set_online(false);
    let mut offline = false;
    for _ in 0..100 {
        if alice.connection_state() != ConnectionState::Synced {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline, "alice should notice the outage");

    alice.apply_local(EditIntent::insert_text(0, "A")).await.unwrap();
    bob.apply_local(EditIntent::insert_text(0, "B")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.text().await, "A");
    assert_eq!(bob.text().await, "B");

    alice_link.set_online(true);
    assert!(alice.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await);
    assert!(wait_converged(&alice, &bob).await);

    let text = alice.text().await;
    assert_eq!(text.len(), 2);
    // Offline edits were delivered exactly once
    let relay_sv = relay.room_state_vector("doc").await.unwrap();
    assert_eq!(relay_sv.get(&alice.replica()), 1);
    assert_eq!(relay_sv.get(&bob.replica()), 1);
}

#[tokio::test]
async fn test_collaborative_undo_through_relay() {
    let relay = relay();
    let (mut alice, _c1) = join(&relay, "doc").await;
    let (mut bob, _c2) = join(&relay, "doc").await;
    assert_eq!(alice.undo_mode(), UndoMode::Collaborative);

    alice.apply_local(EditIntent::insert_text(0, "Hello")).await.unwrap();
    assert!(wait_for_text(&bob, "Hello").await);
    bob.apply_local(EditIntent::insert_text(5, "!")).await.unwrap();
    assert!(wait_for_text(&alice, "Hello!").await);

    let ops = alice.undo().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(alice.text().await, "!");
    assert!(wait_for_text(&bob, "!").await);

    alice.redo().await.unwrap();
    assert!(wait_converged(&alice, &bob).await);
    assert_eq!(bob.text().await, "Hello!");
}

#[tokio::test]
async fn test_websocket_end_to_end() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = relay();
    tokio::spawn(relay.clone().serve(listener));

    let connector: Arc<dyn Connector> = Arc::new(WebSocketConnector::new(format!("ws://{addr}")));
    let mut alice = Session::open(
        "doc",
        Arc::new(MemoryStore::new()),
        Some(connector.clone()),
        fast_config(),
    )
    .await;
    let mut bob = Session::open("doc", Arc::new(MemoryStore::new()), Some(connector), fast_config()).await;
    assert!(alice.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await);
    assert!(bob.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await);

    alice.apply_local(EditIntent::insert_text(0, "over the wire")).await.unwrap();
    assert!(wait_for_text(&bob, "over the wire").await);
    bob.apply_local(EditIntent::set_attribute(0, "align", Some("center"))).await.unwrap();
    assert!(wait_converged(&alice, &bob).await);
    assert_eq!(alice.content().await.blocks[0].attrs["align"], "center");

    alice.close().await;
    bob.close().await;
}

struct PendingConnector;

#[async_trait]
impl Connector for PendingConnector {
    async fn connect(&self, _room: &str) -> Result<Link, TransportError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_close_while_connecting() {
    let session = Session::open(
        "doc",
        Arc::new(MemoryStore::new()),
        Some(Arc::new(PendingConnector)),
        fast_config(),
    )
    .await;
    assert!(session.wait_for_state(ConnectionState::Connecting, SYNC_TIMEOUT).await);
    assert!(timeout(Duration::from_secs(1), session.close()).await.is_ok());
}

struct RefusingConnector {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(&self, _room: &str) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Connect("connection refused".into()))
    }
}

#[tokio::test]
async fn test_retries_with_backoff() {
    let connector = Arc::new(RefusingConnector {
        attempts: AtomicUsize::new(0),
    });
    let mut session = Session::open(
        "doc",
        Arc::new(MemoryStore::new()),
        Some(connector.clone() as Arc<dyn Connector>),
        fast_config(),
    )
    .await;

    // Editing keeps working while the transport is down
    session.apply_local(EditIntent::insert_text(0, "still here")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let attempts = connector.attempts.load(Ordering::SeqCst);
    assert!(attempts >= 3, "only {attempts} attempts");
    // 20 + 40 + 80 + 100 + 100 ... ms apart: far fewer than a tight loop
    assert!(attempts < 20, "{attempts} attempts");
    assert_ne!(session.connection_state(), ConnectionState::Synced);
    assert_eq!(session.text().await, "still here");
    session.close().await;
}

/// Accepts frames and never answers.
struct SilentConnector;

#[async_trait]
impl Connector for SilentConnector {
    async fn connect(&self, _room: &str) -> Result<Link, TransportError> {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
        let sink = tokio::spawn(async move {
            let _keep_open = in_tx;
            while out_rx.recv().await.is_some() {}
        });
        Ok(Link::new(out_tx, in_rx).with_task(sink))
    }
}

#[tokio::test]
async fn test_silent_link_is_dropped() {
    let config = SessionConfig {
        transport: TransportConfig {
            heartbeat_interval: Duration::from_millis(50),
            backoff: BackoffPolicy {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(2),
                multiplier: 1.0,
            },
            ..TransportConfig::default()
        },
        ..fast_config()
    };
    let session = Session::open(
        "doc",
        Arc::new(MemoryStore::new()),
        Some(Arc::new(SilentConnector)),
        config,
    )
    .await;

    assert!(session.wait_for_state(ConnectionState::SyncHandshake, SYNC_TIMEOUT).await);
    assert!(session.wait_for_state(ConnectionState::Reconnecting, SYNC_TIMEOUT).await);
    session.close().await;
}

/// Like [`SilentConnector`], and reports when its link task goes away.
struct MuteConnector {
    alive: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl Connector for MuteConnector {
    async fn connect(&self, _room: &str) -> Result<Link, TransportError> {
        let alive = self.alive.lock().unwrap().take();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
        let sink = tokio::spawn(async move {
            let _keep_open = (in_tx, alive);
            while out_rx.recv().await.is_some() {}
        });
        Ok(Link::new(out_tx, in_rx).with_task(sink))
    }
}

#[tokio::test]
async fn test_close_during_handshake() {
    let (alive_tx, alive_rx) = oneshot::channel();
    let connector = Arc::new(MuteConnector {
        alive: std::sync::Mutex::new(Some(alive_tx)),
    });
    let config = TransportConfig {
        heartbeat_interval: Duration::from_secs(60),
        ..TransportConfig::default()
    };
    let replica = ReplicaId::random();
    let doc = Arc::new(Mutex::new(Document::new(replica)));
    let (events_tx, _events_rx) = mpsc::channel(16);
    let mut connection = Connection::spawn("doc", replica, doc, connector, config, events_tx);

    assert!(connection.wait_for_state(ConnectionState::SyncHandshake, SYNC_TIMEOUT).await);
    assert!(timeout(Duration::from_secs(1), connection.close()).await.is_ok());
    assert_eq!(connection.state(), ConnectionState::Closed);
    // The link and its task were released
    assert!(matches!(timeout(Duration::from_secs(1), alive_rx).await, Ok(Err(_))));
}
