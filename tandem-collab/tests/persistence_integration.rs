//! Integration tests for hydration, autosave and durability.

use std::sync::Arc;
use tokio::time::Duration;

use tandem_collab::reconciler::HydrationOutcome;
use tandem_collab::relay::{LocalConnector, Relay, RelayConfig};
use tandem_collab::session::{Session, SessionConfig};
use tandem_collab::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig};
use tandem_collab::transport::{BackoffPolicy, ConnectionState, Connector, TransportConfig};
use tandem_core::{Document, EditIntent, ReplicaId};

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

/// Store a snapshot of a document containing `text` under `room`.
async fn seed(store: &dyn SnapshotStore, room: &str, text: &str) {
    let mut doc = Document::new(ReplicaId::random());
    doc.apply_local(EditIntent::insert_text(0, text)).unwrap();
    store.save(room, &doc.snapshot()).await.unwrap();
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

async fn wait_clean(session: &Session) -> bool {
    for _ in 0..250 {
        if !session.document().lock().await.is_dirty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_autosave_survives_reopen() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::open("notes", store.clone(), None, fast_config()).await;
    assert_eq!(session.hydration(), &HydrationOutcome::NotFound);

    session.apply_local(EditIntent::insert_text(0, "Remember this")).await.unwrap();
    session
        .apply_local(EditIntent::set_attribute(0, "align", Some("right")))
        .await
        .unwrap();
    assert!(wait_clean(&session).await);
    assert!(session.autosave_stats().saves >= 1);
    let saved = session.content().await;
    session.close().await;

    let reopened = Session::open("notes", store, None, fast_config()).await;
    assert_eq!(reopened.hydration(), &HydrationOutcome::Loaded { operations: 2 });
    assert_eq!(reopened.content().await, saved);
    assert!(!reopened.document().lock().await.is_dirty());
}

#[tokio::test]
async fn test_failed_saves_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::open("notes", store.clone(), None, fast_config()).await;

    store.set_available(false);
    session.apply_local(EditIntent::insert_text(0, "unsaved")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(session.autosave_stats().failures >= 1);
    assert!(session.document().lock().await.is_dirty());
    assert!(!store.contains("notes").await);

    store.set_available(true);
    assert!(wait_clean(&session).await);
    assert!(store.contains("notes").await);
    session.close().await;
}

#[tokio::test]
async fn test_close_stops_autosave() {
    let store = Arc::new(MemoryStore::new());
    let mut session = Session::open("notes", store.clone(), None, fast_config()).await;
    session.apply_local(EditIntent::insert_text(0, "a")).await.unwrap();
    let doc = session.document();
    session.close().await;

    let saves = store.save_count();
    doc.lock().await.apply_local(EditIntent::insert_text(0, "b")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.save_count(), saves);
    assert!(doc.lock().await.is_dirty());
}

#[tokio::test]
async fn test_unreadable_snapshot_starts_empty() {
    let store = Arc::new(MemoryStore::new());
    store.insert_raw("notes", b"definitely not a snapshot".to_vec()).await;

    let mut session = Session::open("notes", store.clone(), None, fast_config()).await;
    assert_eq!(session.hydration(), &HydrationOutcome::Failed);
    assert_eq!(session.text().await, "");

    // The broken blob is replaced on the next save
    session.apply_local(EditIntent::insert_text(0, "fresh")).await.unwrap();
    assert!(wait_clean(&session).await);
    let stored = store.load("notes").await.unwrap().unwrap();
    assert_eq!(stored.operations.len(), 1);
    session.close().await;
}

#[tokio::test]
async fn test_live_content_wins_over_slow_storage() {
    let relay = Arc::new(Relay::new(RelayConfig::default()).unwrap());
    let connector: Arc<dyn Connector> = Arc::new(LocalConnector::new(relay.clone()));

    let mut alice = Session::open("doc", Arc::new(MemoryStore::new()), Some(connector.clone()), fast_config()).await;
    assert!(alice.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await);
    alice.apply_local(EditIntent::insert_text(0, "live")).await.unwrap();

    let slow = Arc::new(MemoryStore::new().with_load_delay(Duration::from_secs(1)));
    seed(slow.as_ref(), "doc", "stale").await;
    let bob = Session::open("doc", slow, Some(connector), fast_config()).await;

    assert_eq!(bob.hydration(), &HydrationOutcome::Discarded);
    assert_eq!(bob.text().await, "live");
}

#[tokio::test]
async fn test_hydrated_content_reaches_peers() {
    let relay = Arc::new(Relay::new(RelayConfig::default()).unwrap());
    let connector: Arc<dyn Connector> = Arc::new(LocalConnector::new(relay.clone()));

    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), "doc", "from disk").await;
    let alice = Session::open("doc", store, Some(connector.clone()), fast_config()).await;
    assert_eq!(alice.hydration(), &HydrationOutcome::Loaded { operations: 1 });

    let bob = Session::open("doc", Arc::new(MemoryStore::new()), Some(connector), fast_config()).await;
    assert!(wait_for_text(&bob, "from disk").await);
    assert_eq!(alice.text().await, "from disk");
}

#[tokio::test]
async fn test_relay_persists_room_between_runs() {
    let relay_store = Arc::new(MemoryStore::new());

    let first = Arc::new(Relay::with_store(RelayConfig::default(), relay_store.clone()));
    let connector: Arc<dyn Connector> = Arc::new(LocalConnector::new(first.clone()));
    let mut alice = Session::open("doc", Arc::new(MemoryStore::new()), Some(connector), fast_config()).await;
    assert!(alice.wait_for_state(ConnectionState::Synced, SYNC_TIMEOUT).await);
    alice.apply_local(EditIntent::insert_text(0, "kept by relay")).await.unwrap();
    for _ in 0..250 {
        if first.room_content("doc").await.map(|c| c.text()) == Some("kept by relay".into()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    alice.close().await;

    for _ in 0..250 {
        if first.room_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(first.room_count().await, 0);
    assert!(relay_store.contains("doc").await);

    let second = Arc::new(Relay::with_store(RelayConfig::default(), relay_store));
    let connector: Arc<dyn Connector> = Arc::new(LocalConnector::new(second));
    let bob = Session::open("doc", Arc::new(MemoryStore::new()), Some(connector), fast_config()).await;
    assert!(wait_for_text(&bob, "kept by relay").await);
}

#[tokio::test]
async fn test_rocksdb_backed_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());

    let config = SessionConfig {
        autosave_interval: Duration::from_secs(3600),
        ..fast_config()
    };
    let mut session = Session::open("doc-1", store.clone(), None, config.clone()).await;
    session.apply_local(EditIntent::insert_text(0, "durable")).await.unwrap();
    session.apply_local(EditIntent::insert_block(7, "heading")).await.unwrap();
    session.close().await;

    let meta = store.load_metadata("doc-1").unwrap().unwrap();
    assert_eq!(meta.op_count, 2);
    assert_eq!(store.list_rooms().unwrap(), vec!["doc-1".to_string()]);

    let reopened = Session::open("doc-1", store, None, config).await;
    assert_eq!(reopened.hydration(), &HydrationOutcome::Loaded { operations: 2 });
    assert_eq!(reopened.content().await.blocks.len(), 2);
    assert_eq!(reopened.text().await, "durable\n");
}
