//! Room relay: the rendezvous point replicas sync through.
//!
//! ```text
//! Replica A ──┐
//!             ├── Room ── Document (merged state) ── BroadcastGroup
//! Replica B ──┘              │
//!                            └── SnapshotStore (on last leave)
//! ```
//!
//! The relay holds a full replica of every active room. It answers
//! handshakes from its own state, merges what peers send and fans new
//! operations out to everyone else in the room. When the last peer leaves,
//! the room is persisted and dropped.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use tandem_core::{Content, Document, MergeOutcome, Operation, ReplicaId, StateVector};

use crate::broadcast::{BroadcastGroup, Frame, PeerId};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::storage::{RocksStore, SnapshotStore, StoreConfig, StoreError};
use crate::transport::{Connector, Link, TransportError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// RocksDB path for room snapshots (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            storage_path: None,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `TANDEM_BIND_ADDR`, `TANDEM_STORAGE_PATH` and
    /// `TANDEM_BROADCAST_CAPACITY`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("TANDEM_STORAGE_PATH") {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Ok(capacity) = std::env::var("TANDEM_BROADCAST_CAPACITY") {
            match capacity.parse() {
                Ok(capacity) => config.broadcast_capacity = capacity,
                Err(e) => log::warn!("Ignoring TANDEM_BROADCAST_CAPACITY={capacity}: {e}"),
            }
        }
        config
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub relayed_operations: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

/// Room: merged document + broadcast group.
struct RelayRoom {
    doc: Mutex<Document>,
    broadcast: BroadcastGroup,
}

/// What a peer is bound to after joining.
struct Membership {
    peer: PeerId,
    replica: ReplicaId,
    room: String,
    state: Arc<RelayRoom>,
}

enum Flow {
    Continue,
    Leave,
}

pub struct Relay {
    config: RelayConfig,
    replica: ReplicaId,
    rooms: RwLock<HashMap<String, Arc<RelayRoom>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    stats: RwLock<RelayStats>,
}

impl Relay {
    /// Create a relay, opening RocksDB storage if a path is configured.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                log::info!("Relay storage at {}", path.display());
                Some(Arc::new(RocksStore::open(store_config)?) as Arc<dyn SnapshotStore>)
            }
            None => None,
        };
        Ok(Self::build(config, store))
    }

    /// Create a relay persisting rooms to `store`.
    pub fn with_store(config: RelayConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: RelayConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        Self {
            config,
            replica: ReplicaId::random(),
            rooms: RwLock::new(HashMap::new()),
            store,
            stats: RwLock::new(RelayStats::default()),
        }
    }

    /// Bind the configured address and serve WebSocket peers.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve WebSocket peers from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let relay = self.clone();
            tokio::spawn(async move {
                relay.handle_socket(stream, addr).await;
            });
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };
        log::info!("WebSocket connection established from {addr}");
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let capacity = self.config.broadcast_capacity;
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(capacity);

        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        });

        self.serve_peer(in_rx, out_tx).await;
        reader.abort();
        let _ = writer.await;
        log::info!("Connection closed from {addr}");
    }

    /// Serve one peer over a pair of frame channels until it leaves, its
    /// link closes, or it falls behind the room's broadcast.
    pub async fn serve_peer(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<Vec<u8>>,
        outgoing: mpsc::Sender<Vec<u8>>,
    ) {
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }

        let mut member: Option<Membership> = None;
        let mut frames: Option<broadcast::Receiver<Arc<Frame>>> = None;

        loop {
            tokio::select! {
                frame = incoming.recv() => {
                    let Some(bytes) = frame else { break };
                    match self.handle_frame(&bytes, &mut member, &mut frames, &outgoing).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Leave) => break,
                        Err(e) => {
                            log::debug!("Peer link failed: {e}");
                            break;
                        }
                    }
                }

                relayed = next_frame(&mut frames) => {
                    match relayed {
                        Ok(frame) => {
                            // Don't echo back to sender
                            if member.as_ref().map(|m| m.replica) == Some(frame.origin) {
                                continue;
                            }
                            if outgoing.send(frame.bytes.clone()).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            if let Some(m) = &member {
                                m.state.broadcast.record_dropped(n);
                                log::warn!("Peer {} lagged by {n} frames, disconnecting", m.replica);
                            }
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        if let Some(m) = member {
            self.release(m).await;
        }
        let mut stats = self.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }

    async fn handle_frame(
        &self,
        bytes: &[u8],
        member: &mut Option<Membership>,
        frames: &mut Option<broadcast::Receiver<Arc<Frame>>>,
        outgoing: &mpsc::Sender<Vec<u8>>,
    ) -> Result<Flow, ProtocolError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode frame: {e}");
                return Ok(Flow::Continue);
            }
        };
        self.stats.write().await.total_messages += 1;

        match msg.msg_type {
            MessageType::Join => {
                if member.is_some() {
                    log::debug!("Duplicate join from {}", msg.replica);
                    return Ok(Flow::Continue);
                }
                let Some((state, peer, rx)) = self.join(&msg.room, msg.replica).await else {
                    log::warn!("Room {} is full, refusing {}", msg.room, msg.replica);
                    return Ok(Flow::Leave);
                };
                log::info!("Peer {} joined room {}", msg.replica, msg.room);
                *frames = Some(rx);
                *member = Some(Membership {
                    peer,
                    replica: msg.replica,
                    room: msg.room,
                    state,
                });
            }
            MessageType::SyncStep1 => {
                let Some(m) = member.as_ref() else {
                    log::warn!("SyncStep1 from {} before join", msg.replica);
                    return Ok(Flow::Continue);
                };
                let remote = match msg.state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Corrupt state vector from {}: {e}", msg.replica);
                        return Ok(Flow::Continue);
                    }
                };
                let (ours, diff) = {
                    let doc = m.state.doc.lock().await;
                    (doc.state_vector(), doc.diff(&remote))
                };
                log::debug!("Sending {} operations to {} in room {}", diff.len(), msg.replica, m.room);
                send(outgoing, SyncMessage::sync_step1(self.replica, &m.room, &ours)?).await?;
                send(outgoing, SyncMessage::sync_step2(self.replica, &m.room, &diff)?).await?;
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let Some(m) = member.as_ref() else {
                    log::warn!("{:?} from {} before join", msg.msg_type, msg.replica);
                    return Ok(Flow::Continue);
                };
                let operations = match msg.operations() {
                    Ok(ops) => ops,
                    Err(e) => {
                        log::warn!("Corrupt operations from {}: {e}", msg.replica);
                        return Ok(Flow::Continue);
                    }
                };
                let fresh = merge(&m.state, operations).await;
                if !fresh.is_empty() {
                    let update = SyncMessage::update(msg.replica, &m.room, &fresh)?;
                    m.state.broadcast.broadcast(&update)?;
                    self.stats.write().await.relayed_operations += fresh.len() as u64;
                }
            }
            MessageType::Ping => send(outgoing, SyncMessage::pong(self.replica)).await?,
            MessageType::Pong => {}
            MessageType::Leave => return Ok(Flow::Leave),
        }
        Ok(Flow::Continue)
    }

    /// Get or create a room and subscribe `replica` to it. `None` when the
    /// room is full.
    async fn join(
        &self,
        room: &str,
        replica: ReplicaId,
    ) -> Option<(Arc<RelayRoom>, PeerId, broadcast::Receiver<Arc<Frame>>)> {
        let mut rooms = self.rooms.write().await;
        let state = match rooms.get(room) {
            Some(state) => state.clone(),
            None => {
                let state = Arc::new(RelayRoom {
                    doc: Mutex::new(self.load_room(room).await),
                    broadcast: BroadcastGroup::new(self.config.broadcast_capacity),
                });
                rooms.insert(room.to_string(), state.clone());
                self.stats.write().await.active_rooms = rooms.len();
                log::info!("Room {room} created");
                state
            }
        };
        if state.broadcast.peer_count().await >= self.config.max_peers_per_room {
            return None;
        }
        let (peer, rx) = state.broadcast.add_peer(replica).await;
        Some((state, peer, rx))
    }

    async fn load_room(&self, room: &str) -> Document {
        let mut doc = Document::new(self.replica);
        let Some(store) = &self.store else {
            return doc;
        };
        match store.load(room).await {
            Ok(Some(snapshot)) => match doc.load_snapshot(snapshot) {
                Ok(n) => log::info!("Loaded persisted snapshot for room {room} ({n} operations)"),
                Err(e) => log::warn!("Stored snapshot for room {room} unusable: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load room {room}: {e}"),
        }
        doc
    }

    /// Drop one peer link from its room; persist and remove the room once
    /// its last link is gone.
    async fn release(&self, member: Membership) {
        let Membership {
            peer,
            replica,
            room,
            state,
        } = member;
        let mut rooms = self.rooms.write().await;
        log::info!("Peer {replica} left room {room}");
        if state.broadcast.remove_peer(peer).await > 0 {
            return;
        }
        if !rooms.get(&room).is_some_and(|current| Arc::ptr_eq(current, &state)) {
            return;
        }

        if let Some(store) = &self.store {
            let pending = {
                let doc = state.doc.lock().await;
                doc.is_dirty().then(|| (doc.snapshot(), doc.version()))
            };
            if let Some((snapshot, version)) = pending {
                match store.save(&room, &snapshot).await {
                    Ok(()) => {
                        state.doc.lock().await.mark_persisted(version);
                        self.stats.write().await.persisted_snapshots += 1;
                        log::info!("Persisted snapshot for room {room} (room closing)");
                    }
                    Err(e) => log::error!("Failed to persist snapshot for room {room}: {e}"),
                }
            }
        }

        rooms.remove(&room);
        self.stats.write().await.active_rooms = rooms.len();
        log::info!("Room {room} removed (empty)");
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Content of an active room.
    pub async fn room_content(&self, room: &str) -> Option<Content> {
        let state = self.rooms.read().await.get(room).cloned()?;
        let content = state.doc.lock().await.content();
        Some(content)
    }

    pub async fn room_state_vector(&self, room: &str) -> Option<StateVector> {
        let state = self.rooms.read().await.get(room).cloned()?;
        let sv = state.doc.lock().await.state_vector();
        Some(sv)
    }
}

/// Merge operations into a room, returning the ones that were new.
async fn merge(room: &RelayRoom, operations: Vec<Operation>) -> Vec<Operation> {
    let mut doc = room.doc.lock().await;
    operations
        .into_iter()
        .filter(|op| {
            matches!(
                doc.apply_remote(op.clone()),
                MergeOutcome::Applied | MergeOutcome::Pending
            )
        })
        .collect()
}

async fn next_frame(
    frames: &mut Option<broadcast::Receiver<Arc<Frame>>>,
) -> Result<Arc<Frame>, RecvError> {
    match frames {
        Some(rx) => rx.recv().await,
        // Not joined yet: wait forever
        None => std::future::pending().await,
    }
}

async fn send(outgoing: &mpsc::Sender<Vec<u8>>, msg: SyncMessage) -> Result<(), ProtocolError> {
    let bytes = msg.encode()?;
    outgoing
        .send(bytes)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed)
}

/// In-process connector to a [`Relay`]. Can be switched offline, which
/// severs open links and refuses new ones.
pub struct LocalConnector {
    relay: Arc<Relay>,
    online: watch::Sender<bool>,
    capacity: usize,
}

impl LocalConnector {
    pub fn new(relay: Arc<Relay>) -> Self {
        let (online, _) = watch::channel(true);
        let capacity = relay.config.broadcast_capacity;
        Self {
            relay,
            online,
            capacity,
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _room: &str) -> Result<Link, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Offline);
        }
        let (client_tx, client_rx) = mpsc::channel(self.capacity);
        let (to_client_tx, to_client_rx) = mpsc::channel(self.capacity);
        let (relay_in_tx, relay_in_rx) = mpsc::channel(self.capacity);
        let (relay_out_tx, relay_out_rx) = mpsc::channel(self.capacity);

        tokio::spawn(self.relay.clone().serve_peer(relay_in_rx, relay_out_tx));
        let forwarder = tokio::spawn(forward(
            client_rx,
            relay_in_tx,
            relay_out_rx,
            to_client_tx,
            self.online.subscribe(),
        ));
        Ok(Link::new(client_tx, to_client_rx).with_task(forwarder))
    }
}

/// Shuttle frames between a link and a relay peer until either side closes
/// or the connector goes offline. Dropping the relay-side sender lets the
/// relay run its leave handling.
async fn forward(
    mut from_client: mpsc::Receiver<Vec<u8>>,
    to_relay: mpsc::Sender<Vec<u8>>,
    mut from_relay: mpsc::Receiver<Vec<u8>>,
    to_client: mpsc::Sender<Vec<u8>>,
    mut online: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = offline(&mut online) => break,
            frame = from_client.recv() => match frame {
                Some(bytes) => if to_relay.send(bytes).await.is_err() { break },
                None => break,
            },
            frame = from_relay.recv() => match frame {
                Some(bytes) => if to_client.send(bytes).await.is_err() { break },
                None => break,
            },
        }
    }
}

async fn offline(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|online| !*online).await;
}
