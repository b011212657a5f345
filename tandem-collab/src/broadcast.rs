//! Fan-out of relayed frames to every peer of a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind sees `Lagged` and has to
//! resynchronize.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use tandem_core::ReplicaId;

use crate::protocol::{ProtocolError, SyncMessage};

/// An encoded message plus the replica it came from, so a peer can skip
/// its own traffic.
#[derive(Debug)]
pub struct Frame {
    pub origin: ReplicaId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters on the hot path, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Identifies one subscription. A replica that connects twice holds two.
pub type PeerId = u64;

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,

    /// Live subscriptions and the replica behind each
    peers: RwLock<HashMap<PeerId, ReplicaId>>,
    next_peer: AtomicU64,

    /// Frames buffered per receiver
    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` determines how many frames can be buffered per peer
    /// before lagging peers start dropping them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a peer and return its subscription id and receiver.
    pub async fn add_peer(&self, replica: ReplicaId) -> (PeerId, broadcast::Receiver<Arc<Frame>>) {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        self.peers.write().await.insert(peer, replica);
        (peer, self.sender.subscribe())
    }

    /// Remove one subscription. Returns the number of peers left.
    pub async fn remove_peer(&self, peer: PeerId) -> usize {
        let mut peers = self.peers.write().await;
        peers.remove(&peer);
        peers.len()
    }

    /// Encode `msg` once and send it to every subscriber. Receivers skip
    /// frames whose origin is their own replica.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let frame = Arc::new(Frame {
            origin: msg.replica,
            bytes: msg.encode()?,
        });
        Ok(self.broadcast_raw(frame))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<Frame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether any subscription belongs to `replica`.
    pub async fn has_peer(&self, replica: &ReplicaId) -> bool {
        self.peers.read().await.values().any(|r| r == replica)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
