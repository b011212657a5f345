//! In-memory snapshot store with failure and latency injection.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use tandem_core::Snapshot;

use super::{SnapshotStore, StoreError};

/// Keeps encoded snapshots in a map. Blobs go through the same encoding as
/// a durable store so decode failures can be exercised.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    load_delay: Duration,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `load` by `delay`.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// While unavailable, every call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, room: &str) -> bool {
        self.blobs.lock().await.contains_key(room)
    }

    /// Store arbitrary bytes as the snapshot of `room`.
    pub async fn insert_raw(&self, room: &str, bytes: Vec<u8>) {
        self.blobs.lock().await.insert(room.to_string(), bytes);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, room: &str) -> Result<Option<Snapshot>, StoreError> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.check_available()?;
        let blobs = self.blobs.lock().await;
        match blobs.get(room) {
            Some(bytes) => Ok(Some(Snapshot::decode(bytes)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, room: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check_available()?;
        let bytes = snapshot.encode()?;
        self.blobs.lock().await.insert(room.to_string(), bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
