//! Persistence reconciler: hydrates a document from its stored snapshot and
//! keeps the snapshot current while the document changes.
//!
//! Live content wins. A stored snapshot is only loaded into a document that
//! is still pristine; once anything arrived over the network the snapshot
//! is discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::storage::{SnapshotStore, StoreError};
use crate::transport::stopped;
use crate::DocHandle;

/// Default autosave period.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(3);

/// Result of [`hydrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// The snapshot was loaded; `operations` were replayed from it.
    Loaded { operations: usize },
    /// A snapshot existed but the document already had content.
    Discarded,
    /// Nothing stored for this room.
    NotFound,
    /// The store could not be read or the snapshot could not be decoded.
    Failed,
}

/// Load the stored snapshot of `room` into `doc` if `doc` is still
/// pristine. Failures are logged, never returned.
pub async fn hydrate(doc: &DocHandle, store: &dyn SnapshotStore, room: &str) -> HydrationOutcome {
    let snapshot = match store.load(room).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            log::debug!("No stored snapshot for room {room}");
            return HydrationOutcome::NotFound;
        }
        Err(e) => {
            log::warn!("Failed to load snapshot for room {room}: {e}");
            return HydrationOutcome::Failed;
        }
    };

    let mut doc = doc.lock().await;
    if !doc.is_pristine() {
        log::info!("Discarding stored snapshot for room {room}: document already has content");
        return HydrationOutcome::Discarded;
    }
    match doc.load_snapshot(snapshot) {
        Ok(operations) => {
            log::info!("Hydrated room {room} from {operations} stored operations");
            HydrationOutcome::Loaded { operations }
        }
        Err(e) => {
            log::warn!("Failed to load snapshot for room {room}: {e}");
            HydrationOutcome::Failed
        }
    }
}

/// Save `doc` if it is dirty. Returns whether a save happened.
///
/// The document is only marked clean at the version that was captured, so
/// edits made during the write keep it dirty.
pub async fn persist_now(
    doc: &DocHandle,
    store: &dyn SnapshotStore,
    room: &str,
) -> Result<bool, StoreError> {
    let (snapshot, version) = {
        let doc = doc.lock().await;
        if !doc.is_dirty() {
            return Ok(false);
        }
        (doc.snapshot(), doc.version())
    };

    store.save(room, &snapshot).await?;

    let clean = doc.lock().await.mark_persisted(version);
    if clean {
        log::debug!("Saved room {room} at version {version}");
    } else {
        log::debug!("Saved room {room} at version {version}, newer edits pending");
    }
    Ok(true)
}

/// Autosave counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AutosaveStats {
    pub saves: u64,
    pub failures: u64,
}

#[derive(Default)]
struct AtomicAutosaveStats {
    saves: AtomicU64,
    failures: AtomicU64,
}

/// Periodically persists a dirty document.
pub struct Autosave {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    stats: Arc<AtomicAutosaveStats>,
}

impl Autosave {
    /// Start saving `doc` to `store` every `interval`. The first save is
    /// attempted one interval from now.
    pub fn spawn(
        room: impl Into<String>,
        doc: DocHandle,
        store: Arc<dyn SnapshotStore>,
        interval: Duration,
    ) -> Self {
        let room = room.into();
        let period = interval.max(Duration::from_millis(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let stats = Arc::new(AtomicAutosaveStats::default());
        let counters = stats.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = ticker.tick() => {
                        // An in-flight write is abandoned on shutdown
                        tokio::select! {
                            _ = stopped(&mut shutdown_rx) => break,
                            result = persist_now(&doc, store.as_ref(), &room) => match result {
                                Ok(true) => {
                                    counters.saves.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(false) => {}
                                Err(e) => {
                                    counters.failures.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Autosave of room {room} failed: {e}");
                                }
                            },
                        }
                    }
                }
            }
            log::debug!("Autosave for room {room} stopped");
        });

        Self {
            shutdown,
            task: Some(task),
            stats,
        }
    }

    pub fn stats(&self) -> AutosaveStats {
        AutosaveStats {
            saves: self.stats.saves.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
