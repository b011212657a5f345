//! Session coordinator: one open document in one room.
//!
//! ```text
//!                 ┌──────────── Session ────────────┐
//!  apply_local ──►│ UndoManager ──► Document (lock) │──► Connection ──► relay
//!  undo / redo    │                    ▲            │
//!                 │   inbox task ──────┘            │◄── TransportEvent
//!                 │   Autosave ──► SnapshotStore    │
//!                 └─────────────────────────────────┘
//! ```
//!
//! Opening a session starts the transport and the autosave loop first and
//! then hydrates from storage, so live content that arrives meanwhile takes
//! precedence over the stored snapshot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use tandem_core::undo::DEFAULT_UNDO_LIMIT;
use tandem_core::{
    CollabError, Content, Document, EditIntent, MergeOutcome, Operation, ReplicaId, StateVector,
    UndoManager, UndoMode,
};

use crate::reconciler::{self, Autosave, AutosaveStats, HydrationOutcome, DEFAULT_AUTOSAVE_INTERVAL};
use crate::storage::SnapshotStore;
use crate::transport::{Connection, ConnectionState, Connector, TransportConfig, TransportEvent};
use crate::DocHandle;

/// How long `close` lets the inbox drain after the transport stopped.
const INBOX_DRAIN: Duration = Duration::from_millis(500);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub autosave_interval: Duration,
    pub transport: TransportConfig,
    /// Persist a dirty document when the session closes
    pub flush_on_close: bool,
    /// Replica id to use; random when `None`
    pub replica: Option<ReplicaId>,
    pub undo_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            transport: TransportConfig::default(),
            flush_on_close: true,
            replica: None,
            undo_limit: DEFAULT_UNDO_LIMIT,
        }
    }
}

pub struct Session {
    room: String,
    replica: ReplicaId,
    doc: DocHandle,
    undo: UndoManager,
    store: Arc<dyn SnapshotStore>,
    connection: Option<Connection>,
    inbox: Option<JoinHandle<()>>,
    autosave: Option<Autosave>,
    hydration: HydrationOutcome,
    flush_on_close: bool,
}

impl Session {
    /// Open `room`. With a connector the session replicates through it and
    /// undo is collaborative; without one it is a standalone editor with
    /// linear undo.
    pub async fn open(
        room: &str,
        store: Arc<dyn SnapshotStore>,
        connector: Option<Arc<dyn Connector>>,
        config: SessionConfig,
    ) -> Self {
        let replica = config.replica.unwrap_or_else(ReplicaId::random);
        let doc: DocHandle = Arc::new(Mutex::new(Document::new(replica)));

        let mode = if connector.is_some() {
            UndoMode::Collaborative
        } else {
            UndoMode::Linear
        };
        let undo = UndoManager::new(mode).with_limit(config.undo_limit);

        let (connection, inbox) = match connector {
            Some(connector) => {
                let (events_tx, events_rx) = mpsc::channel(config.transport.channel_capacity);
                let connection = Connection::spawn(
                    room,
                    replica,
                    doc.clone(),
                    connector,
                    config.transport.clone(),
                    events_tx,
                );
                let inbox = tokio::spawn(pump_inbox(doc.clone(), events_rx));
                (Some(connection), Some(inbox))
            }
            None => (None, None),
        };

        let autosave = Autosave::spawn(room, doc.clone(), store.clone(), config.autosave_interval);
        let hydration = reconciler::hydrate(&doc, store.as_ref(), room).await;
        if let (HydrationOutcome::Loaded { .. }, Some(connection)) = (&hydration, &connection) {
            // The handshake may have run before the load finished
            let loaded = doc.lock().await.diff(&StateVector::new());
            connection.broadcast(loaded);
        }
        log::info!("Opened room {room} as replica {replica} ({mode:?} undo, {hydration:?})");

        Self {
            room: room.to_string(),
            replica,
            doc,
            undo,
            store,
            connection,
            inbox,
            autosave: Some(autosave),
            hydration,
            flush_on_close: config.flush_on_close,
        }
    }

    /// Apply a local edit and send the resulting operations to peers.
    pub async fn apply_local(&mut self, intent: EditIntent) -> Result<Vec<Operation>, CollabError> {
        let ops = {
            let mut doc = self.doc.lock().await;
            self.undo.apply(&mut doc, intent)?
        };
        self.publish(&ops);
        Ok(ops)
    }

    /// Revert the most recent local step. Empty when there is nothing to
    /// undo.
    pub async fn undo(&mut self) -> Result<Vec<Operation>, CollabError> {
        let ops = {
            let mut doc = self.doc.lock().await;
            self.undo.undo(&mut doc)?
        };
        self.publish(&ops);
        Ok(ops)
    }

    pub async fn redo(&mut self) -> Result<Vec<Operation>, CollabError> {
        let ops = {
            let mut doc = self.doc.lock().await;
            self.undo.redo(&mut doc)?
        };
        self.publish(&ops);
        Ok(ops)
    }

    fn publish(&self, ops: &[Operation]) {
        if let Some(connection) = &self.connection {
            connection.broadcast(ops.to_vec());
        }
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn undo_mode(&self) -> UndoMode {
        self.undo.mode()
    }

    pub async fn content(&self) -> Content {
        self.doc.lock().await.content()
    }

    pub async fn text(&self) -> String {
        self.doc.lock().await.text()
    }

    pub async fn state_vector(&self) -> StateVector {
        self.doc.lock().await.state_vector()
    }

    /// Shared handle to the underlying document.
    pub fn document(&self) -> DocHandle {
        self.doc.clone()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn hydration(&self) -> &HydrationOutcome {
        &self.hydration
    }

    /// `Disconnected` for a standalone session.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state())
    }

    /// Wait for the transport to reach `state`. False on timeout or for a
    /// standalone session.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        match &self.connection {
            Some(connection) => connection.wait_for_state(state, timeout).await,
            None => false,
        }
    }

    pub fn autosave_stats(&self) -> AutosaveStats {
        self.autosave.as_ref().map(Autosave::stats).unwrap_or_default()
    }

    /// Stop replication and autosave, then flush the document if it is
    /// dirty and flushing is enabled.
    pub async fn close(mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        if let Some(mut inbox) = self.inbox.take() {
            if tokio::time::timeout(INBOX_DRAIN, &mut inbox).await.is_err() {
                inbox.abort();
            }
        }
        if let Some(autosave) = self.autosave.take() {
            autosave.stop().await;
        }
        if self.flush_on_close {
            match reconciler::persist_now(&self.doc, self.store.as_ref(), &self.room).await {
                Ok(true) => log::info!("Flushed room {} on close", self.room),
                Ok(false) => {}
                Err(e) => log::warn!("Flushing room {} on close failed: {e}", self.room),
            }
        }
        log::info!("Closed room {}", self.room);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(inbox) = self.inbox.take() {
            inbox.abort();
        }
    }
}

/// Apply transport events to the document until the transport goes away.
async fn pump_inbox(doc: DocHandle, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Remote { origin, operations } => {
                let mut doc = doc.lock().await;
                let total = operations.len();
                let mut applied = 0;
                for op in operations {
                    if doc.apply_remote(op) == MergeOutcome::Applied {
                        applied += 1;
                    }
                }
                log::trace!("Applied {applied}/{total} operations via {origin}");
            }
            TransportEvent::State(state) => log::debug!("Transport state: {state:?}"),
        }
    }
}
