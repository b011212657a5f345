//! Replication transport: keeps one replica of a room in sync with a relay.
//!
//! ```text
//!  Disconnected ──► Connecting ──► SyncHandshake ──► Synced
//!                       ▲                │              │
//!                       │                ▼              ▼
//!                       └──────── Reconnecting ◄────────┘
//!
//!  close() from any state ──► Closed
//! ```
//!
//! The handshake is symmetric: each side sends its state vector
//! (`SyncStep1`) and answers the other's with the operations it is missing
//! (`SyncStep2`). Operations created while the link is down are not queued;
//! they live in the document and are covered by the next handshake's diff.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use tandem_core::{Operation, ReplicaId};

use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::DocHandle;

/// How long `close` waits for the connection task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    SyncHandshake,
    Synced,
    Reconnecting,
    Closed,
}

/// Events delivered to the owner of a [`Connection`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Operations received from the relay. `origin` is the replica that
    /// sent them on.
    Remote {
        origin: ReplicaId,
        operations: Vec<Operation>,
    },
    State(ConnectionState),
}

/// Transport errors. None of these reach the editing caller; they drive
/// reconnection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Connector is offline")]
    Offline,
    #[error("Connect timed out")]
    Timeout,
    #[error("Link closed")]
    LinkClosed,
    #[error("Session closed")]
    SessionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub backoff: BackoffPolicy,
    /// Ping period. A link silent for two periods counts as lost.
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    /// Buffered frames per direction
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// A bidirectional frame pipe to a relay. Dropping it tears down the
/// tasks that drive it.
pub struct Link {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(outgoing: mpsc::Sender<Vec<u8>>, incoming: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            outgoing,
            incoming,
            tasks: Vec::new(),
        }
    }

    /// Tie a background task to the lifetime of this link.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens links to the relay serving a room.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, room: &str) -> Result<Link, TransportError>;
}

/// Connects over WebSocket to `{url}/{room}`.
pub struct WebSocketConnector {
    url: String,
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            capacity: TransportConfig::default().channel_capacity,
        }
    }

    /// Use the channel capacity of `config` for the link's frame queues.
    pub fn from_config(url: impl Into<String>, config: &TransportConfig) -> Self {
        Self::new(url).with_capacity(config.channel_capacity)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, room: &str) -> Result<Link, TransportError> {
        let url = format!("{}/{}", self.url.trim_end_matches('/'), room);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.capacity);

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward binary frames to the incoming channel
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
        });

        Ok(Link::new(out_tx, in_rx).with_task(writer).with_task(reader))
    }
}

/// Handle to the background task replicating one room.
pub struct Connection {
    state: Arc<watch::Sender<ConnectionState>>,
    commands: mpsc::UnboundedSender<Vec<Operation>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start replicating `doc` through `connector`. Received operations
    /// and state changes are sent to `events`.
    pub fn spawn(
        room: impl Into<String>,
        replica: ReplicaId,
        doc: DocHandle,
        connector: Arc<dyn Connector>,
        config: TransportConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let driver = Driver {
            room: room.into(),
            replica,
            doc,
            connector,
            config,
            events,
            commands,
            shutdown: shutdown_rx,
            state: state.clone(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            state,
            commands: commands_tx,
            shutdown,
            task: Some(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the connection reaches `target`. Returns false on
    /// timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|state| *state == target).await.is_ok()
        })
        .await;
        reached.unwrap_or(false)
    }

    /// Send locally produced operations to peers. Dropped unless the link
    /// is synced; the next handshake covers them.
    pub fn broadcast(&self, operations: Vec<Operation>) {
        if operations.is_empty() {
            return;
        }
        let _ = self.commands.send(operations);
    }

    /// Tear the connection down, whatever state it is in.
    pub async fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                log::warn!("Connection task did not stop in time, aborting");
                task.abort();
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Resolves once `rx` carries `true` or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

enum LinkEnd {
    Lost,
    Shutdown,
}

/// Handshake progress of one link.
#[derive(Default)]
struct Handshake {
    diff_sent: bool,
    diff_received: bool,
}

impl Handshake {
    fn complete(&self) -> bool {
        self.diff_sent && self.diff_received
    }
}

struct Driver {
    room: String,
    replica: ReplicaId,
    doc: DocHandle,
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Vec<Operation>>,
    shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connect().await {
                None => break,
                Some(Ok(link)) => {
                    log::info!("Connected to room {}", self.room);
                    let (end, synced) = self.serve(link).await;
                    if synced {
                        attempt = 0;
                    }
                    if let LinkEnd::Shutdown = end {
                        break;
                    }
                    log::warn!("Link to room {} lost", self.room);
                }
                Some(Err(e)) => {
                    log::warn!("Connecting to room {} failed: {e}", self.room);
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            log::debug!("Reconnecting to room {} in {delay:?}", self.room);
            if !self.idle(delay).await {
                break;
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Room {}: {previous:?} -> {state:?}", self.room);
            let _ = self.events.try_send(TransportEvent::State(state));
        }
    }

    /// Open a link. `None` when shut down first.
    async fn connect(&mut self) -> Option<Result<Link, TransportError>> {
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.room),
        );
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => return None,
                // Not synced: the next handshake diff covers these
                Some(_) = self.commands.recv() => continue,
                result = &mut attempt => {
                    return Some(result.unwrap_or(Err(TransportError::Timeout)));
                }
            }
        }
    }

    /// Wait out a backoff delay. False when shut down first.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => return false,
                Some(_) = self.commands.recv() => continue,
                _ = &mut sleep => return true,
            }
        }
    }

    /// Run one link until it is lost or the connection shuts down. Also
    /// reports whether the link reached `Synced`.
    async fn serve(&mut self, mut link: Link) -> (LinkEnd, bool) {
        self.set_state(ConnectionState::SyncHandshake);
        let mut handshake = Handshake::default();
        let mut synced = false;

        if let Err(e) = self.hello(&link).await {
            log::warn!("Handshake with room {} failed: {e}", self.room);
            return (LinkEnd::Lost, false);
        }

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                _ = stopped(&mut self.shutdown) => {
                    if let Ok(bytes) = SyncMessage::leave(self.replica, &self.room).encode() {
                        let _ = link.outgoing.try_send(bytes);
                    }
                    return (LinkEnd::Shutdown, synced);
                }

                frame = link.incoming.recv() => {
                    let Some(bytes) = frame else {
                        return (LinkEnd::Lost, synced);
                    };
                    last_heard = Instant::now();
                    match self.handle_frame(&link, &bytes, &mut handshake).await {
                        Ok(()) => {}
                        Err(TransportError::SessionClosed) => return (LinkEnd::Shutdown, synced),
                        Err(e) => {
                            log::warn!("Link to room {} failed: {e}", self.room);
                            return (LinkEnd::Lost, synced);
                        }
                    }
                    if !synced && handshake.complete() {
                        synced = true;
                        self.set_state(ConnectionState::Synced);
                        log::info!("Room {} synced", self.room);
                    }
                }

                Some(operations) = self.commands.recv() => {
                    // Before our diff went out, the diff carries these
                    if !handshake.diff_sent {
                        continue;
                    }
                    let update = match SyncMessage::update(self.replica, &self.room, &operations) {
                        Ok(update) => update,
                        Err(e) => {
                            log::warn!("Failed to encode update: {e}");
                            continue;
                        }
                    };
                    if send(&link, update).await.is_err() {
                        return (LinkEnd::Lost, synced);
                    }
                    log::trace!("Sent {} operations to room {}", operations.len(), self.room);
                }

                _ = heartbeat.tick() => {
                    if last_heard.elapsed() >= period * 2 {
                        log::warn!("Link to room {} silent for {:?}", self.room, last_heard.elapsed());
                        return (LinkEnd::Lost, synced);
                    }
                    if send(&link, SyncMessage::ping(self.replica)).await.is_err() {
                        return (LinkEnd::Lost, synced);
                    }
                }
            }
        }
    }

    /// Join the room and offer our state vector.
    async fn hello(&self, link: &Link) -> Result<(), TransportError> {
        let state_vector = self.doc.lock().await.state_vector();
        send(link, SyncMessage::join(self.replica, &self.room)).await?;
        send(link, SyncMessage::sync_step1(self.replica, &self.room, &state_vector)?).await
    }

    async fn handle_frame(
        &mut self,
        link: &Link,
        bytes: &[u8],
        handshake: &mut Handshake,
    ) -> Result<(), TransportError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame from room {}: {e}", self.room);
                return Ok(());
            }
        };

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let remote = match msg.state_vector() {
                    Ok(sv) => sv,
                    Err(e) => {
                        log::warn!("Dropping corrupt state vector: {e}");
                        return Ok(());
                    }
                };
                let diff = self.doc.lock().await.diff(&remote);
                log::debug!("Sending {} missing operations to room {}", diff.len(), self.room);
                send(link, SyncMessage::sync_step2(self.replica, &self.room, &diff)?).await?;
                handshake.diff_sent = true;
            }
            MessageType::SyncStep2 | MessageType::Update => {
                let operations = match msg.operations() {
                    Ok(ops) => ops,
                    Err(e) => {
                        log::warn!("Dropping corrupt operations payload: {e}");
                        return Ok(());
                    }
                };
                if msg.msg_type == MessageType::SyncStep2 {
                    handshake.diff_received = true;
                }
                if !operations.is_empty() {
                    log::trace!("Received {} operations from {}", operations.len(), msg.replica);
                    self.events
                        .send(TransportEvent::Remote {
                            origin: msg.replica,
                            operations,
                        })
                        .await
                        .map_err(|_| TransportError::SessionClosed)?;
                }
            }
            MessageType::Ping => send(link, SyncMessage::pong(self.replica)).await?,
            MessageType::Pong => log::trace!("Pong from {}", msg.replica),
            MessageType::Join | MessageType::Leave => {
                log::debug!("Ignoring {:?} from {}", msg.msg_type, msg.replica);
            }
        }
        Ok(())
    }
}

async fn send(link: &Link, msg: SyncMessage) -> Result<(), TransportError> {
    let bytes = msg.encode()?;
    link.outgoing
        .send(bytes)
        .await
        .map_err(|_| TransportError::LinkClosed)
}
