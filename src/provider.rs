//! Sync transport provider: bridges the replicated document engine to a
//! document's broadcast channel.
//!
//! The transport gives at-most-once delivery, no ordering across
//! publishers, no persistence, and drops everything while the local client
//! is disconnected. The provider's job is eventual convergence despite
//! that, leaning entirely on the engine's merge properties:
//!
//! - on join it broadcasts a `SyncRequest` and arms a convergence timeout;
//!   any connected peer may answer with a full-state `SyncResponse`
//! - local deltas are published as `Update` messages; remote ones are
//!   applied with a Remote origin tag so they are never re-broadcast
//! - `synced` means "received at least one full-state reply or timed out
//!   waiting", not "identical to all peers"
//!
//! Local deltas produced while disconnected are dropped, not queued; after
//! a reconnect, offline edits reach peers only through a later full-state
//! exchange (a peer's own `SyncRequest` reaching this client).
//!
//! The whole state machine runs on one spawned task per provider instance;
//! channel callbacks, engine callbacks and the timeout are never concurrent
//! with each other, so there is no locking inside the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::engine::{DocChange, ReplicatedDoc, UpdateOrigin};
use crate::protocol::{MessageKind, SyncMessage};
use crate::transport::{
    BroadcastTransport, ChannelEvent, ChannelPublisher, TransportError,
};

/// Connection state of a provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the provider.
///
/// A closed sum type delivered over one channel, so callers can handle the
/// whole surface exhaustively.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Connection state changed.
    Status(ConnectionState),
    /// First full-state reply applied, or the convergence timeout elapsed
    /// with no peers. Emitted at most once per connected session.
    Synced,
    /// A non-fatal failure: an undecodable or unappliable message was
    /// dropped, or the channel reported an error.
    Error(String),
}

/// Provider tuning knobs.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How long a fresh session waits for a `SyncResponse` before assuming
    /// it is the first/only client and declaring itself synced.
    pub convergence_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            convergence_timeout: Duration::from_secs(3),
        }
    }
}

/// The sync transport provider.
///
/// One instance per document session; it may cycle
/// disconnected ⇄ connected indefinitely across network interruptions and
/// is terminal only on [`SyncProvider::destroy`].
pub struct SyncProvider {
    engine: Arc<dyn ReplicatedDoc>,
    transport: Arc<dyn BroadcastTransport>,
    document_id: String,
    config: ProviderConfig,

    connected: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,

    event_tx: mpsc::Sender<ProviderEvent>,
    event_rx: Option<mpsc::Receiver<ProviderEvent>>,

    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl SyncProvider {
    pub fn new(
        engine: Arc<dyn ReplicatedDoc>,
        transport: Arc<dyn BroadcastTransport>,
        document_id: impl Into<String>,
        config: ProviderConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            engine,
            transport,
            document_id: document_id.into(),
            config,
            connected: Arc::new(AtomicBool::new(false)),
            synced: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.event_rx.take()
    }

    /// Whether the broadcast subscription is live.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether this session has received a full-state reply (or given up
    /// waiting). Resets on disconnect.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// The channel this provider publishes on.
    pub fn channel_name(&self) -> String {
        format!("sync:{}", self.document_id)
    }

    /// The engine this provider is bridging.
    pub fn engine(&self) -> Arc<dyn ReplicatedDoc> {
        Arc::clone(&self.engine)
    }

    /// Join the document's broadcast channel and start the sync session.
    ///
    /// May be called once per session; after a disconnect use
    /// [`SyncProvider::reconnect`].
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Err(TransportError::AlreadyJoined);
        }

        let handle = self.transport.join(&self.channel_name())?;
        // Subscribed but not yet acked; a failed join emits nothing.
        let _ = self
            .event_tx
            .try_send(ProviderEvent::Status(ConnectionState::Connecting));
        let changes = self.engine.subscribe();
        // Fresh shutdown handle per session so a stale notification from a
        // previous teardown cannot cancel this one.
        self.shutdown = Arc::new(Notify::new());

        let task = SyncTask {
            engine: Arc::clone(&self.engine),
            publisher: Arc::clone(&handle.publisher),
            document_id: self.document_id.clone(),
            connected: Arc::clone(&self.connected),
            synced: Arc::clone(&self.synced),
            event_tx: self.event_tx.clone(),
            convergence_timeout: self.config.convergence_timeout,
        };
        let shutdown = Arc::clone(&self.shutdown);
        self.task = Some(tokio::spawn(task.run(handle.events, changes, shutdown)));

        log::debug!("joining channel {}", self.channel_name());
        Ok(())
    }

    /// Tear down the current session (if any) and join again. The new
    /// session starts unsynced and re-issues a `SyncRequest`.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.teardown().await;
        self.connect()
    }

    /// Tear down the session: stop the event loop, unsubscribe, reset
    /// state to disconnected. Safe to call multiple times.
    pub async fn destroy(&mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.notify_one();
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.synced.store(false, Ordering::SeqCst);
    }
}

/// State owned by the provider's event-loop task.
struct SyncTask {
    engine: Arc<dyn ReplicatedDoc>,
    publisher: Arc<dyn ChannelPublisher>,
    document_id: String,
    connected: Arc<AtomicBool>,
    synced: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ProviderEvent>,
    convergence_timeout: Duration,
}

/// One-shot convergence timer; `None` until the channel is acknowledged
/// and after it has fired.
type ConvergenceTimer = Option<Pin<Box<dyn Future<Output = ()> + Send>>>;

impl SyncTask {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut changes: mpsc::UnboundedReceiver<DocChange>,
        shutdown: Arc<Notify>,
    ) {
        let mut timer: ConvergenceTimer = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    self.publisher.leave();
                    log::debug!("sync session for {} torn down", self.document_id);
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(ChannelEvent::Joined) => {
                            self.connected.store(true, Ordering::SeqCst);
                            self.emit(ProviderEvent::Status(ConnectionState::Connected)).await;
                            log::info!("connected to sync:{}", self.document_id);
                            self.send(SyncMessage::sync_request()).await;
                            timer = Some(Box::pin(tokio::time::sleep(self.convergence_timeout)));
                        }
                        Some(ChannelEvent::Message(bytes)) => {
                            self.handle_message(&bytes, &mut timer).await;
                        }
                        Some(ChannelEvent::Error(reason)) => {
                            log::warn!("sync:{} channel error: {reason}", self.document_id);
                            self.emit(ProviderEvent::Error(reason)).await;
                            self.publisher.leave();
                            self.disconnected().await;
                            break;
                        }
                        Some(ChannelEvent::Closed) | None => {
                            log::info!("sync:{} channel closed", self.document_id);
                            self.publisher.leave();
                            self.disconnected().await;
                            break;
                        }
                        // Presence traffic never appears on the document
                        // channel; nothing to do for membership events.
                        Some(_) => {}
                    }
                }

                Some(change) = changes.recv() => {
                    self.handle_local_change(change).await;
                }

                _ = async { timer.as_mut().unwrap().await }, if timer.is_some() => {
                    timer = None;
                    if !self.synced.load(Ordering::SeqCst) {
                        // No peer answered: first/only client. A heuristic,
                        // not a proof of convergence — it just unblocks the
                        // caller's UI.
                        log::info!(
                            "sync:{} no peers responded within {:?}, assuming first client",
                            self.document_id,
                            self.convergence_timeout
                        );
                        self.mark_synced().await;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, bytes: &[u8], timer: &mut ConvergenceTimer) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                // Corrupt/foreign message: drop it, keep the session alive.
                self.emit(ProviderEvent::Error(format!("dropped message: {e}")))
                    .await;
                return;
            }
        };

        match msg.kind {
            MessageKind::Update => {
                if let Err(e) = self.engine.apply(&msg.payload, UpdateOrigin::Remote) {
                    self.emit(ProviderEvent::Error(format!("dropped update: {e}")))
                        .await;
                }
            }
            MessageKind::SyncRequest => {
                if self.connected.load(Ordering::SeqCst) {
                    let snapshot = self.engine.encode_full_state();
                    log::debug!(
                        "sync:{} answering sync request ({} bytes)",
                        self.document_id,
                        snapshot.len()
                    );
                    self.send(SyncMessage::sync_response(snapshot)).await;
                }
            }
            MessageKind::SyncResponse => {
                match self.engine.apply(&msg.payload, UpdateOrigin::Remote) {
                    Ok(()) => {
                        if !self.synced.load(Ordering::SeqCst) {
                            *timer = None;
                            self.mark_synced().await;
                        }
                    }
                    Err(e) => {
                        self.emit(ProviderEvent::Error(format!("dropped sync response: {e}")))
                            .await;
                    }
                }
            }
        }
    }

    async fn handle_local_change(&self, change: DocChange) {
        // Deltas that resulted from applying a remote message are already
        // on the wire; re-publishing them would relay forever.
        if change.origin != UpdateOrigin::Local {
            return;
        }
        if !self.connected.load(Ordering::SeqCst) {
            log::debug!(
                "sync:{} dropping local delta while disconnected ({} bytes)",
                self.document_id,
                change.delta.len()
            );
            return;
        }
        self.send(SyncMessage::update(change.delta)).await;
    }

    async fn send(&self, msg: SyncMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.emit(ProviderEvent::Error(e.to_string())).await;
                return;
            }
        };
        if let Err(e) = self.publisher.publish(&bytes) {
            self.emit(ProviderEvent::Error(e.to_string())).await;
        }
    }

    async fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
        self.emit(ProviderEvent::Synced).await;
    }

    async fn disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.synced.store(false, Ordering::SeqCst);
        self.emit(ProviderEvent::Status(ConnectionState::Disconnected))
            .await;
    }

    async fn emit(&self, event: ProviderEvent) {
        let _ = self.event_tx.send(event).await;
    }
}
