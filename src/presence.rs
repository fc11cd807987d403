//! Ephemeral presence: per-user liveness, cursor and selection data.
//!
//! Presence lives on its own channel (`"presence:<doc>"`), fully separate
//! from document content, so cursor churn never touches the CRDT merge
//! path. Records are last-write-wins, keyed by user id, never persisted
//! and never merged — there is exactly one legitimate publisher per key.
//!
//! Each publish sends the user's *full* current record, not a delta:
//! staleness self-heals on the next publish.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{unix_millis, ProtocolError};
use crate::transport::{BroadcastTransport, ChannelEvent, ChannelPublisher, TransportError};

/// A caret location in the rich-text document: the path of the containing
/// node plus a character offset within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub path: Vec<u32>,
    pub offset: u32,
}

/// A selection, as anchor/focus carets (focus may precede the anchor for
/// backwards selections).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub anchor: CursorPosition,
    pub focus: CursorPosition,
}

/// One user's presence state. Keyed by `user_id`; last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub display_name: String,
    /// RGBA color for cursor/selection rendering.
    pub color: [f32; 4],
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    /// Unix milliseconds of the last publish.
    pub last_active: u64,
}

impl PresenceRecord {
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: color_from_uuid(user_id),
            cursor: None,
            selection: None,
            last_active: unix_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// Stable color from a user id hash.
fn color_from_uuid(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Aggregate of remote peers' presence records.
///
/// Pure bookkeeping over transport membership events; the local user is
/// always excluded. `keys` maps transport-assigned subscriber keys to user
/// ids so a leave event (which carries only the key) can evict the right
/// record.
pub struct PeerRoster {
    local_user: Uuid,
    peers: HashMap<Uuid, PresenceRecord>,
    keys: HashMap<String, Uuid>,
}

impl PeerRoster {
    pub fn new(local_user: Uuid) -> Self {
        Self {
            local_user,
            peers: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Rebuild from a full membership snapshot.
    pub fn apply_sync(&mut self, snapshot: &[(String, Vec<u8>)]) {
        self.peers.clear();
        self.keys.clear();
        for (key, state) in snapshot {
            self.upsert(key, state);
        }
    }

    /// Insert or overwrite one peer's record.
    pub fn apply_join(&mut self, key: &str, state: &[u8]) {
        self.upsert(key, state);
    }

    /// Remove the record tracked under a subscriber key.
    pub fn apply_leave(&mut self, key: &str) {
        if let Some(user_id) = self.keys.remove(key) {
            self.peers.remove(&user_id);
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.keys.clear();
    }

    /// All remote peers' records (the local user is excluded).
    pub fn remote_peers(&self) -> Vec<PresenceRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn upsert(&mut self, key: &str, state: &[u8]) {
        match PresenceRecord::decode(state) {
            Ok(record) => {
                if record.user_id == self.local_user {
                    return;
                }
                self.keys.insert(key.to_string(), record.user_id);
                self.peers.insert(record.user_id, record);
            }
            Err(e) => {
                // One undecodable record must not poison the roster.
                log::warn!("dropping undecodable presence record: {e}");
            }
        }
    }
}

/// The presence channel for one document session.
///
/// Tracks the local user's record on the transport and aggregates remote
/// peers' records from membership events.
pub struct PresenceChannel {
    channel: String,
    local: Mutex<PresenceRecord>,
    roster: Arc<Mutex<PeerRoster>>,
    publisher: Arc<dyn ChannelPublisher>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl PresenceChannel {
    /// Subscribe to a document's presence channel and announce the local
    /// user.
    pub fn join(
        transport: &dyn BroadcastTransport,
        document_id: &str,
        user_id: Uuid,
        display_name: &str,
    ) -> Result<Self, TransportError> {
        let channel = format!("presence:{document_id}");
        let handle = transport.join(&channel)?;

        let local = PresenceRecord::new(user_id, display_name);
        let bytes = local
            .encode()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        handle.publisher.track(&bytes)?;

        let roster = Arc::new(Mutex::new(PeerRoster::new(user_id)));
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(roster_loop(
            handle.events,
            Arc::clone(&roster),
            Arc::clone(&shutdown),
        ));
        log::debug!("joined presence:{document_id} as {display_name}");

        Ok(Self {
            channel,
            local: Mutex::new(local),
            roster,
            publisher: handle.publisher,
            shutdown,
            task: Some(task),
        })
    }

    /// Subscribe again after a transport failure, re-announcing the
    /// current local record (cursor and selection survive the outage).
    pub async fn rejoin(
        &mut self,
        transport: &dyn BroadcastTransport,
    ) -> Result<(), TransportError> {
        self.leave().await;

        let handle = transport.join(&self.channel)?;
        let bytes = self
            .local
            .lock()
            .unwrap()
            .encode()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        handle.publisher.track(&bytes)?;

        // Fresh shutdown handle per subscription, as on first join.
        self.shutdown = Arc::new(Notify::new());
        self.task = Some(tokio::spawn(roster_loop(
            handle.events,
            Arc::clone(&self.roster),
            Arc::clone(&self.shutdown),
        )));
        self.publisher = handle.publisher;
        log::debug!("rejoined {}", self.channel);
        Ok(())
    }

    /// Publish the local cursor position (`None` clears it).
    pub fn publish_cursor(&self, cursor: Option<CursorPosition>) -> Result<(), TransportError> {
        self.publish_with(|record| record.cursor = cursor)
    }

    /// Publish the local selection (`None` clears it).
    pub fn publish_selection(
        &self,
        selection: Option<SelectionRange>,
    ) -> Result<(), TransportError> {
        self.publish_with(|record| record.selection = selection)
    }

    /// Refresh the liveness timestamp without changing cursor/selection.
    pub fn touch(&self) -> Result<(), TransportError> {
        self.publish_with(|_| {})
    }

    fn publish_with(
        &self,
        mutate: impl FnOnce(&mut PresenceRecord),
    ) -> Result<(), TransportError> {
        let mut local = self.local.lock().unwrap();
        mutate(&mut local);
        local.last_active = unix_millis();
        let bytes = local
            .encode()
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        self.publisher.track(&bytes)
    }

    /// The local user's current record.
    pub fn local_record(&self) -> PresenceRecord {
        self.local.lock().unwrap().clone()
    }

    /// All remote peers' records.
    pub fn remote_peers(&self) -> Vec<PresenceRecord> {
        self.roster.lock().unwrap().remote_peers()
    }

    pub fn peer_count(&self) -> usize {
        self.roster.lock().unwrap().peer_count()
    }

    /// Withdraw the local record and unsubscribe. Safe to call multiple
    /// times.
    pub async fn leave(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.notify_one();
            let _ = task.await;
        }
        self.publisher.leave();
        self.roster.lock().unwrap().clear();
    }
}

async fn roster_loop(
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    roster: Arc<Mutex<PeerRoster>>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            event = events.recv() => match event {
                Some(ChannelEvent::PresenceSync(snapshot)) => {
                    roster.lock().unwrap().apply_sync(&snapshot);
                }
                Some(ChannelEvent::PresenceJoin { key, state }) => {
                    roster.lock().unwrap().apply_join(&key, &state);
                }
                Some(ChannelEvent::PresenceLeave { key }) => {
                    roster.lock().unwrap().apply_leave(&key);
                }
                Some(ChannelEvent::Joined) | Some(ChannelEvent::Message(_)) => {}
                Some(ChannelEvent::Closed) | Some(ChannelEvent::Error(_)) | None => {
                    // Liveness data is meaningless without a channel.
                    roster.lock().unwrap().clear();
                    break;
                }
            },
        }
    }
}
