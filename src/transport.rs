//! Broadcast transport boundary and the in-memory hub.
//!
//! The pub/sub transport is an external collaborator: best-effort,
//! unordered, non-persistent. Clients get one subscription per channel
//! name (`"sync:<doc>"` for documents, `"presence:<doc>"` for cursors);
//! a published message fans out to every *other* current subscriber.
//!
//! The transport is injected into the provider at construction time via
//! [`BroadcastTransport`] — no ambient singleton — so tests substitute
//! [`InMemoryBroadcast`] for the real thing. The hub also implements the
//! transport-level presence aggregation (`track` + membership snapshots)
//! the presence channel builds on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Events delivered on a channel subscription.
///
/// A closed set: the provider and presence channel `match` exhaustively.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Subscription acknowledged; the channel is live.
    Joined,
    /// A broadcast payload from another subscriber.
    Message(Vec<u8>),
    /// Full membership snapshot of tracked presence states, keyed by
    /// transport-assigned subscriber key. Delivered once on join.
    PresenceSync(Vec<(String, Vec<u8>)>),
    /// A subscriber published (or overwrote) its tracked presence state.
    PresenceJoin { key: String, state: Vec<u8> },
    /// A subscriber's tracked presence state was withdrawn.
    PresenceLeave { key: String },
    /// The channel closed; no further events will arrive.
    Closed,
    /// The channel errored; no further events will arrive.
    Error(String),
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The subscription is gone; publishing is impossible.
    ChannelClosed,
    /// The provider instance already holds a live subscription.
    AlreadyJoined,
    Publish(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::AlreadyJoined => write!(f, "Already joined"),
            Self::Publish(e) => write!(f, "Publish failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Write half of a channel subscription.
pub trait ChannelPublisher: Send + Sync {
    /// Broadcast a payload to all other subscribers. Fire-and-forget:
    /// delivery is best-effort with no ordering guarantee.
    fn publish(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Publish (or overwrite) this subscriber's presence state.
    /// Last write wins; the state is withdrawn on leave.
    fn track(&self, state: &[u8]) -> Result<(), TransportError>;

    /// Tear down the subscription. Idempotent.
    fn leave(&self);
}

/// A live channel subscription: write half plus the event stream.
pub struct ChannelHandle {
    pub publisher: Arc<dyn ChannelPublisher>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// The pub/sub transport a client connects through.
pub trait BroadcastTransport: Send + Sync {
    fn join(&self, channel: &str) -> Result<ChannelHandle, TransportError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory hub
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ChannelState {
    subscribers: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
    /// Tracked presence states, keyed by subscriber id.
    presence: HashMap<u64, Vec<u8>>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, ChannelState>,
    next_id: u64,
}

impl HubState {
    fn remove_subscriber(&mut self, channel: &str, id: u64, notify: Option<ChannelEvent>) {
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        let Some(tx) = state.subscribers.remove(&id) else {
            return;
        };
        if let Some(event) = notify {
            let _ = tx.send(event);
        }
        if state.presence.remove(&id).is_some() {
            let key = id.to_string();
            for peer_tx in state.subscribers.values() {
                let _ = peer_tx.send(ChannelEvent::PresenceLeave { key: key.clone() });
            }
        }
        if state.subscribers.is_empty() {
            self.channels.remove(channel);
        }
    }
}

/// In-memory broadcast fabric shared by all simulated clients.
///
/// One hub stands in for the whole pub/sub service; each simulated browser
/// client gets its own [`BroadcastClient`] so a single client's network
/// loss can be simulated without touching its peers.
#[derive(Default)]
pub struct InMemoryBroadcast {
    inner: Arc<Mutex<HubState>>,
}

impl InMemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client handle onto this hub.
    pub fn client(&self) -> BroadcastClient {
        BroadcastClient {
            inner: Arc::clone(&self.inner),
            joined: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of live subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let hub = self.inner.lock().unwrap();
        hub.channels
            .get(channel)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Fail a whole channel: every subscriber receives an error event and
    /// is dropped. Simulates the transport reporting `CHANNEL_ERROR`.
    pub fn fail_channel(&self, channel: &str, reason: &str) {
        let mut hub = self.inner.lock().unwrap();
        if let Some(state) = hub.channels.remove(channel) {
            for tx in state.subscribers.values() {
                let _ = tx.send(ChannelEvent::Error(reason.to_string()));
            }
        }
    }
}

/// One simulated client's view of the hub.
///
/// Implements [`BroadcastTransport`]; every subscription made through this
/// client is severed by [`BroadcastClient::disconnect`].
#[derive(Clone)]
pub struct BroadcastClient {
    inner: Arc<Mutex<HubState>>,
    joined: Arc<Mutex<Vec<(String, u64)>>>,
}

impl BroadcastClient {
    /// Sever every subscription made through this client, as if the
    /// client's network connection dropped. Each affected subscription
    /// receives `Closed`; other clients on the same channels are
    /// untouched (beyond presence-leave notifications).
    pub fn disconnect(&self) {
        let joined: Vec<(String, u64)> = self.joined.lock().unwrap().drain(..).collect();
        let mut hub = self.inner.lock().unwrap();
        for (channel, id) in joined {
            hub.remove_subscriber(&channel, id, Some(ChannelEvent::Closed));
        }
    }
}

impl BroadcastTransport for BroadcastClient {
    fn join(&self, channel: &str) -> Result<ChannelHandle, TransportError> {
        let mut hub = self.inner.lock().unwrap();
        let id = hub.next_id;
        hub.next_id += 1;

        let state = hub.channels.entry(channel.to_string()).or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Joined);
        let snapshot: Vec<(String, Vec<u8>)> = state
            .presence
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let _ = tx.send(ChannelEvent::PresenceSync(snapshot));
        state.subscribers.insert(id, tx);

        self.joined.lock().unwrap().push((channel.to_string(), id));

        Ok(ChannelHandle {
            publisher: Arc::new(HubPublisher {
                inner: Arc::clone(&self.inner),
                channel: channel.to_string(),
                id,
            }),
            events: rx,
        })
    }
}

struct HubPublisher {
    inner: Arc<Mutex<HubState>>,
    channel: String,
    id: u64,
}

impl ChannelPublisher for HubPublisher {
    fn publish(&self, payload: &[u8]) -> Result<(), TransportError> {
        let hub = self.inner.lock().unwrap();
        let state = hub
            .channels
            .get(&self.channel)
            .filter(|c| c.subscribers.contains_key(&self.id))
            .ok_or(TransportError::ChannelClosed)?;
        for (peer_id, tx) in &state.subscribers {
            if *peer_id != self.id {
                let _ = tx.send(ChannelEvent::Message(payload.to_vec()));
            }
        }
        Ok(())
    }

    fn track(&self, state: &[u8]) -> Result<(), TransportError> {
        let mut hub = self.inner.lock().unwrap();
        let channel = hub
            .channels
            .get_mut(&self.channel)
            .filter(|c| c.subscribers.contains_key(&self.id))
            .ok_or(TransportError::ChannelClosed)?;
        channel.presence.insert(self.id, state.to_vec());
        let key = self.id.to_string();
        for (peer_id, tx) in &channel.subscribers {
            if *peer_id != self.id {
                let _ = tx.send(ChannelEvent::PresenceJoin {
                    key: key.clone(),
                    state: state.to_vec(),
                });
            }
        }
        Ok(())
    }

    fn leave(&self) {
        let mut hub = self.inner.lock().unwrap();
        hub.remove_subscriber(&self.channel, self.id, None);
    }
}
