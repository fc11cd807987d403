//! Replicated document engine boundary.
//!
//! The engine is an opaque CRDT: applying any valid delta or full-state
//! snapshot, in any order, any number of times, converges to the same
//! content on every replica. That merge property is a trusted precondition
//! here — this module only bridges the engine to the sync provider, it does
//! not implement merge logic of its own.
//!
//! Every change the engine emits carries an origin tag so the provider can
//! tell locally-produced deltas (broadcast them) from deltas it applied on
//! behalf of a remote peer (already on the wire — re-broadcasting would
//! loop forever).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Which side of the wire produced a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by an edit on this client.
    Local,
    /// Applied by this client's provider on behalf of a remote peer.
    Remote,
}

/// One engine-emitted change notification.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub delta: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// Engine errors. One corrupt delta must not desynchronize the session, so
/// these are surfaced per-message and the offending message is dropped.
#[derive(Debug, Clone)]
pub enum EngineError {
    InvalidDelta(String),
    Apply(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDelta(e) => write!(f, "Invalid delta: {e}"),
            Self::Apply(e) => write!(f, "Apply failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// The replicated document engine as the provider sees it.
///
/// Deliberately minimal: apply a binary delta or snapshot, encode the full
/// current state, observe changes. Duplicated and out-of-order applies are
/// safe by the engine's CRDT contract.
pub trait ReplicatedDoc: Send + Sync {
    /// Merge an incoming binary delta (or full-state snapshot — the wire
    /// format is the same) into the document.
    fn apply(&self, delta: &[u8], origin: UpdateOrigin) -> Result<(), EngineError>;

    /// Encode the entire current state as a snapshot a fresh replica can
    /// bootstrap from.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Subscribe to change notifications. Each committed transaction emits
    /// one [`DocChange`] tagged with its origin.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DocChange>;
}

type Listeners = Arc<Mutex<Vec<mpsc::UnboundedSender<DocChange>>>>;

/// Yrs-backed engine holding one shared rich-text root.
///
/// Origin tagging uses an `applying_remote` flag around remote applies:
/// the update observer fires inside the commit, so emissions during a
/// remote apply are tagged [`UpdateOrigin::Remote`] and everything else is
/// a local edit.
///
/// One writer context per engine: committing a local edit concurrently
/// with [`ReplicatedDoc::apply`] from another thread can mis-tag it as
/// remote, and a mis-tagged edit is never broadcast. Callers must drive
/// all edits to one document from a single context (the editing surface's
/// event loop), as a browser client does by construction.
pub struct YrsEngine {
    doc: Doc,
    text: yrs::TextRef,
    applying_remote: Arc<AtomicBool>,
    listeners: Listeners,
    _update_subscription: yrs::Subscription,
}

/// Name of the Y.Text holding the document content.
const CONTENT_TEXT_NAME: &str = "content";

impl YrsEngine {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_TEXT_NAME);

        let listeners: Listeners = Arc::new(Mutex::new(Vec::new()));
        let applying_remote = Arc::new(AtomicBool::new(false));

        let observer_listeners = Arc::clone(&listeners);
        let observer_flag = Arc::clone(&applying_remote);
        let subscription = doc
            .observe_update_v1(move |_, event| {
                let origin = if observer_flag.load(Ordering::SeqCst) {
                    UpdateOrigin::Remote
                } else {
                    UpdateOrigin::Local
                };
                let change = DocChange {
                    delta: event.update.clone(),
                    origin,
                };
                let mut subs = observer_listeners.lock().unwrap();
                subs.retain(|tx| tx.send(change.clone()).is_ok());
            })
            .expect("failed to observe document updates");

        Self {
            doc,
            text,
            applying_remote,
            listeners,
            _update_subscription: subscription,
        }
    }

    /// Insert text at a character index. Emits a Local change.
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    /// Remove a character range. Emits a Local change.
    pub fn remove_range(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
    }

    /// Full document content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }
}

impl Default for YrsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedDoc for YrsEngine {
    fn apply(&self, delta: &[u8], origin: UpdateOrigin) -> Result<(), EngineError> {
        let update =
            Update::decode_v1(delta).map_err(|e| EngineError::InvalidDelta(e.to_string()))?;

        if origin == UpdateOrigin::Remote {
            self.applying_remote.store(true, Ordering::SeqCst);
        }
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
            // Observer fires on commit, i.e. when `txn` drops — the flag
            // must stay set until then.
        };
        self.applying_remote.store(false, Ordering::SeqCst);

        result.map_err(|e| EngineError::Apply(e.to_string()))
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<DocChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }
}
