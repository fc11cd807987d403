//! Editor-facing session glue.
//!
//! A [`DocumentSession`] bundles the three per-document pieces — one
//! replicated engine, one sync provider, one presence channel — behind the
//! surface the editing UI consumes: edit passthrough, the
//! `connected`/`synced` pair for the "connecting… / live" indicator, and a
//! single teardown that guarantees no broadcast subscription leaks when
//! the editing surface goes away.
//!
//! Edits never touch the provider directly: they flow into the engine,
//! whose change notifications the provider observes. Documents stay
//! locally editable while disconnected (optimistic, offline-first).

use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{ReplicatedDoc, YrsEngine};
use crate::presence::{CursorPosition, PresenceChannel, PresenceRecord, SelectionRange};
use crate::provider::{ProviderConfig, ProviderEvent, SyncProvider};
use crate::transport::{BroadcastTransport, TransportError};

/// One user's live editing session on one document.
pub struct DocumentSession {
    engine: Arc<YrsEngine>,
    provider: SyncProvider,
    presence: PresenceChannel,
    transport: Arc<dyn BroadcastTransport>,
}

impl DocumentSession {
    /// Open a session: create a fresh local replica, join the document's
    /// sync channel, and announce the user on the presence channel.
    pub async fn open(
        transport: Arc<dyn BroadcastTransport>,
        document_id: &str,
        user_id: Uuid,
        display_name: &str,
        config: ProviderConfig,
    ) -> Result<Self, TransportError> {
        let engine = Arc::new(YrsEngine::new());
        let mut provider = SyncProvider::new(
            Arc::clone(&engine) as Arc<dyn ReplicatedDoc>,
            Arc::clone(&transport),
            document_id,
            config,
        );
        provider.connect()?;
        let presence =
            match PresenceChannel::join(transport.as_ref(), document_id, user_id, display_name) {
                Ok(presence) => presence,
                Err(e) => {
                    // A half-open session must not leave a live sync
                    // subscription behind.
                    provider.destroy().await;
                    return Err(e);
                }
            };

        log::info!("opened session on {document_id} for {display_name}");
        Ok(Self {
            engine,
            provider,
            presence,
            transport,
        })
    }

    // ── status ───────────────────────────────────────────────────

    pub fn connected(&self) -> bool {
        self.provider.connected()
    }

    pub fn synced(&self) -> bool {
        self.provider.synced()
    }

    /// Take the provider's event stream (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.provider.take_event_rx()
    }

    // ── editing ──────────────────────────────────────────────────

    /// The replica backing this session, for binding the visible editor.
    pub fn engine(&self) -> Arc<YrsEngine> {
        Arc::clone(&self.engine)
    }

    pub fn insert_text(&self, index: u32, chunk: &str) {
        self.engine.insert(index, chunk);
    }

    pub fn delete_range(&self, index: u32, len: u32) {
        self.engine.remove_range(index, len);
    }

    pub fn text(&self) -> String {
        self.engine.text()
    }

    // ── presence ─────────────────────────────────────────────────

    pub fn publish_cursor(&self, cursor: Option<CursorPosition>) -> Result<(), TransportError> {
        self.presence.publish_cursor(cursor)
    }

    pub fn publish_selection(
        &self,
        selection: Option<SelectionRange>,
    ) -> Result<(), TransportError> {
        self.presence.publish_selection(selection)
    }

    /// Remote collaborators' presence records (never includes this user).
    pub fn remote_peers(&self) -> Vec<PresenceRecord> {
        self.presence.remote_peers()
    }

    // ── lifecycle ────────────────────────────────────────────────

    /// Tear down and rejoin both channels after a transport failure. The
    /// new sync session re-issues a sync request; the presence channel
    /// re-announces the current local record.
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        self.provider.reconnect().await?;
        self.presence.rejoin(self.transport.as_ref()).await
    }

    /// Close the session: tear down the provider and withdraw presence.
    /// Safe to call multiple times.
    pub async fn close(&mut self) {
        self.provider.destroy().await;
        self.presence.leave().await;
    }
}
