//! # lex-collab — real-time collaborative document sync
//!
//! The synchronization layer behind multi-user editing of legal documents:
//! keeps every client's replica of a rich-text document convergent over a
//! best-effort broadcast transport, with a separate ephemeral presence
//! channel for cursors and selections.
//!
//! ## Architecture
//!
//! ```text
//! local edit                                   remote peers
//!     │                                             ▲
//!     ▼                                             │
//! ┌────────────┐  delta (origin: local)  ┌──────────┴─────────┐
//! │ YrsEngine  │ ───────────────────────►│   SyncProvider     │
//! │ (replica)  │ ◄───────────────────────│ sync:<document-id> │
//! └────────────┘  apply (origin: remote) └──────────┬─────────┘
//!                                                   │
//!                                        ┌──────────┴─────────┐
//!                                        │ BroadcastTransport │
//!                                        │ (injected pub/sub) │
//!                                        └──────────┬─────────┘
//!                                        ┌──────────┴─────────┐
//!                                        │  PresenceChannel   │
//!                                        │ presence:<doc-id>  │
//!                                        └────────────────────┘
//! ```
//!
//! The transport provides no ordering, no delivery guarantee and no
//! replay; convergence relies entirely on the engine's CRDT merge being
//! commutative, associative and idempotent. "Synced" means "received at
//! least one full-state reply or timed out waiting" — eventual, not
//! linearizable.
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire envelope (bincode-encoded [`SyncMessage`])
//! - [`transport`] — injected pub/sub boundary + in-memory hub
//! - [`engine`] — opaque CRDT engine boundary + yrs bridge
//! - [`provider`] — join/sync protocol and connection state machine
//! - [`presence`] — last-write-wins cursor/selection/liveness records
//! - [`session`] — editor-facing glue binding the pieces per document

pub mod engine;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use engine::{DocChange, EngineError, ReplicatedDoc, UpdateOrigin, YrsEngine};
pub use presence::{
    CursorPosition, PeerRoster, PresenceChannel, PresenceRecord, SelectionRange,
};
pub use protocol::{MessageKind, ProtocolError, SyncMessage};
pub use provider::{ConnectionState, ProviderConfig, ProviderEvent, SyncProvider};
pub use session::DocumentSession;
pub use transport::{
    BroadcastClient, BroadcastTransport, ChannelEvent, ChannelHandle, ChannelPublisher,
    InMemoryBroadcast, TransportError,
};
