//! End-to-end tests for the sync provider over the in-memory broadcast hub.
//!
//! Each simulated browser client gets its own `BroadcastClient` so a single
//! client's network loss can be exercised without touching its peers.

use lex_collab::{
    ConnectionState, DocumentSession, InMemoryBroadcast, MessageKind, ProviderConfig,
    ProviderEvent, ReplicatedDoc, SyncMessage, SyncProvider, TransportError, UpdateOrigin,
    YrsEngine,
};
use lex_collab::{BroadcastClient, BroadcastTransport, ChannelEvent, ChannelHandle};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn config(convergence_ms: u64) -> ProviderConfig {
    ProviderConfig {
        convergence_timeout: Duration::from_millis(convergence_ms),
    }
}

/// Open a session through a fresh client handle onto the hub.
async fn open_session(
    hub: &InMemoryBroadcast,
    doc: &str,
    name: &str,
    cfg: ProviderConfig,
) -> (
    DocumentSession,
    mpsc::Receiver<ProviderEvent>,
    BroadcastClient,
) {
    let net = hub.client();
    let mut session = DocumentSession::open(Arc::new(net.clone()), doc, Uuid::new_v4(), name, cfg)
        .await
        .unwrap();
    let events = session.take_event_rx().unwrap();
    (session, events, net)
}

/// Drain events until the connected status arrives.
async fn wait_connected(events: &mut mpsc::Receiver<ProviderEvent>) {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ProviderEvent::Status(ConnectionState::Connected))) => return,
            Ok(Some(_)) => continue,
            other => panic!("never connected: {other:?}"),
        }
    }
}

/// Drain events until the disconnected status arrives.
async fn wait_disconnected(events: &mut mpsc::Receiver<ProviderEvent>) {
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ProviderEvent::Status(ConnectionState::Disconnected))) => return,
            Ok(Some(_)) => continue,
            other => panic!("never disconnected: {other:?}"),
        }
    }
}

/// Drain events until the sync event arrives.
async fn wait_synced(events: &mut mpsc::Receiver<ProviderEvent>) {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ProviderEvent::Synced)) => return,
            Ok(Some(_)) => continue,
            other => panic!("never synced: {other:?}"),
        }
    }
}

/// Poll until the session's document reaches the expected content.
async fn wait_for_text(session: &DocumentSession, expected: &str) {
    for _ in 0..200 {
        if session.text() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "document never reached {expected:?}, got {:?}",
        session.text()
    );
}

/// Receive the next broadcast payload on a raw channel handle.
async fn next_payload(handle: &mut ChannelHandle) -> Option<Vec<u8>> {
    loop {
        match timeout(Duration::from_millis(500), handle.events.recv()).await {
            Ok(Some(ChannelEvent::Message(bytes))) => return Some(bytes),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Produce one encoded delta by editing a scratch replica.
fn delta_for(text: &str) -> Vec<u8> {
    let source = YrsEngine::new();
    let mut changes = source.subscribe();
    source.insert(0, text);
    changes.try_recv().unwrap().delta
}

// ─── Join protocol ───────────────────────────────────────────────

#[tokio::test]
async fn test_solo_join_syncs_only_after_timeout() {
    let hub = InMemoryBroadcast::new();
    let start = Instant::now();
    let (session, mut events, _net) = open_session(&hub, "doc-1", "Alice", config(200)).await;

    assert!(!session.synced());
    wait_synced(&mut events).await;

    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(session.connected());
    assert!(session.synced());
    assert_eq!(session.text(), "");
}

#[tokio::test]
async fn test_join_with_peer_syncs_before_timeout() {
    let hub = InMemoryBroadcast::new();
    let (alice, mut alice_events, _a) = open_session(&hub, "doc-1", "Alice", config(100)).await;
    wait_synced(&mut alice_events).await;
    alice.insert_text(0, "hello");

    let start = Instant::now();
    let (bob, mut bob_events, _b) = open_session(&hub, "doc-1", "Bob", config(5_000)).await;
    wait_synced(&mut bob_events).await;

    // A peer answered, so sync must beat the 5s timeout by a wide margin.
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(bob.text(), "hello");
}

#[tokio::test]
async fn test_any_connected_peer_bootstraps_a_late_joiner() {
    let hub = InMemoryBroadcast::new();
    let (alice, mut alice_events, _a) = open_session(&hub, "doc-1", "Alice", config(100)).await;
    wait_synced(&mut alice_events).await;
    let (bob, mut bob_events, _b) = open_session(&hub, "doc-1", "Bob", config(5_000)).await;
    wait_synced(&mut bob_events).await;

    alice.insert_text(0, "clause 7");
    wait_for_text(&bob, "clause 7").await;

    // Both Alice and Bob may answer; duplicate snapshots are idempotent.
    let (carol, mut carol_events, _c) = open_session(&hub, "doc-1", "Carol", config(5_000)).await;
    wait_synced(&mut carol_events).await;
    assert_eq!(carol.text(), "clause 7");
}

// ─── Update relay ────────────────────────────────────────────────

#[tokio::test]
async fn test_updates_propagate_and_converge() {
    let hub = InMemoryBroadcast::new();
    let (alice, mut alice_events, _a) = open_session(&hub, "doc-1", "Alice", config(100)).await;
    wait_synced(&mut alice_events).await;
    let (bob, mut bob_events, _b) = open_session(&hub, "doc-1", "Bob", config(5_000)).await;
    wait_synced(&mut bob_events).await;

    alice.insert_text(0, "hello");
    wait_for_text(&bob, "hello").await;

    bob.insert_text(5, " world");
    wait_for_text(&alice, "hello world").await;

    assert_eq!(alice.text(), bob.text());
    assert_eq!(
        alice.engine().encode_full_state(),
        bob.engine().encode_full_state()
    );
}

#[tokio::test]
async fn test_duplicated_update_is_idempotent() {
    let hub = InMemoryBroadcast::new();
    let engine = Arc::new(YrsEngine::new());
    let mut provider = SyncProvider::new(
        Arc::clone(&engine) as Arc<dyn ReplicatedDoc>,
        Arc::new(hub.client()),
        "doc-1",
        config(100),
    );
    let mut events = provider.take_event_rx().unwrap();
    let spy = hub.client().join("sync:doc-1").unwrap();
    provider.connect().unwrap();
    wait_synced(&mut events).await;

    // The transport may deliver the same message more than once.
    let update = SyncMessage::update(delta_for("hi")).encode().unwrap();
    spy.publisher.publish(&update).unwrap();
    spy.publisher.publish(&update).unwrap();

    for _ in 0..100 {
        if engine.text() == "hi" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.text(), "hi");
    provider.destroy().await;
}

#[tokio::test]
async fn test_no_self_echo_of_applied_remote_updates() {
    let hub = InMemoryBroadcast::new();
    let engine = Arc::new(YrsEngine::new());
    let mut provider = SyncProvider::new(
        engine as Arc<dyn ReplicatedDoc>,
        Arc::new(hub.client()),
        "doc-1",
        config(100),
    );
    let mut events = provider.take_event_rx().unwrap();

    let mut spy = hub.client().join("sync:doc-1").unwrap();
    provider.connect().unwrap();

    // The provider announces itself with a sync request.
    let first = next_payload(&mut spy).await.expect("expected sync request");
    assert_eq!(
        SyncMessage::decode(&first).unwrap().kind,
        MessageKind::SyncRequest
    );
    wait_synced(&mut events).await;

    // Feed the provider a remote update; applying it must not cause a
    // re-broadcast.
    let update = SyncMessage::update(delta_for("hello")).encode().unwrap();
    spy.publisher.publish(&update).unwrap();

    assert!(
        next_payload(&mut spy).await.is_none(),
        "provider re-broadcast an applied remote update"
    );
    provider.destroy().await;
}

#[tokio::test]
async fn test_connected_peer_answers_sync_requests() {
    let hub = InMemoryBroadcast::new();
    let (alice, mut alice_events, _a) = open_session(&hub, "doc-1", "Alice", config(100)).await;
    wait_synced(&mut alice_events).await;
    alice.insert_text(0, "draft");

    let mut spy = hub.client().join("sync:doc-1").unwrap();
    let request = SyncMessage::sync_request().encode().unwrap();
    spy.publisher.publish(&request).unwrap();

    // Alice's earlier edit may still be in flight; skip past any updates.
    let reply = loop {
        let bytes = next_payload(&mut spy).await.expect("expected sync response");
        let msg = SyncMessage::decode(&bytes).unwrap();
        if msg.kind == MessageKind::SyncResponse {
            break msg;
        }
    };

    // The snapshot bootstraps a fresh replica to Alice's content.
    let replica = YrsEngine::new();
    replica.apply(&reply.payload, UpdateOrigin::Remote).unwrap();
    assert_eq!(replica.text(), "draft");
}

// ─── Failure handling ────────────────────────────────────────────

#[tokio::test]
async fn test_corrupt_message_is_dropped_not_fatal() {
    let hub = InMemoryBroadcast::new();
    let engine = Arc::new(YrsEngine::new());
    let mut provider = SyncProvider::new(
        Arc::clone(&engine) as Arc<dyn ReplicatedDoc>,
        Arc::new(hub.client()),
        "doc-1",
        config(100),
    );
    let mut events = provider.take_event_rx().unwrap();
    let spy = hub.client().join("sync:doc-1").unwrap();
    provider.connect().unwrap();
    wait_synced(&mut events).await;

    spy.publisher.publish(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    // Error surfaced as an event, session stays up.
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ProviderEvent::Error(_))) => break,
            Ok(Some(_)) => continue,
            other => panic!("expected an error event, got {other:?}"),
        }
    }
    assert!(provider.connected());

    // Subsequent valid traffic still applies.
    let update = SyncMessage::update(delta_for("ok")).encode().unwrap();
    spy.publisher.publish(&update).unwrap();
    for _ in 0..100 {
        if engine.text() == "ok" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(engine.text(), "ok");
    provider.destroy().await;
}

#[tokio::test]
async fn test_disconnect_resets_status_and_reconnect_resyncs() {
    let hub = InMemoryBroadcast::new();
    let (bob, mut bob_events, _b) = open_session(&hub, "doc-1", "Bob", config(100)).await;
    wait_synced(&mut bob_events).await;
    bob.insert_text(0, "hello");

    let (mut alice, mut alice_events, net_a) = open_session(&hub, "doc-1", "Alice", config(2_000)).await;
    wait_synced(&mut alice_events).await;
    assert_eq!(alice.text(), "hello");

    net_a.disconnect();
    wait_disconnected(&mut alice_events).await;
    assert!(!alice.connected());
    assert!(!alice.synced(), "synced must reset on disconnect");

    // Caller-initiated recovery; the new session re-issues a sync request
    // and Bob answers it.
    alice.reconnect().await.unwrap();
    wait_connected(&mut alice_events).await;
    wait_synced(&mut alice_events).await;
    assert!(alice.connected());
    assert_eq!(alice.text(), "hello");
}

#[tokio::test]
async fn test_channel_error_surfaces_and_disconnects() {
    let hub = InMemoryBroadcast::new();
    let (session, mut events, _net) = open_session(&hub, "doc-1", "Alice", config(100)).await;
    wait_synced(&mut events).await;

    hub.fail_channel("sync:doc-1", "CHANNEL_ERROR");

    let mut saw_error = false;
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(ProviderEvent::Error(_))) => saw_error = true,
            Ok(Some(ProviderEvent::Status(ConnectionState::Disconnected))) => break,
            Ok(Some(_)) => continue,
            other => panic!("expected error + disconnect, got {other:?}"),
        }
    }
    assert!(saw_error);
    assert!(!session.connected());
}

/// Transport whose presence channels are unavailable; document channels
/// join normally.
struct SyncOnlyTransport {
    inner: BroadcastClient,
}

impl BroadcastTransport for SyncOnlyTransport {
    fn join(&self, channel: &str) -> Result<ChannelHandle, TransportError> {
        if channel.starts_with("presence:") {
            return Err(TransportError::Publish("presence unavailable".into()));
        }
        self.inner.join(channel)
    }
}

#[tokio::test]
async fn test_failed_open_leaves_no_sync_subscription_behind() {
    let hub = InMemoryBroadcast::new();
    let transport = Arc::new(SyncOnlyTransport {
        inner: hub.client(),
    });

    let result =
        DocumentSession::open(transport, "doc-1", Uuid::new_v4(), "Alice", config(100)).await;

    assert!(result.is_err());
    // The sync join succeeded before the presence join failed; the
    // half-open session must not keep answering on the sync channel.
    assert_eq!(hub.subscriber_count("sync:doc-1"), 0);
}

// ─── Known limitation (offline edits) ────────────────────────────

/// Local deltas produced while disconnected are dropped, not queued, and a
/// reconnect does not proactively push locally-accumulated state: the
/// reconnecting client's offline edit survives its own merge but reaches
/// nobody until some later exchange carries it. This pins that behavior.
#[tokio::test]
async fn test_offline_edit_survives_locally_but_is_not_propagated() {
    let hub = InMemoryBroadcast::new();

    // Alice joins alone on doc-1 and syncs via timeout.
    let (mut alice, mut alice_events, net_a) = open_session(&hub, "doc-1", "Alice", config(150)).await;
    wait_synced(&mut alice_events).await;
    assert_eq!(alice.text(), "");

    // Bob joins and types before receiving any message.
    let (mut bob, mut bob_events, _net_b) = open_session(&hub, "doc-1", "Bob", config(2_000)).await;
    wait_connected(&mut bob_events).await;
    bob.insert_text(0, "hello");
    wait_synced(&mut bob_events).await;

    // Bob's update reaches Alice.
    wait_for_text(&alice, "hello").await;

    // Alice loses the channel and types "!" — the delta is dropped.
    net_a.disconnect();
    wait_disconnected(&mut alice_events).await;
    alice.insert_text(5, "!");
    assert_eq!(alice.text(), "hello!");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.text(), "hello", "no update may be published while offline");

    // Alice reconnects; Bob's sync response contains only "hello". The
    // CRDT merge keeps Alice's local "!", but Bob never learns of it.
    alice.reconnect().await.unwrap();
    wait_synced(&mut alice_events).await;
    assert_eq!(alice.text(), "hello!");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        bob.text(),
        "hello",
        "reconnect alone must not propagate the offline edit"
    );

    // Only a full-state exchange heals the gap: Bob rejoins, and Alice's
    // snapshot response carries the offline edit.
    bob.reconnect().await.unwrap();
    wait_synced(&mut bob_events).await;
    assert_eq!(bob.text(), "hello!");
}
