//! Integration tests for the session lifecycle.
//!
//! Every test drives a real [`SessionRegistry`] against loopback protocol
//! clients, observing state through the public API only.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use wamux::bridge::{ChannelSubscriber, EventHub, EventKind};
use wamux::protocol::loopback::{LoopbackBehavior, LoopbackFactory};
use wamux::protocol::RawEvent;
use wamux::reconnect::{reconnect_paired_sessions, ReconnectSettings};
use wamux::sessions::{InMemorySessionStore, SessionStore};
use wamux::{ConnectOutcome, ConnectionState, SessionError, SessionRegistry, SupervisorSettings};

struct Harness {
    registry: Arc<SessionRegistry>,
    factory: Arc<LoopbackFactory>,
    store: Arc<InMemorySessionStore>,
}

fn harness_with(behavior: LoopbackBehavior) -> Harness {
    let store = Arc::new(InMemorySessionStore::new());
    let factory = Arc::new(LoopbackFactory::with_behavior(behavior));
    let registry = Arc::new(SessionRegistry::new(
        store.clone(),
        factory.clone(),
        Arc::new(EventHub::new()),
        SupervisorSettings::default(),
    ));
    Harness {
        registry,
        factory,
        store,
    }
}

fn harness() -> Harness {
    harness_with(LoopbackBehavior::default())
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
        .unwrap();
}

// ---------------------------------------------------------------------------
// 1. Full pairing, disconnect and reconnect without a new QR
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sales_bot_lifecycle() {
    let h = harness();
    let (subscriber, mut events) = ChannelSubscriber::new(64);
    h.registry.hub().subscribe(subscriber);

    let info = h.registry.create_session("sales-bot", None).await.unwrap();
    assert_eq!(info.state, ConnectionState::Created);
    let id = info.id.clone();
    let mut state = h.registry.subscribe_state(&id).unwrap();

    assert_eq!(
        h.registry.connect(&id).await.unwrap(),
        ConnectOutcome::Started
    );
    wait_state(&mut state, ConnectionState::QrWait).await;
    let qr = h.registry.get_qr_code(&id).await.unwrap();
    assert!(!qr.code.is_empty());

    let client = h.factory.client(&id).unwrap();
    assert!(client.complete_pairing(b"device-creds"));
    wait_state(&mut state, ConnectionState::Connected).await;
    let info = h.registry.get_session_info(&id).unwrap();
    assert!(info.has_device_identity);
    assert!(info.error.is_none());

    h.registry.disconnect(&id).await.unwrap();
    assert_eq!(
        h.registry.get_session_info(&id).unwrap().state,
        ConnectionState::Disconnected
    );

    // Paired sessions reconnect without a QR scan
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::Connected).await;
    assert!(matches!(
        h.registry.get_qr_code(&id).await,
        Err(SessionError::NoQrAvailable(_))
    ));
    assert_eq!(h.factory.created_count(), 2);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::QrUpdate));
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EventKind::PairingSuccess)
            .count(),
        1
    );
    assert!(kinds.contains(&EventKind::ConnectionState));
}

// ---------------------------------------------------------------------------
// 2. Concurrent connects produce a single client
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connect_creates_one_client() {
    let h = harness_with(LoopbackBehavior {
        connect_delay: Duration::from_millis(50),
        ..LoopbackBehavior::default()
    });
    let id = h.registry.create_session("bot", None).await.unwrap().id;

    let (a, b) = tokio::join!(h.registry.connect(&id), h.registry.connect(&id));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| matches!(o, ConnectOutcome::AlreadyInProgress));
    assert_eq!(
        outcomes,
        vec![ConnectOutcome::Started, ConnectOutcome::AlreadyInProgress]
    );
    assert_eq!(h.factory.created_count(), 1);
}

// ---------------------------------------------------------------------------
// 3. Deleting a connected session tears the connection down once
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_connected_session() {
    let h = harness();
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    let client = h.factory.client(&id).unwrap();
    client.complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;

    let (subscriber, mut events) = ChannelSubscriber::new(16);
    h.registry.hub().subscribe(subscriber);

    h.registry.delete(&id).await.unwrap();

    // The connection is closed before the record goes away
    let mut changes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.kind == EventKind::ConnectionState {
            assert_eq!(event.session_id, id);
            changes.push(serde_json::to_value(&event).unwrap()["payload"].clone());
        }
    }
    let last = changes.last().expect("no connection-state event on delete");
    assert_eq!(last["from"], "connected");
    assert_eq!(last["to"], "disconnected");

    assert_eq!(client.disconnect_count(), 1);
    assert!(!client.is_connected());
    assert!(h.registry.list_sessions().is_empty());
    assert!(h.store.get(&id).await.unwrap().is_none());
    assert!(matches!(
        h.registry.get_session_info(&id),
        Err(SessionError::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// 4. Caller mistakes are returned, not recorded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_logout_when_not_connected_is_rejected() {
    let h = harness();
    let before = h.registry.create_session("bot", None).await.unwrap();

    assert!(matches!(
        h.registry.logout(&before.id).await,
        Err(SessionError::InvalidState { .. })
    ));
    let after = h.registry.get_session_info(&before.id).unwrap();
    assert_eq!(after.state, ConnectionState::Created);
    assert!(after.error.is_none());
    assert_eq!(h.factory.created_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logout_after_disconnect_is_rejected() {
    let h = harness();
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    let client = h.factory.client(&id).unwrap();
    client.complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;
    h.registry.disconnect(&id).await.unwrap();
    let before = h.registry.get_session_info(&id).unwrap();
    assert_eq!(before.state, ConnectionState::Disconnected);

    let err = h.registry.logout(&id).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::InvalidState {
            operation: "logout",
            state: ConnectionState::Disconnected
        }
    );
    let after = h.registry.get_session_info(&id).unwrap();
    assert_eq!(after.state, ConnectionState::Disconnected);
    assert_eq!(after.error, before.error);
    assert!(after.has_device_identity);
    assert_eq!(client.logout_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logout_confirmed_by_server_ends_logged_out() {
    let h = harness_with(LoopbackBehavior {
        logout_event: true,
        ..LoopbackBehavior::default()
    });
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    let client = h.factory.client(&id).unwrap();
    client.complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;

    h.registry.logout(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let info = h.registry.get_session_info(&id).unwrap();
    assert_eq!(info.state, ConnectionState::LoggedOut);
    assert!(info.error.is_none());
    assert!(!info.has_device_identity);
    assert_eq!(client.logout_count(), 1);

    // A logged out session pairs again from scratch
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_logout_clears_credentials() {
    let h = harness();
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    let client = h.factory.client(&id).unwrap();
    client.complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;

    h.registry.logout(&id).await.unwrap();

    let info = h.registry.get_session_info(&id).unwrap();
    assert_eq!(info.state, ConnectionState::LoggedOut);
    assert!(!info.has_device_identity);
    assert_eq!(client.logout_count(), 1);
    let stored = h.store.get(&id).await.unwrap().unwrap();
    assert!(!stored.is_paired());
}

// ---------------------------------------------------------------------------
// 5. QR codes are refreshed once they expire
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_expired_qr_is_replaced() {
    let h = harness_with(LoopbackBehavior {
        qr_timeout: Duration::from_millis(150),
        ..LoopbackBehavior::default()
    });
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;

    let first = h.registry.get_qr_code(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = h.registry.get_qr_code(&id).await.unwrap();

    assert_ne!(first.code, second.code);
    assert!(second.expires_at > first.expires_at);
    assert_eq!(
        h.registry.get_session_info(&id).unwrap().state,
        ConnectionState::QrWait
    );
}

// ---------------------------------------------------------------------------
// 6. Remote logout is an error that drops the credential
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_logout_moves_to_error() {
    let h = harness();
    let id = h.registry.create_session("bot", None).await.unwrap().id;
    let mut state = h.registry.subscribe_state(&id).unwrap();
    h.registry.connect(&id).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    let client = h.factory.client(&id).unwrap();
    client.complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;

    client.emit(RawEvent::LoggedOut {
        reason: "unlinked from phone".into(),
    });
    wait_state(&mut state, ConnectionState::Error).await;

    let info = h.registry.get_session_info(&id).unwrap();
    assert!(!info.has_device_identity);
    assert!(info.error.unwrap().contains("logged out"));
}

// ---------------------------------------------------------------------------
// 7. Startup reconnect skips sessions that never paired
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_skips_unpaired_sessions() {
    let h = harness();
    let paired = h.registry.create_session("paired", None).await.unwrap().id;
    let fresh = h.registry.create_session("fresh", None).await.unwrap().id;

    let mut state = h.registry.subscribe_state(&paired).unwrap();
    h.registry.connect(&paired).await.unwrap();
    wait_state(&mut state, ConnectionState::QrWait).await;
    h.factory.client(&paired).unwrap().complete_pairing(b"creds");
    wait_state(&mut state, ConnectionState::Connected).await;
    h.registry.disconnect(&paired).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let settings = ReconnectSettings {
        enabled: true,
        settle_delay: Duration::ZERO,
        spacing: Duration::from_millis(1),
    };
    let report = reconnect_paired_sessions(h.registry.clone(), settings, rx).await;

    assert_eq!(report.attempted, 1);
    assert_eq!(report.started, 1);
    assert_eq!(report.skipped_unpaired, 1);
    wait_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(
        h.registry.get_session_info(&fresh).unwrap().state,
        ConnectionState::Created
    );
    assert!(h.factory.client(&fresh).is_none());
}
