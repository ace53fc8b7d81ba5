//! End-to-end store replication between two participants.

use serde_json::json;
use std::sync::Arc;
use tandem_link::{
    ConnectionManager, LinkConfig, PeerEvent, PeerMessage, Phase, RendezvousHub, SyncedStore,
};
use tandem_store::{DataChanged, ReplicatedStore, StoreConfig};
use tempfile::{tempdir, TempDir};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Duration};

struct Side {
    synced: SyncedStore,
    _dir: TempDir,
}

fn side(hub: &RendezvousHub, channel: &str, config: LinkConfig) -> Side {
    let dir = tempdir().unwrap();
    let store = ReplicatedStore::open(StoreConfig::for_testing(dir.path(), "snippets")).unwrap();
    let conn = ConnectionManager::new(channel, Arc::new(hub.clone()), config);
    Side {
        synced: SyncedStore::new(store, conn),
        _dir: dir,
    }
}

/// Host first, then guest, both ready.
async fn connected_pair(hub: &RendezvousHub) -> (Side, Side) {
    connected_pair_with(hub, LinkConfig::for_testing()).await
}

async fn connected_pair_with(hub: &RendezvousHub, config: LinkConfig) -> (Side, Side) {
    let a = side(hub, "room", config.clone());
    a.synced.connection().start();
    timeout(Duration::from_secs(2), async {
        while a.synced.connection().phase() != Phase::HostIdle {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let b = side(hub, "room", config);
    timeout(Duration::from_secs(2), b.synced.connection().initialize())
        .await
        .unwrap();
    timeout(Duration::from_secs(2), a.synced.connection().wait_for_ready())
        .await
        .unwrap();
    (a, b)
}

async fn next_change(changes: &mut broadcast::Receiver<DataChanged>) -> DataChanged {
    timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("change expected")
        .unwrap()
}

#[tokio::test]
async fn test_snippet_round_trip_with_echo_suppression() {
    let hub = RendezvousHub::new();
    let (a, b) = connected_pair(&hub).await;

    let mut b_changes = b.synced.subscribe();
    let mut a_inbound = a.synced.connection().subscribe();

    let version = a.synced.set("snippet-1", json!({"n": 5}), None).await.unwrap().unwrap();

    let change = next_change(&mut b_changes).await;
    assert_eq!(change.key, "snippet-1");
    assert_eq!(change.value, json!({"n": 5}));
    assert_eq!(change.version, version);

    let entry = b.synced.get("snippet-1").await.unwrap().unwrap();
    assert_eq!(entry.value, json!({"n": 5}));
    assert_eq!(entry.version, version);

    // B applied it from the network, so nothing comes back to A.
    sleep(Duration::from_millis(100)).await;
    loop {
        match a_inbound.try_recv() {
            Ok(PeerEvent::RemoteData(payload)) => panic!("unexpected echo: {payload}"),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[tokio::test]
async fn test_duplicate_delivery_applies_once() {
    let hub = RendezvousHub::new();
    let (a, b) = connected_pair(&hub).await;
    let mut b_changes = b.synced.subscribe();

    let version = a.synced.set("k", json!("v1"), None).await.unwrap().unwrap();
    next_change(&mut b_changes).await;

    // Same write again over the wire: B must not fire a second change.
    let again = PeerMessage::db_sync("k", json!("v1"), &version);
    a.synced.connection().send(&again).unwrap();
    let newer = a.synced.set("other", json!(1), None).await.unwrap().unwrap();

    let change = next_change(&mut b_changes).await;
    assert_eq!(change.key, "other");
    assert_eq!(change.version, newer);
}

#[tokio::test]
async fn test_writes_flow_both_directions() {
    let hub = RendezvousHub::new();
    let (a, b) = connected_pair(&hub).await;
    let mut a_changes = a.synced.subscribe();
    let mut b_changes = b.synced.subscribe();

    let from_b = b.synced.set("from-guest", json!({"ok": true}), None).await.unwrap().unwrap();
    let change = loop {
        let change = next_change(&mut a_changes).await;
        if change.key == "from-guest" {
            break change;
        }
    };
    assert_eq!(change.version, from_b);

    // Later write on the same key wins on both sides.
    a.synced.set("shared", json!(1), None).await.unwrap().unwrap();
    let second = a.synced.set("shared", json!(2), None).await.unwrap().unwrap();
    loop {
        let change = next_change(&mut b_changes).await;
        if change.version == second {
            break;
        }
    }
    assert_eq!(b.synced.get("shared").await.unwrap().unwrap().value, json!(2));
}

#[tokio::test]
async fn test_foreign_messages_are_not_applied() {
    let hub = RendezvousHub::new();
    let (a, b) = connected_pair(&hub).await;
    let mut b_events = b.synced.connection().subscribe();

    a.synced
        .connection()
        .send(&json!({"type": "chat", "text": "hi"}))
        .unwrap();

    let payload = timeout(Duration::from_secs(1), async {
        loop {
            if let PeerEvent::RemoteData(v) = b_events.recv().await.unwrap() {
                return v;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(payload["type"], "chat");
    assert!(b.synced.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_burst_larger_than_event_buffer_arrives_whole() {
    let hub = RendezvousHub::new();
    let config = LinkConfig {
        event_capacity: 4,
        ..LinkConfig::for_testing()
    };
    let (a, b) = connected_pair_with(&hub, config).await;

    for i in 0..300 {
        a.synced
            .set(&format!("key-{i:03}"), json!(i), None)
            .await
            .unwrap()
            .unwrap();
    }

    timeout(Duration::from_secs(10), async {
        while b.synced.keys().await.unwrap().len() < 300 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("every key should reach the peer");
    assert_eq!(b.synced.get("key-299").await.unwrap().unwrap().value, json!(299));
}

#[tokio::test]
async fn test_write_at_stored_version_is_not_forwarded() {
    let hub = RendezvousHub::new();
    let (a, b) = connected_pair(&hub).await;
    let mut b_changes = b.synced.subscribe();
    let mut b_inbound = b.synced.connection().inbound_data();

    let version = a.synced.set("k", json!("v1"), None).await.unwrap().unwrap();
    next_change(&mut b_changes).await;

    let suppressed = a
        .synced
        .set("k", json!("v2"), Some(version.clone()))
        .await
        .unwrap();
    assert_eq!(suppressed, None);
    let newer = a.synced.set("other", json!(1), None).await.unwrap().unwrap();

    // Only the two applied writes crossed the link.
    let first = timeout(Duration::from_secs(2), b_inbound.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), b_inbound.recv()).await.unwrap().unwrap();
    assert_eq!(first["key"], "k");
    assert_eq!(first["version"], json!(version));
    assert_eq!(second["key"], "other");
    assert_eq!(second["version"], json!(newer));

    let change = next_change(&mut b_changes).await;
    assert_eq!(change.key, "other");
    assert_eq!(b.synced.get("k").await.unwrap().unwrap().value, json!("v1"));
}
