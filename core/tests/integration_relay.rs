//! End-to-end relay through the composed service

mod common;

use common::{announce_raw, eventually, message_raw, FakeFactory, RecordingListener};
use meshlink_core::broadcast::{ListenerError, RelayListener};
use meshlink_core::config::{ServiceConfig, TRANSPORT_CEILING_BYTES};
use meshlink_core::event::{field_ids, FILE_REF_KEY};
use meshlink_core::locks::HostLocks;
use meshlink_core::network::NetworkSnapshot;
use meshlink_core::runtime::{PushKind, RuntimeFactory};
use meshlink_core::service::RelayService;
use meshlink_core::state::ServiceStatus;
use meshlink_core::store::{EventStore, MemoryEventStore};
use rmpv::Value;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

struct Harness {
    _dir: TempDir,
    factory: Arc<FakeFactory>,
    store: Arc<MemoryEventStore>,
    listener: Arc<RecordingListener>,
    service: Arc<RelayService>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServiceConfig::with_storage(dir.path());
    config.health.enabled = false;

    let factory = FakeFactory::new();
    let store = Arc::new(MemoryEventStore::new());
    let listener = Arc::new(RecordingListener::default());
    let runtime_factory: Arc<dyn RuntimeFactory> = factory.clone();
    let event_store: Arc<dyn EventStore> = store.clone();
    let service =
        RelayService::new(config, runtime_factory, event_store, HostLocks::noop()).unwrap();
    service.register_listener(listener.clone());

    Harness {
        _dir: dir,
        factory,
        store,
        listener,
        service,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drained_announce_not_duplicated_by_push() {
    let h = harness();
    h.factory.queue_for_next(
        vec![announce_raw(1, "relay-one")],
        vec![message_raw(10, 20, "queued while offline")],
    );

    let report = h.service.start().await.unwrap();
    assert_eq!(report.init.generation, 1);
    assert!(!report.init.is_shared_instance);
    assert_eq!(report.drained.relayed, 2);
    assert_eq!(h.listener.announce_count(), 1);
    assert_eq!(h.listener.message_count(), 1);
    assert!(h.listener.announces.lock()[0].contains("relay-one"));

    let runtime = h.factory.latest().unwrap();
    assert!(runtime.has_callbacks());

    // Same announce again through the push path: suppressed
    runtime.push(PushKind::Announce, announce_raw(1, "relay-one"));
    // A different announce goes through
    runtime.push(PushKind::Announce, announce_raw(2, "relay-two"));
    runtime.push(PushKind::Message, message_raw(11, 20, "live"));

    assert!(eventually(|| h.listener.announce_count() == 2 && h.listener.message_count() == 2).await);
    assert!(h.listener.announces.lock()[1].contains("relay-two"));
    assert_eq!(h.service.relay().stats().suppressed, 1);

    // Suppression is one-shot: a later re-announce is relayed
    runtime.push(PushKind::Announce, announce_raw(1, "relay-one"));
    assert!(eventually(|| h.listener.announce_count() == 3).await);

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_pushed_during_init_are_relayed_once() {
    let h = harness();
    // The runtime queues these and fires their callbacks before the drain runs
    *h.factory.behaviour.echo_on_init.lock() = vec![
        (PushKind::Announce, announce_raw(3, "early-bird")),
        (PushKind::Message, message_raw(30, 20, "sent during init")),
    ];

    let report = h.service.start().await.unwrap();
    assert_eq!(report.drained.relayed, 2);

    let relay = h.service.relay().clone();
    assert!(eventually(|| relay.stats().suppressed == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.listener.announce_count(), 1);
    assert_eq!(h.listener.message_count(), 1);
    assert_eq!(h.store.message_count(), 1);

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redelivered_message_broadcast_once() {
    let h = harness();
    h.factory
        .queue_for_next(Vec::new(), vec![message_raw(12, 20, "queued")]);
    h.service.start().await.unwrap();
    assert_eq!(h.listener.message_count(), 1);

    let runtime = h.factory.latest().unwrap();
    runtime.push(PushKind::Message, message_raw(12, 20, "queued"));
    runtime.push(PushKind::Message, message_raw(13, 20, "fresh"));
    assert!(eventually(|| h.listener.message_count() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.listener.message_count(), 2);
    assert!(h.listener.messages.lock()[1].contains("fresh"));

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_fingerprints_reset_on_restart() {
    let h = harness();
    h.factory
        .queue_for_next(vec![announce_raw(1, "relay-one")], Vec::new());
    h.service.start().await.unwrap();
    assert_eq!(h.listener.announce_count(), 1);

    let report = h.service.restart().await.unwrap();
    assert_eq!(report.drained.relayed, 0);

    // The new runtime never drained this announce, so its push is relayed
    let current = h.factory.latest().unwrap();
    current.push(PushKind::Announce, announce_raw(1, "relay-one"));
    assert!(eventually(|| h.listener.announce_count() == 2).await);
    assert_eq!(h.service.relay().stats().suppressed, 0);

    h.service.teardown().await;
}

/// Records how many messages were persisted when each broadcast arrived
struct PersistenceWitness {
    store: Arc<MemoryEventStore>,
    seen: parking_lot::Mutex<Vec<usize>>,
}

impl RelayListener for PersistenceWitness {
    fn on_message(&self, _json: &str) -> Result<(), ListenerError> {
        self.seen.lock().push(self.store.message_count());
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persist_happens_before_broadcast() {
    let h = harness();
    let witness = Arc::new(PersistenceWitness {
        store: h.store.clone(),
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    h.service.register_listener(witness.clone());
    h.service.start().await.unwrap();
    let runtime = h.factory.latest().unwrap();

    runtime.push(PushKind::Message, message_raw(1, 5, "first"));
    runtime.push(PushKind::Message, message_raw(2, 5, "second"));
    assert!(eventually(|| witness.seen.lock().len() == 2).await);
    assert_eq!(*witness.seen.lock(), vec![1, 2]);

    // Blocked sender: persisted nowhere, broadcast nowhere
    h.store.block_sender(&[6; 16]);
    runtime.push(PushKind::Message, message_raw(3, 6, "spam"));
    runtime.push(PushKind::Message, message_raw(4, 5, "third"));
    assert!(eventually(|| witness.seen.lock().len() == 3).await);
    assert_eq!(h.listener.message_count(), 3);
    assert!(h.listener.messages.lock().iter().all(|m| !m.contains("spam")));

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_image_is_offloaded_under_ceiling() {
    let h = harness();
    h.service.start().await.unwrap();
    let runtime = h.factory.latest().unwrap();

    let image: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let raw = message_raw(42, 7, "look at this").with(
        "fields",
        Value::Map(vec![(
            Value::from(field_ids::IMAGE),
            Value::Array(vec![Value::from("png"), Value::Binary(image.clone())]),
        )]),
    );
    runtime.push(PushKind::Message, raw);
    assert!(eventually(|| h.listener.message_count() == 1).await);

    let json = h.listener.messages.lock()[0].clone();
    assert!(json.len() < TRANSPORT_CEILING_BYTES);
    let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
    let path = payload["fields"]["6"][FILE_REF_KEY]
        .as_str()
        .map(PathBuf::from)
        .unwrap();
    assert_eq!(h.service.load_attachment(&path).unwrap(), image);

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pushes_from_previous_generation_are_dropped() {
    let h = harness();
    h.service.start().await.unwrap();
    let stale = h.factory.latest().unwrap();

    let report = h.service.restart().await.unwrap();
    assert_eq!(report.init.generation, 2);
    let current = h.factory.latest().unwrap();
    assert_eq!(current.id, 2);

    stale.push(PushKind::Message, message_raw(1, 2, "from the past"));
    current.push(PushKind::Message, message_raw(2, 2, "from now"));
    assert!(eventually(|| h.listener.message_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.listener.message_count(), 1);
    assert!(h.listener.messages.lock()[0].contains("from now"));

    h.service.teardown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_and_readiness_reach_listeners() {
    let h = harness();
    let late = Arc::new(RecordingListener::default());
    h.service.register_readiness(late.clone());
    assert_eq!(late.ready.load(Ordering::SeqCst), 0);

    h.service.start().await.unwrap();
    assert_eq!(late.ready.load(Ordering::SeqCst), 1);
    assert!(eventually(|| h.listener.statuses.lock().iter().any(|s| s == "READY")).await);

    // Already bound: notified on registration
    let early = Arc::new(RecordingListener::default());
    h.service.register_readiness(early.clone());
    assert_eq!(early.ready.load(Ordering::SeqCst), 1);

    h.service.teardown().await;
    assert_eq!(h.service.status(), ServiceStatus::Shutdown);
    assert_eq!(h.service.broadcaster().listener_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_network_change_reannounces() {
    let h = harness();
    h.service.start().await.unwrap();

    let snapshot = |id: &str| NetworkSnapshot {
        network_id: id.to_string(),
        transport: "wifi".to_string(),
        has_internet: true,
    };
    let (tx, rx) = watch::channel(Some(snapshot("home")));
    h.service.watch_network(rx, None);
    tokio::time::sleep(Duration::from_millis(20)).await;

    tx.send_replace(Some(snapshot("home")));
    tx.send_replace(Some(snapshot("cafe")));
    let announces = &h.factory.behaviour.announces;
    assert!(eventually(|| announces.load(Ordering::SeqCst) == 1).await);
    assert!(h.service.lock_status().wake_held);

    h.service.teardown().await;
    assert!(!h.service.lock_status().wake_held);
}
