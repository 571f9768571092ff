//! Discovery Engine Scenario Tests
//!
//! Drives a full engine over the in-memory store:
//! - Cold start with an empty store and with pre-existing queues
//! - Live creation and removal from keyspace notifications
//! - Reconnect recovery of changes missed while disconnected
//! - Resync after the notification connection re-subscribes
//! - Per-prefix isolation of scan failures
//! - Lifecycle steps that lose the race for the lifecycle guard
//! - Fault-driven eviction
//! - Shutdown

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bm_common::QueueIdentity;
use bm_config::DiscoveryConfig;
use bm_discovery::memory::{InMemoryHandleFactory, InMemoryStore};
use bm_discovery::{DiscoveryEngine, DiscoveryEvent, EngineStatus};
use tokio::sync::broadcast;

struct Harness {
    engine: DiscoveryEngine,
    store: Arc<InMemoryStore>,
    factory: Arc<InMemoryHandleFactory>,
    events: broadcast::Receiver<DiscoveryEvent>,
}

fn test_config(prefixes: &[&str]) -> DiscoveryConfig {
    DiscoveryConfig {
        watch_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
        scan_page_size: 2,
        lifecycle_lock_timeout_ms: 2_000,
        mutation_lock_timeout_ms: 2_000,
        reconcile_on_resubscribe: false,
        ..Default::default()
    }
}

/// Build an engine over a fresh store seeded with `existing`, start it and
/// bring both connections up
async fn start_engine(config: DiscoveryConfig, existing: &[QueueIdentity]) -> Harness {
    let (store, admin_rx, notification_rx) = InMemoryStore::new(0);
    for identity in existing {
        store.insert_queue(identity);
    }
    let factory = Arc::new(InMemoryHandleFactory::new());
    let engine = DiscoveryEngine::new(&config, 0, store.clone(), store.clone(), factory.clone());
    let events = engine.subscribe();

    engine.start(admin_rx, notification_rx).unwrap();
    store.connect_admin();
    store.connect_notifications();
    wait_ready(&engine).await;

    Harness {
        engine,
        store,
        factory,
        events,
    }
}

async fn wait_ready(engine: &DiscoveryEngine) {
    let mut status = engine.subscribe_status();
    let ready = tokio::time::timeout(Duration::from_secs(5), status.wait_for(EngineStatus::is_ready))
        .await
        .expect("engine did not become ready")
        .is_ok();
    assert!(ready);
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain(events: &mut broadcast::Receiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn count(events: &[DiscoveryEvent], name: &str, identity: Option<&QueueIdentity>) -> usize {
    events
        .iter()
        .filter(|event| event.name() == name)
        .filter(|event| identity.map_or(true, |id| event.identity() == Some(id)))
        .count()
}

fn queue(name: &str) -> QueueIdentity {
    QueueIdentity::new("bull", name)
}

fn inventory(engine: &DiscoveryEngine) -> HashSet<QueueIdentity> {
    engine.registry().keys()
}

#[tokio::test]
async fn test_empty_store_becomes_ready() {
    let mut harness = start_engine(test_config(&["bull"]), &[]).await;

    let events = drain(&mut harness.events);
    assert!(count(&events, "service_ready", None) >= 1);
    assert_eq!(count(&events, "queue_created", None), 0);
    assert!(harness.engine.registry().is_empty());

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_cold_start_with_existing_queues() {
    let existing: Vec<_> = (1..=5).map(|i| queue(&format!("queue-{}", i))).collect();
    let mut harness = start_engine(test_config(&["bull"]), &existing).await;

    assert_eq!(harness.engine.registry().len(), 5);
    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_created", None), 5);
    assert!(count(&events, "service_ready", None) >= 1);

    // ServiceReady follows every creation from the scan
    let ready_at = events.iter().position(|e| e.name() == "service_ready").unwrap();
    assert_eq!(count(&events[..ready_at], "queue_created", None), 5);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_service_ready_waits_for_subscription() {
    let (store, admin_rx, notification_rx) = InMemoryStore::new(0);
    store.insert_queue(&queue("orders"));
    let factory = Arc::new(InMemoryHandleFactory::new());
    let engine = DiscoveryEngine::new(&test_config(&["bull"]), 0, store.clone(), store.clone(), factory);
    let mut events = engine.subscribe();
    engine.start(admin_rx, notification_rx).unwrap();

    store.connect_admin();
    eventually("admin reconciled", || engine.status().reconciled).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = drain(&mut events);
    assert_eq!(count(&before, "queue_created", None), 1);
    assert_eq!(count(&before, "service_ready", None), 0);

    store.connect_notifications();
    wait_ready(&engine).await;
    assert_eq!(store.subscriptions().len(), 1);
    assert_eq!(count(&drain(&mut events), "service_ready", None), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_live_creation_and_removal() {
    let mut harness = start_engine(test_config(&["bull"]), &[]).await;
    drain(&mut harness.events);

    let orders = queue("orders");
    harness.store.create_queue(&orders);
    eventually("orders added", || harness.engine.registry().contains(&orders)).await;

    harness.store.delete_queue(&orders);
    eventually("orders removed", || !harness.engine.registry().contains(&orders)).await;

    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_created", Some(&orders)), 1);
    assert_eq!(count(&events, "queue_removed", Some(&orders)), 1);

    // the removed handle was closed exactly once
    let clients = harness.factory.clients(&orders).unwrap();
    assert_eq!(clients.queue.close_count(), 1);
    assert_eq!(clients.support.close_count(), 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_repeated_notifications_are_idempotent() {
    let mut harness = start_engine(test_config(&["bull"]), &[]).await;
    drain(&mut harness.events);

    let orders = queue("orders");
    harness.store.create_queue(&orders);
    harness.store.create_queue(&orders);
    harness.store.publish_keyspace("bull:orders:meta", "hset");
    eventually("orders added", || harness.engine.registry().contains(&orders)).await;

    // a deletion of an unknown queue is a no-op
    harness.store.publish_keyspace("bull:ghost:meta", "del");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_created", Some(&orders)), 1);
    assert_eq!(count(&events, "queue_removed", None), 0);
    assert_eq!(harness.factory.created_count(), 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_unrelated_keys_are_ignored() {
    let mut harness = start_engine(test_config(&["bull"]), &[]).await;
    drain(&mut harness.events);

    harness.store.publish_keyspace("bull:orders:meta", "expire");
    harness.store.emit_notification(bm_discovery::StoreEvent::PatternMessage {
        pattern: "__keyspace@0__:bull:*:meta".to_string(),
        channel: "__keyspace@0__:garbage".to_string(),
        payload: "hset".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.engine.registry().is_empty());
    assert!(drain(&mut harness.events).is_empty());

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_recovers_missed_changes() {
    let a = queue("a");
    let b = queue("b");
    let c = queue("c");
    let d = queue("d");
    let mut harness = start_engine(test_config(&["bull"]), &[a.clone(), b.clone(), c.clone()]).await;
    assert_eq!(harness.engine.registry().len(), 3);
    drain(&mut harness.events);

    harness.store.disconnect_admin();
    eventually("admin down", || !harness.engine.status().admin.is_ready()).await;

    // changes made while the engine was not looking
    harness.store.forget_queue(&a);
    harness.store.insert_queue(&d);
    harness.store.connect_admin();

    let expected: HashSet<_> = [b.clone(), c.clone(), d.clone()].into_iter().collect();
    eventually("inventory converged", || inventory(&harness.engine) == expected).await;
    wait_ready(&harness.engine).await;

    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_removed", Some(&a)), 1);
    assert_eq!(count(&events, "queue_created", Some(&d)), 1);
    assert_eq!(count(&events, "queue_created", Some(&b)), 0);
    assert_eq!(count(&events, "queue_created", Some(&c)), 0);
    assert!(count(&events, "service_ready", None) >= 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_resubscribe_triggers_resync() {
    let config = DiscoveryConfig {
        reconcile_on_resubscribe: true,
        ..test_config(&["bull"])
    };
    let mut harness = start_engine(config, &[]).await;
    eventually("subscribed", || !harness.store.subscriptions().is_empty()).await;

    harness.store.disconnect_notifications();
    eventually("listener stopped", || !harness.engine.status().listening).await;

    // created while no subscription was active: the notification is lost
    let missed = queue("missed");
    harness.store.create_queue(&missed);
    assert!(!harness.engine.registry().contains(&missed));
    drain(&mut harness.events);

    harness.store.connect_notifications();
    eventually("missed queue resynced", || harness.engine.registry().contains(&missed)).await;
    wait_ready(&harness.engine).await;

    assert_eq!(
        harness.store.subscriptions(),
        vec!["__keyspace@0__:bull:*:meta".to_string()]
    );
    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_created", Some(&missed)), 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_failed_prefix_is_not_pruned() {
    let bull_queue = queue("orders");
    let jobs_queue = QueueIdentity::new("jobs", "emails");
    let mut harness = start_engine(
        test_config(&["bull", "jobs"]),
        &[bull_queue.clone(), jobs_queue.clone()],
    )
    .await;
    assert_eq!(harness.engine.registry().len(), 2);
    drain(&mut harness.events);

    harness.store.forget_queue(&bull_queue);
    harness.store.fail_scans_for("jobs", true);

    let report = harness.engine.reconcile_now().await.unwrap();
    assert_eq!(report.failed_prefixes, vec!["jobs".to_string()]);
    assert_eq!(report.pruned, 1);

    // the failing prefix keeps its queue, the healthy one converged
    assert!(harness.engine.registry().contains(&jobs_queue));
    assert!(!harness.engine.registry().contains(&bull_queue));

    // one failing prefix does not hold back readiness for the rest
    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_removed", Some(&bull_queue)), 1);
    assert_eq!(count(&events, "service_ready", None), 1);
    assert!(harness.engine.status().is_ready());

    harness.store.fail_scans_for("jobs", false);
    let report = harness.engine.reconcile_now().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(count(&drain(&mut harness.events), "service_ready", None), 1);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_handle_failure_does_not_block_other_queues() {
    let (store, admin_rx, notification_rx) = InMemoryStore::new(0);
    let broken = queue("broken");
    let healthy = queue("healthy");
    store.insert_queue(&broken);
    store.insert_queue(&healthy);

    let factory = Arc::new(InMemoryHandleFactory::new());
    factory.fail_for(&broken);
    let engine = DiscoveryEngine::new(&test_config(&["bull"]), 0, store.clone(), store.clone(), factory.clone());
    engine.start(admin_rx, notification_rx).unwrap();
    store.connect_admin();
    store.connect_notifications();
    wait_ready(&engine).await;

    assert!(engine.registry().contains(&healthy));
    assert!(!engine.registry().contains(&broken));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_faulted_handle_is_evicted() {
    let orders = queue("orders");
    let mut harness = start_engine(test_config(&["bull"]), &[orders.clone()]).await;
    drain(&mut harness.events);

    let clients = harness.factory.clients(&orders).unwrap();
    clients.support.trip("connection reset");

    eventually("faulted queue evicted", || !harness.engine.registry().contains(&orders)).await;
    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_removed", Some(&orders)), 1);

    // the next reconciliation brings it back with fresh clients
    harness.engine.reconcile_now().await.unwrap();
    assert!(harness.engine.registry().contains(&orders));
    assert_eq!(harness.factory.created_count(), 2);

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_keyspace_flags_are_enabled() {
    let harness = start_engine(test_config(&["bull"]), &[]).await;

    let flags = harness.store.notify_flags();
    assert!(flags.contains('K'));
    assert!(flags.contains('$') || flags.contains('A'));

    harness.engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let existing = [queue("a"), queue("b")];
    let mut harness = start_engine(test_config(&["bull"]), &existing).await;
    drain(&mut harness.events);

    harness.engine.shutdown().await;

    assert!(harness.engine.registry().is_empty());
    assert!(harness.store.is_admin_closed());
    assert!(harness.store.is_notifications_closed());
    assert!(harness.store.subscriptions().is_empty());
    assert!(!harness.engine.status().is_ready());

    for pair in harness.factory.all_clients() {
        assert_eq!(pair.queue.close_count(), 1);
        assert_eq!(pair.support.close_count(), 1);
    }

    let events = drain(&mut harness.events);
    assert_eq!(count(&events, "queue_removed", None), 2);
    assert_eq!(events.last().map(|e| e.name()), Some("service_closed"));

    // a second shutdown is a no-op
    harness.engine.shutdown().await;
    assert!(drain(&mut harness.events).is_empty());
}

#[tokio::test]
async fn test_notifications_after_shutdown_are_ignored() {
    let harness = start_engine(test_config(&["bull"]), &[]).await;
    harness.engine.shutdown().await;

    harness.store.insert_queue(&queue("late"));
    assert!(harness.engine.reconcile_now().await.is_err());
    assert!(harness.engine.registry().is_empty());
}

#[tokio::test]
async fn test_listener_start_retries_after_guard_timeout() {
    let config = DiscoveryConfig {
        lifecycle_lock_timeout_ms: 50,
        ..test_config(&["bull"])
    };
    let (store, admin_rx, notification_rx) = InMemoryStore::new(0);
    for i in 0..10 {
        store.insert_queue(&queue(&format!("queue-{}", i)));
    }
    let factory = Arc::new(InMemoryHandleFactory::new());
    // the cold-start scan holds the lifecycle guard for ~200ms
    factory.set_create_delay(Duration::from_millis(20));
    let engine = DiscoveryEngine::new(&config, 0, store.clone(), store.clone(), factory.clone());
    engine.start(admin_rx, notification_rx).unwrap();

    store.connect_admin();
    eventually("scan started", || store.scan_calls() > 0).await;
    store.connect_notifications();

    wait_ready(&engine).await;
    assert_eq!(engine.registry().len(), 10);
    assert_eq!(store.subscriptions(), vec!["__keyspace@0__:bull:*:meta".to_string()]);

    let late = queue("late");
    store.create_queue(&late);
    eventually("late queue added", || engine.registry().contains(&late)).await;

    engine.shutdown().await;
}

#[tokio::test]
async fn test_pending_listener_start_dropped_when_connection_closes() {
    let config = DiscoveryConfig {
        lifecycle_lock_timeout_ms: 50,
        ..test_config(&["bull"])
    };
    let (store, admin_rx, notification_rx) = InMemoryStore::new(0);
    for i in 0..10 {
        store.insert_queue(&queue(&format!("queue-{}", i)));
    }
    let factory = Arc::new(InMemoryHandleFactory::new());
    factory.set_create_delay(Duration::from_millis(20));
    let engine = DiscoveryEngine::new(&config, 0, store.clone(), store.clone(), factory.clone());
    engine.start(admin_rx, notification_rx).unwrap();

    store.connect_admin();
    eventually("scan started", || store.scan_calls() > 0).await;
    store.connect_notifications();
    tokio::time::sleep(Duration::from_millis(60)).await;
    store.disconnect_notifications();

    eventually("admin reconciled", || engine.status().reconciled).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(store.subscriptions().is_empty());
    assert!(!engine.status().listening);

    // the next ready subscribes normally
    store.connect_notifications();
    wait_ready(&engine).await;
    assert_eq!(store.subscriptions().len(), 1);

    engine.shutdown().await;
}
