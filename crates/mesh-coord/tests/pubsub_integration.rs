//! Integration tests for the pub/sub side of the facade: envelope delivery,
//! change events, capacity, worker deactivation and idle cleanup.

use std::sync::Arc;
use std::time::Duration;

use mesh_acl::{CapabilityLedger, LedgerConfig, ManualClock};
use mesh_coord::subscription::Delivery;
use mesh_coord::{
    BroadcastOutcome, CapacityKind, ENVELOPE_VERSION, MeshConfig, MeshError, SemanticMesh,
};
use mesh_store::{FlakyStore, MemStore, MeshStore};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

// Re-use shared helpers defined for other integration tests.
#[path = "helpers.rs"]
mod helpers;

use helpers::{
    FailingHandler, PoisonedChannelStore, RecordingHandler, RendezvousStore, admin_caller,
    admin_mesh, admin_mesh_on,
};

async fn recv_one(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("channel closed")
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn publish_delivers_envelopes_to_pattern_subscribers() {
    let mesh = admin_mesh();
    let (handler, mut seen) = RecordingHandler::pair();
    mesh.subscribe("tasks.*", handler).await.expect("subscribe");

    let receivers = mesh
        .publish("tasks.created", json!({ "id": 7 }))
        .await
        .expect("publish");
    assert_eq!(receivers, 1);

    let delivery = recv_one(&mut seen).await;
    assert_eq!(delivery.channel, "tasks.created");
    assert_eq!(delivery.envelope.data, json!({ "id": 7 }));
    assert_eq!(delivery.envelope.source, "test-admin");
    assert_eq!(delivery.envelope.version, ENVELOPE_VERSION);
    assert!(delivery.envelope.timestamp > 0.0);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_skipped_without_counting() {
    let store = Arc::new(MemStore::new());
    let mesh = admin_mesh_on(Arc::clone(&store));
    let (handler, mut seen) = RecordingHandler::pair();
    mesh.subscribe("tasks.*", handler).await.expect("subscribe");

    // raw bytes on the wire, not an envelope
    let receivers = store
        .publish("tasks.created", b"not-an-envelope")
        .await
        .expect("publish");
    assert_eq!(receivers, 1);

    mesh.publish("tasks.created", json!({ "task": 7 }))
        .await
        .expect("publish");
    let delivery = recv_one(&mut seen).await;
    assert_eq!(delivery.envelope.data, json!({ "task": 7 }));

    // the garbage frame was skipped: worker still active, nothing counted
    let info = &mesh.subscriptions()[0];
    assert!(info.active);
    assert_eq!(info.message_count, 1);
}

#[tokio::test]
async fn change_events_follow_writes() {
    let mesh = admin_mesh();
    let (handler, mut seen) = RecordingHandler::pair();
    mesh.subscribe("mesh.events.blog", handler)
        .await
        .expect("subscribe");

    mesh.set("blog:post", b"v1".to_vec()).await.expect("set");
    let event = recv_one(&mut seen).await;
    assert_eq!(event.envelope.data["event"], "set");
    assert_eq!(event.envelope.data["key"], "blog:post");
    assert_eq!(event.envelope.data["version"], 1);

    assert!(
        mesh.compare_and_set("blog:post", Some(b"v1"), b"v2".to_vec())
            .await
            .expect("cas")
    );
    let event = recv_one(&mut seen).await;
    assert_eq!(event.envelope.data["event"], "set");
    assert_eq!(event.envelope.data["version"], 2);

    assert!(mesh.delete("blog:post").await.expect("delete"));
    let event = recv_one(&mut seen).await;
    assert_eq!(event.envelope.data["event"], "delete");
    assert_eq!(event.envelope.data["namespace"], "blog");
}

#[tokio::test]
async fn subscription_capacity_is_enforced() {
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let mesh = SemanticMesh::with_gate(
        Arc::new(MemStore::new()),
        gate,
        admin_caller("t"),
        helpers::small_config(2),
    );
    for pattern in ["a.*", "b.*"] {
        let (handler, _rx) = RecordingHandler::pair();
        mesh.subscribe(pattern, handler).await.expect("subscribe");
    }

    let (handler, _rx) = RecordingHandler::pair();
    let err = mesh.subscribe("c.*", handler).await.expect_err("over cap");
    assert!(err.is_capacity(CapacityKind::Subscriptions));
    assert_eq!(mesh.subscription_count(), 2);

    // freeing a slot admits the next subscriber
    assert!(mesh.unsubscribe("a.*").await.expect("unsubscribe"));
    let (handler, _rx) = RecordingHandler::pair();
    mesh.subscribe("c.*", handler).await.expect("subscribe");
}

#[tokio::test]
async fn concurrent_subscribes_never_exceed_the_limit() {
    let store = RendezvousStore::holding(2);
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let mesh = Arc::new(SemanticMesh::with_gate(
        Arc::clone(&store),
        gate,
        admin_caller("t"),
        helpers::small_config(1),
    ));

    let left = {
        let mesh = Arc::clone(&mesh);
        let (handler, _rx) = RecordingHandler::pair();
        tokio::spawn(async move { mesh.subscribe("race.left", handler).await })
    };
    let right = {
        let mesh = Arc::clone(&mesh);
        let (handler, _rx) = RecordingHandler::pair();
        tokio::spawn(async move { mesh.subscribe("race.right", handler).await })
    };
    let left = left.await.expect("join");
    let right = right.await.expect("join");

    let left_won = left.is_ok();
    assert_ne!(left_won, right.is_ok(), "exactly one subscribe wins");
    let err = if left_won {
        right.expect_err("over cap")
    } else {
        left.expect_err("over cap")
    };
    assert!(err.is_capacity(CapacityKind::Subscriptions));
    assert_eq!(mesh.subscription_count(), 1);

    // the loser's store registration was rolled back
    let (winner_channel, loser_channel) = if left_won {
        ("race.left", "race.right")
    } else {
        ("race.right", "race.left")
    };
    assert_eq!(store.publish(loser_channel, b"x").await.expect("publish"), 0);
    assert_eq!(store.publish(winner_channel, b"x").await.expect("publish"), 1);
}

#[tokio::test]
async fn duplicate_patterns_are_rejected_until_unsubscribed() {
    let mesh = admin_mesh();
    let (handler, _rx) = RecordingHandler::pair();
    mesh.subscribe("jobs.*", handler).await.expect("subscribe");

    let (handler, _rx) = RecordingHandler::pair();
    let err = mesh.subscribe("jobs.*", handler).await.expect_err("dup");
    assert!(matches!(err, MeshError::SubscriptionFailed { .. }));

    assert!(mesh.unsubscribe("jobs.*").await.expect("unsubscribe"));
    assert!(!mesh.unsubscribe("jobs.*").await.expect("unsubscribe"));
}

#[tokio::test]
async fn unsubscribe_leaves_sibling_subscribers_attached() {
    let store = Arc::new(MemStore::new());
    let mesh_a = admin_mesh_on(Arc::clone(&store));
    let mesh_b = admin_mesh_on(Arc::clone(&store));

    let (handler, mut seen) = RecordingHandler::pair();
    mesh_a.subscribe("alerts", handler).await.expect("subscribe");
    let (handler, _other) = RecordingHandler::pair();
    mesh_b.subscribe("alerts", handler).await.expect("subscribe");

    assert!(mesh_b.unsubscribe("alerts").await.expect("unsubscribe"));

    // the first worker's feed survives the second's teardown
    let receivers = mesh_a
        .publish("alerts", json!({ "sev": "high" }))
        .await
        .expect("publish");
    assert_eq!(receivers, 1);
    let delivery = recv_one(&mut seen).await;
    assert_eq!(delivery.envelope.data, json!({ "sev": "high" }));
    assert!(mesh_a.subscriptions()[0].active);
}

#[tokio::test(start_paused = true)]
async fn failed_store_unsubscribe_keeps_the_subscription() {
    let store = Arc::new(FlakyStore::new(MemStore::new()));
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let mesh = SemanticMesh::with_gate(
        Arc::clone(&store),
        gate,
        admin_caller("t"),
        MeshConfig::default(),
    );
    let (handler, mut seen) = RecordingHandler::pair();
    mesh.subscribe("jobs.done", handler).await.expect("subscribe");

    store.fail_next(1);
    let err = mesh
        .unsubscribe("jobs.done")
        .await
        .expect_err("store failure surfaces");
    assert!(matches!(err, MeshError::SubscriptionFailed { .. }));
    assert_eq!(mesh.subscription_count(), 1);

    // the registration is intact: traffic still flows
    let receivers = mesh
        .publish("jobs.done", json!({ "job": 3 }))
        .await
        .expect("publish");
    assert_eq!(receivers, 1);
    assert_eq!(recv_one(&mut seen).await.envelope.data, json!({ "job": 3 }));

    // a retry completes the removal
    assert!(mesh.unsubscribe("jobs.done").await.expect("retry"));
    assert_eq!(mesh.subscription_count(), 0);
    assert_eq!(mesh.publish("jobs.done", json!(0)).await.expect("publish"), 0);
}

#[tokio::test(start_paused = true)]
async fn broadcast_reports_per_channel_outcomes() {
    let store = PoisonedChannelStore::poisoning("beta");
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let mesh = SemanticMesh::with_gate(store, gate, admin_caller("caster"), MeshConfig::default());

    let outcomes = mesh
        .broadcast(&["alpha", "beta", "gamma"], json!({ "x": 1 }))
        .await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes["alpha"].succeeded());
    assert!(outcomes["gamma"].succeeded());
    match &outcomes["beta"] {
        BroadcastOutcome::Failed { error } => {
            assert!(matches!(error, MeshError::PublishFailed { .. }));
        }
        BroadcastOutcome::Delivered { .. } => panic!("beta must fail"),
    }
}

#[tokio::test(start_paused = true)]
async fn publish_retries_transient_store_failures() {
    let store = Arc::new(FlakyStore::new(MemStore::new()));
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let mesh = SemanticMesh::with_gate(
        Arc::clone(&store),
        gate,
        admin_caller("t"),
        MeshConfig::default(),
    );

    let (handler, mut seen) = RecordingHandler::pair();
    mesh.subscribe("news", handler).await.expect("subscribe");

    // two injected faults still fit inside the three-attempt budget
    store.fail_next(2);
    let receivers = mesh.publish("news", json!("flash")).await.expect("publish");
    assert_eq!(receivers, 1);
    assert_eq!(recv_one(&mut seen).await.envelope.data, json!("flash"));

    // a third consecutive fault exhausts it
    store.fail_next(3);
    let err = mesh.publish("news", json!("drop")).await.expect_err("give up");
    assert!(matches!(err, MeshError::PublishFailed { .. }));
}

#[tokio::test(start_paused = true)]
async fn fatal_handler_errors_deactivate_the_subscription() {
    let mesh = admin_mesh();
    let handler = FailingHandler::fatal();
    mesh.subscribe("alerts", handler.clone())
        .await
        .expect("subscribe");

    mesh.publish("alerts", json!("boom")).await.expect("publish");
    wait_until(|| mesh.subscriptions().first().is_some_and(|sub| !sub.active)).await;
    assert_eq!(handler.attempts(), 1);

    // a deactivated worker has stopped consuming
    mesh.publish("alerts", json!("again")).await.expect("publish");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn repeated_transient_errors_deactivate_at_the_check_interval() {
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let config = MeshConfig {
        failure_check_interval: 3,
        ..Default::default()
    };
    let mesh = SemanticMesh::with_gate(Arc::new(MemStore::new()), gate, admin_caller("t"), config);

    let handler = FailingHandler::transient();
    mesh.subscribe("jobs", handler.clone())
        .await
        .expect("subscribe");
    for _ in 0..3 {
        mesh.publish("jobs", json!("tick")).await.expect("publish");
    }

    wait_until(|| mesh.subscriptions().first().is_some_and(|sub| !sub.active)).await;
    assert_eq!(handler.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn subscription_info_tracks_message_counts() {
    let mesh = admin_mesh();
    let (handler, mut seen) = RecordingHandler::pair();
    let id = mesh.subscribe("feed", handler).await.expect("subscribe");
    assert!(id.starts_with("sub-"));

    for i in 0..3 {
        mesh.publish("feed", json!(i)).await.expect("publish");
    }
    for _ in 0..3 {
        recv_one(&mut seen).await;
    }

    wait_until(|| mesh.subscriptions()[0].message_count == 3).await;
    let stats = mesh.subscription_stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.total_messages, 3);
}

#[tokio::test(start_paused = true)]
async fn cleanup_reclaims_idle_subscriptions() {
    let clock = ManualClock::at_unix(1_700_000_000);
    let gate = Arc::new(CapabilityLedger::new(LedgerConfig::default()));
    let config = MeshConfig {
        idle_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let mesh = SemanticMesh::with_clock(
        Arc::new(MemStore::new()),
        gate,
        admin_caller("t"),
        config,
        Arc::new(clock.clone()),
    );

    let (handler, _quiet_rx) = RecordingHandler::pair();
    mesh.subscribe("quiet.*", handler).await.expect("subscribe");
    let (handler, mut busy_rx) = RecordingHandler::pair();
    mesh.subscribe("busy.*", handler).await.expect("subscribe");

    // nothing is stale yet
    assert_eq!(mesh.cleanup_inactive().await, 0);

    clock.advance(Duration::from_secs(120));
    // traffic refreshes the busy subscription at the advanced clock
    mesh.publish("busy.ping", json!(1)).await.expect("publish");
    recv_one(&mut busy_rx).await;
    wait_until(|| mesh.subscriptions().iter().any(|sub| sub.message_count == 1)).await;

    assert_eq!(mesh.cleanup_inactive().await, 1);
    assert_eq!(mesh.subscription_count(), 1);
    assert_eq!(mesh.subscriptions()[0].pattern, "busy.*");
}
