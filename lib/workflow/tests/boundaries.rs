mod common;

use chrono::Duration as ChronoDuration;
use common::{Harness, document};
use haulflow_workflow::{HandlerErrorKind, InstanceStatus, StepOutcome, Worker};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn skipped_branches_still_join() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "fan",
        json!({
            "fan": {"kind": "parallel", "children": ["a", "b"], "join": "done"},
            "a": {
                "kind": "action",
                "action": "test.echo",
                "condition": "$.amount > 1000",
                "config": {"value": {"a": 1}},
                "next": "done"
            },
            "b": {
                "kind": "action",
                "action": "test.echo",
                "condition": "$.amount > 1000",
                "config": {"value": {"b": 2}},
                "next": "done"
            },
            "done": {"kind": "action", "action": "test.echo", "config": {"value": {"finished": true}}}
        }),
    ));
    let id = harness.start(&definition, json!({"amount": 10})).await;
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["finished"], true);
    for step in ["a", "b"] {
        let records = harness.records_of(id, step).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, StepOutcome::Skipped);
    }
    let fan = harness.records_of(id, "fan").await;
    assert_eq!(fan.last().map(|r| r.outcome), Some(StepOutcome::Success));
}

#[tokio::test]
async fn first_success_cancels_siblings() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "race",
        json!({
            "race": {
                "kind": "parallel",
                "children": ["fast", "slow"],
                "join": "after",
                "mode": "first_success"
            },
            "fast": {
                "kind": "action",
                "action": "test.echo",
                "config": {"value": {"winner": "fast"}},
                "next": "after"
            },
            "slow": {"kind": "action", "action": "test.stall", "config": {}, "next": "after"},
            "after": {"kind": "action", "action": "test.echo", "config": {"value": {"joined": true}}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["race"]["fast"]["winner"], "fast");
    assert!(instance.variables["race"].get("slow").is_none());
    assert_eq!(instance.variables["joined"], true);
    assert!(harness.stall_cancelled.load(Ordering::SeqCst));

    let slow = harness.records_of(id, "slow").await;
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].outcome, StepOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_cancels_and_records_timeout() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "slow",
        json!({
            "slow": {
                "kind": "action",
                "action": "test.stall",
                "config": {},
                "timeout_seconds": 1,
                "retry": {"max_attempts": 1}
            }
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Failed);
    assert!(harness.stall_cancelled.load(Ordering::SeqCst));
    let records = harness.records_of(id, "slow").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, StepOutcome::Failed);
    assert_eq!(
        records[0].error.as_ref().map(|e| e.kind),
        Some(HandlerErrorKind::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn handler_timeout_follows_on_timeout() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "slow",
        json!({
            "slow": {
                "kind": "action",
                "action": "test.stall",
                "config": {},
                "timeout_seconds": 2,
                "on_timeout": "fallback"
            },
            "fallback": {"kind": "action", "action": "test.echo", "config": {"value": {"fallback": true}}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["fallback"], true);
}

#[tokio::test]
async fn retry_exhaustion_fails_only_the_instance() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.ports.http.push_status(503, json!("down"));
    }
    let failing = harness.publish(document(
        "call",
        json!({
            "call": {
                "kind": "action",
                "action": "data.api_call",
                "config": {"url": "https://rates.example.com/quote"},
                "retry": {"max_attempts": 3, "initial_backoff_ms": 10, "max_backoff_ms": 100}
            }
        }),
    ));
    let id = harness.start(&failing, json!({})).await;
    let status = harness.drive(id, ChronoDuration::seconds(1)).await;
    assert_eq!(status, InstanceStatus::Failed);

    let outcomes: Vec<_> = harness
        .records_of(id, "call")
        .await
        .iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        outcomes,
        [StepOutcome::Retrying, StepOutcome::Retrying, StepOutcome::Failed]
    );
    assert!(harness.instance(id).await.error.is_some());

    let healthy = harness.publish(document(
        "ok",
        json!({"ok": {"kind": "action", "action": "test.echo", "config": {"value": {"ok": true}}}}),
    ));
    let other = harness.start(&healthy, json!({})).await;
    harness.run_until_idle().await;
    assert_eq!(harness.status(other).await, InstanceStatus::Succeeded);
}

#[tokio::test]
async fn not_found_follows_on_failure() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "dispatch",
        json!({
            "dispatch": {
                "kind": "action",
                "action": "shipment.update_status",
                "config": {"shipment_id": "S404", "status": "Dispatched"},
                "on_failure": "alert"
            },
            "alert": {
                "kind": "action",
                "action": "notification.send_email",
                "config": {"to": "ops@example.com", "subject": "Dispatch failed", "body": "S404"}
            }
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
    let dispatch = harness.records_of(id, "dispatch").await;
    assert_eq!(dispatch.len(), 1);
    assert_eq!(
        dispatch[0].error.as_ref().map(|e| e.kind),
        Some(HandlerErrorKind::NotFound)
    );
    assert_eq!(harness.ports.notifier.emails_to("ops@example.com"), 1);
}

#[tokio::test]
async fn instance_deadline_times_out_waits() {
    let harness = Harness::new();
    let mut body = document(
        "wait",
        json!({
            "wait": {"kind": "wait_for_event", "event_kind": "document.uploaded"}
        }),
    );
    body["timeout"] = json!({"instance_seconds": 120});
    let definition = harness.publish(body);
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;
    assert_eq!(harness.status(id).await, InstanceStatus::WaitingEvent);

    harness.clock.advance(ChronoDuration::seconds(121));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 1);
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::TimedOut);
    assert_eq!(instance.error.as_deref(), Some("instance deadline passed"));
    assert_eq!(harness.store.wait_count().expect("waits"), 0);
}

#[tokio::test]
async fn step_longer_than_the_lease_commits_once() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "haul",
        json!({
            "haul": {"kind": "action", "action": "test.slow", "config": {"seconds": 31}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;

    for _ in 0..5 {
        harness.worker.run_once().await.expect("claim");
    }

    assert_eq!(harness.slow_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
    let records = harness.records_of(id, "haul").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, StepOutcome::Success);
}

#[tokio::test]
async fn lease_is_renewed_before_each_step() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "load",
        json!({
            "load": {
                "kind": "action",
                "action": "test.slow",
                "config": {"seconds": 20},
                "next": "unload"
            },
            "unload": {
                "kind": "action",
                "action": "test.slow",
                "config": {"seconds": 20, "rival": true}
            }
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.rival_claims.load(Ordering::SeqCst), 0);
    assert_eq!(harness.slow_calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_a_long_step_leased() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "haul",
        json!({
            "haul": {
                "kind": "action",
                "action": "test.slow",
                "timeout_seconds": 120,
                "config": {"seconds": 45, "paced": true, "rival": true}
            }
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    assert_eq!(harness.worker.run_once().await.expect("claim"), 1);

    assert_eq!(harness.rival_claims.load(Ordering::SeqCst), 0);
    assert_eq!(harness.slow_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
}

#[tokio::test]
async fn reclaimed_instance_discards_the_stale_outcome() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "haul",
        json!({
            "haul": {
                "kind": "action",
                "action": "test.slow",
                "config": {"seconds": 31, "rival": true}
            }
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    assert_eq!(harness.worker.run_once().await.expect("claim"), 1);

    assert_eq!(harness.rival_claims.load(Ordering::SeqCst), 1);
    assert!(harness.history(id).await.is_empty());
    assert!(!harness.status(id).await.is_terminal());
    assert_ne!(
        harness.store.lease_holder(id, harness.now()).expect("lease"),
        Some(harness.worker.id())
    );
}

#[tokio::test]
async fn cancel_interrupts_a_running_handler() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "hold",
        json!({
            "hold": {"kind": "action", "action": "test.stall", "config": {}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;

    let worker = Worker::new(Arc::clone(&harness.runtime));
    let running = tokio::spawn(async move { worker.run_once().await });
    tokio::time::timeout(Duration::from_secs(5), harness.stall_started.notified())
        .await
        .expect("handler started");

    let cancelled = harness
        .engine
        .cancel(&harness.tenant, id, "dispatcher withdrew the load")
        .await
        .expect("cancel");
    assert!(cancelled);
    running
        .await
        .expect("worker task")
        .expect("claim");

    assert!(harness.stall_cancelled.load(Ordering::SeqCst));
    assert_eq!(harness.status(id).await, InstanceStatus::Cancelled);
    assert!(
        harness
            .records_of(id, "hold")
            .await
            .iter()
            .all(|record| record.outcome != StepOutcome::Success)
    );
}
