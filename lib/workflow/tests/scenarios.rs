//! End-to-end runs of the runtime over the in-memory store.

mod common;

use chrono::Duration as ChronoDuration;
use common::{Harness, document};
use haulflow_core::WorkerId;
use haulflow_integration::IntegrationError;
use haulflow_workflow::{
    HandlerErrorKind, InstanceStatus, SignalEnvelope, SignalKind, SignalOutcome, StepId,
    StepOutcome, Worker,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn shipment_status_update() {
    let harness = Harness::new();
    harness.add_shipment("S1");
    let definition = harness.publish(document(
        "dispatch",
        json!({
            "dispatch": {
                "kind": "action",
                "action": "shipment.update_status",
                "config": {"shipment_id": "{{ $.shipment_id }}", "status": "Dispatched"}
            }
        }),
    ));

    let id = harness
        .start(&definition, json!({"shipment_id": "S1", "origin": "A"}))
        .await;
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["old_status"], "New");
    assert_eq!(instance.variables["new_status"], "Dispatched");

    let history = harness.history(id).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, StepOutcome::Success);
    assert_eq!(harness.ports.shipments.applied(), 1);
}

fn routing_document() -> serde_json::Value {
    document(
        "check",
        json!({
            "check": {
                "kind": "branch",
                "condition": "$.amount > 100",
                "true_next": "manager",
                "false_next": "clerk"
            },
            "manager": {
                "kind": "action",
                "action": "notification.send_email",
                "config": {"to": "manager@example.com", "subject": "Large load", "body": "Amount {{ $.amount }}"}
            },
            "clerk": {
                "kind": "action",
                "action": "notification.send_email",
                "config": {"to": "clerk@example.com", "subject": "Load", "body": "Amount {{ $.amount }}"}
            }
        }),
    )
}

#[tokio::test]
async fn branch_on_condition() {
    let harness = Harness::new();
    let definition = harness.publish(routing_document());

    let id = harness.start(&definition, json!({"amount": 150})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
    assert_eq!(harness.ports.notifier.emails_to("manager@example.com"), 1);
    assert_eq!(harness.ports.notifier.emails_to("clerk@example.com"), 0);
    let branch = harness.records_of(id, "check").await;
    assert_eq!(branch[0].result, Some(json!({"condition": true})));
}

#[tokio::test]
async fn branch_takes_false_edge() {
    let harness = Harness::new();
    let definition = harness.publish(routing_document());

    let id = harness.start(&definition, json!({"amount": 40})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
    assert_eq!(harness.ports.notifier.emails_to("manager@example.com"), 0);
    assert_eq!(harness.ports.notifier.emails_to("clerk@example.com"), 1);
}

#[tokio::test]
async fn branch_condition_error_fails_the_instance() {
    let harness = Harness::new();
    let definition = harness.publish(routing_document());

    let id = harness.start(&definition, json!({"amount": "lots"})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Failed);
    let branch = harness.records_of(id, "check").await;
    assert_eq!(branch.len(), 1);
    assert_eq!(branch[0].outcome, StepOutcome::Failed);
    assert_eq!(
        branch[0].error.as_ref().map(|e| e.kind),
        Some(HandlerErrorKind::InvalidInput)
    );
    assert!(harness.ports.notifier.sent().is_empty());
}

fn approval_document() -> serde_json::Value {
    document(
        "approve",
        json!({
            "approve": {
                "kind": "approval",
                "approver": {"role": "billing_manager"},
                "timeout_seconds": 60,
                "approved_next": "invoice",
                "rejected_next": "notify",
                "on_timeout": "notify"
            },
            "invoice": {
                "kind": "action",
                "action": "billing.generate_invoice",
                "config": {"shipment_id": "{{ $.shipment_id }}"}
            },
            "notify": {
                "kind": "action",
                "action": "notification.send_email",
                "config": {"to": "requester@example.com", "subject": "Not approved", "body": "Shipment {{ $.shipment_id }}"}
            }
        }),
    )
}

#[tokio::test]
async fn approval_granted_generates_invoice() {
    let harness = Harness::new();
    let definition = harness.publish(approval_document());
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;

    harness.run_until_idle().await;
    assert_eq!(harness.status(id).await, InstanceStatus::WaitingApproval);
    let raised = harness.ports.approvals.raised();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].1.step, "approve");

    harness.clock.advance(ChronoDuration::seconds(10));
    let outcome = harness
        .engine
        .signal(
            &harness.tenant,
            SignalEnvelope {
                instance: id,
                step: StepId::from("approve"),
                kind: SignalKind::Approval,
                payload: json!({"decision": "approved"}),
                decided_by: None,
            },
        )
        .await
        .expect("signal");
    assert_eq!(outcome, SignalOutcome::Delivered);

    harness.run_until_idle().await;
    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["approve"]["decision"], "approved");
    assert_eq!(harness.ports.billing.invoices(), 1);
    assert!(harness.ports.notifier.sent().is_empty());

    let late = harness
        .engine
        .signal(
            &harness.tenant,
            SignalEnvelope {
                instance: id,
                step: StepId::from("approve"),
                kind: SignalKind::Approval,
                payload: json!({"decision": "rejected"}),
                decided_by: None,
            },
        )
        .await
        .expect("signal");
    assert_eq!(late, SignalOutcome::NotWaiting);
}

#[tokio::test]
async fn approval_without_answer_times_out() {
    let harness = Harness::new();
    let definition = harness.publish(approval_document());
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    harness.run_until_idle().await;

    harness.clock.advance(ChronoDuration::seconds(30));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 0);

    harness.clock.advance(ChronoDuration::seconds(31));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 1);
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Succeeded);
    assert_eq!(harness.ports.notifier.emails_to("requester@example.com"), 1);
    assert_eq!(harness.ports.billing.invoices(), 0);
    let approve = harness.records_of(id, "approve").await;
    let last = approve.last().expect("approve records");
    assert_eq!(last.outcome, StepOutcome::Failed);
    assert_eq!(last.error.as_ref().map(|e| e.kind), Some(HandlerErrorKind::Timeout));
}

fn parallel_document(require_valid: bool) -> serde_json::Value {
    document(
        "prepare",
        json!({
            "prepare": {
                "kind": "parallel",
                "children": ["docs", "validate"],
                "join": "invoice"
            },
            "docs": {
                "kind": "action",
                "action": "document.generate",
                "config": {"shipment_id": "{{ $.shipment_id }}", "document_type": "invoice_packet"},
                "next": "invoice"
            },
            "validate": {
                "kind": "action",
                "action": "billing.validate_requirements",
                "config": {"shipment_id": "{{ $.shipment_id }}", "require_valid": require_valid},
                "next": "invoice"
            },
            "invoice": {
                "kind": "action",
                "action": "billing.generate_invoice",
                "config": {"shipment_id": "{{ $.shipment_id }}"}
            }
        }),
    )
}

#[tokio::test]
async fn parallel_all_joins_before_invoice() {
    let harness = Harness::new();
    harness.add_shipment("S1");
    let definition = harness.publish(parallel_document(false));
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["prepare"]["validate"]["is_valid"], false);
    assert!(instance.variables["prepare"]["docs"]["document_id"].is_string());

    let history = harness.history(id).await;
    let position = |step: &str| {
        history
            .iter()
            .position(|r| r.step.as_str() == step && r.outcome == StepOutcome::Success)
            .unwrap_or_else(|| panic!("no success record for {step}"))
    };
    assert!(position("docs") < position("invoice"));
    assert!(position("validate") < position("invoice"));
    assert!(position("prepare") < position("invoice"));
    assert_eq!(harness.ports.billing.invoices(), 1);
}

#[tokio::test]
async fn parallel_all_fails_when_a_child_fails() {
    let harness = Harness::new();
    harness.add_shipment("S1");
    let definition = harness.publish(parallel_document(true));
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::Failed);
    assert_eq!(harness.ports.billing.invoices(), 0);
    assert!(harness.records_of(id, "invoice").await.is_empty());
    let prepare = harness.records_of(id, "prepare").await;
    assert_eq!(prepare.last().map(|r| r.outcome), Some(StepOutcome::Failed));
}

fn quote_document() -> serde_json::Value {
    document(
        "quote",
        json!({
            "quote": {
                "kind": "action",
                "action": "data.api_call",
                "config": {"url": "https://rates.example.com/quote", "method": "POST", "body": {"lane": "A-B"}},
                "result_var": "quote",
                "retry": {"max_attempts": 3}
            }
        }),
    )
}

#[tokio::test]
async fn retries_transient_upstream_failures() {
    let harness = Harness::new();
    harness.ports.http.push_status(503, json!("busy"));
    harness.ports.http.push_status(502, json!("bad gateway"));
    harness.ports.http.push_status(200, json!({"rate": 1250}));
    let definition = harness.publish(quote_document());
    let id = harness.start(&definition, json!({})).await;

    let status = harness.drive(id, ChronoDuration::milliseconds(500)).await;
    assert_eq!(status, InstanceStatus::Succeeded);

    let records = harness.records_of(id, "quote").await;
    let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        [StepOutcome::Retrying, StepOutcome::Retrying, StepOutcome::Success]
    );
    let attempts: Vec<_> = records.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, [1, 2, 3]);
    let elapsed = records[2].started_at - records[0].started_at;
    assert!(elapsed >= ChronoDuration::seconds(3), "elapsed {elapsed}");
    assert_eq!(harness.instance(id).await.variables["quote"]["response"]["rate"], 1250);
    assert_eq!(harness.ports.http.requests().len(), 3);
}

#[tokio::test]
async fn crashed_worker_is_replaced_after_lease_expiry() {
    let harness = Harness::new();
    harness.add_shipment("S1");
    let definition = harness.publish(document(
        "dispatch",
        json!({
            "dispatch": {
                "kind": "action",
                "action": "shipment.update_status",
                "config": {"shipment_id": "{{ $.shipment_id }}", "status": "Dispatched"},
                "next": "tell"
            },
            "tell": {
                "kind": "action",
                "action": "notification.send_email",
                "config": {"to": "ops@example.com", "subject": "Dispatched", "body": "{{ $.shipment_id }}"}
            }
        }),
    ));
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;

    harness.crashes.fail_next_commits(1);
    assert_eq!(harness.worker.run_once().await.expect("claim"), 1);
    assert_eq!(harness.status(id).await, InstanceStatus::Pending);
    assert!(harness.history(id).await.is_empty());
    assert_eq!(
        harness.store.lease_holder(id, harness.now()).expect("lease"),
        Some(harness.worker.id())
    );

    let replacement = Worker::new(Arc::clone(&harness.runtime)).with_id(WorkerId::new());
    assert_eq!(replacement.run_once().await.expect("claim"), 0);

    harness.clock.advance(ChronoDuration::seconds(31));
    assert_eq!(replacement.run_once().await.expect("claim"), 1);

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["old_status"], "New");
    assert_eq!(harness.ports.shipments.applied(), 1);
    assert_eq!(harness.records_of(id, "dispatch").await.len(), 1);
    assert_eq!(harness.ports.notifier.emails_to("ops@example.com"), 1);
}

#[tokio::test]
async fn wait_for_event_resumes_with_payload() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "wait_pod",
        json!({
            "wait_pod": {
                "kind": "wait_for_event",
                "event_kind": "document.uploaded",
                "result_var": "pod",
                "next": "ack"
            },
            "ack": {
                "kind": "action",
                "action": "test.echo",
                "config": {"value": {"received": "{{ $.pod.document_type }}"}}
            }
        }),
    ));
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    harness.run_until_idle().await;
    assert_eq!(harness.status(id).await, InstanceStatus::WaitingEvent);
    assert_eq!(harness.store.wait_count().expect("waits"), 1);

    let outcome = harness
        .engine
        .signal(
            &harness.tenant,
            SignalEnvelope {
                instance: id,
                step: StepId::from("wait_pod"),
                kind: SignalKind::Event,
                payload: json!({"document_type": "pod"}),
                decided_by: None,
            },
        )
        .await
        .expect("signal");
    assert_eq!(outcome, SignalOutcome::Delivered);
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["pod"]["document_type"], "pod");
    assert_eq!(instance.variables["received"], "pod");
    assert_eq!(harness.store.wait_count().expect("waits"), 0);
}

#[tokio::test]
async fn cancel_clears_waits_and_rejects_signals() {
    let harness = Harness::new();
    let definition = harness.publish(approval_document());
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    harness.run_until_idle().await;
    assert_eq!(harness.store.wait_count().expect("waits"), 1);

    let cancelled = harness
        .engine
        .cancel(&harness.tenant, id, "load withdrawn")
        .await
        .expect("cancel");
    assert!(cancelled);
    assert_eq!(harness.status(id).await, InstanceStatus::Cancelled);
    assert_eq!(harness.store.wait_count().expect("waits"), 0);

    let again = harness
        .engine
        .cancel(&harness.tenant, id, "twice")
        .await
        .expect("cancel");
    assert!(!again);

    let outcome = harness
        .engine
        .signal(
            &harness.tenant,
            SignalEnvelope {
                instance: id,
                step: StepId::from("approve"),
                kind: SignalKind::Approval,
                payload: json!({"approved": true}),
                decided_by: None,
            },
        )
        .await
        .expect("signal");
    assert_eq!(outcome, SignalOutcome::NotWaiting);
}

#[tokio::test]
async fn other_tenants_cannot_touch_an_instance() {
    let harness = Harness::new();
    let definition = harness.publish(approval_document());
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;
    let stranger = haulflow_core::TenantScope::new(
        haulflow_core::OrganizationId::new(),
        haulflow_core::BusinessUnitId::new(),
    );

    assert!(harness.engine.instance(&stranger, id).await.is_err());
    assert!(harness.engine.cancel(&stranger, id, "nope").await.is_err());
    assert_eq!(harness.status(id).await, InstanceStatus::Pending);
}

#[tokio::test]
async fn approval_request_failure_is_retried() {
    let harness = Harness::new();
    harness
        .ports
        .approvals
        .failures
        .push(IntegrationError::unavailable("approvals", "503"));
    let definition = harness.publish(approval_document());
    let id = harness.start(&definition, json!({"shipment_id": "S1"})).await;

    harness.run_until_idle().await;
    let approve = harness.records_of(id, "approve").await;
    assert_eq!(approve[0].outcome, StepOutcome::Retrying);

    harness.clock.advance(ChronoDuration::seconds(2));
    harness.run_until_idle().await;
    assert_eq!(harness.status(id).await, InstanceStatus::WaitingApproval);
    assert_eq!(harness.ports.approvals.raised().len(), 1);
}

#[tokio::test]
async fn delay_holds_the_thread_until_the_timer_fires() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "cool_off",
        json!({
            "cool_off": {"kind": "delay", "seconds": 600, "next": "remind"},
            "remind": {"kind": "action", "action": "test.echo", "config": {"value": {"reminded": true}}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::WaitingEvent);
    let parked = harness.records_of(id, "cool_off").await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].outcome, StepOutcome::Suspended);
    assert_eq!(harness.store.wait_count().expect("waits"), 1);

    harness.clock.advance(ChronoDuration::seconds(599));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 0);
    harness.run_until_idle().await;
    assert!(harness.records_of(id, "remind").await.is_empty());

    harness.clock.advance(ChronoDuration::seconds(1));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 1);
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["reminded"], true);
    let outcomes: Vec<_> = harness
        .records_of(id, "cool_off")
        .await
        .iter()
        .map(|record| record.outcome)
        .collect();
    assert_eq!(outcomes, [StepOutcome::Suspended, StepOutcome::Success]);
    assert_eq!(harness.store.wait_count().expect("waits"), 0);
}

#[tokio::test]
async fn delay_inside_a_sequence_continues_with_the_next_child() {
    let harness = Harness::new();
    let definition = harness.publish(document(
        "steps",
        json!({
            "steps": {"kind": "sequence", "children": ["pause", "ping"], "next": "done"},
            "pause": {"kind": "action", "action": "flow.delay", "config": {"seconds": 30}},
            "ping": {"kind": "action", "action": "test.echo", "config": {"value": {"pinged": true}}},
            "done": {"kind": "action", "action": "test.echo", "config": {"value": {"done": true}}}
        }),
    ));
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;
    assert_eq!(harness.status(id).await, InstanceStatus::WaitingEvent);

    harness.clock.advance(ChronoDuration::seconds(30));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 1);
    harness.run_until_idle().await;

    let instance = harness.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Succeeded);
    assert_eq!(instance.variables["pinged"], true);
    assert_eq!(instance.variables["done"], true);
}

#[tokio::test]
async fn instance_deadline_cuts_a_delay_short() {
    let harness = Harness::new();
    let mut body = document(
        "cool_off",
        json!({
            "cool_off": {"kind": "delay", "seconds": 3600, "next": "remind"},
            "remind": {"kind": "action", "action": "test.echo", "config": {}}
        }),
    );
    body["timeout"] = json!({"instance_seconds": 60});
    let definition = harness.publish(body);
    let id = harness.start(&definition, json!({})).await;
    harness.run_until_idle().await;

    harness.clock.advance(ChronoDuration::seconds(61));
    assert_eq!(harness.engine.fire_due_timers().await.expect("timers"), 1);
    harness.run_until_idle().await;

    assert_eq!(harness.status(id).await, InstanceStatus::TimedOut);
    assert!(harness.records_of(id, "remind").await.is_empty());
}
