//! Shared fixtures: the real runtime over the in-memory store, a manual
//! clock and in-memory ports.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use haulflow_core::{
    BusinessUnitId, Clock, DefinitionId, EventId, InstanceId, ManualClock, OrganizationId,
    TenantScope, WorkerId,
};
use haulflow_integration::{ConcurrencyLimiter, MemoryPorts, Shipment};
use haulflow_workflow::store::{Created, InstanceSnapshot, StepCommit};
use haulflow_workflow::{
    ActionHandler, ActionRegistry, ConfigSchema, DefinitionCatalog, Engine, ExecutionContext,
    FieldType, HandlerError, InstanceStatus, MemoryStateStore, PendingWait, Runtime,
    RuntimeConfig, Signal, StartRequest, StateStore, StepId, StepRecord, StoreError, WaitKind,
    Worker, WorkflowDefinition, WorkflowInstance, parse_definition, register_builtins,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Returns `config.value`, or the whole config.
struct Echo;

#[async_trait]
impl ActionHandler for Echo {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        Ok(ctx
            .raw_config()
            .get("value")
            .cloned()
            .unwrap_or_else(|| ctx.raw_config().clone()))
    }
}

/// Blocks until cancelled and remembers that it was.
struct Stall {
    started: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl ActionHandler for Stall {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        self.started.notify_one();
        tokio::select! {
            () = ctx.cancellation().cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                Err(HandlerError::cancelled())
            }
            () = tokio::time::sleep(Duration::from_secs(3600)) => Ok(json!({"stalled": false})),
        }
    }
}

/// Takes `seconds` of clock time, then optionally lets a rival worker try to
/// claim the instance. With `paced`, tokio time passes alongside the clock in
/// five-second slices so lease heartbeats get a chance to run.
struct Slow {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStateStore>,
    lease_ttl: Duration,
    calls: Arc<AtomicUsize>,
    rival_claims: Arc<AtomicUsize>,
}

#[async_trait]
impl ActionHandler for Slow {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let config = ctx.raw_config();
        let seconds = config["seconds"].as_i64().unwrap_or(0);
        if config["paced"].as_bool().unwrap_or(false) {
            let mut left = seconds;
            while left > 0 {
                let slice = left.min(5);
                tokio::time::sleep(Duration::from_secs(slice.unsigned_abs())).await;
                self.clock.advance(ChronoDuration::seconds(slice));
                left -= slice;
            }
        } else {
            self.clock.advance(ChronoDuration::seconds(seconds));
        }
        if config["rival"].as_bool().unwrap_or(false) {
            let claimed = self
                .store
                .claim_ready(WorkerId::new(), 10, self.clock.now(), self.lease_ttl)
                .await
                .map_err(|e| HandlerError::internal(e.to_string()))?;
            self.rival_claims.fetch_add(claimed.len(), Ordering::SeqCst);
        }
        Ok(json!({"took": seconds}))
    }
}

/// Delegates to a [`MemoryStateStore`] but fails the next N commits, as if
/// the worker died between running a handler and persisting its outcome.
pub struct CrashingStore {
    inner: Arc<MemoryStateStore>,
    failing_commits: AtomicUsize,
}

impl CrashingStore {
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for CrashingStore {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<Created, StoreError> {
        self.inner.create_instance(instance).await
    }

    async fn load_instance(&self, instance: InstanceId) -> Result<InstanceSnapshot, StoreError> {
        self.inner.load_instance(instance).await
    }

    async fn save_step_and_advance(&self, commit: StepCommit) -> Result<(), StoreError> {
        let crashed = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            return Err(StoreError::Unavailable {
                reason: "worker crashed".to_string(),
            });
        }
        self.inner.save_step_and_advance(commit).await
    }

    async fn claim_ready(
        &self,
        worker: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<InstanceId>, StoreError> {
        self.inner.claim_ready(worker, limit, now, ttl).await
    }

    async fn renew_lease(
        &self,
        instance: InstanceId,
        worker: WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.renew_lease(instance, worker, now, ttl).await
    }

    async fn release(&self, instance: InstanceId, worker: WorkerId) -> Result<(), StoreError> {
        self.inner.release(instance, worker).await
    }

    async fn put_wait(&self, wait: PendingWait) -> Result<(), StoreError> {
        self.inner.put_wait(wait).await
    }

    async fn take_wait(
        &self,
        instance: InstanceId,
        step: &StepId,
    ) -> Result<Option<PendingWait>, StoreError> {
        self.inner.take_wait(instance, step).await
    }

    async fn find_waits_by_match(
        &self,
        kind: WaitKind,
        match_key: &str,
    ) -> Result<Vec<PendingWait>, StoreError> {
        self.inner.find_waits_by_match(kind, match_key).await
    }

    async fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingWait>, StoreError> {
        self.inner.due_waits(now, limit).await
    }

    async fn deliver_signal(&self, signal: Signal, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.deliver_signal(signal, now).await
    }

    async fn step_records(&self, instance: InstanceId) -> Result<Vec<StepRecord>, StoreError> {
        self.inner.step_records(instance).await
    }

    async fn cancel_instance(
        &self,
        instance: InstanceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.cancel_instance(instance, reason, now).await
    }

    async fn is_event_processed(&self, event: EventId) -> Result<bool, StoreError> {
        self.inner.is_event_processed(event).await
    }

    async fn mark_event_processed(
        &self,
        event: EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_event_processed(event, now).await
    }
}

pub struct Harness {
    pub tenant: TenantScope,
    pub ports: MemoryPorts,
    pub store: Arc<MemoryStateStore>,
    pub crashes: Arc<CrashingStore>,
    pub catalog: Arc<DefinitionCatalog>,
    pub registry: Arc<ActionRegistry>,
    pub clock: Arc<ManualClock>,
    pub runtime: Arc<Runtime>,
    pub engine: Engine,
    pub worker: Worker,
    /// Notified when a `test.stall` handler starts.
    pub stall_started: Arc<Notify>,
    /// Set once a `test.stall` step observed cancellation.
    pub stall_cancelled: Arc<AtomicBool>,
    /// Invocations of `test.slow`.
    pub slow_calls: Arc<AtomicUsize>,
    /// Instances a rival worker managed to claim from inside `test.slow`.
    pub rival_claims: Arc<AtomicUsize>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig {
            cancel_grace_ms: 100,
            ..RuntimeConfig::default()
        })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        let ports = MemoryPorts::default();
        let stall_started = Arc::new(Notify::new());
        let stall_cancelled = Arc::new(AtomicBool::new(false));
        let slow_calls = Arc::new(AtomicUsize::new(0));
        let rival_claims = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let mut registry = ActionRegistry::new();
        register_builtins(
            &mut registry,
            ports.ports(),
            Arc::new(ConcurrencyLimiter::default()),
        )
        .expect("builtins");
        registry
            .register(
                "test.echo",
                ConfigSchema::new().optional("value", FieldType::Any),
                Arc::new(Echo),
            )
            .expect("echo");
        registry
            .register(
                "test.stall",
                ConfigSchema::new(),
                Arc::new(Stall {
                    started: Arc::clone(&stall_started),
                    cancelled: Arc::clone(&stall_cancelled),
                }),
            )
            .expect("stall");
        registry
            .register(
                "test.slow",
                ConfigSchema::new()
                    .required("seconds", FieldType::Number)
                    .optional("paced", FieldType::Bool)
                    .optional("rival", FieldType::Bool),
                Arc::new(Slow {
                    clock: Arc::clone(&clock),
                    store: Arc::clone(&store),
                    lease_ttl: config.lease_ttl(),
                    calls: Arc::clone(&slow_calls),
                    rival_claims: Arc::clone(&rival_claims),
                }),
            )
            .expect("slow");
        registry.freeze();
        let registry = Arc::new(registry);

        let crashes = Arc::new(CrashingStore {
            inner: Arc::clone(&store),
            failing_commits: AtomicUsize::new(0),
        });
        let catalog = Arc::new(DefinitionCatalog::new());
        let runtime = Arc::new(Runtime::new(
            crashes.clone(),
            catalog.clone(),
            Arc::clone(&registry),
            ports.approvals.clone(),
            clock.clone(),
            config,
        ));
        let engine = Engine::new(Arc::clone(&runtime));
        let worker = Worker::new(Arc::clone(&runtime));

        Self {
            tenant,
            ports,
            store,
            crashes,
            catalog,
            registry,
            clock,
            runtime,
            engine,
            worker,
            stall_started,
            stall_cancelled,
            slow_calls,
            rival_claims,
        }
    }

    pub fn add_shipment(&self, id: &str) {
        self.ports.shipments.insert(Shipment::new(self.tenant, id));
    }

    pub fn publish(&self, document: JsonValue) -> Arc<WorkflowDefinition> {
        let definition = parse_definition(DefinitionId::new(), self.tenant, &document, &self.registry)
            .unwrap_or_else(|errors| panic!("invalid definition: {errors:?}"));
        self.catalog.insert(definition)
    }

    pub async fn start(&self, definition: &WorkflowDefinition, payload: JsonValue) -> InstanceId {
        let request = StartRequest::new(definition.id, self.tenant, payload);
        self.engine
            .start_instance(request)
            .await
            .expect("start")
            .instance()
    }

    /// Runs the worker until nothing is due at the current time.
    pub async fn run_until_idle(&self) {
        for _ in 0..100 {
            if self.worker.run_once().await.expect("claim") == 0 {
                return;
            }
        }
        panic!("instances kept being claimable");
    }

    /// Alternates running the worker with moving the clock until the
    /// instance finishes.
    pub async fn drive(&self, instance: InstanceId, step: ChronoDuration) -> InstanceStatus {
        for _ in 0..100 {
            self.run_until_idle().await;
            let status = self.status(instance).await;
            if status.is_terminal() {
                return status;
            }
            self.clock.advance(step);
        }
        panic!("instance never finished");
    }

    pub async fn instance(&self, id: InstanceId) -> WorkflowInstance {
        self.engine.instance(&self.tenant, id).await.expect("instance")
    }

    pub async fn status(&self, id: InstanceId) -> InstanceStatus {
        self.instance(id).await.status
    }

    pub async fn history(&self, id: InstanceId) -> Vec<StepRecord> {
        self.engine.history(&self.tenant, id).await.expect("history")
    }

    /// Records of one step, in order.
    pub async fn records_of(&self, id: InstanceId, step: &str) -> Vec<StepRecord> {
        self.history(id)
            .await
            .into_iter()
            .filter(|record| record.step.as_str() == step)
            .collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Wraps `steps` into a minimal definition document.
pub fn document(entry: &str, steps: JsonValue) -> JsonValue {
    json!({
        "name": "test flow",
        "version": 1,
        "trigger": {"event_kind": "shipment.created"},
        "entry": entry,
        "steps": steps,
    })
}
