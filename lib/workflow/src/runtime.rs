//! Advancing instances.
//!
//! A worker holding an instance's lease hands it to [`Runtime::advance`],
//! which applies pending signal deliveries and then runs rounds. In each
//! round every runnable thread executes one step. Structural steps resolve
//! inline; handler calls and approval requests of different threads run
//! concurrently. Each step outcome is committed on its own through
//! [`StateStore::save_step_and_advance`].
//!
//! The lease is renewed before every round, before each handler call or
//! approval request starts, and on a heartbeat while calls are in flight.
//! Once a renewal fails nothing new is started and in-flight calls are
//! cancelled.

use crate::catalog::DefinitionSource;
use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::cursor::{BranchRef, BranchStatus, FrameOutcome, Thread, ThreadId, ThreadState};
use crate::definition::WorkflowDefinition;
use crate::error::StoreError;
use crate::expression::{Env, resolve_template};
use crate::handler::{HandlerError, HandlerErrorKind};
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::record::{StepOutcome, StepRecord};
use crate::registry::ActionRegistry;
use crate::retry::RetryPolicy;
use crate::step::{ActionStep, ApprovalStep, DelayStep, StepId, StepSpec, WaitStep};
use crate::store::{StateStore, StepCommit};
use crate::wait::{
    PendingWait, SignalDelivery, WaitKind, WaitMatch, WaitResolution, approval_match_key,
    event_match_key, timer_match_key,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use haulflow_core::{ApprovalRequestId, InstanceId, SharedClock, WorkerId, after};
use haulflow_integration::{ApprovalDraft, ApprovalService};
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Executes instances step by step against the state store.
pub struct Runtime {
    store: Arc<dyn StateStore>,
    definitions: Arc<dyn DefinitionSource>,
    registry: Arc<ActionRegistry>,
    approvals: Arc<dyn ApprovalService>,
    clock: SharedClock,
    config: RuntimeConfig,
    /// Root cancellation tokens of the instances this process is advancing.
    tokens: Mutex<HashMap<InstanceId, CancellationToken>>,
}

impl Runtime {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        definitions: Arc<dyn DefinitionSource>,
        registry: Arc<ActionRegistry>,
        approvals: Arc<dyn ApprovalService>,
        clock: SharedClock,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            registry,
            approvals,
            clock,
            config,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    #[must_use]
    pub fn definitions(&self) -> &Arc<dyn DefinitionSource> {
        &self.definitions
    }

    #[must_use]
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Cancels every handler this process is running for `instance`.
    ///
    /// Returns false if the instance is not being advanced here.
    pub fn interrupt(&self, instance: InstanceId) -> bool {
        let token = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(&instance).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn track(&self, instance: InstanceId, token: &CancellationToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(instance, token.clone());
        }
    }

    fn untrack(&self, instance: InstanceId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(&instance);
        }
    }

    /// Advances a claimed instance, then releases its lease.
    ///
    /// Losing the lease or finding the instance finished ends the claim
    /// quietly. Any other store error is returned without releasing, so the
    /// lease expires and another worker resumes from the last commit.
    ///
    /// # Errors
    ///
    /// Returns store errors other than lease loss and terminal refusals.
    #[instrument(skip(self))]
    pub async fn advance(&self, instance: InstanceId, worker: WorkerId) -> Result<(), StoreError> {
        let snapshot = self.store.load_instance(instance).await?;
        if snapshot.instance.status.is_terminal() {
            return self.store.release(instance, worker).await;
        }

        let pinned = self
            .definitions
            .get(snapshot.instance.definition, snapshot.instance.version)
            .await;
        let Some(definition) = pinned else {
            error!(
                definition = %snapshot.instance.definition,
                version = snapshot.instance.version,
                "instance references an unpublished definition"
            );
            let outcome = self.fail_orphan(snapshot.instance, worker).await;
            return self.finish_claim(instance, worker, outcome).await;
        };

        let token = CancellationToken::new();
        self.track(instance, &token);
        let mut advance = Advance {
            runtime: self,
            worker,
            definition,
            instance: snapshot.instance,
            token,
            inflight: HashMap::new(),
        };
        let outcome = advance.run(snapshot.inbox).await;
        self.untrack(instance);
        self.finish_claim(instance, worker, outcome).await
    }

    async fn finish_claim(
        &self,
        instance: InstanceId,
        worker: WorkerId,
        outcome: Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        match outcome {
            Ok(()) => self.store.release(instance, worker).await,
            Err(e) if e.ends_claim() => {
                debug!(error = %e, "claim ended early");
                self.store.release(instance, worker).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_orphan(
        &self,
        instance: WorkflowInstance,
        worker: WorkerId,
    ) -> Result<(), StoreError> {
        let commit = StepCommit {
            instance: instance.id,
            worker,
            records: Vec::new(),
            cursor: instance.cursor,
            variables: instance.variables,
            status: InstanceStatus::Failed,
            ready_at: None,
            error: Some(format!(
                "definition {} version {} is not published",
                instance.definition, instance.version
            )),
            put_waits: Vec::new(),
            take_waits: Vec::new(),
            ack_signal: None,
            now: self.clock.now(),
        };
        self.store.save_step_and_advance(commit).await
    }
}

/// Writes accumulated by one step, committed together.
#[derive(Debug, Default)]
struct Change {
    records: Vec<StepRecord>,
    put_waits: Vec<PendingWait>,
    take_waits: Vec<StepId>,
    ack_signal: Option<u64>,
    terminal: Option<(InstanceStatus, String)>,
}

impl Change {
    fn terminate(&mut self, status: InstanceStatus, reason: impl Into<String>) {
        if self.terminal.is_none() {
            self.terminal = Some((status, reason.into()));
        }
    }
}

/// Where a failed step goes.
struct Routes {
    on_failure: Option<StepId>,
    on_timeout: Option<StepId>,
    retry: RetryPolicy,
}

struct Job {
    thread: ThreadId,
    step: StepId,
    attempt: u32,
    started_at: DateTime<Utc>,
    output: JobOutput,
}

enum JobOutput {
    Action(Result<JsonValue, HandlerError>),
    Approval {
        approver: JsonValue,
        deadline: Option<DateTime<Utc>>,
        result: Result<ApprovalRequestId, HandlerError>,
    },
}

enum Stepped {
    Inline(Change),
    Run(BoxFuture<'static, Job>),
}

/// Runs `call` for at most `budget`.
///
/// On expiry the step's token is cancelled and the call gets `grace` to wind
/// down before its result is discarded.
async fn within_budget<T, F>(
    call: F,
    cancel: &CancellationToken,
    budget: Duration,
    grace: Duration,
) -> Result<T, HandlerError>
where
    F: Future<Output = Result<T, HandlerError>>,
{
    tokio::pin!(call);
    tokio::select! {
        result = &mut call => result,
        () = tokio::time::sleep(budget) => {
            cancel.cancel();
            if tokio::time::timeout(grace, &mut call).await.is_err() {
                warn!(budget_ms = budget.as_millis(), "handler ignored cancellation");
            }
            Err(HandlerError::timeout(format!(
                "step exceeded its {}ms deadline",
                budget.as_millis()
            )))
        }
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// One claim's worth of work on one instance.
struct Advance<'r> {
    runtime: &'r Runtime,
    worker: WorkerId,
    definition: Arc<WorkflowDefinition>,
    instance: WorkflowInstance,
    token: CancellationToken,
    inflight: HashMap<ThreadId, CancellationToken>,
}

impl Advance<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.runtime.clock.now()
    }

    fn finished(&self) -> bool {
        self.instance.status.is_terminal()
    }

    async fn run(&mut self, inbox: Vec<SignalDelivery>) -> Result<(), StoreError> {
        if self.instance.is_overdue(self.now()) {
            return self.time_out().await;
        }
        for delivery in inbox {
            if self.finished() {
                return Ok(());
            }
            let change = self.resume(delivery);
            self.commit(change).await?;
        }

        for _ in 0..self.runtime.config.max_rounds_per_claim {
            if self.finished() {
                break;
            }
            let now = self.now();
            if self.instance.is_overdue(now) {
                return self.time_out().await;
            }
            let runnable = self.instance.cursor.runnable(now);
            if runnable.is_empty() {
                break;
            }

            self.renew().await?;

            let mut jobs = FuturesUnordered::new();
            for id in runnable {
                if self.finished() {
                    break;
                }
                let Some(thread) = self.instance.cursor.thread(id).cloned() else {
                    continue;
                };
                if !thread.is_runnable(now) {
                    continue;
                }
                match self.step(&thread, now) {
                    Stepped::Inline(change) => self.commit(change).await?,
                    Stepped::Run(job) => {
                        if let Err(e) = self.renew().await {
                            self.inflight.remove(&id);
                            self.token.cancel();
                            return Err(e);
                        }
                        jobs.push(job);
                    }
                }
            }
            self.drain(jobs).await?;
        }
        Ok(())
    }

    /// Extends the lease so it covers the work about to start.
    async fn renew(&self) -> Result<(), StoreError> {
        let config = &self.runtime.config;
        self.runtime
            .store
            .renew_lease(self.instance.id, self.worker, self.now(), config.lease_ttl())
            .await
    }

    /// Commits in-flight jobs as they finish, renewing the lease meanwhile.
    async fn drain(
        &mut self,
        mut jobs: FuturesUnordered<BoxFuture<'static, Job>>,
    ) -> Result<(), StoreError> {
        let period = self.runtime.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let job = tokio::select! {
                job = jobs.next() => job,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.renew().await {
                        warn!(
                            instance = %self.instance.id,
                            error = %e,
                            "lease renewal failed, cancelling in-flight steps"
                        );
                        self.token.cancel();
                        return Err(e);
                    }
                    continue;
                }
            };
            let Some(job) = job else {
                return Ok(());
            };
            self.inflight.remove(&job.thread);
            if self.finished() {
                continue;
            }
            if let Some(change) = self.complete(job) {
                self.commit(change).await?;
            }
        }
    }

    async fn time_out(&mut self) -> Result<(), StoreError> {
        warn!(instance = %self.instance.id, "instance deadline passed");
        let mut change = Change::default();
        change.terminate(InstanceStatus::TimedOut, "instance deadline passed");
        self.commit(change).await
    }

    async fn commit(&mut self, change: Change) -> Result<(), StoreError> {
        let now = self.now();
        let (status, error) = match change.terminal {
            Some((status, reason)) => (status, Some(reason)),
            None => (self.instance.cursor.status(), self.instance.error.clone()),
        };
        let ready_at = if status.is_terminal() {
            None
        } else {
            let deadline = self.instance.deadline;
            self.instance
                .cursor
                .ready_at(now)
                .map(|at| deadline.map_or(at, |d| at.min(d)))
        };
        let commit = StepCommit {
            instance: self.instance.id,
            worker: self.worker,
            records: change.records,
            cursor: self.instance.cursor.clone(),
            variables: self.instance.variables.clone(),
            status,
            ready_at,
            error: error.clone(),
            put_waits: change.put_waits,
            take_waits: change.take_waits,
            ack_signal: change.ack_signal,
            now,
        };
        self.runtime.store.save_step_and_advance(commit).await?;

        self.instance.status = status;
        self.instance.ready_at = ready_at;
        self.instance.error = error;
        self.instance.updated_at = now;
        if status.is_terminal() {
            self.token.cancel();
            info!(instance = %self.instance.id, %status, "instance finished");
        }
        Ok(())
    }

    fn record(&self, thread: &Thread, started_at: DateTime<Utc>, outcome: StepOutcome) -> StepRecord {
        StepRecord::new(
            self.instance.id,
            thread.step.clone(),
            thread.attempt,
            started_at,
            self.now(),
            outcome,
        )
    }

    fn env<'a>(&'a self, scope: &'a JsonValue, now: DateTime<Utc>) -> Env<'a> {
        Env::new(scope, now)
            .with_fallback(&self.instance.trigger)
            .with_root("trigger", &self.instance.trigger)
            .with_root("event", &self.instance.trigger)
    }

    fn scope(&self, thread: ThreadId) -> JsonValue {
        self.instance.cursor.scope(thread, &self.instance.variables)
    }

    /// Executes or starts the step a runnable thread stands on.
    fn step(&mut self, thread: &Thread, now: DateTime<Utc>) -> Stepped {
        let mut change = Change::default();
        let Some(spec) = self.definition.step(&thread.step).cloned() else {
            error!(step = %thread.step, "cursor points at an unknown step");
            change.terminate(
                InstanceStatus::Failed,
                format!("unknown step '{}'", thread.step),
            );
            return Stepped::Inline(change);
        };

        match spec {
            StepSpec::Action(step) => return self.action(thread, &step, now),
            StepSpec::Approval(step) => return self.approval(thread, &step, now),
            StepSpec::Sequence(step) => {
                change
                    .records
                    .push(self.record(thread, now, StepOutcome::Success));
                match step.children.first() {
                    Some(first) => self.instance.cursor.move_to(thread.id, first.clone()),
                    None => self.advance(thread.id, &thread.step, &mut change),
                }
            }
            StepSpec::Branch(step) => {
                let scope = self.scope(thread.id);
                let outcome = step.condition.evaluate_bool(&self.env(&scope, now));
                match outcome {
                    Ok(value) => {
                        change.records.push(
                            self.record(thread, now, StepOutcome::Success)
                                .with_result(json!({ "condition": value })),
                        );
                        let target = if value { step.true_next } else { step.false_next };
                        debug!(step = %thread.step, value, %target, "branch taken");
                        self.goto(thread.id, Some(target), &mut change);
                    }
                    Err(e) => {
                        let error = HandlerError::invalid_input(format!("branch condition: {e}"));
                        change.records.push(
                            self.record(thread, now, StepOutcome::Failed)
                                .with_error(error.clone()),
                        );
                        self.fail_thread(thread.id, &error, &mut change);
                    }
                }
            }
            StepSpec::Parallel(step) => {
                let children = self.instance.cursor.fork(
                    thread.id,
                    thread.step.clone(),
                    &step.children,
                    step.join.clone(),
                    step.mode,
                );
                debug!(step = %thread.step, branches = children.len(), "forked");
            }
            StepSpec::WaitForEvent(step) => self.wait_for_event(thread, &step, now, &mut change),
            StepSpec::Delay(step) => self.delay(thread, &step, now, &mut change),
        }
        Stepped::Inline(change)
    }

    fn wait_for_event(
        &mut self,
        thread: &Thread,
        step: &WaitStep,
        now: DateTime<Utc>,
        change: &mut Change,
    ) {
        let bindings = self.scope(thread.id);
        let deadline = earliest(
            step.timeout_seconds
                .map(|seconds| after(now, Duration::from_secs(seconds))),
            self.instance.deadline,
        );
        let tenant = self.instance.tenant;
        change.put_waits.push(PendingWait {
            instance: self.instance.id,
            tenant,
            step: thread.step.clone(),
            matcher: WaitMatch::Event {
                event_kind: step.event_kind.clone(),
                predicate: step.predicate.clone(),
                bindings,
            },
            match_key: event_match_key(&tenant, &step.event_kind),
            created_at: now,
            deadline,
        });
        self.instance.cursor.suspend(thread.id, WaitKind::Event);
        change
            .records
            .push(self.record(thread, now, StepOutcome::Suspended));
        debug!(step = %thread.step, event_kind = %step.event_kind, "waiting for event");
    }

    /// Parks the thread on a timer wait the timer loop resolves when due.
    fn delay(&mut self, thread: &Thread, step: &DelayStep, now: DateTime<Utc>, change: &mut Change) {
        let due = after(now, Duration::from_secs(step.seconds));
        change.put_waits.push(PendingWait {
            instance: self.instance.id,
            tenant: self.instance.tenant,
            step: thread.step.clone(),
            matcher: WaitMatch::Timer,
            match_key: timer_match_key(self.instance.id, &thread.step),
            created_at: now,
            deadline: earliest(Some(due), self.instance.deadline),
        });
        self.instance.cursor.suspend(thread.id, WaitKind::Timer);
        change.records.push(
            self.record(thread, now, StepOutcome::Suspended)
                .with_result(json!({ "until": due })),
        );
        debug!(step = %thread.step, %due, "delaying");
    }

    fn action(&mut self, thread: &Thread, step: &ActionStep, now: DateTime<Utc>) -> Stepped {
        let mut change = Change::default();
        let routes = Routes {
            on_failure: step.on_failure.clone(),
            on_timeout: step.on_timeout.clone(),
            retry: self.definition.retry_policy(step),
        };
        let scope = self.scope(thread.id);

        let prepared = {
            let env = self.env(&scope, now);
            match step.condition.as_ref().map(|c| c.evaluate_bool(&env)).transpose() {
                Err(e) => Err(HandlerError::invalid_input(format!("step condition: {e}"))),
                Ok(Some(false)) => Ok(None),
                Ok(_) => resolve_template(&step.config, &env)
                    .map(Some)
                    .map_err(|errors| {
                        let detail: Vec<String> = errors.iter().map(ToString::to_string).collect();
                        HandlerError::invalid_input(format!(
                            "config did not resolve: {}",
                            detail.join("; ")
                        ))
                    }),
            }
        };
        let config = match prepared {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(step = %thread.step, "condition false, skipping");
                change
                    .records
                    .push(self.record(thread, now, StepOutcome::Skipped));
                self.advance(thread.id, &thread.step, &mut change);
                return Stepped::Inline(change);
            }
            Err(error) => {
                self.fail_step(thread, now, error, &routes, &mut change);
                return Stepped::Inline(change);
            }
        };

        let registry = &self.runtime.registry;
        let (violations, handler) = match registry.lookup(&step.action) {
            Ok(entry) => (entry.schema.validate(&config), entry.handler().cloned()),
            Err(_) => (Vec::new(), None),
        };
        if !violations.is_empty() {
            let detail: Vec<String> = violations.iter().map(ToString::to_string).collect();
            let error = HandlerError::invalid_input(detail.join("; "));
            self.fail_step(thread, now, error, &routes, &mut change);
            return Stepped::Inline(change);
        }
        let Some(handler) = handler else {
            let error = HandlerError::internal(format!("no handler for action '{}'", step.action));
            self.fail_step(thread, now, error, &routes, &mut change);
            return Stepped::Inline(change);
        };

        let deadline = earliest(
            Some(after(now, self.definition.step_timeout(step))),
            self.instance.deadline,
        )
        .unwrap_or(now);
        let budget = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        let ctx = self
            .context(thread, scope, config, deadline)
            .with_action(step.action.clone());
        let grace = self.runtime.config.cancel_grace();
        let (id, step_id, attempt) = (thread.id, thread.step.clone(), thread.attempt);
        debug!(step = %step_id, action = %step.action, attempt, "invoking handler");

        Stepped::Run(
            async move {
                let cancel = ctx.cancellation().clone();
                let result = within_budget(handler.invoke(&ctx), &cancel, budget, grace).await;
                Job {
                    thread: id,
                    step: step_id,
                    attempt,
                    started_at: now,
                    output: JobOutput::Action(result),
                }
            }
            .boxed(),
        )
    }

    fn approval(&mut self, thread: &Thread, step: &ApprovalStep, now: DateTime<Utc>) -> Stepped {
        let wait_deadline = earliest(
            step.timeout_seconds
                .map(|seconds| after(now, Duration::from_secs(seconds))),
            self.instance.deadline,
        );
        let draft = ApprovalDraft {
            instance: self.instance.id,
            step: thread.step.to_string(),
            approver: step.approver.clone(),
            deadline: wait_deadline,
        };
        let deadline = earliest(
            Some(after(now, self.definition.default_step_timeout())),
            self.instance.deadline,
        )
        .unwrap_or(now);
        let budget = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        let scope = self.scope(thread.id);
        let ctx = self
            .context(thread, scope, JsonValue::Null, deadline)
            .with_action("flow.approval_request");
        let approvals = Arc::clone(&self.runtime.approvals);
        let grace = self.runtime.config.cancel_grace();
        let approver = step.approver.clone();
        let (id, step_id, attempt) = (thread.id, thread.step.clone(), thread.attempt);

        Stepped::Run(
            async move {
                let key = ctx.idempotency_key();
                let cancel = ctx.cancellation().clone();
                let call = ctx.call(approvals.create_request(&ctx.tenant, &draft, &key));
                let result = within_budget(call, &cancel, budget, grace).await;
                Job {
                    thread: id,
                    step: step_id,
                    attempt,
                    started_at: now,
                    output: JobOutput::Approval {
                        approver,
                        deadline: wait_deadline,
                        result,
                    },
                }
            }
            .boxed(),
        )
    }

    fn context(
        &mut self,
        thread: &Thread,
        scope: JsonValue,
        config: JsonValue,
        deadline: DateTime<Utc>,
    ) -> ExecutionContext {
        let token = self.token.child_token();
        self.inflight.insert(thread.id, token.clone());
        ExecutionContext::new(
            self.instance.tenant,
            self.instance.id,
            thread.step.clone(),
            config,
        )
        .with_definition(self.definition.id)
        .with_attempt(thread.attempt)
        .with_user(self.instance.started_by)
        .with_correlation_id(self.instance.correlation_id)
        .with_variables(scope)
        .with_deadline(deadline)
        .with_cancellation(token)
        .with_clock(Arc::clone(&self.runtime.clock))
    }

    /// Applies a finished handler call or approval request.
    ///
    /// Results for threads that were cancelled or moved on are discarded.
    fn complete(&mut self, job: Job) -> Option<Change> {
        let thread = self.instance.cursor.thread(job.thread).cloned();
        let Some(thread) = thread.filter(|t| t.step == job.step && t.attempt == job.attempt)
        else {
            debug!(step = %job.step, attempt = job.attempt, "discarding result of a cancelled thread");
            return None;
        };
        let spec = self.definition.step(&job.step).cloned()?;
        let mut change = Change::default();

        match (job.output, spec) {
            (JobOutput::Action(Ok(result)), StepSpec::Action(step)) => {
                change.records.push(
                    self.record(&thread, job.started_at, StepOutcome::Success)
                        .with_result(result.clone()),
                );
                self.store_result(thread.id, step.result_var.as_deref(), &thread.step, result);
                self.advance(thread.id, &thread.step, &mut change);
            }
            (JobOutput::Action(Err(error)), StepSpec::Action(step)) => {
                let routes = Routes {
                    on_failure: step.on_failure.clone(),
                    on_timeout: step.on_timeout.clone(),
                    retry: self.definition.retry_policy(&step),
                };
                self.fail_step(&thread, job.started_at, error, &routes, &mut change);
            }
            (
                JobOutput::Approval {
                    approver,
                    deadline,
                    result: Ok(request_id),
                },
                StepSpec::Approval(_),
            ) => {
                let now = self.now();
                change.put_waits.push(PendingWait {
                    instance: self.instance.id,
                    tenant: self.instance.tenant,
                    step: thread.step.clone(),
                    matcher: WaitMatch::Approval {
                        request_id,
                        approver,
                    },
                    match_key: approval_match_key(request_id),
                    created_at: now,
                    deadline,
                });
                self.instance.cursor.suspend(thread.id, WaitKind::Approval);
                change.records.push(
                    self.record(&thread, job.started_at, StepOutcome::Suspended)
                        .with_result(json!({ "request_id": request_id })),
                );
                debug!(step = %thread.step, %request_id, "waiting for approval");
            }
            (JobOutput::Approval { result: Err(error), .. }, StepSpec::Approval(step)) => {
                let routes = Routes {
                    on_failure: None,
                    on_timeout: step.on_timeout.clone(),
                    retry: RetryPolicy::resolve(self.definition.document().retry.as_ref(), None),
                };
                self.fail_step(&thread, job.started_at, error, &routes, &mut change);
            }
            (_, spec) => {
                error!(step = %thread.step, kind = spec.kind(), "result does not fit the step kind");
                change.terminate(InstanceStatus::Failed, "step result did not fit the step kind");
            }
        }
        Some(change)
    }

    /// Applies a resolved wait from the inbox.
    fn resume(&mut self, delivery: SignalDelivery) -> Change {
        let mut change = Change {
            ack_signal: Some(delivery.seq),
            ..Change::default()
        };
        let Some(thread) = self.instance.cursor.waiting_on(&delivery.step).cloned() else {
            debug!(step = %delivery.step, "delivery for a step that is no longer waiting");
            return change;
        };
        let Some(spec) = self.definition.step(&delivery.step).cloned() else {
            return change;
        };
        let started = delivery.delivered_at;

        match (delivery.resolution, &spec) {
            (WaitResolution::Event { payload, .. }, StepSpec::WaitForEvent(step)) => {
                change.records.push(
                    self.record(&thread, started, StepOutcome::Success)
                        .with_result(payload.clone()),
                );
                let key = step
                    .result_var
                    .clone()
                    .unwrap_or_else(|| thread.step.to_string());
                self.instance
                    .cursor
                    .write(thread.id, &key, payload, &mut self.instance.variables);
                self.advance(thread.id, &thread.step, &mut change);
            }
            (
                WaitResolution::Approval {
                    approved,
                    decided_by,
                    comment,
                },
                StepSpec::Approval(step),
            ) => {
                let request_id = match &delivery.matcher {
                    WaitMatch::Approval { request_id, .. } => Some(*request_id),
                    _ => None,
                };
                let decision = json!({
                    "request_id": request_id,
                    "decision": if approved { "approved" } else { "rejected" },
                    "decided_by": decided_by,
                    "comment": comment,
                });
                change.records.push(
                    self.record(&thread, started, StepOutcome::Success)
                        .with_result(decision.clone()),
                );
                let key = step
                    .result_var
                    .clone()
                    .unwrap_or_else(|| thread.step.to_string());
                self.instance
                    .cursor
                    .write(thread.id, &key, decision, &mut self.instance.variables);
                let target = if approved {
                    step.approved_next.clone()
                } else {
                    step.rejected_next.clone()
                };
                self.goto(thread.id, Some(target), &mut change);
            }
            (WaitResolution::Timeout, StepSpec::Delay(_)) => {
                change
                    .records
                    .push(self.record(&thread, started, StepOutcome::Success));
                self.advance(thread.id, &thread.step, &mut change);
            }
            (WaitResolution::Timeout, spec) => {
                let error = HandlerError::timeout("wait deadline passed");
                change.records.push(
                    self.record(&thread, started, StepOutcome::Failed)
                        .with_error(error.clone()),
                );
                match spec.on_timeout() {
                    Some(target) => self.goto(thread.id, Some(target.clone()), &mut change),
                    None => self.fail_thread(thread.id, &error, &mut change),
                }
            }
            (_, spec) => {
                let error = HandlerError::internal(format!(
                    "resolution does not fit {} step",
                    spec.kind()
                ));
                error!(step = %thread.step, %error, "mismatched signal delivery");
                change.records.push(
                    self.record(&thread, started, StepOutcome::Failed)
                        .with_error(error.clone()),
                );
                self.fail_thread(thread.id, &error, &mut change);
            }
        }
        change
    }

    /// Writes a step result into the thread's scope.
    ///
    /// With `result_var` the whole result goes there; otherwise an object
    /// result is merged key by key and anything else is stored under the
    /// step id.
    fn store_result(
        &mut self,
        thread: ThreadId,
        result_var: Option<&str>,
        step: &StepId,
        result: JsonValue,
    ) {
        let instance = &mut self.instance;
        match (result_var, result) {
            (Some(var), value) => instance
                .cursor
                .write(thread, var, value, &mut instance.variables),
            (None, JsonValue::Object(map)) => {
                for (key, value) in map {
                    instance
                        .cursor
                        .write(thread, &key, value, &mut instance.variables);
                }
            }
            (None, value) => instance
                .cursor
                .write(thread, step.as_str(), value, &mut instance.variables),
        }
    }

    /// Applies the error disposition of a failed attempt.
    fn fail_step(
        &mut self,
        thread: &Thread,
        started_at: DateTime<Utc>,
        error: HandlerError,
        routes: &Routes,
        change: &mut Change,
    ) {
        let failed = self
            .record(thread, started_at, StepOutcome::Failed)
            .with_error(error.clone());
        match error.kind {
            HandlerErrorKind::InvalidInput
            | HandlerErrorKind::NotFound
            | HandlerErrorKind::Conflict => {
                change.records.push(failed);
                self.follow_failure(thread.id, routes.on_failure.clone(), &error, change);
            }
            HandlerErrorKind::Upstream => self.retry_or_fail(thread, started_at, error, routes, change),
            HandlerErrorKind::Timeout => match &routes.on_timeout {
                Some(target) => {
                    change.records.push(failed);
                    self.goto(thread.id, Some(target.clone()), change);
                }
                None => self.retry_or_fail(thread, started_at, error, routes, change),
            },
            HandlerErrorKind::Cancelled => {
                change.records.push(failed);
                change.terminate(InstanceStatus::Cancelled, "cancelled while running");
            }
            HandlerErrorKind::Internal => {
                error!(
                    instance = %self.instance.id,
                    step = %thread.step,
                    attempt = thread.attempt,
                    worker = %self.worker,
                    error = %error.message,
                    "internal error in step"
                );
                change.records.push(failed);
                change.terminate(InstanceStatus::Failed, error.to_string());
            }
        }
    }

    fn retry_or_fail(
        &mut self,
        thread: &Thread,
        started_at: DateTime<Utc>,
        error: HandlerError,
        routes: &Routes,
        change: &mut Change,
    ) {
        if routes.retry.allows_retry_after(thread.attempt) {
            let delay = routes.retry.delay(thread.attempt, &mut rand::thread_rng());
            warn!(
                step = %thread.step,
                attempt = thread.attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "retrying step"
            );
            change.records.push(
                self.record(thread, started_at, StepOutcome::Retrying)
                    .with_error(error),
            );
            let not_before = after(self.now(), delay);
            self.instance.cursor.retry_at(thread.id, not_before);
        } else {
            change.records.push(
                self.record(thread, started_at, StepOutcome::Failed)
                    .with_error(error.clone()),
            );
            self.follow_failure(thread.id, routes.on_failure.clone(), &error, change);
        }
    }

    fn follow_failure(
        &mut self,
        thread: ThreadId,
        on_failure: Option<StepId>,
        error: &HandlerError,
        change: &mut Change,
    ) {
        match on_failure {
            Some(target) => self.goto(thread, Some(target), change),
            None => self.fail_thread(thread, error, change),
        }
    }

    /// Moves a thread past a completed step.
    fn advance(&mut self, thread: ThreadId, step: &StepId, change: &mut Change) {
        let next = self.definition.successor(step).cloned();
        self.goto(thread, next, change);
    }

    /// Moves a thread to `target`, ending it when there is nowhere to go or
    /// when it reaches its frame's join.
    fn goto(&mut self, thread: ThreadId, target: Option<StepId>, change: &mut Change) {
        let branch = self.instance.cursor.thread(thread).and_then(|t| t.branch);
        let join = branch
            .and_then(|b| self.instance.cursor.frame(b.frame))
            .map(|frame| frame.join.clone());
        match (target, branch) {
            (Some(target), Some(branch)) if join.as_ref() == Some(&target) => {
                self.instance.cursor.remove_thread(thread);
                self.settle(branch, BranchStatus::Succeeded, None, change);
            }
            (Some(target), _) => self.instance.cursor.move_to(thread, target),
            (None, Some(branch)) => {
                self.instance.cursor.remove_thread(thread);
                self.settle(branch, BranchStatus::Succeeded, None, change);
            }
            (None, None) => {
                self.instance.cursor.remove_thread(thread);
            }
        }
    }

    /// Ends a thread unsuccessfully. The main thread failing fails the instance.
    fn fail_thread(&mut self, thread: ThreadId, error: &HandlerError, change: &mut Change) {
        match self.instance.cursor.thread(thread).and_then(|t| t.branch) {
            Some(branch) => {
                self.instance.cursor.remove_thread(thread);
                self.settle(branch, BranchStatus::Failed, Some(error), change);
            }
            None => change.terminate(InstanceStatus::Failed, error.to_string()),
        }
    }

    fn settle(
        &mut self,
        branch: BranchRef,
        status: BranchStatus,
        error: Option<&HandlerError>,
        change: &mut Change,
    ) {
        let outcome =
            self.instance
                .cursor
                .settle_branch(branch, status, &mut self.instance.variables);
        let now = self.now();
        match outcome {
            FrameOutcome::Open => {}
            FrameOutcome::Joined {
                frame,
                merged,
                cancelled,
            } => {
                self.cancel_threads(cancelled, change);
                change.records.push(
                    StepRecord::new(self.instance.id, frame.step.clone(), 1, now, now, StepOutcome::Success)
                        .with_result(merged),
                );
                debug!(step = %frame.step, join = %frame.join, "parallel branches joined");
            }
            FrameOutcome::Failed { frame, cancelled } => {
                self.cancel_threads(cancelled, change);
                let error = error.cloned().unwrap_or_else(|| {
                    HandlerError::internal(format!("parallel step '{}' failed", frame.step))
                });
                change.records.push(
                    StepRecord::new(self.instance.id, frame.step.clone(), 1, now, now, StepOutcome::Failed)
                        .with_error(error.clone()),
                );
                debug!(step = %frame.step, "parallel frame failed");
                self.fail_thread(frame.parent, &error, change);
            }
        }
    }

    /// Stops threads removed by a settled frame.
    fn cancel_threads(&mut self, threads: Vec<Thread>, change: &mut Change) {
        let now = self.now();
        for thread in threads {
            if let Some(token) = self.inflight.remove(&thread.id) {
                token.cancel();
            }
            if matches!(thread.state, ThreadState::Waiting { .. }) {
                change.take_waits.push(thread.step.clone());
            }
            change.records.push(StepRecord::new(
                self.instance.id,
                thread.step,
                thread.attempt,
                now,
                now,
                StepOutcome::Skipped,
            ));
        }
    }
}
