//! In-process state store.
//!
//! All state sits behind one mutex, so every trait call is atomic. Used by
//! tests and by single-node deployments that accept losing state on restart.

use super::{Created, InstanceSnapshot, StateStore, StepCommit};
use crate::error::StoreError;
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::record::StepRecord;
use crate::step::StepId;
use crate::wait::{PendingWait, Signal, SignalDelivery, WaitKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::{DefinitionId, EventId, InstanceId, WorkerId, after};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Lease {
    worker: WorkerId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    instances: BTreeMap<InstanceId, WorkflowInstance>,
    by_trigger: HashMap<(DefinitionId, EventId), InstanceId>,
    records: HashMap<InstanceId, Vec<StepRecord>>,
    waits: BTreeMap<(InstanceId, StepId), PendingWait>,
    inbox: HashMap<InstanceId, Vec<SignalDelivery>>,
    leases: HashMap<InstanceId, Lease>,
    processed: HashMap<EventId, DateTime<Utc>>,
    next_seq: u64,
}

impl Inner {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut WorkflowInstance, StoreError> {
        self.instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound { instance: id })
    }

    /// Ownership, not expiry: an expired lease is only lost to a new claim.
    fn holds_lease(&self, instance: InstanceId, worker: WorkerId) -> bool {
        self.leases
            .get(&instance)
            .is_some_and(|lease| lease.worker == worker)
    }

    fn clear_pending(&mut self, instance: InstanceId) {
        self.waits.retain(|(owner, _), _| *owner != instance);
        self.inbox.remove(&instance);
    }
}

/// A [`StateStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable {
            reason: "state lock poisoned".to_string(),
        })
    }

    /// Number of waits currently registered.
    pub fn wait_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.waits.len())
    }

    /// The worker currently holding `instance`'s lease, if unexpired at `now`.
    pub fn lease_holder(
        &self,
        instance: InstanceId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerId>, StoreError> {
        Ok(self
            .lock()?
            .leases
            .get(&instance)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.worker))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<Created, StoreError> {
        let mut inner = self.lock()?;
        if let Some(event) = instance.trigger_event {
            let key = (instance.definition, event);
            if let Some(existing) = inner.by_trigger.get(&key) {
                return Ok(Created::Duplicate(*existing));
            }
            inner.by_trigger.insert(key, instance.id);
        }
        let id = instance.id;
        inner.instances.insert(id, instance);
        Ok(Created::New(id))
    }

    async fn load_instance(&self, instance: InstanceId) -> Result<InstanceSnapshot, StoreError> {
        let inner = self.lock()?;
        let found = inner
            .instances
            .get(&instance)
            .cloned()
            .ok_or(StoreError::InstanceNotFound { instance })?;
        Ok(InstanceSnapshot {
            instance: found,
            inbox: inner.inbox.get(&instance).cloned().unwrap_or_default(),
        })
    }

    async fn save_step_and_advance(&self, commit: StepCommit) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let id = commit.instance;
        let current = inner.instance_mut(id)?.status;
        if current.is_terminal() {
            return Err(StoreError::Terminal {
                instance: id,
                status: current,
            });
        }
        if !inner.holds_lease(id, commit.worker) {
            return Err(StoreError::LeaseLost { instance: id });
        }
        if current != commit.status && !current.can_transition_to(commit.status) {
            return Err(StoreError::Corrupt {
                reason: format!("illegal transition {current} -> {}", commit.status),
            });
        }

        let mut records = commit.records;
        for record in &mut records {
            record.seq = inner.seq();
        }
        inner.records.entry(id).or_default().extend(records);

        for step in &commit.take_waits {
            inner.waits.remove(&(id, step.clone()));
        }
        for wait in commit.put_waits {
            inner.waits.insert((id, wait.step.clone()), wait);
        }
        if let Some(seq) = commit.ack_signal
            && let Some(inbox) = inner.inbox.get_mut(&id)
        {
            inbox.retain(|delivery| delivery.seq != seq);
        }

        let instance = inner.instance_mut(id)?;
        instance.cursor = commit.cursor;
        instance.variables = commit.variables;
        instance.status = commit.status;
        instance.ready_at = commit.ready_at;
        instance.error = commit.error;
        instance.updated_at = commit.now;
        if commit.status.is_terminal() {
            inner.clear_pending(id);
        }
        Ok(())
    }

    async fn claim_ready(
        &self,
        worker: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<InstanceId>, StoreError> {
        let mut inner = self.lock()?;
        let due: Vec<InstanceId> = inner
            .instances
            .values()
            .filter(|instance| !instance.status.is_terminal())
            .filter(|instance| {
                inner
                    .leases
                    .get(&instance.id)
                    .is_none_or(|lease| lease.expires_at <= now)
            })
            .filter(|instance| {
                let runnable = matches!(
                    instance.status,
                    InstanceStatus::Pending | InstanceStatus::Running
                ) && instance.ready_at.is_some_and(|at| at <= now);
                let signalled = inner
                    .inbox
                    .get(&instance.id)
                    .is_some_and(|inbox| !inbox.is_empty());
                runnable || signalled
            })
            .map(|instance| instance.id)
            .take(limit)
            .collect();
        let expires_at = after(now, ttl);
        for id in &due {
            inner.leases.insert(*id, Lease { worker, expires_at });
        }
        if !due.is_empty() {
            debug!(%worker, claimed = due.len(), "claimed instances");
        }
        Ok(due)
    }

    async fn renew_lease(
        &self,
        instance: InstanceId,
        worker: WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let status = inner.instance_mut(instance)?.status;
        if status.is_terminal() {
            return Err(StoreError::Terminal { instance, status });
        }
        match inner.leases.get_mut(&instance) {
            Some(lease) if lease.worker == worker => {
                lease.expires_at = after(now, ttl);
                Ok(())
            }
            _ => Err(StoreError::LeaseLost { instance }),
        }
    }

    async fn release(&self, instance: InstanceId, worker: WorkerId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.holds_lease(instance, worker) {
            inner.leases.remove(&instance);
        }
        Ok(())
    }

    async fn put_wait(&self, wait: PendingWait) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.waits.insert((wait.instance, wait.step.clone()), wait);
        Ok(())
    }

    async fn take_wait(
        &self,
        instance: InstanceId,
        step: &StepId,
    ) -> Result<Option<PendingWait>, StoreError> {
        Ok(self.lock()?.waits.remove(&(instance, step.clone())))
    }

    async fn find_waits_by_match(
        &self,
        kind: WaitKind,
        match_key: &str,
    ) -> Result<Vec<PendingWait>, StoreError> {
        let inner = self.lock()?;
        let mut found: Vec<PendingWait> = inner
            .waits
            .values()
            .filter(|wait| wait.kind() == kind && wait.match_key == match_key)
            .cloned()
            .collect();
        found.sort_by_key(|wait| wait.created_at);
        Ok(found)
    }

    async fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingWait>, StoreError> {
        let inner = self.lock()?;
        let mut due: Vec<PendingWait> = inner
            .waits
            .values()
            .filter(|wait| wait.deadline.is_some_and(|deadline| deadline <= now))
            .cloned()
            .collect();
        due.sort_by_key(|wait| wait.deadline);
        due.truncate(limit);
        Ok(due)
    }

    async fn deliver_signal(
        &self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let key = (signal.instance, signal.step.clone());
        let fits = inner
            .waits
            .get(&key)
            .is_some_and(|wait| signal.resolution.fits(wait.kind()));
        if !fits {
            return Ok(false);
        }
        let Some(wait) = inner.waits.remove(&key) else {
            return Ok(false);
        };
        let seq = inner.seq();
        inner
            .inbox
            .entry(signal.instance)
            .or_default()
            .push(SignalDelivery {
                seq,
                instance: signal.instance,
                step: signal.step,
                resolution: signal.resolution,
                matcher: wait.matcher,
                delivered_at: now,
            });
        let instance = inner.instance_mut(signal.instance)?;
        instance.status = InstanceStatus::Running;
        instance.ready_at = Some(now);
        instance.updated_at = now;
        Ok(true)
    }

    async fn step_records(&self, instance: InstanceId) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.lock()?;
        let mut records = inner.records.get(&instance).cloned().unwrap_or_default();
        records.sort_by_key(|record| (record.started_at, record.seq));
        Ok(records)
    }

    async fn cancel_instance(
        &self,
        instance: InstanceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let found = inner.instance_mut(instance)?;
        if found.status.is_terminal() {
            return Ok(false);
        }
        found.status = InstanceStatus::Cancelled;
        found.error = Some(reason.to_string());
        found.ready_at = None;
        found.updated_at = now;
        inner.clear_pending(instance);
        inner.leases.remove(&instance);
        Ok(true)
    }

    async fn is_event_processed(&self, event: EventId) -> Result<bool, StoreError> {
        Ok(self.lock()?.processed.contains_key(&event))
    }

    async fn mark_event_processed(
        &self,
        event: EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()?.processed.entry(event).or_insert(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::wait::{WaitMatch, WaitResolution, approval_match_key};
    use haulflow_core::{ApprovalRequestId, BusinessUnitId, CorrelationId, OrganizationId, TenantScope};
    use serde_json::json;

    fn instance(now: DateTime<Utc>, event: Option<EventId>) -> WorkflowInstance {
        WorkflowInstance {
            id: InstanceId::new(),
            definition: DefinitionId::new(),
            version: 1,
            tenant: TenantScope::new(OrganizationId::new(), BusinessUnitId::new()),
            status: InstanceStatus::Pending,
            variables: json!({}),
            cursor: Cursor::start(StepId::from("start")),
            trigger: json!({}),
            correlation_id: CorrelationId::new(),
            trigger_event: event,
            started_by: None,
            created_at: now,
            updated_at: now,
            deadline: None,
            ready_at: Some(now),
            error: None,
        }
    }

    fn commit(
        instance: &WorkflowInstance,
        worker: WorkerId,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> StepCommit {
        StepCommit {
            instance: instance.id,
            worker,
            records: Vec::new(),
            cursor: instance.cursor.clone(),
            variables: json!({}),
            status,
            ready_at: None,
            error: None,
            put_waits: Vec::new(),
            take_waits: Vec::new(),
            ack_signal: None,
            now,
        }
    }

    fn approval_wait(instance: &WorkflowInstance, now: DateTime<Utc>) -> PendingWait {
        let request_id = ApprovalRequestId::new();
        PendingWait {
            instance: instance.id,
            tenant: instance.tenant,
            step: StepId::from("approve"),
            matcher: WaitMatch::Approval {
                request_id,
                approver: json!("ops"),
            },
            match_key: approval_match_key(request_id),
            created_at: now,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_trigger_event() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let event = EventId::new();
        let first = instance(now, Some(event));
        let mut second = instance(now, Some(event));
        second.definition = first.definition;

        let created = store.create_instance(first.clone()).await.expect("create");
        let again = store.create_instance(second).await.expect("create again");
        assert_eq!(created, Created::New(first.id));
        assert_eq!(again, Created::Duplicate(first.id));
    }

    #[tokio::test]
    async fn commit_requires_the_lease() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let pending = instance(now, None);
        store.create_instance(pending.clone()).await.expect("create");

        let result = store
            .save_step_and_advance(commit(&pending, WorkerId::new(), InstanceStatus::Running, now))
            .await;
        assert_eq!(result, Err(StoreError::LeaseLost { instance: pending.id }));
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let pending = instance(now, None);
        store.create_instance(pending.clone()).await.expect("create");
        let ttl = Duration::from_secs(30);

        let first = WorkerId::new();
        let second = WorkerId::new();
        assert_eq!(
            store.claim_ready(first, 10, now, ttl).await.expect("claim"),
            vec![pending.id]
        );
        assert!(store.claim_ready(second, 10, now, ttl).await.expect("claim").is_empty());

        let later = after(now, Duration::from_secs(31));
        assert_eq!(
            store.claim_ready(second, 10, later, ttl).await.expect("reclaim"),
            vec![pending.id]
        );
        let stale = store
            .save_step_and_advance(commit(&pending, first, InstanceStatus::Running, later))
            .await;
        assert_eq!(stale, Err(StoreError::LeaseLost { instance: pending.id }));
    }

    #[tokio::test]
    async fn expired_lease_still_commits_until_reclaimed() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let pending = instance(now, None);
        store.create_instance(pending.clone()).await.expect("create");
        let worker = WorkerId::new();
        store
            .claim_ready(worker, 10, now, Duration::from_secs(30))
            .await
            .expect("claim");

        let later = after(now, Duration::from_secs(45));
        assert_eq!(store.lease_holder(pending.id, later).expect("holder"), None);
        store
            .save_step_and_advance(commit(&pending, worker, InstanceStatus::Running, later))
            .await
            .expect("nobody reclaimed the instance");
    }

    #[tokio::test]
    async fn renewal_extends_the_lease_and_fences_other_workers() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let pending = instance(now, None);
        store.create_instance(pending.clone()).await.expect("create");
        let ttl = Duration::from_secs(30);
        let first = WorkerId::new();
        let second = WorkerId::new();
        store.claim_ready(first, 10, now, ttl).await.expect("claim");

        let renewed_at = after(now, Duration::from_secs(20));
        store
            .renew_lease(pending.id, first, renewed_at, ttl)
            .await
            .expect("renew");
        let past_first_ttl = after(now, Duration::from_secs(40));
        assert!(
            store
                .claim_ready(second, 10, past_first_ttl, ttl)
                .await
                .expect("claim")
                .is_empty()
        );
        assert_eq!(
            store.lease_holder(pending.id, past_first_ttl).expect("holder"),
            Some(first)
        );
        assert_eq!(
            store.renew_lease(pending.id, second, past_first_ttl, ttl).await,
            Err(StoreError::LeaseLost { instance: pending.id })
        );

        let expired = after(now, Duration::from_secs(60));
        store.claim_ready(second, 10, expired, ttl).await.expect("reclaim");
        assert_eq!(
            store.renew_lease(pending.id, first, expired, ttl).await,
            Err(StoreError::LeaseLost { instance: pending.id })
        );
    }

    #[tokio::test]
    async fn terminal_instances_reject_writes() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let pending = instance(now, None);
        store.create_instance(pending.clone()).await.expect("create");
        let worker = WorkerId::new();
        store
            .claim_ready(worker, 1, now, Duration::from_secs(30))
            .await
            .expect("claim");
        store
            .save_step_and_advance(commit(&pending, worker, InstanceStatus::Succeeded, now))
            .await
            .expect("finish");

        let result = store
            .save_step_and_advance(commit(&pending, worker, InstanceStatus::Running, now))
            .await;
        assert_eq!(
            result,
            Err(StoreError::Terminal {
                instance: pending.id,
                status: InstanceStatus::Succeeded
            })
        );
        assert!(!store.cancel_instance(pending.id, "late", now).await.expect("cancel"));
    }

    #[tokio::test]
    async fn a_wait_is_resolved_at_most_once() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let mut waiting = instance(now, None);
        waiting.status = InstanceStatus::WaitingApproval;
        waiting.ready_at = None;
        store.create_instance(waiting.clone()).await.expect("create");
        store.put_wait(approval_wait(&waiting, now)).await.expect("wait");

        let signal = Signal {
            instance: waiting.id,
            step: StepId::from("approve"),
            resolution: WaitResolution::Approval {
                approved: true,
                decided_by: None,
                comment: None,
            },
        };
        assert!(store.deliver_signal(signal.clone(), now).await.expect("deliver"));
        assert!(!store.deliver_signal(signal, now).await.expect("redeliver"));

        let snapshot = store.load_instance(waiting.id).await.expect("load");
        assert_eq!(snapshot.inbox.len(), 1);
        assert_eq!(snapshot.instance.status, InstanceStatus::Running);
        assert_eq!(store.wait_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn mismatched_resolutions_leave_the_wait() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let waiting = instance(now, None);
        store.create_instance(waiting.clone()).await.expect("create");
        store.put_wait(approval_wait(&waiting, now)).await.expect("wait");

        let delivered = store
            .deliver_signal(
                Signal {
                    instance: waiting.id,
                    step: StepId::from("approve"),
                    resolution: WaitResolution::Event {
                        payload: json!({}),
                        event_id: None,
                    },
                },
                now,
            )
            .await
            .expect("deliver");
        assert!(!delivered);
        assert_eq!(store.wait_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn cancel_clears_waits() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let waiting = instance(now, None);
        store.create_instance(waiting.clone()).await.expect("create");
        store.put_wait(approval_wait(&waiting, now)).await.expect("wait");

        assert!(store.cancel_instance(waiting.id, "requested", now).await.expect("cancel"));
        assert_eq!(store.wait_count().expect("count"), 0);
        let snapshot = store.load_instance(waiting.id).await.expect("load");
        assert_eq!(snapshot.instance.status, InstanceStatus::Cancelled);
    }
}
