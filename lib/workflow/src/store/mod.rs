//! Durable workflow state.
//!
//! The store owns instances, step records, pending waits, the signal inbox,
//! leases and processed-event markers. [`StateStore::save_step_and_advance`]
//! is the one transactional boundary the runtime relies on: a step's records,
//! the new cursor, variables and status, wait changes and the inbox
//! acknowledgement are persisted together or not at all.

mod memory;

pub use memory::MemoryStateStore;

use crate::cursor::Cursor;
use crate::error::StoreError;
use crate::instance::{InstanceStatus, WorkflowInstance};
use crate::record::StepRecord;
use crate::step::StepId;
use crate::wait::{PendingWait, Signal, SignalDelivery, WaitKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::{EventId, InstanceId, WorkerId};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Result of [`StateStore::create_instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New(InstanceId),
    /// An instance already exists for the same (definition, event).
    Duplicate(InstanceId),
}

impl Created {
    #[must_use]
    pub const fn instance(self) -> InstanceId {
        match self {
            Self::New(id) | Self::Duplicate(id) => id,
        }
    }
}

/// An instance together with its undelivered inbox entries.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    /// Resolved waits not yet applied, oldest first.
    pub inbox: Vec<SignalDelivery>,
}

/// Everything one atomic advance writes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommit {
    pub instance: InstanceId,
    /// Must hold the instance lease.
    pub worker: WorkerId,
    /// Appended in order; the store assigns sequence numbers.
    pub records: Vec<StepRecord>,
    pub cursor: Cursor,
    pub variables: JsonValue,
    pub status: InstanceStatus,
    pub ready_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub put_waits: Vec<PendingWait>,
    pub take_waits: Vec<StepId>,
    /// Inbox entry consumed by this commit.
    pub ack_signal: Option<u64>,
    pub now: DateTime<Utc>,
}

/// Persistence for the workflow runtime.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists a new instance.
    ///
    /// Idempotent on (definition, triggering event): a second call for the
    /// same pair returns the existing instance as `Duplicate`.
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<Created, StoreError>;

    /// Loads an instance with its undelivered signals.
    async fn load_instance(&self, instance: InstanceId) -> Result<InstanceSnapshot, StoreError>;

    /// Atomically applies one step's outcome.
    ///
    /// Rejected with `LeaseLost` unless `commit.worker` holds the lease, and
    /// with `Terminal` once the instance has finished. A lease past its
    /// expiry still belongs to its worker until another worker claims the
    /// instance. A terminal status
    /// clears the instance's waits and inbox.
    async fn save_step_and_advance(&self, commit: StepCommit) -> Result<(), StoreError>;

    /// Leases up to `limit` instances that have work due at `now`.
    ///
    /// An instance is due when it is non-terminal, not leased (or its lease
    /// expired), and either runnable with `ready_at <= now` or holding
    /// undelivered signals.
    async fn claim_ready(
        &self,
        worker: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<InstanceId>, StoreError>;

    /// Extends `worker`'s lease on `instance` to `now + ttl`.
    ///
    /// Fails with `LeaseLost` once another worker holds the lease, and with
    /// `Terminal` once the instance has finished.
    async fn renew_lease(
        &self,
        instance: InstanceId,
        worker: WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Gives up a lease. A no-op if `worker` no longer holds it.
    async fn release(&self, instance: InstanceId, worker: WorkerId) -> Result<(), StoreError>;

    /// Registers a wait, replacing any wait for the same (instance, step).
    async fn put_wait(&self, wait: PendingWait) -> Result<(), StoreError>;

    /// Removes and returns the wait for (instance, step).
    async fn take_wait(
        &self,
        instance: InstanceId,
        step: &StepId,
    ) -> Result<Option<PendingWait>, StoreError>;

    /// Waits of `kind` registered under `match_key`.
    async fn find_waits_by_match(
        &self,
        kind: WaitKind,
        match_key: &str,
    ) -> Result<Vec<PendingWait>, StoreError>;

    /// Waits whose deadline is at or before `now`, earliest first.
    async fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingWait>, StoreError>;

    /// Resolves a wait.
    ///
    /// Atomically removes the wait, appends a delivery to the inbox and marks
    /// the instance runnable. Returns false, changing nothing, when no wait
    /// of a kind the resolution fits exists for (instance, step).
    async fn deliver_signal(&self, signal: Signal, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// Step records ordered by start time, then sequence.
    async fn step_records(&self, instance: InstanceId) -> Result<Vec<StepRecord>, StoreError>;

    /// Marks an instance Cancelled and clears its waits and inbox.
    ///
    /// Returns false if the instance had already finished.
    async fn cancel_instance(
        &self,
        instance: InstanceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn is_event_processed(&self, event: EventId) -> Result<bool, StoreError>;

    async fn mark_event_processed(
        &self,
        event: EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
