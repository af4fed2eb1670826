//! Postgres-backed state store.
//!
//! Instances are claimed with `FOR UPDATE SKIP LOCKED`, so any number of
//! engine processes can poll the same tables. Every multi-row change runs in
//! one transaction that first locks the instance row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::{
    BusinessUnitId, CorrelationId, DefinitionId, EventId, InstanceId, OrganizationId, TenantScope,
    UserId, WorkerId, after,
};
use haulflow_workflow::store::{Created, InstanceSnapshot, StepCommit};
use haulflow_workflow::wait::SignalDelivery;
use haulflow_workflow::{
    InstanceStatus, PendingWait, Signal, StateStore, StepId, StepRecord, StoreError, WaitKind,
    WorkflowInstance,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

const TERMINAL: &str = "('succeeded', 'failed', 'cancelled', 'timed_out')";

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        reason: e.to_string(),
    }
}

fn corrupt(what: &str, e: impl fmt::Display) -> StoreError {
    StoreError::Corrupt {
        reason: format!("invalid {what}: {e}"),
    }
}

fn parse<T>(what: &str, value: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    T::from_str(value).map_err(|e| corrupt(what, format!("'{value}': {e}")))
}

fn to_json<T: Serialize>(what: &str, value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| corrupt(what, e))
}

fn from_json<T: DeserializeOwned>(what: &str, value: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| corrupt(what, e))
}

fn tenant_of(organization: &str, business_unit: &str) -> Result<TenantScope, StoreError> {
    Ok(TenantScope::new(
        parse::<OrganizationId>("organization id", organization)?,
        parse::<BusinessUnitId>("business unit id", business_unit)?,
    ))
}

fn seq_of(seq: i64) -> Result<u64, StoreError> {
    u64::try_from(seq).map_err(|e| corrupt("sequence", e))
}

#[derive(FromRow)]
struct InstanceRow {
    id: String,
    definition_id: String,
    version: i32,
    organization_id: String,
    business_unit_id: String,
    status: String,
    variables: JsonValue,
    cursor: JsonValue,
    trigger_payload: JsonValue,
    correlation_id: String,
    trigger_event: Option<String>,
    started_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    ready_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl InstanceRow {
    fn try_into_instance(self) -> Result<WorkflowInstance, StoreError> {
        Ok(WorkflowInstance {
            id: parse::<InstanceId>("instance id", &self.id)?,
            definition: parse::<DefinitionId>("definition id", &self.definition_id)?,
            version: u32::try_from(self.version).map_err(|e| corrupt("version", e))?,
            tenant: tenant_of(&self.organization_id, &self.business_unit_id)?,
            status: parse::<InstanceStatus>("status", &self.status)?,
            variables: self.variables,
            cursor: from_json("cursor", self.cursor)?,
            trigger: self.trigger_payload,
            correlation_id: parse::<CorrelationId>("correlation id", &self.correlation_id)?,
            trigger_event: self
                .trigger_event
                .as_deref()
                .map(|id| parse::<EventId>("event id", id))
                .transpose()?,
            started_by: self
                .started_by
                .as_deref()
                .map(|id| parse::<UserId>("user id", id))
                .transpose()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deadline: self.deadline,
            ready_at: self.ready_at,
            error: self.error,
        })
    }
}

#[derive(FromRow)]
struct WaitRow {
    instance_id: String,
    step_id: String,
    organization_id: String,
    business_unit_id: String,
    match_key: String,
    matcher: JsonValue,
    created_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
}

impl WaitRow {
    fn try_into_wait(self) -> Result<PendingWait, StoreError> {
        Ok(PendingWait {
            instance: parse::<InstanceId>("instance id", &self.instance_id)?,
            tenant: tenant_of(&self.organization_id, &self.business_unit_id)?,
            step: StepId::from(self.step_id),
            matcher: from_json("wait matcher", self.matcher)?,
            match_key: self.match_key,
            created_at: self.created_at,
            deadline: self.deadline,
        })
    }
}

#[derive(FromRow)]
struct RecordRow {
    seq: i64,
    instance_id: String,
    step_id: String,
    attempt: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: String,
    result: Option<JsonValue>,
    error: Option<JsonValue>,
}

impl RecordRow {
    fn try_into_record(self) -> Result<StepRecord, StoreError> {
        Ok(StepRecord {
            instance: parse::<InstanceId>("instance id", &self.instance_id)?,
            seq: seq_of(self.seq)?,
            step: StepId::from(self.step_id),
            attempt: u32::try_from(self.attempt).map_err(|e| corrupt("attempt", e))?,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: parse("outcome", &self.outcome)?,
            result: self.result,
            error: self
                .error
                .map(|error| from_json("handler error", error))
                .transpose()?,
        })
    }
}

#[derive(FromRow)]
struct InboxRow {
    seq: i64,
    instance_id: String,
    step_id: String,
    resolution: JsonValue,
    matcher: JsonValue,
    delivered_at: DateTime<Utc>,
}

impl InboxRow {
    fn try_into_delivery(self) -> Result<SignalDelivery, StoreError> {
        Ok(SignalDelivery {
            seq: seq_of(self.seq)?,
            instance: parse::<InstanceId>("instance id", &self.instance_id)?,
            step: StepId::from(self.step_id),
            resolution: from_json("resolution", self.resolution)?,
            matcher: from_json("wait matcher", self.matcher)?,
            delivered_at: self.delivered_at,
        })
    }
}

async fn upsert_wait(conn: &mut PgConnection, wait: &PendingWait) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_waits
            (instance_id, step_id, organization_id, business_unit_id, kind, match_key,
             matcher, created_at, deadline)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (instance_id, step_id) DO UPDATE
        SET kind = EXCLUDED.kind, match_key = EXCLUDED.match_key, matcher = EXCLUDED.matcher,
            created_at = EXCLUDED.created_at, deadline = EXCLUDED.deadline
        "#,
    )
    .bind(wait.instance.to_string())
    .bind(wait.step.as_str())
    .bind(wait.tenant.organization.to_string())
    .bind(wait.tenant.business_unit.to_string())
    .bind(wait.kind().as_str())
    .bind(&wait.match_key)
    .bind(to_json("wait matcher", &wait.matcher)?)
    .bind(wait.created_at)
    .bind(wait.deadline)
    .execute(conn)
    .await
    .map_err(unavailable)?;
    Ok(())
}

/// Locks a live instance row leased to `worker` and returns its status.
///
/// The lease is matched by holder only. An expired lease stays with its
/// worker until a claim hands it to another.
async fn lock_held(
    conn: &mut PgConnection,
    instance: InstanceId,
    worker: WorkerId,
) -> Result<InstanceStatus, StoreError> {
    let locked: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT status, lease_worker FROM workflow_instances WHERE id = $1 FOR UPDATE",
    )
    .bind(instance.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(unavailable)?;
    let Some((status, lease_worker)) = locked else {
        return Err(StoreError::InstanceNotFound { instance });
    };
    let status = parse::<InstanceStatus>("status", &status)?;
    if status.is_terminal() {
        return Err(StoreError::Terminal { instance, status });
    }
    if lease_worker.as_deref() != Some(worker.to_string().as_str()) {
        return Err(StoreError::LeaseLost { instance });
    }
    Ok(status)
}

async fn clear_pending(conn: &mut PgConnection, instance: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM workflow_waits WHERE instance_id = $1")
        .bind(instance)
        .execute(&mut *conn)
        .await
        .map_err(unavailable)?;
    sqlx::query("DELETE FROM workflow_signal_inbox WHERE instance_id = $1")
        .bind(instance)
        .execute(&mut *conn)
        .await
        .map_err(unavailable)?;
    Ok(())
}

/// A [`StateStore`] over the `workflow_*` tables.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_instance(&self, instance: WorkflowInstance) -> Result<Created, StoreError> {
        let inserted: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO workflow_instances
                (id, definition_id, version, organization_id, business_unit_id, status,
                 variables, cursor, trigger_payload, correlation_id, trigger_event, started_by,
                 created_at, updated_at, deadline, ready_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (definition_id, trigger_event) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(instance.id.to_string())
        .bind(instance.definition.to_string())
        .bind(i32::try_from(instance.version).map_err(|e| corrupt("version", e))?)
        .bind(instance.tenant.organization.to_string())
        .bind(instance.tenant.business_unit.to_string())
        .bind(instance.status.as_str())
        .bind(&instance.variables)
        .bind(to_json("cursor", &instance.cursor)?)
        .bind(&instance.trigger)
        .bind(instance.correlation_id.to_string())
        .bind(instance.trigger_event.map(|id| id.to_string()))
        .bind(instance.started_by.map(|id| id.to_string()))
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(instance.deadline)
        .bind(instance.ready_at)
        .bind(&instance.error)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        if inserted.is_some() {
            return Ok(Created::New(instance.id));
        }
        let (existing,): (String,) = sqlx::query_as(
            "SELECT id FROM workflow_instances WHERE definition_id = $1 AND trigger_event = $2",
        )
        .bind(instance.definition.to_string())
        .bind(instance.trigger_event.map(|id| id.to_string()))
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(Created::Duplicate(parse("instance id", &existing)?))
    }

    async fn load_instance(&self, instance: InstanceId) -> Result<InstanceSnapshot, StoreError> {
        let row: Option<InstanceRow> = sqlx::query_as(
            r#"
            SELECT id, definition_id, version, organization_id, business_unit_id, status,
                   variables, cursor, trigger_payload, correlation_id, trigger_event, started_by,
                   created_at, updated_at, deadline, ready_at, error
            FROM workflow_instances
            WHERE id = $1
            "#,
        )
        .bind(instance.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        let found = row
            .ok_or(StoreError::InstanceNotFound { instance })?
            .try_into_instance()?;

        let inbox: Vec<InboxRow> = sqlx::query_as(
            r#"
            SELECT seq, instance_id, step_id, resolution, matcher, delivered_at
            FROM workflow_signal_inbox
            WHERE instance_id = $1
            ORDER BY seq
            "#,
        )
        .bind(instance.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(InstanceSnapshot {
            instance: found,
            inbox: inbox
                .into_iter()
                .map(InboxRow::try_into_delivery)
                .collect::<Result<_, _>>()?,
        })
    }

    #[instrument(skip(self, commit), fields(instance = %commit.instance, status = %commit.status))]
    async fn save_step_and_advance(&self, commit: StepCommit) -> Result<(), StoreError> {
        let id = commit.instance.to_string();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let current = lock_held(&mut *tx, commit.instance, commit.worker).await?;
        if current != commit.status && !current.can_transition_to(commit.status) {
            return Err(StoreError::Corrupt {
                reason: format!("illegal transition {current} -> {}", commit.status),
            });
        }

        for record in &commit.records {
            sqlx::query(
                r#"
                INSERT INTO workflow_step_records
                    (instance_id, step_id, attempt, started_at, finished_at, outcome, result, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&id)
            .bind(record.step.as_str())
            .bind(i32::try_from(record.attempt).map_err(|e| corrupt("attempt", e))?)
            .bind(record.started_at)
            .bind(record.finished_at)
            .bind(record.outcome.as_str())
            .bind(&record.result)
            .bind(
                record
                    .error
                    .as_ref()
                    .map(|error| to_json("handler error", error))
                    .transpose()?,
            )
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        }

        for step in &commit.take_waits {
            sqlx::query("DELETE FROM workflow_waits WHERE instance_id = $1 AND step_id = $2")
                .bind(&id)
                .bind(step.as_str())
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }
        for wait in &commit.put_waits {
            upsert_wait(&mut *tx, wait).await?;
        }
        if let Some(seq) = commit.ack_signal {
            sqlx::query("DELETE FROM workflow_signal_inbox WHERE instance_id = $1 AND seq = $2")
                .bind(&id)
                .bind(i64::try_from(seq).map_err(|e| corrupt("sequence", e))?)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET cursor = $2, variables = $3, status = $4, ready_at = $5, error = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&id)
        .bind(to_json("cursor", &commit.cursor)?)
        .bind(&commit.variables)
        .bind(commit.status.as_str())
        .bind(commit.ready_at)
        .bind(&commit.error)
        .bind(commit.now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        if commit.status.is_terminal() {
            clear_pending(&mut *tx, &id).await?;
        }
        tx.commit().await.map_err(unavailable)
    }

    async fn claim_ready(
        &self,
        worker: WorkerId,
        limit: usize,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<InstanceId>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let claimed: Vec<(String,)> = sqlx::query_as(&format!(
            r#"
            WITH due AS (
                SELECT i.id
                FROM workflow_instances i
                WHERE i.status NOT IN {TERMINAL}
                  AND (i.lease_expires_at IS NULL OR i.lease_expires_at <= $1)
                  AND ((i.status IN ('pending', 'running') AND i.ready_at <= $1)
                       OR EXISTS (SELECT 1 FROM workflow_signal_inbox s WHERE s.instance_id = i.id))
                ORDER BY i.ready_at NULLS LAST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_instances w
            SET lease_worker = $3, lease_expires_at = $4
            FROM due
            WHERE w.id = due.id
            RETURNING w.id
            "#
        ))
        .bind(now)
        .bind(limit)
        .bind(worker.to_string())
        .bind(after(now, ttl))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        if !claimed.is_empty() {
            debug!(%worker, claimed = claimed.len(), "claimed instances");
        }
        claimed
            .into_iter()
            .map(|(id,)| parse("instance id", &id))
            .collect()
    }

    async fn renew_lease(
        &self,
        instance: InstanceId,
        worker: WorkerId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        lock_held(&mut *tx, instance, worker).await?;
        sqlx::query("UPDATE workflow_instances SET lease_expires_at = $2 WHERE id = $1")
            .bind(instance.to_string())
            .bind(after(now, ttl))
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)
    }

    async fn release(&self, instance: InstanceId, worker: WorkerId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET lease_worker = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_worker = $2
            "#,
        )
        .bind(instance.to_string())
        .bind(worker.to_string())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn put_wait(&self, wait: PendingWait) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        upsert_wait(&mut *conn, &wait).await
    }

    async fn take_wait(
        &self,
        instance: InstanceId,
        step: &StepId,
    ) -> Result<Option<PendingWait>, StoreError> {
        let row: Option<WaitRow> = sqlx::query_as(
            r#"
            DELETE FROM workflow_waits
            WHERE instance_id = $1 AND step_id = $2
            RETURNING instance_id, step_id, organization_id, business_unit_id, match_key,
                      matcher, created_at, deadline
            "#,
        )
        .bind(instance.to_string())
        .bind(step.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.map(WaitRow::try_into_wait).transpose()
    }

    async fn find_waits_by_match(
        &self,
        kind: WaitKind,
        match_key: &str,
    ) -> Result<Vec<PendingWait>, StoreError> {
        let rows: Vec<WaitRow> = sqlx::query_as(
            r#"
            SELECT instance_id, step_id, organization_id, business_unit_id, match_key,
                   matcher, created_at, deadline
            FROM workflow_waits
            WHERE kind = $1 AND match_key = $2
            ORDER BY created_at
            "#,
        )
        .bind(kind.as_str())
        .bind(match_key)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(WaitRow::try_into_wait).collect()
    }

    async fn due_waits(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingWait>, StoreError> {
        let rows: Vec<WaitRow> = sqlx::query_as(
            r#"
            SELECT instance_id, step_id, organization_id, business_unit_id, match_key,
                   matcher, created_at, deadline
            FROM workflow_waits
            WHERE deadline <= $1
            ORDER BY deadline
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(WaitRow::try_into_wait).collect()
    }

    #[instrument(skip(self, signal), fields(instance = %signal.instance, step = %signal.step))]
    async fn deliver_signal(
        &self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let instance = signal.instance.to_string();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let wait: Option<(String, JsonValue)> = sqlx::query_as(
            "SELECT kind, matcher FROM workflow_waits WHERE instance_id = $1 AND step_id = $2 FOR UPDATE",
        )
        .bind(&instance)
        .bind(signal.step.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;
        let Some((kind, matcher)) = wait else {
            return Ok(false);
        };
        if !signal.resolution.fits(parse::<WaitKind>("wait kind", &kind)?) {
            return Ok(false);
        }

        sqlx::query("DELETE FROM workflow_waits WHERE instance_id = $1 AND step_id = $2")
            .bind(&instance)
            .bind(signal.step.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_signal_inbox (instance_id, step_id, resolution, matcher, delivered_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&instance)
        .bind(signal.step.as_str())
        .bind(to_json("resolution", &signal.resolution)?)
        .bind(matcher)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        sqlx::query(
            "UPDATE workflow_instances SET status = 'running', ready_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(&instance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(true)
    }

    async fn step_records(&self, instance: InstanceId) -> Result<Vec<StepRecord>, StoreError> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT seq, instance_id, step_id, attempt, started_at, finished_at, outcome, result, error
            FROM workflow_step_records
            WHERE instance_id = $1
            ORDER BY started_at, seq
            "#,
        )
        .bind(instance.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.into_iter().map(RecordRow::try_into_record).collect()
    }

    async fn cancel_instance(
        &self,
        instance: InstanceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = instance.to_string();
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM workflow_instances WHERE id = $1 FOR UPDATE")
                .bind(&id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        let Some((status,)) = status else {
            return Err(StoreError::InstanceNotFound { instance });
        };
        if parse::<InstanceStatus>("status", &status)?.is_terminal() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = 'cancelled', error = $2, ready_at = NULL, updated_at = $3,
                lease_worker = NULL, lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(&id)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        clear_pending(&mut *tx, &id).await?;
        tx.commit().await.map_err(unavailable)?;
        Ok(true)
    }

    async fn is_event_processed(&self, event: EventId) -> Result<bool, StoreError> {
        let (processed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM workflow_processed_events WHERE event_id = $1)",
        )
        .bind(event.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(processed)
    }

    async fn mark_event_processed(
        &self,
        event: EventId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_processed_events (event_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}
