//! Workflow instances and their lifecycle.
//!
//! The status state machine is
//! `Pending → Running ⇄ {WaitingEvent, WaitingApproval} → terminal`, where the
//! terminal statuses are Succeeded, Failed, Cancelled and TimedOut. Terminal
//! transitions are one-way.

use crate::cursor::Cursor;
use crate::definition::WorkflowDefinition;
use chrono::{DateTime, Utc};
use haulflow_core::{CorrelationId, DefinitionId, EventId, InstanceId, TenantScope, UserId, after};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// The overall state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created by a trigger, not yet advanced.
    Pending,
    /// At least one thread can run.
    Running,
    /// Suspended until a matching event arrives.
    WaitingEvent,
    /// Suspended until an approval decision arrives.
    WaitingApproval,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl InstanceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingEvent => "waiting_event",
            Self::WaitingApproval => "waiting_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingEvent | Self::WaitingApproval)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && !matches!(next, Self::Pending)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Pending,
            Self::Running,
            Self::WaitingEvent,
            Self::WaitingApproval,
            Self::Succeeded,
            Self::Failed,
            Self::Cancelled,
            Self::TimedOut,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| format!("unknown instance status '{s}'"))
    }
}

/// What starts an instance: a trigger match or an explicit request.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub definition: DefinitionId,
    pub tenant: TenantScope,
    pub payload: JsonValue,
    /// The triggering event; instances are unique per (definition, event).
    pub event: Option<EventId>,
    pub started_by: Option<UserId>,
    pub correlation_id: Option<CorrelationId>,
}

impl StartRequest {
    #[must_use]
    pub fn new(definition: DefinitionId, tenant: TenantScope, payload: JsonValue) -> Self {
        Self {
            definition,
            tenant,
            payload,
            event: None,
            started_by: None,
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: EventId) -> Self {
        self.event = Some(event);
        self
    }

    #[must_use]
    pub fn with_started_by(mut self, user: UserId) -> Self {
        self.started_by = Some(user);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A live execution of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub definition: DefinitionId,
    /// The definition version the instance is pinned to.
    pub version: u32,
    pub tenant: TenantScope,
    pub status: InstanceStatus,
    /// Root variable bag. Always a JSON object.
    pub variables: JsonValue,
    pub cursor: Cursor,
    /// The payload the instance was started with.
    pub trigger: JsonValue,
    pub correlation_id: CorrelationId,
    pub trigger_event: Option<EventId>,
    pub started_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The instance times out once this passes.
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest time any thread may run; `None` while nothing is runnable.
    pub ready_at: Option<DateTime<Utc>>,
    /// Why the instance failed, timed out or was cancelled.
    pub error: Option<String>,
}

impl WorkflowInstance {
    /// Creates a pending instance positioned at the definition's entry step.
    #[must_use]
    pub fn start(definition: &WorkflowDefinition, request: StartRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::new(),
            definition: definition.id,
            version: definition.version(),
            tenant: request.tenant,
            status: InstanceStatus::Pending,
            variables: JsonValue::Object(Map::new()),
            cursor: Cursor::start(definition.entry().clone()),
            trigger: request.payload,
            correlation_id: request.correlation_id.unwrap_or_default(),
            trigger_event: request.event,
            started_by: request.started_by,
            created_at: now,
            updated_at: now,
            deadline: definition.instance_timeout().map(|t| after(now, t)),
            ready_at: Some(now),
            error: None,
        }
    }

    /// True once the instance deadline has passed.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}
