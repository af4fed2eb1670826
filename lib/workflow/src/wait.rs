//! Pending waits and the signals that resolve them.
//!
//! A wait is written in the same commit that suspends a thread. Resolving it
//! is a two-part hand-off: the store atomically removes the wait and appends a
//! [`SignalDelivery`] to the instance's inbox, and the next worker holding
//! the instance lease applies the delivery.

use crate::expression::Expression;
use crate::step::StepId;
use chrono::{DateTime, Utc};
use haulflow_core::{ApprovalRequestId, EventId, InstanceId, TenantScope, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Event,
    Approval,
    /// A deadline with nothing external to match.
    Timer,
}

impl WaitKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Approval => "approval",
            Self::Timer => "timer",
        }
    }
}

impl fmt::Display for WaitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WaitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(Self::Event),
            "approval" => Ok(Self::Approval),
            "timer" => Ok(Self::Timer),
            other => Err(format!("unknown wait kind '{other}'")),
        }
    }
}

/// What a wait is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitMatch {
    Event {
        event_kind: String,
        predicate: Option<Expression>,
        /// Variables captured at suspension, visible to the predicate as `$vars`.
        bindings: JsonValue,
    },
    Approval {
        request_id: ApprovalRequestId,
        approver: JsonValue,
    },
    Timer,
}

impl WaitMatch {
    #[must_use]
    pub const fn kind(&self) -> WaitKind {
        match self {
            Self::Event { .. } => WaitKind::Event,
            Self::Approval { .. } => WaitKind::Approval,
            Self::Timer => WaitKind::Timer,
        }
    }
}

/// Index key under which event waits are found: `org:bu:kind`.
#[must_use]
pub fn event_match_key(tenant: &TenantScope, event_kind: &str) -> String {
    format!("{tenant}:{event_kind}")
}

/// Index key for approval waits.
#[must_use]
pub fn approval_match_key(request_id: ApprovalRequestId) -> String {
    format!("approval:{request_id}")
}

/// Index key for the timer wait of a delay step.
#[must_use]
pub fn timer_match_key(instance: InstanceId, step: &StepId) -> String {
    format!("timer:{instance}:{step}")
}

/// A suspended step awaiting a signal. At most one per (instance, step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWait {
    pub instance: InstanceId,
    pub tenant: TenantScope,
    pub step: StepId,
    pub matcher: WaitMatch,
    pub match_key: String,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl PendingWait {
    #[must_use]
    pub fn kind(&self) -> WaitKind {
        self.matcher.kind()
    }
}

/// How a wait was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitResolution {
    Event {
        payload: JsonValue,
        event_id: Option<EventId>,
    },
    Approval {
        approved: bool,
        decided_by: Option<UserId>,
        comment: Option<String>,
    },
    Timeout,
}

impl WaitResolution {
    /// Whether this resolution may resolve a wait of `kind`.
    ///
    /// A timeout resolves any wait.
    #[must_use]
    pub fn fits(&self, kind: WaitKind) -> bool {
        match self {
            Self::Event { .. } => kind == WaitKind::Event,
            Self::Approval { .. } => kind == WaitKind::Approval,
            Self::Timeout => true,
        }
    }
}

/// A request to resolve the wait of (instance, step).
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub instance: InstanceId,
    pub step: StepId,
    pub resolution: WaitResolution,
}

/// An inbox entry produced when a wait was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDelivery {
    /// Store-assigned, increasing per store.
    pub seq: u64,
    pub instance: InstanceId,
    pub step: StepId,
    pub resolution: WaitResolution,
    /// The match descriptor of the wait that was resolved.
    pub matcher: WaitMatch,
    pub delivered_at: DateTime<Utc>,
}
