//! Step types for workflow definitions.
//!
//! A step is one node of a definition's DAG. Steps are keyed by a
//! [`StepId`] that is unique within the definition and discriminated by a
//! `kind` key in the document.

use crate::expression::Expression;
use crate::retry::RetrySpec;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::borrow::Borrow;
use std::fmt;

/// The identifier of a step within one definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a parallel step decides that its branches are done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Every branch must succeed; any failure fails the frame.
    #[default]
    All,
    /// The first branch to succeed wins and its siblings are cancelled.
    FirstSuccess,
}

impl JoinMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::FirstSuccess => "first_success",
        }
    }
}

/// A step that invokes a registered action handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    /// Registered action name, e.g. `shipment.update_status`.
    pub action: String,
    /// Static config with `{{ expr }}` placeholders.
    pub config: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<StepId>,
    /// When present and false, the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    /// Variable that receives the handler result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Ordered children run one after another, then `next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub children: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepId>,
}

/// A two-way branch on a boolean condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStep {
    pub condition: Expression,
    pub true_next: StepId,
    pub false_next: StepId,
}

/// A fork that runs each child as its own branch and meets at `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelStep {
    pub children: Vec<StepId>,
    pub join: StepId,
    #[serde(default)]
    pub mode: JoinMode,
}

/// Suspends until a matching domain event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitStep {
    pub event_kind: String,
    /// Predicate over the event payload (`$.`) and captured variables (`$vars`).
    #[serde(
        rename = "match",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub predicate: Option<Expression>,
    #[serde(
        default,
        alias = "timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_var: Option<String>,
}

/// Raises an approval request and routes on the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    /// Approver selector handed to the approval service.
    pub approver: JsonValue,
    #[serde(
        default,
        alias = "timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_seconds: Option<u64>,
    pub approved_next: StepId,
    pub rejected_next: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_var: Option<String>,
}

/// Suspends the thread for a fixed time, then continues at `next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayStep {
    pub seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<StepId>,
}

/// One step of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Action(ActionStep),
    Sequence(SequenceStep),
    Branch(BranchStep),
    Parallel(ParallelStep),
    WaitForEvent(WaitStep),
    Approval(ApprovalStep),
    Delay(DelayStep),
}

/// The label of an edge in the step graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Next,
    OnFailure,
    OnTimeout,
    True,
    False,
    Approved,
    Rejected,
    Child,
    Join,
}

impl EdgeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::OnFailure => "on_failure",
            Self::OnTimeout => "on_timeout",
            Self::True => "true_next",
            Self::False => "false_next",
            Self::Approved => "approved_next",
            Self::Rejected => "rejected_next",
            Self::Child => "children",
            Self::Join => "join",
        }
    }
}

impl StepSpec {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Action(_) => "action",
            Self::Sequence(_) => "sequence",
            Self::Branch(_) => "branch",
            Self::Parallel(_) => "parallel",
            Self::WaitForEvent(_) => "wait_for_event",
            Self::Approval(_) => "approval",
            Self::Delay(_) => "delay",
        }
    }

    /// The step's own `next` edge, where it has one.
    #[must_use]
    pub fn next(&self) -> Option<&StepId> {
        match self {
            Self::Action(step) => step.next.as_ref(),
            Self::Sequence(step) => step.next.as_ref(),
            Self::WaitForEvent(step) => step.next.as_ref(),
            Self::Delay(step) => step.next.as_ref(),
            Self::Branch(_) | Self::Parallel(_) | Self::Approval(_) => None,
        }
    }

    #[must_use]
    pub fn on_timeout(&self) -> Option<&StepId> {
        match self {
            Self::Action(step) => step.on_timeout.as_ref(),
            Self::WaitForEvent(step) => step.on_timeout.as_ref(),
            Self::Approval(step) => step.on_timeout.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn result_var(&self) -> Option<&str> {
        match self {
            Self::Action(step) => step.result_var.as_deref(),
            Self::WaitForEvent(step) => step.result_var.as_deref(),
            Self::Approval(step) => step.result_var.as_deref(),
            _ => None,
        }
    }

    /// Every outgoing edge declared on the step.
    #[must_use]
    pub fn edges(&self) -> Vec<(EdgeKind, &StepId)> {
        let declared: Vec<(EdgeKind, Option<&StepId>)> = match self {
            Self::Action(step) => vec![
                (EdgeKind::Next, step.next.as_ref()),
                (EdgeKind::OnFailure, step.on_failure.as_ref()),
                (EdgeKind::OnTimeout, step.on_timeout.as_ref()),
            ],
            Self::Sequence(step) => step
                .children
                .iter()
                .map(|child| (EdgeKind::Child, Some(child)))
                .chain([(EdgeKind::Next, step.next.as_ref())])
                .collect(),
            Self::Branch(step) => vec![
                (EdgeKind::True, Some(&step.true_next)),
                (EdgeKind::False, Some(&step.false_next)),
            ],
            Self::Parallel(step) => step
                .children
                .iter()
                .map(|child| (EdgeKind::Child, Some(child)))
                .chain([(EdgeKind::Join, Some(&step.join))])
                .collect(),
            Self::WaitForEvent(step) => vec![
                (EdgeKind::Next, step.next.as_ref()),
                (EdgeKind::OnTimeout, step.on_timeout.as_ref()),
            ],
            Self::Approval(step) => vec![
                (EdgeKind::Approved, Some(&step.approved_next)),
                (EdgeKind::Rejected, Some(&step.rejected_next)),
                (EdgeKind::OnTimeout, step.on_timeout.as_ref()),
            ],
            Self::Delay(step) => vec![(EdgeKind::Next, step.next.as_ref())],
        };
        declared
            .into_iter()
            .filter_map(|(kind, target)| target.map(|target| (kind, target)))
            .collect()
    }
}
