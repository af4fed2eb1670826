//! Workflow definition types.
//!
//! A definition is a named, versioned, tenant-scoped automation consisting of:
//! - A trigger (event kind plus optional predicate)
//! - An entry step and a map of steps forming a DAG
//! - Optional retry and timeout defaults
//!
//! Definitions are immutable once published. They are built only through
//! [`parse_definition`](crate::parser::parse_definition), which checks every
//! invariant the runtime relies on.

use crate::expression::Expression;
use crate::graph;
use crate::retry::{RetryPolicy, RetrySpec};
use crate::step::{ActionStep, StepId, StepSpec};
use haulflow_core::{DefinitionId, TenantScope};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// The event that starts new instances of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Domain event kind, e.g. `shipment.created`.
    pub event_kind: String,
    /// Predicate over the event payload.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<Expression>,
}

/// Default timeouts for a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeoutSpec {
    /// Handler deadline for action steps without their own `timeout_seconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_seconds: Option<u64>,
    /// Deadline for the whole instance, counted from its creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_seconds: Option<u64>,
}

/// The declarative document a definition is parsed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionDocument {
    pub name: String,
    pub version: u32,
    pub trigger: TriggerSpec,
    pub entry: StepId,
    pub steps: BTreeMap<StepId, StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSpec>,
}

/// A validated, published workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub tenant: TenantScope,
    document: DefinitionDocument,
    /// Sequence children mapped to the step that follows them.
    continuations: BTreeMap<StepId, StepId>,
}

impl WorkflowDefinition {
    pub(crate) fn from_document(
        id: DefinitionId,
        tenant: TenantScope,
        document: DefinitionDocument,
    ) -> Self {
        let continuations = graph::continuations(&document.steps);
        Self {
            id,
            tenant,
            document,
            continuations,
        }
    }

    #[must_use]
    pub fn document(&self) -> &DefinitionDocument {
        &self.document
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.document.name
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.document.version
    }

    #[must_use]
    pub fn trigger(&self) -> &TriggerSpec {
        &self.document.trigger
    }

    #[must_use]
    pub fn entry(&self) -> &StepId {
        &self.document.entry
    }

    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&StepSpec> {
        self.document.steps.get(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = (&StepId, &StepSpec)> {
        self.document.steps.iter()
    }

    /// The step that runs after `id` succeeds, if any.
    ///
    /// This is the step's own `next`, or for a sequence child without one,
    /// the following child (or the sequence's `next`).
    #[must_use]
    pub fn successor(&self, id: &StepId) -> Option<&StepId> {
        self.step(id)
            .and_then(StepSpec::next)
            .or_else(|| self.continuations.get(id))
    }

    /// Retry policy for an action step.
    #[must_use]
    pub fn retry_policy(&self, step: &ActionStep) -> RetryPolicy {
        RetryPolicy::resolve(self.document.retry.as_ref(), step.retry.as_ref())
    }

    /// Handler timeout for an action step.
    #[must_use]
    pub fn step_timeout(&self, step: &ActionStep) -> Duration {
        step.timeout_seconds
            .map_or_else(|| self.default_step_timeout(), Duration::from_secs)
    }

    /// Handler timeout for steps without their own.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        self.document
            .timeout
            .and_then(|t| t.step_seconds)
            .map_or(DEFAULT_STEP_TIMEOUT, Duration::from_secs)
    }

    #[must_use]
    pub fn instance_timeout(&self) -> Option<Duration> {
        self.document
            .timeout
            .and_then(|t| t.instance_seconds)
            .map(Duration::from_secs)
    }

    /// Serializes the definition back to its document form.
    ///
    /// # Errors
    ///
    /// Returns the serializer error, which only occurs for non-finite retry numbers.
    pub fn to_document(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(&self.document)
    }
}
