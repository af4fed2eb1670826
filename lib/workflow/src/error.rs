//! Error types for the workflow crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `DefinitionError`: one problem found while parsing a definition document
//! - `RegistryError`: action registration and lookup failures
//! - `StoreError`: state store failures, including lease and terminal-state refusals
//! - `EngineError`: high-level engine operations (wrapped in a `Report`)

use crate::instance::InstanceStatus;
use crate::step::StepId;
use haulflow_core::{DefinitionId, InstanceId};
use std::fmt;

/// A single problem in a definition document.
///
/// The parser collects every problem it finds, so a rejected document comes
/// back with the full list rather than the first error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A required key is absent.
    MissingKey { path: String, key: &'static str },
    /// A key is present but not allowed for this object.
    UnknownKey { path: String, key: String },
    /// A value has the wrong JSON type or shape.
    InvalidValue { path: String, reason: String },
    /// An expression failed to parse or type-check.
    Expression { path: String, message: String },
    /// A step names an action that is not registered.
    UnknownAction { step: StepId, action: String },
    /// An action step's config does not satisfy the action's schema.
    Config { step: StepId, message: String },
    /// The entry step does not exist.
    EntryMissing { entry: StepId },
    /// An edge points at a step that does not exist.
    MissingStep { from: StepId, to: StepId },
    /// The step graph has a cycle through this step.
    Cycle { step: StepId },
    /// The step cannot be reached from the entry step.
    Unreachable { step: StepId },
    /// A parallel or sequence step lists no children.
    EmptyChildren { step: StepId },
    /// A branch of a parallel step can finish without reaching the join.
    BranchNeverJoins { fork: StepId, child: StepId },
    /// A step is reachable from two branches of the same parallel step.
    SharedBranchStep { fork: StepId, step: StepId },
    /// A sequence child is malformed.
    SequenceChild {
        sequence: StepId,
        child: StepId,
        reason: String,
    },
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey { path, key } => write!(f, "{path}: missing required key '{key}'"),
            Self::UnknownKey { path, key } => write!(f, "{path}: unknown key '{key}'"),
            Self::InvalidValue { path, reason } => write!(f, "{path}: {reason}"),
            Self::Expression { path, message } => write!(f, "{path}: {message}"),
            Self::UnknownAction { step, action } => {
                write!(f, "step '{step}': unknown action '{action}'")
            }
            Self::Config { step, message } => write!(f, "step '{step}': {message}"),
            Self::EntryMissing { entry } => write!(f, "entry step '{entry}' does not exist"),
            Self::MissingStep { from, to } => {
                write!(f, "step '{from}' references missing step '{to}'")
            }
            Self::Cycle { step } => write!(f, "step graph has a cycle through '{step}'"),
            Self::Unreachable { step } => {
                write!(f, "step '{step}' is not reachable from the entry step")
            }
            Self::EmptyChildren { step } => write!(f, "step '{step}' has no children"),
            Self::BranchNeverJoins { fork, child } => write!(
                f,
                "branch '{child}' of parallel step '{fork}' can finish without reaching the join"
            ),
            Self::SharedBranchStep { fork, step } => write!(
                f,
                "step '{step}' is shared by more than one branch of parallel step '{fork}'"
            ),
            Self::SequenceChild {
                sequence,
                child,
                reason,
            } => write!(f, "sequence '{sequence}' child '{child}': {reason}"),
        }
    }
}

impl std::error::Error for DefinitionError {}

/// Errors from the action registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registration was attempted after the registry was frozen.
    RegistryFrozen { action: String },
    /// An action with this name is already registered.
    DuplicateAction { action: String },
    /// No action with this name is registered.
    UnknownAction { action: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryFrozen { action } => {
                write!(f, "registry is frozen; cannot register '{action}'")
            }
            Self::DuplicateAction { action } => {
                write!(f, "action '{action}' is already registered")
            }
            Self::UnknownAction { action } => write!(f, "unknown action '{action}'"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors from the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The instance does not exist.
    InstanceNotFound { instance: InstanceId },
    /// The caller no longer holds the instance's lease.
    LeaseLost { instance: InstanceId },
    /// The instance reached a terminal status; no further writes are accepted.
    Terminal {
        instance: InstanceId,
        status: InstanceStatus,
    },
    /// The backend is unreachable or failed transiently.
    Unavailable { reason: String },
    /// Persisted data could not be decoded.
    Corrupt { reason: String },
}

impl StoreError {
    /// Returns true if the caller must stop advancing the instance.
    #[must_use]
    pub fn ends_claim(&self) -> bool {
        matches!(
            self,
            Self::LeaseLost { .. } | Self::Terminal { .. } | Self::InstanceNotFound { .. }
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance } => write!(f, "instance not found: {instance}"),
            Self::LeaseLost { instance } => write!(f, "lease lost for instance {instance}"),
            Self::Terminal { instance, status } => {
                write!(f, "instance {instance} is already {status}")
            }
            Self::Unavailable { reason } => write!(f, "state store unavailable: {reason}"),
            Self::Corrupt { reason } => write!(f, "corrupt state: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// High-level engine errors.
///
/// Use these to add engine context when wrapping lower-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No published definition has this id.
    DefinitionNotFound { definition: DefinitionId },
    /// The request's tenant does not own the definition or instance.
    TenantMismatch,
    /// A signal did not fit the wait it addressed.
    InvalidSignal { reason: String },
    /// A state store operation failed.
    Store(StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DefinitionNotFound { definition } => {
                write!(f, "definition not found: {definition}")
            }
            Self::TenantMismatch => write!(f, "tenant does not own the target"),
            Self::InvalidSignal { reason } => write!(f, "invalid signal: {reason}"),
            Self::Store(e) => write!(f, "state store operation failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}
