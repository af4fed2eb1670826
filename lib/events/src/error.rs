//! Error types for the events crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `BusError`: ingesting an event or moving it between tasks
//! - `TriggerError`: publishing or retiring definitions

use haulflow_core::{DefinitionId, EventId};
use haulflow_workflow::StoreError;
use std::fmt;

/// Errors from event ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A state store call failed; the event was not marked processed.
    Store(StoreError),
    /// Starting an instance for a matched trigger failed.
    StartFailed {
        definition: DefinitionId,
        event: EventId,
    },
    /// Resolving a matched wait failed.
    DeliveryFailed { event: EventId },
    /// A message could not be decoded into an event.
    Decode { reason: String },
    /// The envelope version is not understood by this build.
    UnsupportedVersion { version: u32 },
    /// The message broker could not be reached or subscribed to.
    Connection { reason: String },
    /// The lane that owns the event's tenant has shut down.
    LaneClosed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "state store operation failed: {e}"),
            Self::StartFailed { definition, event } => {
                write!(f, "failed to start {definition} for event {event}")
            }
            Self::DeliveryFailed { event } => {
                write!(f, "failed to deliver event {event} to a waiting instance")
            }
            Self::Decode { reason } => write!(f, "invalid event message: {reason}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported envelope version: {version}")
            }
            Self::Connection { reason } => write!(f, "message broker unavailable: {reason}"),
            Self::LaneClosed => write!(f, "event lane closed"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<StoreError> for BusError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Errors from trigger management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// No published definition has this id.
    NotFound { definition: DefinitionId },
    /// Definition storage failed.
    StorageFailed { reason: String },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { definition } => write!(f, "definition not found: {definition}"),
            Self::StorageFailed { reason } => write!(f, "trigger storage failed: {reason}"),
        }
    }
}

impl std::error::Error for TriggerError {}
