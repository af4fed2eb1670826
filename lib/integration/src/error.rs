//! Error types for the integration crate.
//!
//! Every port reports failures with [`IntegrationError`]. The workflow
//! runtime maps each variant onto a handler error kind, so variants describe
//! what went wrong from the engine's point of view rather than the transport's.

use std::fmt;

/// Errors returned by external-collaborator ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    /// The referenced entity does not exist for this tenant.
    NotFound { entity: &'static str, id: String },
    /// The entity changed underneath us (optimistic version mismatch).
    Conflict { entity: &'static str, id: String },
    /// The collaborator refused the request as invalid.
    Rejected { reason: String },
    /// The collaborator is unavailable or failed transiently.
    Unavailable { service: String, reason: String },
    /// The collaborator did not answer in time.
    Timeout { service: String },
    /// The caller gave up before the collaborator answered.
    Cancelled,
}

impl IntegrationError {
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Returns true when retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { entity, id } => {
                write!(f, "{entity} {id} was modified concurrently")
            }
            Self::Rejected { reason } => write!(f, "request rejected: {reason}"),
            Self::Unavailable { service, reason } => {
                write!(f, "{service} unavailable: {reason}")
            }
            Self::Timeout { service } => write!(f, "{service} timed out"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for IntegrationError {}
