//! The action handler contract.
//!
//! Handlers are stateless units of external effect. A handler receives an
//! [`ExecutionContext`] and answers with a JSON result or a typed
//! [`HandlerError`]; the runtime decides what the error means for the
//! instance.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use haulflow_integration::IntegrationError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// The class of a handler failure, which decides retry and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorKind {
    /// Config resolved to values the handler cannot use.
    InvalidInput,
    /// A referenced entity does not exist.
    NotFound,
    /// An optimistic version check failed.
    Conflict,
    /// An external service failed transiently.
    Upstream,
    /// The deadline passed.
    Timeout,
    /// The instance was cancelled.
    Cancelled,
    /// A bug or broken invariant.
    Internal,
}

impl HandlerErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Upstream => "upstream",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// True for kinds the retry policy may retry.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Upstream | Self::Timeout)
    }
}

impl fmt::Display for HandlerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(kind: HandlerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::InvalidInput, message)
    }

    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Upstream, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Internal, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HandlerErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(HandlerErrorKind::Cancelled, "step was cancelled")
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<IntegrationError> for HandlerError {
    fn from(error: IntegrationError) -> Self {
        let kind = match &error {
            IntegrationError::NotFound { .. } => HandlerErrorKind::NotFound,
            IntegrationError::Conflict { .. } => HandlerErrorKind::Conflict,
            IntegrationError::Rejected { .. } => HandlerErrorKind::InvalidInput,
            IntegrationError::Unavailable { .. } => HandlerErrorKind::Upstream,
            IntegrationError::Timeout { .. } => HandlerErrorKind::Timeout,
            IntegrationError::Cancelled => HandlerErrorKind::Cancelled,
        };
        Self::new(kind, error.to_string())
    }
}

/// The executable body of an action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs the action once.
    ///
    /// Implementations must pass [`ExecutionContext::idempotency_key`] to any
    /// port that mutates external state, and should return promptly once the
    /// context's cancellation token fires.
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_errors_map_to_kinds() {
        let cases = [
            (IntegrationError::not_found("shipment", "S1"), HandlerErrorKind::NotFound),
            (
                IntegrationError::Conflict {
                    entity: "shipment",
                    id: "S1".into(),
                },
                HandlerErrorKind::Conflict,
            ),
            (IntegrationError::rejected("bad"), HandlerErrorKind::InvalidInput),
            (
                IntegrationError::unavailable("smtp", "503"),
                HandlerErrorKind::Upstream,
            ),
            (
                IntegrationError::Timeout {
                    service: "http".into(),
                },
                HandlerErrorKind::Timeout,
            ),
            (IntegrationError::Cancelled, HandlerErrorKind::Cancelled),
        ];
        for (error, kind) in cases {
            assert_eq!(HandlerError::from(error).kind, kind);
        }
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(HandlerErrorKind::Upstream.is_retryable());
        assert!(HandlerErrorKind::Timeout.is_retryable());
        assert!(!HandlerErrorKind::Conflict.is_retryable());
        assert!(!HandlerErrorKind::Internal.is_retryable());
    }
}
