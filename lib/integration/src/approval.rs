//! Approval service port.
//!
//! An approval step raises a request with the external approval inbox and
//! then waits for a signal carrying the decision.

use crate::error::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::{ApprovalRequestId, InstanceId, TenantScope};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDraft {
    pub instance: InstanceId,
    pub step: String,
    /// Who may decide, e.g. `{"role": "billing_manager"}` or `{"user": "usr_…"}`.
    pub approver: JsonValue,
    pub deadline: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    /// Raises an approval request. Idempotent on the key.
    async fn create_request(
        &self,
        tenant: &TenantScope,
        draft: &ApprovalDraft,
        idempotency_key: &str,
    ) -> Result<ApprovalRequestId, IntegrationError>;
}
