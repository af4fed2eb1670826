//! Document service port.

use crate::error::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::TenantScope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub document_id: String,
    pub generated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Document types already attached to the shipment.
    async fn document_types(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
    ) -> Result<Vec<String>, IntegrationError>;

    async fn request_documents(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        document_types: &[String],
        recipient: Option<&str>,
        idempotency_key: &str,
    ) -> Result<DocumentRequest, IntegrationError>;

    async fn generate(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        document_type: &str,
        idempotency_key: &str,
    ) -> Result<GeneratedDocument, IntegrationError>;
}
