//! Billing service port.

use crate::error::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::TenantScope;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedBilling {
    pub queue: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: String,
    pub invoice_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDispatch {
    pub sent_at: DateTime<Utc>,
}

/// Billing operations. Mutating calls are idempotent on their key.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn transfer_to_queue(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        queue: &str,
        idempotency_key: &str,
    ) -> Result<QueuedBilling, IntegrationError>;

    async fn generate_invoice(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        idempotency_key: &str,
    ) -> Result<Invoice, IntegrationError>;

    async fn send_invoice(
        &self,
        tenant: &TenantScope,
        invoice_id: &str,
        recipient_email: &str,
        idempotency_key: &str,
    ) -> Result<InvoiceDispatch, IntegrationError>;
}
