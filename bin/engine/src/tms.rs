//! TMS REST client.
//!
//! [`TmsApi`] implements the shipment, billing, document, approval and
//! notification ports against the TMS HTTP API. Every call carries the
//! tenant in `X-Organization-Id` / `X-Business-Unit-Id`, and mutating calls
//! forward the step's idempotency key so retried steps are absorbed by the
//! TMS.

use async_trait::async_trait;
use haulflow_core::{ApprovalRequestId, TenantScope};
use haulflow_integration::{
    ApprovalDraft, ApprovalService, BillingService, Delivery, DocumentRequest, DocumentService,
    GeneratedDocument, HttpClient, HttpMethod, HttpRequest, HttpResponse, IntegrationError,
    Invoice, InvoiceDispatch, Notification, Notifier, QueuedBilling, Shipment, ShipmentChange,
    ShipmentMutation, ShipmentRepository,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const SERVICE: &str = "tms";

/// Connection settings for the TMS API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TmsConfig {
    /// Base URL of the versioned API, e.g. `https://tms.internal/api/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token for service-to-service calls.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

impl Default for TmsConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Maps a non-2xx TMS answer onto the port error for `entity`.
fn status_error(entity: &'static str, id: &str, response: &HttpResponse) -> IntegrationError {
    let reason = response
        .body
        .get("message")
        .and_then(JsonValue::as_str)
        .map_or_else(|| response.body.to_string(), str::to_string);
    match response.status {
        404 => IntegrationError::not_found(entity, id),
        409 => IntegrationError::Conflict {
            entity,
            id: id.to_string(),
        },
        400 | 422 => IntegrationError::rejected(reason),
        408 | 504 => IntegrationError::Timeout {
            service: SERVICE.to_string(),
        },
        status => IntegrationError::unavailable(SERVICE, format!("status {status}: {reason}")),
    }
}

#[derive(Deserialize)]
struct CreatedApproval {
    id: String,
}

/// The TMS ports over an [`HttpClient`].
#[derive(Clone)]
pub struct TmsApi {
    http: Arc<dyn HttpClient>,
    config: TmsConfig,
}

impl TmsApi {
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>, config: TmsConfig) -> Self {
        Self { http, config }
    }

    /// Builds `<base_url>/<segments…>/` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<String, IntegrationError> {
        let mut url = reqwest::Url::parse(&self.config.base_url).map_err(|e| {
            IntegrationError::unavailable(SERVICE, format!("invalid base URL: {e}"))
        })?;
        url.path_segments_mut()
            .map_err(|()| IntegrationError::unavailable(SERVICE, "base URL cannot hold a path"))?
            .pop_if_empty()
            .extend(segments)
            .push("");
        Ok(url.into())
    }

    fn request(
        &self,
        method: HttpMethod,
        tenant: &TenantScope,
        segments: &[&str],
    ) -> Result<HttpRequest, IntegrationError> {
        let mut request = HttpRequest::new(method, self.url(segments)?)
            .with_timeout(Duration::from_secs(self.config.timeout_seconds))
            .with_header("X-Organization-Id", tenant.organization.to_string())
            .with_header("X-Business-Unit-Id", tenant.business_unit.to_string());
        if let Some(token) = &self.config.api_token {
            request = request.with_header("Authorization", format!("Bearer {token}"));
        }
        Ok(request)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        entity: &'static str,
        id: &str,
        request: HttpRequest,
    ) -> Result<T, IntegrationError> {
        let response = self.http.send(request).await?;
        if !response.is_success() {
            return Err(status_error(entity, id, &response));
        }
        serde_json::from_value(response.body).map_err(|e| {
            IntegrationError::unavailable(SERVICE, format!("malformed {entity} response: {e}"))
        })
    }
}

#[async_trait]
impl ShipmentRepository for TmsApi {
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn get(&self, tenant: &TenantScope, id: &str) -> Result<Shipment, IntegrationError> {
        let request = self.request(HttpMethod::Get, tenant, &["shipments", id])?;
        self.call("shipment", id, request).await
    }

    #[instrument(skip(self, tenant, mutation), fields(tenant = %tenant))]
    async fn apply(
        &self,
        tenant: &TenantScope,
        id: &str,
        mutation: &ShipmentMutation,
        idempotency_key: &str,
    ) -> Result<ShipmentChange, IntegrationError> {
        let body = serde_json::to_value(mutation)
            .map_err(|e| IntegrationError::rejected(format!("unencodable mutation: {e}")))?;
        let request = self
            .request(HttpMethod::Post, tenant, &["shipments", id, "mutations"])?
            .with_body(body)
            .with_idempotency_key(idempotency_key);
        self.call("shipment", id, request).await
    }
}

#[async_trait]
impl BillingService for TmsApi {
    async fn transfer_to_queue(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        queue: &str,
        idempotency_key: &str,
    ) -> Result<QueuedBilling, IntegrationError> {
        let request = self
            .request(HttpMethod::Post, tenant, &["billing-queue", "transfer"])?
            .with_body(json!({"shipment_id": shipment_id, "queue": queue}))
            .with_idempotency_key(idempotency_key);
        self.call("shipment", shipment_id, request).await
    }

    async fn generate_invoice(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        idempotency_key: &str,
    ) -> Result<Invoice, IntegrationError> {
        let request = self
            .request(HttpMethod::Post, tenant, &["invoices"])?
            .with_body(json!({"shipment_id": shipment_id}))
            .with_idempotency_key(idempotency_key);
        self.call("shipment", shipment_id, request).await
    }

    async fn send_invoice(
        &self,
        tenant: &TenantScope,
        invoice_id: &str,
        recipient_email: &str,
        idempotency_key: &str,
    ) -> Result<InvoiceDispatch, IntegrationError> {
        let request = self
            .request(HttpMethod::Post, tenant, &["invoices", invoice_id, "send"])?
            .with_body(json!({"recipient_email": recipient_email}))
            .with_idempotency_key(idempotency_key);
        self.call("invoice", invoice_id, request).await
    }
}

#[async_trait]
impl DocumentService for TmsApi {
    async fn document_types(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
    ) -> Result<Vec<String>, IntegrationError> {
        let request = self.request(
            HttpMethod::Get,
            tenant,
            &["shipments", shipment_id, "document-types"],
        )?;
        self.call("shipment", shipment_id, request).await
    }

    async fn request_documents(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        document_types: &[String],
        recipient: Option<&str>,
        idempotency_key: &str,
    ) -> Result<DocumentRequest, IntegrationError> {
        let request = self
            .request(HttpMethod::Post, tenant, &["document-requests"])?
            .with_body(json!({
                "shipment_id": shipment_id,
                "document_types": document_types,
                "recipient": recipient,
            }))
            .with_idempotency_key(idempotency_key);
        self.call("shipment", shipment_id, request).await
    }

    async fn generate(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        document_type: &str,
        idempotency_key: &str,
    ) -> Result<GeneratedDocument, IntegrationError> {
        let request = self
            .request(HttpMethod::Post, tenant, &["documents", "generate"])?
            .with_body(json!({"shipment_id": shipment_id, "document_type": document_type}))
            .with_idempotency_key(idempotency_key);
        self.call("shipment", shipment_id, request).await
    }
}

#[async_trait]
impl ApprovalService for TmsApi {
    async fn create_request(
        &self,
        tenant: &TenantScope,
        draft: &ApprovalDraft,
        idempotency_key: &str,
    ) -> Result<ApprovalRequestId, IntegrationError> {
        let body = serde_json::to_value(draft)
            .map_err(|e| IntegrationError::rejected(format!("unencodable approval: {e}")))?;
        let request = self
            .request(HttpMethod::Post, tenant, &["workflow-approvals"])?
            .with_body(body)
            .with_idempotency_key(idempotency_key);
        let instance = draft.instance.to_string();
        let created: CreatedApproval = self.call("workflow instance", &instance, request).await?;
        ApprovalRequestId::from_str(&created.id).map_err(|e| {
            IntegrationError::unavailable(SERVICE, format!("malformed approval id: {e}"))
        })
    }
}

#[async_trait]
impl Notifier for TmsApi {
    async fn send(
        &self,
        tenant: &TenantScope,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<Delivery, IntegrationError> {
        let body = serde_json::to_value(notification)
            .map_err(|e| IntegrationError::rejected(format!("unencodable notification: {e}")))?;
        let request = self
            .request(HttpMethod::Post, tenant, &["notifications"])?
            .with_body(body)
            .with_idempotency_key(idempotency_key);
        self.call("notification", notification.channel(), request).await
    }
}
