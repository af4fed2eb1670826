//! In-memory implementations of every port.
//!
//! These back the engine's tests and embedded use. Each one honors
//! idempotency keys the way a real collaborator must, and can be scripted to
//! fail the next N calls.

use crate::approval::{ApprovalDraft, ApprovalService};
use crate::billing::{BillingService, Invoice, InvoiceDispatch, QueuedBilling};
use crate::document::{DocumentRequest, DocumentService, GeneratedDocument};
use crate::error::IntegrationError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::notify::{Delivery, Notification, Notifier};
use crate::query::{QueryService, Row};
use crate::shipment::{Shipment, ShipmentChange, ShipmentMutation, ShipmentRepository};
use crate::Ports;
use async_trait::async_trait;
use chrono::Utc;
use haulflow_core::{ApprovalRequestId, TenantScope};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use ulid::Ulid;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, IntegrationError> {
    mutex
        .lock()
        .map_err(|_| IntegrationError::unavailable("memory", "lock poisoned"))
}

/// Queue of failures returned by the next calls, oldest first.
#[derive(Debug, Default)]
pub struct FailureScript {
    queue: Mutex<VecDeque<IntegrationError>>,
}

impl FailureScript {
    pub fn push(&self, error: IntegrationError) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(error);
        }
    }

    fn check(&self) -> Result<(), IntegrationError> {
        match lock(&self.queue)?.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Shipments held in memory.
#[derive(Debug, Default)]
pub struct MemoryShipments {
    shipments: Mutex<HashMap<(TenantScope, String), Shipment>>,
    changes: Mutex<HashMap<String, ShipmentChange>>,
    pub failures: FailureScript,
}

impl MemoryShipments {
    pub fn insert(&self, shipment: Shipment) {
        if let Ok(mut shipments) = self.shipments.lock() {
            shipments.insert((shipment.tenant, shipment.id.clone()), shipment);
        }
    }

    #[must_use]
    pub fn get_sync(&self, tenant: &TenantScope, id: &str) -> Option<Shipment> {
        self.shipments
            .lock()
            .ok()
            .and_then(|shipments| shipments.get(&(*tenant, id.to_string())).cloned())
    }

    /// Number of distinct mutations applied.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.changes.lock().map(|changes| changes.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ShipmentRepository for MemoryShipments {
    async fn get(&self, tenant: &TenantScope, id: &str) -> Result<Shipment, IntegrationError> {
        self.failures.check()?;
        lock(&self.shipments)?
            .get(&(*tenant, id.to_string()))
            .cloned()
            .ok_or_else(|| IntegrationError::not_found("shipment", id))
    }

    async fn apply(
        &self,
        tenant: &TenantScope,
        id: &str,
        mutation: &ShipmentMutation,
        idempotency_key: &str,
    ) -> Result<ShipmentChange, IntegrationError> {
        self.failures.check()?;
        if let Some(change) = lock(&self.changes)?.get(idempotency_key) {
            return Ok(change.clone());
        }

        let mut shipments = lock(&self.shipments)?;
        let current = shipments
            .get(&(*tenant, id.to_string()))
            .cloned()
            .ok_or_else(|| IntegrationError::not_found("shipment", id))?;
        let next = mutation.apply(&current)?;
        shipments.insert((*tenant, id.to_string()), next.clone());

        let change = ShipmentChange {
            before: current,
            after: next,
        };
        lock(&self.changes)?.insert(idempotency_key.to_string(), change.clone());
        Ok(change)
    }
}

/// Records notifications instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(TenantScope, Notification)>>,
    deliveries: Mutex<HashMap<String, Delivery>>,
    pub failures: FailureScript,
}

impl RecordingNotifier {
    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(_, n)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// Emails sent to an address.
    #[must_use]
    pub fn emails_to(&self, address: &str) -> usize {
        self.sent()
            .iter()
            .filter(|n| matches!(n, Notification::Email(email) if email.to.iter().any(|to| to == address)))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        tenant: &TenantScope,
        notification: &Notification,
        idempotency_key: &str,
    ) -> Result<Delivery, IntegrationError> {
        self.failures.check()?;
        let mut deliveries = lock(&self.deliveries)?;
        if let Some(delivery) = deliveries.get(idempotency_key) {
            return Ok(delivery.clone());
        }

        let delivery = Delivery {
            message_id: format!("msg-{}", Ulid::new()),
            sent_at: Utc::now(),
        };
        deliveries.insert(idempotency_key.to_string(), delivery.clone());
        lock(&self.sent)?.push((*tenant, notification.clone()));
        Ok(delivery)
    }
}

/// Answers HTTP requests from a script; defaults to `200 {}`.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, IntegrationError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn push(&self, response: Result<HttpResponse, IntegrationError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(response);
        }
    }

    pub fn push_status(&self, status: u16, body: JsonValue) {
        self.push(Ok(HttpResponse { status, body }));
    }

    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, IntegrationError> {
        lock(&self.requests)?.push(request);
        lock(&self.responses)?.pop_front().unwrap_or_else(|| {
            Ok(HttpResponse {
                status: 200,
                body: json!({}),
            })
        })
    }
}

#[derive(Debug, Default)]
struct BillingState {
    queued: HashMap<String, QueuedBilling>,
    invoices: HashMap<String, Invoice>,
    dispatches: HashMap<String, InvoiceDispatch>,
}

/// Billing service that keeps invoices in memory.
#[derive(Debug, Default)]
pub struct MemoryBilling {
    state: Mutex<BillingState>,
    pub failures: FailureScript,
}

impl MemoryBilling {
    #[must_use]
    pub fn invoices(&self) -> usize {
        self.state.lock().map(|s| s.invoices.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BillingService for MemoryBilling {
    async fn transfer_to_queue(
        &self,
        _tenant: &TenantScope,
        _shipment_id: &str,
        queue: &str,
        idempotency_key: &str,
    ) -> Result<QueuedBilling, IntegrationError> {
        self.failures.check()?;
        let mut state = lock(&self.state)?;
        let queued = state
            .queued
            .entry(idempotency_key.to_string())
            .or_insert_with(|| QueuedBilling {
                queue: queue.to_string(),
                queued_at: Utc::now(),
            });
        Ok(queued.clone())
    }

    async fn generate_invoice(
        &self,
        _tenant: &TenantScope,
        _shipment_id: &str,
        idempotency_key: &str,
    ) -> Result<Invoice, IntegrationError> {
        self.failures.check()?;
        let mut state = lock(&self.state)?;
        let invoice = state
            .invoices
            .entry(idempotency_key.to_string())
            .or_insert_with(|| Invoice {
                invoice_id: format!("INV-{}", Ulid::new()),
                invoice_date: Utc::now(),
            });
        Ok(invoice.clone())
    }

    async fn send_invoice(
        &self,
        _tenant: &TenantScope,
        _invoice_id: &str,
        _recipient_email: &str,
        idempotency_key: &str,
    ) -> Result<InvoiceDispatch, IntegrationError> {
        self.failures.check()?;
        let mut state = lock(&self.state)?;
        let dispatch = state
            .dispatches
            .entry(idempotency_key.to_string())
            .or_insert_with(|| InvoiceDispatch {
                sent_at: Utc::now(),
            });
        Ok(dispatch.clone())
    }
}

#[derive(Debug, Default)]
struct DocumentState {
    attached: HashMap<(TenantScope, String), Vec<String>>,
    requests: HashMap<String, DocumentRequest>,
    generated: HashMap<String, GeneratedDocument>,
}

/// Document service over an in-memory attachment list.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
    state: Mutex<DocumentState>,
    pub failures: FailureScript,
}

impl MemoryDocuments {
    pub fn attach(&self, tenant: TenantScope, shipment_id: &str, document_type: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .attached
                .entry((tenant, shipment_id.to_string()))
                .or_default()
                .push(document_type.to_string());
        }
    }

    #[must_use]
    pub fn generated(&self) -> usize {
        self.state.lock().map(|s| s.generated.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentService for MemoryDocuments {
    async fn document_types(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
    ) -> Result<Vec<String>, IntegrationError> {
        self.failures.check()?;
        Ok(lock(&self.state)?
            .attached
            .get(&(*tenant, shipment_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn request_documents(
        &self,
        _tenant: &TenantScope,
        _shipment_id: &str,
        _document_types: &[String],
        _recipient: Option<&str>,
        idempotency_key: &str,
    ) -> Result<DocumentRequest, IntegrationError> {
        self.failures.check()?;
        let mut state = lock(&self.state)?;
        let request = state
            .requests
            .entry(idempotency_key.to_string())
            .or_insert_with(|| DocumentRequest {
                request_id: format!("DOCREQ-{}", Ulid::new()),
                requested_at: Utc::now(),
            });
        Ok(request.clone())
    }

    async fn generate(
        &self,
        tenant: &TenantScope,
        shipment_id: &str,
        document_type: &str,
        idempotency_key: &str,
    ) -> Result<GeneratedDocument, IntegrationError> {
        self.failures.check()?;
        let mut state = lock(&self.state)?;
        if let Some(existing) = state.generated.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let document = GeneratedDocument {
            document_id: format!("DOC-{}", Ulid::new()),
            generated_at: Utc::now(),
        };
        state
            .generated
            .insert(idempotency_key.to_string(), document.clone());
        state
            .attached
            .entry((*tenant, shipment_id.to_string()))
            .or_default()
            .push(document_type.to_string());
        Ok(document)
    }
}

/// Approval inbox that remembers raised requests.
#[derive(Debug, Default)]
pub struct MemoryApprovals {
    requests: Mutex<HashMap<String, (ApprovalRequestId, ApprovalDraft)>>,
    pub failures: FailureScript,
}

impl MemoryApprovals {
    #[must_use]
    pub fn raised(&self) -> Vec<(ApprovalRequestId, ApprovalDraft)> {
        self.requests
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalService for MemoryApprovals {
    async fn create_request(
        &self,
        _tenant: &TenantScope,
        draft: &ApprovalDraft,
        idempotency_key: &str,
    ) -> Result<ApprovalRequestId, IntegrationError> {
        self.failures.check()?;
        let mut requests = lock(&self.requests)?;
        let (id, _) = requests
            .entry(idempotency_key.to_string())
            .or_insert_with(|| (ApprovalRequestId::new(), draft.clone()));
        Ok(*id)
    }
}

/// Query service answering every statement with the same scripted rows.
#[derive(Debug, Default)]
pub struct StaticQueries {
    rows: Mutex<Vec<Row>>,
    statements: Mutex<Vec<String>>,
}

impl StaticQueries {
    pub fn set_rows(&self, rows: Vec<Row>) {
        if let Ok(mut current) = self.rows.lock() {
            *current = rows;
        }
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl QueryService for StaticQueries {
    async fn read_only(
        &self,
        _tenant: &TenantScope,
        statement: &str,
        _params: &[JsonValue],
        max_rows: usize,
    ) -> Result<Vec<Row>, IntegrationError> {
        lock(&self.statements)?.push(statement.to_string());
        Ok(lock(&self.rows)?.iter().take(max_rows).cloned().collect())
    }
}

/// Every in-memory port, kept concrete so tests can inspect them.
#[derive(Debug, Clone, Default)]
pub struct MemoryPorts {
    pub shipments: Arc<MemoryShipments>,
    pub notifier: Arc<RecordingNotifier>,
    pub http: Arc<ScriptedHttpClient>,
    pub billing: Arc<MemoryBilling>,
    pub documents: Arc<MemoryDocuments>,
    pub approvals: Arc<MemoryApprovals>,
    pub queries: Arc<StaticQueries>,
}

impl MemoryPorts {
    #[must_use]
    pub fn ports(&self) -> Ports {
        Ports {
            shipments: self.shipments.clone(),
            notifier: self.notifier.clone(),
            http: self.http.clone(),
            billing: self.billing.clone(),
            documents: self.documents.clone(),
            approvals: self.approvals.clone(),
            queries: self.queries.clone(),
        }
    }
}
