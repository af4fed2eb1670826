//! Ports to the TMS collaborators that workflow actions act upon.
//!
//! This crate provides:
//!
//! - **Port traits**: shipments, notifications, HTTP, billing, documents,
//!   approvals, and read-only queries
//! - **Concurrency limits**: per-action permits protecting upstreams
//! - **In-memory ports**: idempotent fakes for tests and embedded use

pub mod approval;
pub mod billing;
pub mod document;
pub mod error;
pub mod http;
pub mod limit;
pub mod memory;
pub mod notify;
pub mod query;
pub mod shipment;

use std::sync::Arc;

pub use approval::{ApprovalDraft, ApprovalService};
pub use billing::{BillingService, Invoice, InvoiceDispatch, QueuedBilling};
pub use document::{DocumentRequest, DocumentService, GeneratedDocument};
pub use error::IntegrationError;
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};
pub use limit::{ConcurrencyLimiter, LimitConfig};
pub use memory::MemoryPorts;
pub use notify::{Delivery, EmailMessage, Notification, Notifier, PushMessage, SmsMessage};
pub use query::{QueryService, Row, ensure_read_only};
pub use shipment::{Shipment, ShipmentChange, ShipmentMutation, ShipmentRepository, ShipmentStatus};

/// The full set of collaborators handed to the built-in actions.
#[derive(Clone)]
pub struct Ports {
    pub shipments: Arc<dyn ShipmentRepository>,
    pub notifier: Arc<dyn Notifier>,
    pub http: Arc<dyn HttpClient>,
    pub billing: Arc<dyn BillingService>,
    pub documents: Arc<dyn DocumentService>,
    pub approvals: Arc<dyn ApprovalService>,
    pub queries: Arc<dyn QueryService>,
}
