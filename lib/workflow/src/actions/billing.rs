//! Billing actions.

use super::non_empty;
use crate::context::ExecutionContext;
use crate::error::RegistryError;
use crate::handler::{ActionHandler, HandlerError};
use crate::registry::{ActionRegistry, ConfigSchema, FieldType};
use async_trait::async_trait;
use haulflow_integration::{BillingService, Ports, Shipment, ShipmentRepository};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_QUEUE: &str = "billing";

pub(crate) fn register(registry: &mut ActionRegistry, ports: &Ports) -> Result<(), RegistryError> {
    registry.register(
        "billing.validate_requirements",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .optional("require_valid", FieldType::Bool),
        Arc::new(ValidateRequirements {
            shipments: Arc::clone(&ports.shipments),
        }),
    )?;
    registry.register(
        "billing.transfer_to_queue",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .optional("queue", FieldType::String),
        Arc::new(TransferToQueue {
            billing: Arc::clone(&ports.billing),
        }),
    )?;
    registry.register(
        "billing.generate_invoice",
        ConfigSchema::new().required("shipment_id", FieldType::String),
        Arc::new(GenerateInvoice {
            billing: Arc::clone(&ports.billing),
        }),
    )?;
    registry.register(
        "billing.send_invoice",
        ConfigSchema::new()
            .required("invoice_id", FieldType::String)
            .required("recipient_email", FieldType::String),
        Arc::new(SendInvoice {
            billing: Arc::clone(&ports.billing),
        }),
    )
}

/// Outcome of checking a shipment against the billing rules.
///
/// Missing items block billing; notes are warnings only.
#[derive(Debug, Default, PartialEq, Eq)]
struct Readiness {
    missing_items: Vec<String>,
    validation_notes: Vec<String>,
}

impl Readiness {
    fn of(shipment: &Shipment) -> Self {
        let mut readiness = Self::default();
        if shipment.customer_id.is_none() {
            readiness.missing_items.push("customer not assigned".to_string());
        }
        if shipment.move_count == 0 {
            readiness.missing_items.push("no moves configured".to_string());
        }
        if shipment.actual_delivery_date.is_none() {
            readiness
                .validation_notes
                .push("actual delivery date not set".to_string());
        }
        if shipment.freight_charge_amount <= Decimal::ZERO {
            readiness
                .validation_notes
                .push("freight charge amount is not positive".to_string());
        }
        readiness
    }

    fn is_valid(&self) -> bool {
        self.missing_items.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateRequirementsConfig {
    shipment_id: String,
    #[serde(default)]
    require_valid: bool,
}

struct ValidateRequirements {
    shipments: Arc<dyn ShipmentRepository>,
}

#[async_trait]
impl ActionHandler for ValidateRequirements {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: ValidateRequirementsConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let shipment = ctx
            .call(self.shipments.get(&ctx.tenant, shipment_id))
            .await?;

        let readiness = Readiness::of(&shipment);
        debug!(
            shipment_id,
            is_valid = readiness.is_valid(),
            missing = readiness.missing_items.len(),
            "billing requirements checked"
        );
        if config.require_valid && !readiness.is_valid() {
            return Err(HandlerError::invalid_input(format!(
                "shipment {shipment_id} is not ready for billing: {}",
                readiness.missing_items.join(", ")
            )));
        }

        Ok(json!({
            "shipment_id": shipment_id,
            "is_valid": readiness.is_valid(),
            "missing_items": readiness.missing_items,
            "validation_notes": readiness.validation_notes,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransferToQueueConfig {
    shipment_id: String,
    queue: Option<String>,
}

struct TransferToQueue {
    billing: Arc<dyn BillingService>,
}

#[async_trait]
impl ActionHandler for TransferToQueue {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: TransferToQueueConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let queue = config.queue.as_deref().unwrap_or(DEFAULT_QUEUE);
        let key = ctx.idempotency_key();
        let queued = ctx
            .call(self.billing.transfer_to_queue(&ctx.tenant, shipment_id, queue, &key))
            .await?;
        Ok(json!({
            "shipment_id": shipment_id,
            "queue": queued.queue,
            "queued_at": queued.queued_at,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateInvoiceConfig {
    shipment_id: String,
}

struct GenerateInvoice {
    billing: Arc<dyn BillingService>,
}

#[async_trait]
impl ActionHandler for GenerateInvoice {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: GenerateInvoiceConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let key = ctx.idempotency_key();
        let invoice = ctx
            .call(self.billing.generate_invoice(&ctx.tenant, shipment_id, &key))
            .await?;
        debug!(shipment_id, invoice_id = %invoice.invoice_id, "invoice generated");
        Ok(json!({
            "shipment_id": shipment_id,
            "invoice_id": invoice.invoice_id,
            "invoice_date": invoice.invoice_date.date_naive().to_string(),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SendInvoiceConfig {
    invoice_id: String,
    recipient_email: String,
}

struct SendInvoice {
    billing: Arc<dyn BillingService>,
}

#[async_trait]
impl ActionHandler for SendInvoice {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: SendInvoiceConfig = ctx.config()?;
        let invoice_id = non_empty("invoice_id", &config.invoice_id)?;
        let email = non_empty("recipient_email", &config.recipient_email)?;
        if !email.contains('@') {
            return Err(HandlerError::invalid_input(format!(
                "'{email}' is not an email address"
            )));
        }
        let key = ctx.idempotency_key();
        let dispatch = ctx
            .call(self.billing.send_invoice(&ctx.tenant, invoice_id, email, &key))
            .await?;
        Ok(json!({
            "invoice_id": invoice_id,
            "recipient_email": email,
            "sent_at": dispatch.sent_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, tenant};
    use crate::handler::HandlerErrorKind;
    use chrono::Utc;
    use haulflow_integration::memory::{MemoryBilling, MemoryShipments};

    #[test]
    fn readiness_separates_blockers_from_warnings() {
        let mut shipment = Shipment::new(tenant(), "S1");
        let readiness = Readiness::of(&shipment);
        assert_eq!(readiness.missing_items.len(), 2);
        assert_eq!(readiness.validation_notes.len(), 2);

        shipment.customer_id = Some("CUST-1".into());
        shipment.move_count = 2;
        shipment.actual_delivery_date = Some(Utc::now());
        shipment.freight_charge_amount = Decimal::new(125_050, 2);
        assert_eq!(Readiness::of(&shipment), Readiness::default());
    }

    #[tokio::test]
    async fn require_valid_turns_blockers_into_failures() {
        let shipments = Arc::new(MemoryShipments::default());
        let tenant = tenant();
        shipments.insert(Shipment::new(tenant, "S1"));
        let handler = ValidateRequirements { shipments };

        let lenient = context(
            tenant,
            "billing.validate_requirements",
            json!({"shipment_id": "S1"}),
        );
        let result = handler.invoke(&lenient).await.expect("invoke");
        assert_eq!(result["is_valid"], false);

        let strict = context(
            tenant,
            "billing.validate_requirements",
            json!({"shipment_id": "S1", "require_valid": true}),
        );
        let err = handler.invoke(&strict).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn invoice_generation_is_idempotent_per_attempt() {
        let billing = Arc::new(MemoryBilling::default());
        let handler = GenerateInvoice {
            billing: billing.clone(),
        };
        let ctx = context(tenant(), "billing.generate_invoice", json!({"shipment_id": "S1"}));
        let first = handler.invoke(&ctx).await.expect("first");
        let second = handler.invoke(&ctx).await.expect("second");
        assert_eq!(first, second);
        assert_eq!(billing.invoices(), 1);
    }

    #[tokio::test]
    async fn transfer_defaults_the_queue() {
        let handler = TransferToQueue {
            billing: Arc::new(MemoryBilling::default()),
        };
        let ctx = context(tenant(), "billing.transfer_to_queue", json!({"shipment_id": "S1"}));
        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["queue"], DEFAULT_QUEUE);
    }
}
