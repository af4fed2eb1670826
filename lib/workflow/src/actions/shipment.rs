//! Shipment actions: status, carrier, driver and free-form field updates.

use super::non_empty;
use crate::context::ExecutionContext;
use crate::error::RegistryError;
use crate::handler::{ActionHandler, HandlerError};
use crate::registry::{ActionRegistry, ConfigSchema, FieldType};
use async_trait::async_trait;
use haulflow_integration::{
    Ports, ShipmentChange, ShipmentMutation, ShipmentRepository, ShipmentStatus,
};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::debug;

pub(crate) fn register(registry: &mut ActionRegistry, ports: &Ports) -> Result<(), RegistryError> {
    let shipments = &ports.shipments;
    let statuses = FieldType::one_of(ShipmentStatus::ALL.iter().map(|s| s.as_str()));

    registry.register(
        "shipment.update_status",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("status", statuses),
        Arc::new(UpdateStatus {
            shipments: Arc::clone(shipments),
        }),
    )?;
    registry.register(
        "shipment.assign_carrier",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("carrier_id", FieldType::String),
        Arc::new(AssignCarrier {
            shipments: Arc::clone(shipments),
        }),
    )?;
    registry.register(
        "shipment.assign_driver",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("driver_id", FieldType::String),
        Arc::new(AssignDriver {
            shipments: Arc::clone(shipments),
        }),
    )?;
    registry.register(
        "shipment.update_field",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("field", FieldType::String)
            .required("value", FieldType::Any),
        Arc::new(UpdateField {
            shipments: Arc::clone(shipments),
        }),
    )
}

async fn apply(
    shipments: &dyn ShipmentRepository,
    ctx: &ExecutionContext,
    shipment_id: &str,
    mutation: &ShipmentMutation,
) -> Result<ShipmentChange, HandlerError> {
    let shipment_id = non_empty("shipment_id", shipment_id)?;
    let key = ctx.idempotency_key();
    let change = ctx
        .call(shipments.apply(&ctx.tenant, shipment_id, mutation, &key))
        .await?;
    debug!(
        instance = %ctx.instance,
        shipment_id,
        version = change.after.version,
        "shipment updated"
    );
    Ok(change)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateStatusConfig {
    shipment_id: String,
    status: ShipmentStatus,
}

struct UpdateStatus {
    shipments: Arc<dyn ShipmentRepository>,
}

#[async_trait]
impl ActionHandler for UpdateStatus {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: UpdateStatusConfig = ctx.config()?;
        let mutation = ShipmentMutation::Status {
            status: config.status,
        };
        let change = apply(self.shipments.as_ref(), ctx, &config.shipment_id, &mutation).await?;
        Ok(json!({
            "shipment_id": change.after.id,
            "old_status": change.before.status.as_str(),
            "new_status": change.after.status.as_str(),
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AssignCarrierConfig {
    shipment_id: String,
    carrier_id: String,
}

struct AssignCarrier {
    shipments: Arc<dyn ShipmentRepository>,
}

#[async_trait]
impl ActionHandler for AssignCarrier {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: AssignCarrierConfig = ctx.config()?;
        let mutation = ShipmentMutation::Carrier {
            carrier_id: non_empty("carrier_id", &config.carrier_id)?.to_string(),
        };
        let change = apply(self.shipments.as_ref(), ctx, &config.shipment_id, &mutation).await?;
        Ok(json!({
            "shipment_id": change.after.id,
            "carrier_id": change.after.carrier_id,
            "previous_carrier_id": change.before.carrier_id,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AssignDriverConfig {
    shipment_id: String,
    driver_id: String,
}

struct AssignDriver {
    shipments: Arc<dyn ShipmentRepository>,
}

#[async_trait]
impl ActionHandler for AssignDriver {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: AssignDriverConfig = ctx.config()?;
        let mutation = ShipmentMutation::Driver {
            driver_id: non_empty("driver_id", &config.driver_id)?.to_string(),
        };
        let change = apply(self.shipments.as_ref(), ctx, &config.shipment_id, &mutation).await?;
        Ok(json!({
            "shipment_id": change.after.id,
            "driver_id": change.after.driver_id,
            "previous_driver_id": change.before.driver_id,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateFieldConfig {
    shipment_id: String,
    field: String,
    value: JsonValue,
}

struct UpdateField {
    shipments: Arc<dyn ShipmentRepository>,
}

#[async_trait]
impl ActionHandler for UpdateField {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: UpdateFieldConfig = ctx.config()?;
        let field = non_empty("field", &config.field)?.to_string();
        let mutation = ShipmentMutation::Field {
            name: field.clone(),
            value: config.value,
        };
        let change = apply(self.shipments.as_ref(), ctx, &config.shipment_id, &mutation).await?;
        let old_value = change.before.fields.get(&field).cloned().unwrap_or(JsonValue::Null);
        let new_value = change.after.fields.get(&field).cloned().unwrap_or(JsonValue::Null);
        Ok(json!({
            "shipment_id": change.after.id,
            "field": field,
            "old_value": old_value,
            "new_value": new_value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, tenant};
    use crate::handler::HandlerErrorKind;
    use haulflow_integration::memory::MemoryShipments;
    use haulflow_integration::{IntegrationError, Shipment};

    fn seeded() -> (Arc<MemoryShipments>, haulflow_core::TenantScope) {
        let shipments = Arc::new(MemoryShipments::default());
        let tenant = tenant();
        shipments.insert(Shipment::new(tenant, "S1"));
        (shipments, tenant)
    }

    #[tokio::test]
    async fn update_status_reports_both_statuses() {
        let (shipments, tenant) = seeded();
        let handler = UpdateStatus {
            shipments: shipments.clone(),
        };
        let ctx = context(
            tenant,
            "shipment.update_status",
            json!({"shipment_id": "S1", "status": "Dispatched"}),
        );

        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["old_status"], "New");
        assert_eq!(result["new_status"], "Dispatched");

        // Same idempotency key, no second application.
        handler.invoke(&ctx).await.expect("replay");
        assert_eq!(shipments.applied(), 1);
    }

    #[tokio::test]
    async fn undeclared_status_is_invalid_input() {
        let (shipments, tenant) = seeded();
        let handler = UpdateStatus { shipments };
        let ctx = context(
            tenant,
            "shipment.update_status",
            json!({"shipment_id": "S1", "status": "Teleported"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn missing_shipment_is_not_found() {
        let (shipments, tenant) = seeded();
        let handler = AssignCarrier { shipments };
        let ctx = context(
            tenant,
            "shipment.assign_carrier",
            json!({"shipment_id": "S404", "carrier_id": "C1"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::NotFound);
    }

    #[tokio::test]
    async fn update_field_returns_old_and_new_values() {
        let (shipments, tenant) = seeded();
        let handler = UpdateField { shipments };
        let ctx = context(
            tenant,
            "shipment.update_field",
            json!({"shipment_id": "S1", "field": "priority", "value": "high"}),
        );
        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["old_value"], JsonValue::Null);
        assert_eq!(result["new_value"], "high");
    }

    #[tokio::test]
    async fn port_conflicts_surface_as_conflict() {
        let (shipments, tenant) = seeded();
        shipments.failures.push(IntegrationError::Conflict {
            entity: "shipment",
            id: "S1".into(),
        });
        let handler = AssignDriver { shipments };
        let ctx = context(
            tenant,
            "shipment.assign_driver",
            json!({"shipment_id": "S1", "driver_id": "D1"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Conflict);
    }
}
