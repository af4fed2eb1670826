//! Shipment repository port.

use crate::error::IntegrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use haulflow_core::TenantScope;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShipmentStatus {
    New,
    PartiallyAssigned,
    Assigned,
    Dispatched,
    InTransit,
    Delayed,
    PartiallyCompleted,
    Completed,
    Billed,
    Canceled,
}

impl ShipmentStatus {
    pub const ALL: [Self; 10] = [
        Self::New,
        Self::PartiallyAssigned,
        Self::Assigned,
        Self::Dispatched,
        Self::InTransit,
        Self::Delayed,
        Self::PartiallyCompleted,
        Self::Completed,
        Self::Billed,
        Self::Canceled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::PartiallyAssigned => "PartiallyAssigned",
            Self::Assigned => "Assigned",
            Self::Dispatched => "Dispatched",
            Self::InTransit => "InTransit",
            Self::Delayed => "Delayed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Completed => "Completed",
            Self::Billed => "Billed",
            Self::Canceled => "Canceled",
        }
    }

    /// Canceled and billed shipments no longer accept status changes.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Canceled | Self::Billed)
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = IntegrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| IntegrationError::rejected(format!("unknown shipment status '{s}'")))
    }
}

/// The slice of a shipment that workflow actions read and change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: String,
    pub tenant: TenantScope,
    pub status: ShipmentStatus,
    pub customer_id: Option<String>,
    pub carrier_id: Option<String>,
    pub driver_id: Option<String>,
    pub move_count: u32,
    pub actual_delivery_date: Option<DateTime<Utc>>,
    pub freight_charge_amount: Decimal,
    /// Free-form attributes editable through `shipment.update_field`.
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
    pub version: i64,
}

impl Shipment {
    /// A freshly entered shipment with no assignments.
    #[must_use]
    pub fn new(tenant: TenantScope, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant,
            status: ShipmentStatus::New,
            customer_id: None,
            carrier_id: None,
            driver_id: None,
            move_count: 0,
            actual_delivery_date: None,
            freight_charge_amount: Decimal::ZERO,
            fields: Map::new(),
            version: 1,
        }
    }
}

/// A change requested by a shipment action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShipmentMutation {
    Status { status: ShipmentStatus },
    Carrier { carrier_id: String },
    Driver { driver_id: String },
    Field { name: String, value: JsonValue },
}

impl ShipmentMutation {
    /// Applies the mutation to a copy of the shipment.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` when the shipment is closed for the change.
    pub fn apply(&self, shipment: &Shipment) -> Result<Shipment, IntegrationError> {
        if shipment.status.is_closed() {
            return Err(IntegrationError::rejected(format!(
                "shipment {} is {} and cannot be changed",
                shipment.id, shipment.status
            )));
        }

        let mut next = shipment.clone();
        match self {
            Self::Status { status } => next.status = *status,
            Self::Carrier { carrier_id } => next.carrier_id = Some(carrier_id.clone()),
            Self::Driver { driver_id } => next.driver_id = Some(driver_id.clone()),
            Self::Field { name, value } => {
                next.fields.insert(name.clone(), value.clone());
            }
        }
        next.version += 1;
        Ok(next)
    }
}

/// The before and after images of an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentChange {
    pub before: Shipment,
    pub after: Shipment,
}

/// Access to shipments owned by the TMS.
#[async_trait]
pub trait ShipmentRepository: Send + Sync {
    /// Loads a shipment in the tenant's scope.
    async fn get(&self, tenant: &TenantScope, id: &str) -> Result<Shipment, IntegrationError>;

    /// Applies a mutation with optimistic concurrency.
    ///
    /// Repeating a call with the same idempotency key returns the change
    /// recorded the first time without applying it again.
    async fn apply(
        &self,
        tenant: &TenantScope,
        id: &str,
        mutation: &ShipmentMutation,
        idempotency_key: &str,
    ) -> Result<ShipmentChange, IntegrationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use haulflow_core::{BusinessUnitId, OrganizationId};

    fn tenant() -> TenantScope {
        TenantScope::new(OrganizationId::new(), BusinessUnitId::new())
    }

    #[test]
    fn status_parses_declared_names() {
        assert_eq!(
            "Dispatched".parse::<ShipmentStatus>().expect("status"),
            ShipmentStatus::Dispatched
        );
        assert!("Teleported".parse::<ShipmentStatus>().is_err());
    }

    #[test]
    fn mutation_bumps_version() {
        let shipment = Shipment::new(tenant(), "S1");
        let next = ShipmentMutation::Carrier {
            carrier_id: "C9".into(),
        }
        .apply(&shipment)
        .expect("apply");
        assert_eq!(next.carrier_id.as_deref(), Some("C9"));
        assert_eq!(next.version, shipment.version + 1);
    }

    #[test]
    fn closed_shipments_reject_changes() {
        let mut shipment = Shipment::new(tenant(), "S1");
        shipment.status = ShipmentStatus::Canceled;
        let err = ShipmentMutation::Status {
            status: ShipmentStatus::Dispatched,
        }
        .apply(&shipment)
        .unwrap_err();
        assert!(matches!(err, IntegrationError::Rejected { .. }));
    }
}
