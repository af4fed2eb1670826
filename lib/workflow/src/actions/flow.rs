//! Structural `flow.*` actions.
//!
//! These carry only a schema. Steps naming them are rewritten by the parser
//! into wait, approval, parallel and delay steps.

use crate::error::RegistryError;
use crate::registry::{ActionRegistry, ConfigSchema, FieldType, StructuralKind};

pub(crate) fn register(registry: &mut ActionRegistry) -> Result<(), RegistryError> {
    registry.register_structural(
        "flow.wait_for_event",
        ConfigSchema::new()
            .required("event_kind", FieldType::String)
            .optional("match", FieldType::String)
            .optional("timeout_seconds", FieldType::Number)
            .optional("timeout", FieldType::Number),
        StructuralKind::WaitForEvent,
    )?;
    registry.register_structural(
        "flow.approval_request",
        ConfigSchema::new()
            .required("approver", FieldType::Any)
            .optional("timeout_seconds", FieldType::Number)
            .optional("timeout", FieldType::Number),
        StructuralKind::Approval,
    )?;
    registry.register_structural(
        "flow.parallel_execution",
        ConfigSchema::new()
            .required("children", FieldType::Array)
            .optional("mode", FieldType::one_of(["all", "first_success"])),
        StructuralKind::Parallel,
    )?;
    registry.register_structural(
        "flow.delay",
        ConfigSchema::new().required("seconds", FieldType::Number),
        StructuralKind::Delay,
    )
}
