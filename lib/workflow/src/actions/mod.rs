//! Built-in actions.
//!
//! Each family registers its actions with a config schema and a handler
//! holding the ports it needs. `flow.*` actions are registered as structural
//! entries: the parser rewrites steps naming them and the runtime executes
//! them itself.

pub mod billing;
pub mod data;
pub mod document;
pub mod flow;
pub mod notification;
pub mod shipment;

use crate::error::RegistryError;
use crate::handler::HandlerError;
use crate::registry::ActionRegistry;
use haulflow_integration::{ConcurrencyLimiter, Ports};
use serde::Deserialize;
use std::sync::Arc;

/// Registers every built-in action.
///
/// # Errors
///
/// Returns the first registration failure, e.g. when the registry is frozen.
pub fn register_builtins(
    registry: &mut ActionRegistry,
    ports: Ports,
    limiter: Arc<ConcurrencyLimiter>,
) -> Result<(), RegistryError> {
    shipment::register(registry, &ports)?;
    billing::register(registry, &ports)?;
    document::register(registry, &ports)?;
    notification::register(registry, &ports, &limiter)?;
    data::register(registry, &ports, &limiter)?;
    flow::register(registry)?;
    Ok(())
}

/// A config value given either as one string or as a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub(crate) fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Rejects blank identifiers that resolved from missing variables.
pub(crate) fn non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str, HandlerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(HandlerError::invalid_input(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}
