//! Document actions.

use super::non_empty;
use crate::context::ExecutionContext;
use crate::error::RegistryError;
use crate::handler::{ActionHandler, HandlerError};
use crate::registry::{ActionRegistry, ConfigSchema, FieldType};
use async_trait::async_trait;
use haulflow_integration::{DocumentService, Ports};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub(crate) fn register(registry: &mut ActionRegistry, ports: &Ports) -> Result<(), RegistryError> {
    let documents = &ports.documents;
    registry.register(
        "document.validate_completeness",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("required_documents", FieldType::Array),
        Arc::new(ValidateCompleteness {
            documents: Arc::clone(documents),
        }),
    )?;
    registry.register(
        "document.request_missing",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("missing_documents", FieldType::Array)
            .optional("recipient", FieldType::String),
        Arc::new(RequestMissing {
            documents: Arc::clone(documents),
        }),
    )?;
    registry.register(
        "document.generate",
        ConfigSchema::new()
            .required("shipment_id", FieldType::String)
            .required("document_type", FieldType::String),
        Arc::new(Generate {
            documents: Arc::clone(documents),
        }),
    )
}

fn document_list(field: &str, values: Vec<String>) -> Result<Vec<String>, HandlerError> {
    let mut seen = BTreeSet::new();
    let mut list = Vec::with_capacity(values.len());
    for value in values {
        let value = non_empty(field, &value)?.to_string();
        if seen.insert(value.clone()) {
            list.push(value);
        }
    }
    if list.is_empty() {
        return Err(HandlerError::invalid_input(format!("{field} must not be empty")));
    }
    Ok(list)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateCompletenessConfig {
    shipment_id: String,
    required_documents: Vec<String>,
}

struct ValidateCompleteness {
    documents: Arc<dyn DocumentService>,
}

#[async_trait]
impl ActionHandler for ValidateCompleteness {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: ValidateCompletenessConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let required = document_list("required_documents", config.required_documents)?;

        let attached: BTreeSet<String> = ctx
            .call(self.documents.document_types(&ctx.tenant, shipment_id))
            .await?
            .into_iter()
            .collect();
        let (present, missing): (Vec<_>, Vec<_>) =
            required.iter().cloned().partition(|doc| attached.contains(doc));

        let completion_rate = present.len() * 100 / required.len();
        debug!(
            shipment_id,
            present = present.len(),
            missing = missing.len(),
            "document completeness checked"
        );
        Ok(json!({
            "shipment_id": shipment_id,
            "is_complete": missing.is_empty(),
            "present_documents": present,
            "missing_documents": missing,
            "completion_rate": completion_rate,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestMissingConfig {
    shipment_id: String,
    missing_documents: Vec<String>,
    recipient: Option<String>,
}

struct RequestMissing {
    documents: Arc<dyn DocumentService>,
}

#[async_trait]
impl ActionHandler for RequestMissing {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: RequestMissingConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let missing = document_list("missing_documents", config.missing_documents)?;
        let key = ctx.idempotency_key();
        let request = ctx
            .call(self.documents.request_documents(
                &ctx.tenant,
                shipment_id,
                &missing,
                config.recipient.as_deref(),
                &key,
            ))
            .await?;
        Ok(json!({
            "shipment_id": shipment_id,
            "request_id": request.request_id,
            "requested_at": request.requested_at,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GenerateConfig {
    shipment_id: String,
    document_type: String,
}

struct Generate {
    documents: Arc<dyn DocumentService>,
}

#[async_trait]
impl ActionHandler for Generate {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: GenerateConfig = ctx.config()?;
        let shipment_id = non_empty("shipment_id", &config.shipment_id)?;
        let document_type = non_empty("document_type", &config.document_type)?;
        let key = ctx.idempotency_key();
        let document = ctx
            .call(self.documents.generate(&ctx.tenant, shipment_id, document_type, &key))
            .await?;
        Ok(json!({
            "shipment_id": shipment_id,
            "document_id": document.document_id,
            "document_type": document_type,
            "generated_at": document.generated_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, tenant};
    use crate::handler::HandlerErrorKind;
    use haulflow_integration::memory::MemoryDocuments;

    #[tokio::test]
    async fn completeness_reports_present_and_missing() {
        let documents = Arc::new(MemoryDocuments::default());
        let tenant = tenant();
        documents.attach(tenant, "S1", "bill_of_lading");
        let handler = ValidateCompleteness { documents };

        let ctx = context(
            tenant,
            "document.validate_completeness",
            json!({
                "shipment_id": "S1",
                "required_documents": ["bill_of_lading", "proof_of_delivery", "bill_of_lading"]
            }),
        );
        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["is_complete"], false);
        assert_eq!(result["present_documents"], json!(["bill_of_lading"]));
        assert_eq!(result["missing_documents"], json!(["proof_of_delivery"]));
        assert_eq!(result["completion_rate"], 50);
    }

    #[tokio::test]
    async fn empty_requirement_list_is_invalid() {
        let handler = ValidateCompleteness {
            documents: Arc::new(MemoryDocuments::default()),
        };
        let ctx = context(
            tenant(),
            "document.validate_completeness",
            json!({"shipment_id": "S1", "required_documents": []}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn generated_documents_count_as_attached() {
        let documents = Arc::new(MemoryDocuments::default());
        let tenant = tenant();
        let generate = Generate {
            documents: documents.clone(),
        };
        let ctx = context(
            tenant,
            "document.generate",
            json!({"shipment_id": "S1", "document_type": "rate_confirmation"}),
        );
        generate.invoke(&ctx).await.expect("generate");
        assert_eq!(documents.generated(), 1);

        let check = ValidateCompleteness { documents };
        let ctx = context(
            tenant,
            "document.validate_completeness",
            json!({"shipment_id": "S1", "required_documents": ["rate_confirmation"]}),
        );
        let result = check.invoke(&ctx).await.expect("check");
        assert_eq!(result["completion_rate"], 100);
    }
}
