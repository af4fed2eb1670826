//! Published workflow definitions.
//!
//! The TMS writes definitions into `workflow_definitions`; the engine only
//! reads them. Every version is loaded so instances pinned to an older
//! version keep running after a newer one is published.

use chrono::{DateTime, Utc};
use haulflow_core::{BusinessUnitId, DefinitionId, OrganizationId, TenantScope};
use haulflow_events::{CatalogTriggerManager, TriggerError, TriggerManager};
use haulflow_workflow::{ActionRegistry, parse_definition};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};

/// One stored version of a definition.
#[derive(Debug, Clone)]
pub struct StoredDefinition {
    pub id: DefinitionId,
    pub version: u32,
    pub tenant: TenantScope,
    pub document: JsonValue,
    pub retired_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct DefinitionRow {
    id: String,
    version: i32,
    organization_id: String,
    business_unit_id: String,
    document: JsonValue,
    retired_at: Option<DateTime<Utc>>,
}

impl DefinitionRow {
    fn try_into_stored(self) -> Result<StoredDefinition, sqlx::Error> {
        Ok(StoredDefinition {
            id: DefinitionId::from_str(&self.id).map_err(decode_error)?,
            version: u32::try_from(self.version).map_err(decode_error)?,
            tenant: TenantScope::new(
                OrganizationId::from_str(&self.organization_id).map_err(decode_error)?,
                BusinessUnitId::from_str(&self.business_unit_id).map_err(decode_error)?,
            ),
            document: self.document,
            retired_at: self.retired_at,
        })
    }
}

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

/// Repository for workflow definitions.
#[derive(Debug, Clone)]
pub struct DefinitionRepository {
    pool: PgPool,
}

impl DefinitionRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Every stored version, oldest first per definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row holds malformed ids.
    pub async fn list_all(&self) -> Result<Vec<StoredDefinition>, sqlx::Error> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            r#"
            SELECT id, version, organization_id, business_unit_id, document, retired_at
            FROM workflow_definitions
            ORDER BY id, version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DefinitionRow::try_into_stored).collect()
    }
}

/// What a definition sync changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub published: usize,
    pub retired: usize,
    pub invalid: usize,
}

/// Loads stored definitions into the catalog and trigger subscriptions.
///
/// Every valid version enters the catalog. A definition whose latest
/// version is retired loses its subscriptions; otherwise the latest version
/// subscribes. Invalid documents are logged and skipped.
pub async fn sync_definitions(
    stored: Vec<StoredDefinition>,
    registry: &ActionRegistry,
    triggers: &CatalogTriggerManager,
) -> SyncSummary {
    let mut latest: HashMap<DefinitionId, u32> = HashMap::new();
    for definition in &stored {
        let version = latest.entry(definition.id).or_default();
        *version = (*version).max(definition.version);
    }

    let mut summary = SyncSummary::default();
    for row in stored {
        let is_latest = latest.get(&row.id) == Some(&row.version);
        let definition = match parse_definition(row.id, row.tenant, &row.document, registry) {
            Ok(definition) => definition,
            Err(errors) => {
                let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
                warn!(
                    definition = %row.id,
                    version = row.version,
                    errors = ?reasons,
                    "skipping invalid stored definition"
                );
                summary.invalid += 1;
                continue;
            }
        };
        if definition.version() != row.version {
            warn!(
                definition = %row.id,
                row_version = row.version,
                document_version = definition.version(),
                "stored version differs from document version"
            );
        }

        match (row.retired_at, is_latest) {
            (None, _) => match triggers.publish(definition).await {
                Ok(_) => summary.published += 1,
                Err(e) => warn!(definition = %row.id, error = %e, "failed to publish definition"),
            },
            (Some(_), false) => {
                triggers.catalog().insert(definition);
            }
            (Some(_), true) => {
                triggers.catalog().insert(definition);
                match triggers.retire(row.id).await {
                    Ok(()) => summary.retired += 1,
                    Err(TriggerError::NotFound { .. }) => {
                        debug!(definition = %row.id, "retired definition had no subscriptions");
                    }
                    Err(e) => warn!(definition = %row.id, error = %e, "failed to retire definition"),
                }
            }
        }
    }

    debug!(
        published = summary.published,
        retired = summary.retired,
        invalid = summary.invalid,
        "definitions synchronized"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use haulflow_integration::{ConcurrencyLimiter, MemoryPorts};
    use haulflow_workflow::{DefinitionCatalog, register_builtins};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ActionRegistry {
        let ports = MemoryPorts::default();
        let mut registry = ActionRegistry::new();
        register_builtins(
            &mut registry,
            ports.ports(),
            Arc::new(ConcurrencyLimiter::default()),
        )
        .expect("builtins");
        registry.freeze();
        registry
    }

    fn document(version: u32, kind: &str) -> JsonValue {
        json!({
            "name": "notify dispatch",
            "version": version,
            "trigger": {"event_kind": kind},
            "entry": "notify",
            "steps": {
                "notify": {
                    "kind": "action",
                    "action": "notification.send_sms",
                    "config": {"to": "+15550100", "message": "dispatched"}
                }
            }
        })
    }

    fn stored(
        id: DefinitionId,
        tenant: TenantScope,
        version: u32,
        kind: &str,
        retired: bool,
    ) -> StoredDefinition {
        StoredDefinition {
            id,
            version,
            tenant,
            document: document(version, kind),
            retired_at: retired.then(Utc::now),
        }
    }

    #[tokio::test]
    async fn latest_active_version_subscribes() {
        let registry = registry();
        let triggers = CatalogTriggerManager::new(Arc::new(DefinitionCatalog::new()));
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        let id = DefinitionId::new();

        let summary = sync_definitions(
            vec![
                stored(id, tenant, 1, "shipment.created", false),
                stored(id, tenant, 2, "shipment.dispatched", false),
            ],
            &registry,
            &triggers,
        )
        .await;

        assert_eq!(summary.published, 2);
        assert!(triggers.subscriptions(&tenant, "shipment.created").await.is_empty());
        assert_eq!(
            triggers.subscriptions(&tenant, "shipment.dispatched").await.len(),
            1
        );
        assert_eq!(triggers.catalog().latest_versions()[0].version(), 2);
    }

    #[tokio::test]
    async fn retired_definitions_stay_runnable_but_stop_triggering() {
        let registry = registry();
        let triggers = CatalogTriggerManager::new(Arc::new(DefinitionCatalog::new()));
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        let id = DefinitionId::new();
        triggers
            .publish(
                parse_definition(id, tenant, &document(1, "shipment.created"), &registry)
                    .expect("valid"),
            )
            .await
            .expect("publish");

        let summary = sync_definitions(
            vec![stored(id, tenant, 1, "shipment.created", true)],
            &registry,
            &triggers,
        )
        .await;

        assert_eq!(summary.retired, 1);
        assert!(triggers.subscriptions(&tenant, "shipment.created").await.is_empty());
        assert_eq!(triggers.catalog().latest_versions().len(), 1);
    }

    #[tokio::test]
    async fn invalid_documents_are_skipped() {
        let registry = registry();
        let triggers = CatalogTriggerManager::new(Arc::new(DefinitionCatalog::new()));
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        let broken = StoredDefinition {
            id: DefinitionId::new(),
            version: 1,
            tenant,
            document: json!({"name": "broken"}),
            retired_at: None,
        };

        let summary = sync_definitions(vec![broken], &registry, &triggers).await;
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.published, 0);
    }
}
