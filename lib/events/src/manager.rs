//! Trigger manager.
//!
//! Publishing a definition makes it visible to the runtime and subscribes
//! it to its trigger's event kind; retiring it stops new instances while
//! instances already pinned to it keep running.

use crate::error::TriggerError;
use crate::subscription::{Subscription, SubscriptionIndex};
use async_trait::async_trait;
use haulflow_core::{DefinitionId, TenantScope};
use haulflow_workflow::{DefinitionCatalog, DefinitionSource, WorkflowDefinition};
use std::sync::Arc;
use tracing::info;

/// Trait for trigger storage and lookup.
#[async_trait]
pub trait TriggerManager: Send + Sync {
    /// Publishes a definition and (re)subscribes it.
    async fn publish(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, TriggerError>;

    /// Stops a definition from starting new instances.
    async fn retire(&self, definition: DefinitionId) -> Result<(), TriggerError>;

    /// Finds the subscriptions of `tenant` to `event_kind`.
    async fn subscriptions(&self, tenant: &TenantScope, event_kind: &str) -> Vec<Subscription>;
}

/// A [`TriggerManager`] over the in-process definition catalog.
#[derive(Debug, Clone)]
pub struct CatalogTriggerManager {
    catalog: Arc<DefinitionCatalog>,
    index: Arc<SubscriptionIndex>,
}

impl CatalogTriggerManager {
    /// Subscribes the latest version of every definition already in `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<DefinitionCatalog>) -> Self {
        let index = Arc::new(SubscriptionIndex::new());
        index.rebuild(catalog.latest_versions());
        Self { catalog, index }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<DefinitionCatalog> {
        &self.catalog
    }

    #[must_use]
    pub fn index(&self) -> &SubscriptionIndex {
        &self.index
    }
}

#[async_trait]
impl TriggerManager for CatalogTriggerManager {
    async fn publish(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, TriggerError> {
        let id = definition.id;
        self.catalog.insert(definition);
        let latest = self
            .catalog
            .latest(id)
            .await
            .ok_or(TriggerError::NotFound { definition: id })?;
        info!(
            definition = %id,
            version = latest.version(),
            event_kind = %latest.trigger().event_kind,
            "definition published"
        );
        self.index.upsert(Arc::clone(&latest));
        Ok(latest)
    }

    async fn retire(&self, definition: DefinitionId) -> Result<(), TriggerError> {
        if self.index.remove(definition) {
            info!(%definition, "definition retired");
            Ok(())
        } else {
            Err(TriggerError::NotFound { definition })
        }
    }

    async fn subscriptions(&self, tenant: &TenantScope, event_kind: &str) -> Vec<Subscription> {
        self.index.lookup(tenant, event_kind)
    }
}
