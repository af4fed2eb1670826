//! Published definitions.
//!
//! Instances are pinned to the definition version they started on, so the
//! catalog keeps every published version.

use crate::definition::WorkflowDefinition;
use async_trait::async_trait;
use haulflow_core::DefinitionId;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Read access to published definitions.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// A specific published version.
    async fn get(&self, id: DefinitionId, version: u32) -> Option<Arc<WorkflowDefinition>>;

    /// The highest published version.
    async fn latest(&self, id: DefinitionId) -> Option<Arc<WorkflowDefinition>>;
}

/// An in-memory [`DefinitionSource`].
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    definitions: RwLock<BTreeMap<(DefinitionId, u32), Arc<WorkflowDefinition>>>,
}

impl DefinitionCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition, replacing an identical (id, version).
    pub fn insert(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.insert(
                (definition.id, definition.version()),
                Arc::clone(&definition),
            );
        }
        definition
    }

    /// The latest version of every definition.
    #[must_use]
    pub fn latest_versions(&self) -> Vec<Arc<WorkflowDefinition>> {
        let Ok(definitions) = self.definitions.read() else {
            return Vec::new();
        };
        let mut latest: BTreeMap<DefinitionId, &Arc<WorkflowDefinition>> = BTreeMap::new();
        for ((id, _), definition) in definitions.iter() {
            latest.insert(*id, definition);
        }
        latest.into_values().cloned().collect()
    }

    fn lookup_latest(&self, id: DefinitionId) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().ok()?;
        definitions
            .range((id, 0)..=(id, u32::MAX))
            .next_back()
            .map(|(_, definition)| Arc::clone(definition))
    }
}

#[async_trait]
impl DefinitionSource for DefinitionCatalog {
    async fn get(&self, id: DefinitionId, version: u32) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .ok()?
            .get(&(id, version))
            .cloned()
    }

    async fn latest(&self, id: DefinitionId) -> Option<Arc<WorkflowDefinition>> {
        self.lookup_latest(id)
    }
}
