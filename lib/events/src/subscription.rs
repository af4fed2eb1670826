//! Trigger subscriptions indexed by (tenant, event kind).

use chrono::{DateTime, Utc};
use haulflow_core::{DefinitionId, SubscriptionId, TenantScope};
use haulflow_workflow::{Env, EvalError, Expression, WorkflowDefinition};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A published definition listening for one event kind.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant: TenantScope,
    pub event_kind: String,
    pub predicate: Option<Expression>,
    /// The version new instances are pinned to.
    pub definition: Arc<WorkflowDefinition>,
}

impl Subscription {
    #[must_use]
    pub fn for_definition(definition: Arc<WorkflowDefinition>) -> Self {
        let trigger = definition.trigger();
        Self {
            id: SubscriptionId::new(),
            tenant: definition.tenant,
            event_kind: trigger.event_kind.clone(),
            predicate: trigger.predicate.clone(),
            definition,
        }
    }

    #[must_use]
    pub fn definition_id(&self) -> DefinitionId {
        self.definition.id
    }

    /// Evaluates the predicate with `$.` bound to the event payload.
    ///
    /// A subscription without a predicate matches every event of its kind.
    ///
    /// # Errors
    ///
    /// Returns the evaluation error; callers treat it as a non-match.
    pub fn matches(&self, payload: &JsonValue, now: DateTime<Utc>) -> Result<bool, EvalError> {
        match &self.predicate {
            None => Ok(true),
            Some(predicate) => predicate.evaluate_bool(&Env::new(payload, now)),
        }
    }
}

type Key = (TenantScope, String);

/// In-memory index of subscriptions. One subscription per definition id.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    by_kind: RwLock<HashMap<Key, Vec<Subscription>>>,
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever `definition.id` subscribed to with its new trigger.
    pub fn upsert(&self, definition: Arc<WorkflowDefinition>) {
        let subscription = Subscription::for_definition(definition);
        let Ok(mut index) = self.by_kind.write() else {
            return;
        };
        remove_definition(&mut index, subscription.definition_id());
        index
            .entry((subscription.tenant, subscription.event_kind.clone()))
            .or_default()
            .push(subscription);
    }

    /// Drops the subscription of a definition. Returns whether one existed.
    pub fn remove(&self, definition: DefinitionId) -> bool {
        self.by_kind
            .write()
            .is_ok_and(|mut index| remove_definition(&mut index, definition))
    }

    /// Rebuilds the index from scratch.
    pub fn rebuild(&self, definitions: impl IntoIterator<Item = Arc<WorkflowDefinition>>) {
        let mut fresh: HashMap<Key, Vec<Subscription>> = HashMap::new();
        for definition in definitions {
            let subscription = Subscription::for_definition(definition);
            fresh
                .entry((subscription.tenant, subscription.event_kind.clone()))
                .or_default()
                .push(subscription);
        }
        if let Ok(mut index) = self.by_kind.write() {
            *index = fresh;
        }
    }

    /// Subscriptions of `tenant` to `event_kind`.
    #[must_use]
    pub fn lookup(&self, tenant: &TenantScope, event_kind: &str) -> Vec<Subscription> {
        let Ok(index) = self.by_kind.read() else {
            return Vec::new();
        };
        index
            .get(&(*tenant, event_kind.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_kind
            .read()
            .map(|index| index.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_definition(index: &mut HashMap<Key, Vec<Subscription>>, definition: DefinitionId) -> bool {
    let mut removed = false;
    index.retain(|_, subscriptions| {
        let before = subscriptions.len();
        subscriptions.retain(|s| s.definition_id() != definition);
        removed |= subscriptions.len() != before;
        !subscriptions.is_empty()
    });
    removed
}
