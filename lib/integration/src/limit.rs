//! Per-action concurrency limits.
//!
//! Handlers that call external services take a permit before calling out so
//! one busy workflow cannot saturate an upstream. Limits are keyed by action
//! name; actions without an explicit entry share the default size.

use crate::error::IntegrationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

fn default_permits() -> usize {
    16
}

/// Concurrency limit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Permits for actions without an explicit entry.
    #[serde(default = "default_permits")]
    pub default_permits: usize,
    /// Permits per action name, e.g. `data.api_call = 4`.
    #[serde(default)]
    pub per_action: HashMap<String, usize>,
}

impl LimitConfig {
    #[must_use]
    pub fn with_limit(mut self, action: impl Into<String>, permits: usize) -> Self {
        self.per_action.insert(action.into(), permits);
        self
    }

    fn permits_for(&self, action: &str) -> usize {
        self.per_action
            .get(action)
            .copied()
            .unwrap_or(self.default_permits)
            .max(1)
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            default_permits: default_permits(),
            per_action: HashMap::new(),
        }
    }
}

/// Hands out permits per action name.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    config: LimitConfig,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

fn poisoned<E>(_: E) -> IntegrationError {
    IntegrationError::unavailable("limiter", "lock poisoned")
}

impl ConcurrencyLimiter {
    #[must_use]
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    fn semaphore(&self, action: &str) -> Result<Arc<Semaphore>, IntegrationError> {
        if let Some(existing) = self.semaphores.read().map_err(poisoned)?.get(action) {
            return Ok(Arc::clone(existing));
        }

        let mut semaphores = self.semaphores.write().map_err(poisoned)?;
        let semaphore = semaphores
            .entry(action.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.permits_for(action))));
        Ok(Arc::clone(semaphore))
    }

    /// Waits for a permit. The permit is released when dropped.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the limiter can no longer hand out permits.
    pub async fn acquire(&self, action: &str) -> Result<OwnedSemaphorePermit, IntegrationError> {
        self.semaphore(action)?
            .acquire_owned()
            .await
            .map_err(|e| IntegrationError::unavailable(action.to_string(), e.to_string()))
    }

    /// Number of permits currently free for the action.
    #[must_use]
    pub fn available(&self, action: &str) -> usize {
        self.semaphore(action)
            .map(|semaphore| semaphore.available_permits())
            .unwrap_or(0)
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(LimitConfig::default())
    }
}
