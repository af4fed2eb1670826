//! Worker loops.
//!
//! Every worker is identical: it claims due instances from the store, advances
//! each one while holding its lease, and releases it. Several workers, in one
//! process or many, share the store and never advance the same instance at
//! once because claims are exclusive until the lease expires.

use crate::error::StoreError;
use crate::runtime::Runtime;
use futures::future::join_all;
use haulflow_core::WorkerId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A worker loop over a shared [`Runtime`].
pub struct Worker {
    id: WorkerId,
    runtime: Arc<Runtime>,
}

impl Worker {
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            id: WorkerId::new(),
            runtime,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Claims one batch and advances every claimed instance.
    ///
    /// Returns the number of instances claimed. Failures advancing a single
    /// instance are logged; its lease then expires and another claim retries.
    ///
    /// # Errors
    ///
    /// Returns the store error if claiming fails.
    #[instrument(skip(self), fields(worker = %self.id))]
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let config = self.runtime.config();
        let now = self.runtime.clock().now();
        let claimed = self
            .runtime
            .store()
            .claim_ready(self.id, config.claim_batch, now, config.lease_ttl())
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(count = claimed.len(), "claimed instances");

        let outcomes = join_all(
            claimed
                .iter()
                .map(|instance| self.runtime.advance(*instance, self.id)),
        )
        .await;
        for (instance, outcome) in claimed.iter().zip(outcomes) {
            if let Err(e) = outcome {
                error!(%instance, error = %e, "failed to advance instance");
            }
        }
        Ok(claimed.len())
    }

    /// Polls until `shutdown` fires, sleeping between empty polls.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.id, "worker started");
        let idle = self.runtime.config().poll_interval();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let pause = match self.run_once().await {
                Ok(0) => idle,
                Ok(_) => continue,
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "claim failed");
                    idle
                }
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }
        info!(worker = %self.id, "worker stopped");
    }
}
