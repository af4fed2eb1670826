//! Wait deadlines.
//!
//! The timer loop scans for waits whose deadline has passed and resolves them
//! with a timeout through the same path as any other signal, so a wait that
//! is answered and timed out at the same moment resolves only once.

use crate::broker::{SignalBroker, SignalOutcome};
use crate::error::StoreError;
use crate::store::StateStore;
use haulflow_core::SharedClock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TimerLoop {
    store: Arc<dyn StateStore>,
    broker: SignalBroker,
    clock: SharedClock,
    batch: usize,
}

impl TimerLoop {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, clock: SharedClock, batch: usize) -> Self {
        Self {
            broker: SignalBroker::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            clock,
            batch,
        }
    }

    /// Expires every due wait. Returns how many were resolved.
    ///
    /// # Errors
    ///
    /// Returns the store error if the scan fails. Errors expiring a single
    /// wait are logged and left for the next tick.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let due = self.store.due_waits(self.clock.now(), self.batch).await?;
        let mut expired = 0;
        for wait in &due {
            match self.broker.expire(wait).await {
                Ok(SignalOutcome::Delivered) => {
                    debug!(instance = %wait.instance, step = %wait.step, "wait timed out");
                    expired += 1;
                }
                Ok(SignalOutcome::NotWaiting) => {}
                Err(e) => {
                    warn!(instance = %wait.instance, step = %wait.step, error = %e, "failed to expire wait");
                }
            }
        }
        Ok(expired)
    }

    /// Ticks every `interval` until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!("timer loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "due wait scan failed");
            }
        }
        info!("timer loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::tenant;
    use crate::cursor::Cursor;
    use crate::instance::{InstanceStatus, WorkflowInstance};
    use crate::step::StepId;
    use crate::store::MemoryStateStore;
    use crate::wait::{PendingWait, WaitMatch, WaitResolution};
    use chrono::Utc;
    use haulflow_core::{Clock, CorrelationId, DefinitionId, InstanceId, ManualClock};
    use serde_json::json;

    fn instance(id: InstanceId, now: chrono::DateTime<Utc>) -> WorkflowInstance {
        WorkflowInstance {
            id,
            definition: DefinitionId::new(),
            version: 1,
            tenant: tenant(),
            status: InstanceStatus::WaitingEvent,
            variables: json!({}),
            cursor: Cursor::start(StepId::from("wait")),
            trigger: json!({}),
            correlation_id: CorrelationId::new(),
            trigger_event: None,
            started_by: None,
            created_at: now,
            updated_at: now,
            deadline: None,
            ready_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn expires_only_due_waits() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let store = Arc::new(MemoryStateStore::new());
        let id = InstanceId::new();
        store.create_instance(instance(id, now)).await.expect("create");
        for (step, seconds) in [("soon", 10), ("later", 600)] {
            store
                .put_wait(PendingWait {
                    instance: id,
                    tenant: tenant(),
                    step: StepId::from(step),
                    matcher: WaitMatch::Timer,
                    match_key: "timer".to_string(),
                    created_at: now,
                    deadline: Some(now + chrono::Duration::seconds(seconds)),
                })
                .await
                .expect("put");
        }

        let timers = TimerLoop::new(store.clone(), clock.clone(), 10);
        assert_eq!(timers.tick().await.expect("tick"), 0);

        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(timers.tick().await.expect("tick"), 1);
        assert_eq!(timers.tick().await.expect("tick"), 0);

        let snapshot = store.load_instance(id).await.expect("load");
        assert_eq!(snapshot.inbox.len(), 1);
        assert_eq!(snapshot.inbox[0].step, StepId::from("soon"));
        assert_eq!(snapshot.inbox[0].resolution, WaitResolution::Timeout);
    }
}
