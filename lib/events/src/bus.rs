//! The event bus.
//!
//! Every ingested event is checked against trigger subscriptions, which
//! start new instances, and against event waits, which resume suspended
//! ones. The event id is marked processed only after both passes succeed,
//! so a failed ingest can be retried without double effects: instance
//! creation is idempotent per (definition, event) and an already resolved
//! wait simply reports `NotWaiting`.

use crate::config::BusConfig;
use crate::error::BusError;
use crate::event::DomainEvent;
use crate::manager::TriggerManager;
use chrono::{DateTime, Utc};
use haulflow_core::{InstanceId, TenantScope};
use haulflow_workflow::wait::event_match_key;
use haulflow_workflow::{
    Created, Engine, Env, Signal, SignalOutcome, StartRequest, WaitKind, WaitMatch,
    WaitResolution,
};
use rootcause::prelude::Report;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What ingesting one event did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ingested {
    /// The event id had been processed before; nothing was done.
    pub duplicate: bool,
    /// Instances created by matching triggers.
    pub started: Vec<InstanceId>,
    /// Trigger matches whose instance already existed.
    pub already_started: usize,
    /// Waits resolved with this event.
    pub resumed: usize,
}

/// Routes domain events to triggers and waits.
pub struct EventBus {
    engine: Engine,
    triggers: Arc<dyn TriggerManager>,
    config: BusConfig,
}

impl EventBus {
    #[must_use]
    pub fn new(engine: Engine, triggers: Arc<dyn TriggerManager>, config: BusConfig) -> Self {
        Self {
            engine,
            triggers,
            config,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Ingests one event. Processing the same event id twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a store error, or `StartFailed`/`DeliveryFailed` with the
    /// engine error as its cause. The event is then left unprocessed.
    #[instrument(skip(self, event), fields(event = %event.id, kind = %event.kind, tenant = %event.tenant))]
    pub async fn ingest(&self, event: &DomainEvent) -> Result<Ingested, Report<BusError>> {
        let store = self.engine.runtime().store();
        if store
            .is_event_processed(event.id)
            .await
            .map_err(BusError::from)?
        {
            debug!("event already processed");
            return Ok(Ingested {
                duplicate: true,
                ..Ingested::default()
            });
        }

        let now = self.engine.runtime().clock().now();
        let mut ingested = Ingested::default();
        self.fire_triggers(event, now, &mut ingested).await?;
        self.resume_waits(event, now, &mut ingested).await?;

        store
            .mark_event_processed(event.id, now)
            .await
            .map_err(BusError::from)?;
        debug!(
            started = ingested.started.len(),
            resumed = ingested.resumed,
            "event ingested"
        );
        Ok(ingested)
    }

    async fn fire_triggers(
        &self,
        event: &DomainEvent,
        now: DateTime<Utc>,
        ingested: &mut Ingested,
    ) -> Result<(), Report<BusError>> {
        for subscription in self.triggers.subscriptions(&event.tenant, &event.kind).await {
            let definition = subscription.definition_id();
            match subscription.matches(&event.payload, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(%definition, error = %e, "trigger predicate failed, treating as no match");
                    continue;
                }
            }
            let request = StartRequest::new(definition, event.tenant, event.payload.clone())
                .with_event(event.id);
            let created = self
                .engine
                .start_with(&subscription.definition, request)
                .await
                .map_err(|report| {
                    report.context(BusError::StartFailed {
                        definition,
                        event: event.id,
                    })
                })?;
            match created {
                Created::New(instance) => ingested.started.push(instance),
                Created::Duplicate(_) => ingested.already_started += 1,
            }
        }
        Ok(())
    }

    async fn resume_waits(
        &self,
        event: &DomainEvent,
        now: DateTime<Utc>,
        ingested: &mut Ingested,
    ) -> Result<(), Report<BusError>> {
        let key = event_match_key(&event.tenant, &event.kind);
        let waits = self
            .engine
            .runtime()
            .store()
            .find_waits_by_match(WaitKind::Event, &key)
            .await
            .map_err(BusError::from)?;

        for wait in waits {
            let WaitMatch::Event {
                predicate,
                bindings,
                ..
            } = &wait.matcher
            else {
                continue;
            };
            if let Some(predicate) = predicate {
                let env = Env::new(&event.payload, now).with_root("vars", bindings);
                match predicate.evaluate_bool(&env) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            instance = %wait.instance,
                            step = %wait.step,
                            error = %e,
                            "wait predicate failed, treating as no match"
                        );
                        continue;
                    }
                }
            }
            let signal = Signal {
                instance: wait.instance,
                step: wait.step.clone(),
                resolution: WaitResolution::Event {
                    payload: event.payload.clone(),
                    event_id: Some(event.id),
                },
            };
            let outcome = self
                .engine
                .deliver(signal)
                .await
                .map_err(|report| report.context(BusError::DeliveryFailed { event: event.id }))?;
            match outcome {
                SignalOutcome::Delivered => ingested.resumed += 1,
                SignalOutcome::NotWaiting => {
                    debug!(instance = %wait.instance, step = %wait.step, "wait resolved concurrently");
                }
            }
        }
        Ok(())
    }

    /// Ingests with the configured retries, logging the final failure.
    async fn ingest_with_retries(&self, event: &DomainEvent) {
        let attempts = self.config.ingest_attempts.max(1);
        for attempt in 1..=attempts {
            match self.ingest(event).await {
                Ok(_) => return,
                Err(report) if attempt < attempts => {
                    warn!(event = %event.id, attempt, error = %report, "ingest failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(report) => {
                    error!(event = %event.id, kind = %event.kind, error = %report, "dropping event");
                }
            }
        }
    }

    /// Starts one sequential ingest task per lane.
    ///
    /// Events of a tenant always land on the same lane, so a tenant's events
    /// are ingested in the order they were sent. Lanes stop when `shutdown`
    /// is cancelled or every [`LaneSender`] is dropped.
    #[must_use]
    pub fn spawn_lanes(
        self: &Arc<Self>,
        shutdown: &CancellationToken,
    ) -> (LaneSender, Vec<JoinHandle<()>>) {
        let count = self.config.lanes.max(1);
        let capacity = self.config.lane_capacity.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for lane in 0..count {
            let (tx, mut rx) = mpsc::channel::<DomainEvent>(capacity);
            senders.push(tx);
            let bus = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            bus.ingest_with_retries(&event).await;
                        }
                    }
                }
                debug!(lane, "event lane stopped");
            }));
        }
        info!(lanes = count, "event lanes started");

        (LaneSender { lanes: senders }, handles)
    }
}

/// Hands events to the lane owning their tenant.
#[derive(Debug, Clone)]
pub struct LaneSender {
    lanes: Vec<mpsc::Sender<DomainEvent>>,
}

impl LaneSender {
    /// Queues an event, waiting while its lane is full.
    ///
    /// # Errors
    ///
    /// Returns `LaneClosed` once the lanes have stopped.
    pub async fn send(&self, event: DomainEvent) -> Result<(), BusError> {
        let lane = self
            .lanes
            .get(lane_for(&event.tenant, self.lanes.len()))
            .ok_or(BusError::LaneClosed)?;
        lane.send(event).await.map_err(|_| BusError::LaneClosed)
    }
}

/// The lane index for a tenant.
#[must_use]
pub fn lane_for(tenant: &TenantScope, lanes: usize) -> usize {
    if lanes == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    tenant.hash(&mut hasher);
    let lanes = lanes as u64;
    usize::try_from(hasher.finish() % lanes).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haulflow_core::{BusinessUnitId, OrganizationId};

    #[test]
    fn a_tenant_always_maps_to_one_lane() {
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        let lane = lane_for(&tenant, 8);
        assert!(lane < 8);
        for _ in 0..10 {
            assert_eq!(lane_for(&tenant, 8), lane);
        }
        assert_eq!(lane_for(&tenant, 1), 0);
        assert_eq!(lane_for(&tenant, 0), 0);
    }

    #[test]
    fn tenants_spread_across_lanes() {
        let lanes: std::collections::HashSet<usize> = (0..64)
            .map(|_| TenantScope::new(OrganizationId::new(), BusinessUnitId::new()))
            .map(|tenant| lane_for(&tenant, 4))
            .collect();
        assert!(lanes.len() > 1);
    }
}
