//! The engine facade used by the event bus and the daemon.

use crate::broker::{SignalBroker, SignalEnvelope, SignalOutcome};
use crate::definition::WorkflowDefinition;
use crate::error::EngineError;
use crate::instance::{StartRequest, WorkflowInstance};
use crate::record::StepRecord;
use crate::runtime::Runtime;
use crate::store::Created;
use crate::timer::TimerLoop;
use crate::wait::Signal;
use haulflow_core::{InstanceId, TenantScope};
use rootcause::prelude::Report;
use std::sync::Arc;
use tracing::{info, instrument};

/// Starts, signals, cancels and inspects instances.
#[derive(Clone)]
pub struct Engine {
    runtime: Arc<Runtime>,
    broker: SignalBroker,
}

impl Engine {
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let broker = SignalBroker::new(
            Arc::clone(runtime.store()),
            Arc::clone(runtime.clock()),
        );
        Self { runtime, broker }
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Starts an instance on the latest published version of a definition.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionNotFound` for an unknown definition,
    /// `TenantMismatch` if the tenant does not own it, or a store error.
    #[instrument(skip(self, request), fields(definition = %request.definition, tenant = %request.tenant))]
    pub async fn start_instance(&self, request: StartRequest) -> Result<Created, Report<EngineError>> {
        let definition = self
            .runtime
            .definitions()
            .latest(request.definition)
            .await
            .ok_or(EngineError::DefinitionNotFound {
                definition: request.definition,
            })?;
        if definition.tenant != request.tenant {
            return Err(EngineError::TenantMismatch.into());
        }
        self.start_with(&definition, request).await
    }

    /// Starts an instance pinned to `definition`.
    ///
    /// Idempotent on (definition, triggering event).
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn start_with(
        &self,
        definition: &WorkflowDefinition,
        request: StartRequest,
    ) -> Result<Created, Report<EngineError>> {
        let instance = WorkflowInstance::start(definition, request, self.runtime.clock().now());
        let created = self
            .runtime
            .store()
            .create_instance(instance)
            .await
            .map_err(EngineError::from)?;
        match created {
            Created::New(id) => info!(instance = %id, definition = definition.name(), "instance started"),
            Created::Duplicate(id) => info!(instance = %id, "instance already started for this event"),
        }
        Ok(created)
    }

    /// Resolves a wait from an external signal.
    ///
    /// # Errors
    ///
    /// Returns `TenantMismatch` if the tenant does not own the instance,
    /// `InvalidSignal` for a malformed approval payload, or a store error.
    #[instrument(skip(self, envelope), fields(instance = %envelope.instance, step = %envelope.step))]
    pub async fn signal(
        &self,
        tenant: &TenantScope,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, Report<EngineError>> {
        self.owned(tenant, envelope.instance).await?;
        let signal = envelope.into_signal()?;
        self.broker.deliver(signal).await
    }

    /// Resolves a wait with an already validated signal.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn deliver(&self, signal: Signal) -> Result<SignalOutcome, Report<EngineError>> {
        self.broker.deliver(signal).await
    }

    /// Cancels an instance and interrupts any handler running for it here.
    ///
    /// Returns false if the instance had already finished.
    ///
    /// # Errors
    ///
    /// Returns `TenantMismatch` or a store error.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        tenant: &TenantScope,
        instance: InstanceId,
        reason: &str,
    ) -> Result<bool, Report<EngineError>> {
        self.owned(tenant, instance).await?;
        let cancelled = self
            .runtime
            .store()
            .cancel_instance(instance, reason, self.runtime.clock().now())
            .await
            .map_err(EngineError::from)?;
        if cancelled {
            self.runtime.interrupt(instance);
            info!(%instance, reason, "instance cancelled");
        }
        Ok(cancelled)
    }

    /// Expires every due wait once. Returns how many were resolved.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn fire_due_timers(&self) -> Result<usize, Report<EngineError>> {
        let timers = TimerLoop::new(
            Arc::clone(self.runtime.store()),
            Arc::clone(self.runtime.clock()),
            self.runtime.config().timer_batch,
        );
        Ok(timers.tick().await.map_err(EngineError::from)?)
    }

    /// Loads an instance owned by `tenant`.
    ///
    /// # Errors
    ///
    /// Returns `TenantMismatch` or a store error.
    pub async fn instance(
        &self,
        tenant: &TenantScope,
        instance: InstanceId,
    ) -> Result<WorkflowInstance, Report<EngineError>> {
        self.owned(tenant, instance).await
    }

    /// The step records of an instance owned by `tenant`, in order.
    ///
    /// # Errors
    ///
    /// Returns `TenantMismatch` or a store error.
    pub async fn history(
        &self,
        tenant: &TenantScope,
        instance: InstanceId,
    ) -> Result<Vec<StepRecord>, Report<EngineError>> {
        self.owned(tenant, instance).await?;
        Ok(self
            .runtime
            .store()
            .step_records(instance)
            .await
            .map_err(EngineError::from)?)
    }

    async fn owned(
        &self,
        tenant: &TenantScope,
        instance: InstanceId,
    ) -> Result<WorkflowInstance, Report<EngineError>> {
        let snapshot = self
            .runtime
            .store()
            .load_instance(instance)
            .await
            .map_err(EngineError::from)?;
        if snapshot.instance.tenant != *tenant {
            return Err(EngineError::TenantMismatch.into());
        }
        Ok(snapshot.instance)
    }
}
