//! The execution context handed to action handlers.

use crate::handler::{HandlerError, HandlerErrorKind};
use crate::step::StepId;
use chrono::{DateTime, Utc};
use haulflow_core::{
    CorrelationId, DefinitionId, InstanceId, SharedClock, SystemClock, TenantScope, UserId, after,
};
use haulflow_integration::{ConcurrencyLimiter, IntegrationError};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything one handler invocation may see.
///
/// The variables are a read-only view: the instance's root variables
/// overlaid with the staged writes of every parallel branch the step runs in.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tenant: TenantScope,
    /// The user who started the instance, if any.
    pub user: Option<UserId>,
    pub definition: DefinitionId,
    pub instance: InstanceId,
    pub step: StepId,
    pub action: String,
    /// One-based attempt number.
    pub attempt: u32,
    pub correlation_id: CorrelationId,
    variables: JsonValue,
    config: JsonValue,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
    clock: SharedClock,
}

impl ExecutionContext {
    /// Creates a context for the first attempt with a default deadline.
    #[must_use]
    pub fn new(
        tenant: TenantScope,
        instance: InstanceId,
        step: impl Into<StepId>,
        config: JsonValue,
    ) -> Self {
        let clock = SystemClock::shared();
        let deadline = after(clock.now(), DEFAULT_STEP_TIMEOUT);
        Self {
            tenant,
            user: None,
            definition: DefinitionId::new(),
            instance,
            step: step.into(),
            action: String::new(),
            attempt: 1,
            correlation_id: CorrelationId::new(),
            variables: JsonValue::Object(serde_json::Map::new()),
            config,
            deadline,
            cancel: CancellationToken::new(),
            clock,
        }
    }

    #[must_use]
    pub fn with_definition(mut self, definition: DefinitionId) -> Self {
        self.definition = definition;
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: Option<UserId>) -> Self {
        self.user = user;
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_variables(mut self, variables: JsonValue) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// `"{instance}:{step}:{attempt}"`, passed to every mutating port call.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.instance, self.step, self.attempt)
    }

    #[must_use]
    pub fn variables(&self) -> &JsonValue {
        &self.variables
    }

    /// The resolved config as raw JSON.
    #[must_use]
    pub fn raw_config(&self) -> &JsonValue {
        &self.config
    }

    /// Deserializes the resolved config into the action's typed config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the config does not fit the type.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            HandlerError::invalid_input(format!("invalid config for {}: {e}", self.action))
        })
    }

    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Time left before the deadline, zero once it has passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.deadline - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs a port call, abandoning it when the step is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` on cancellation, otherwise the mapped port error.
    pub async fn call<T, F>(&self, call: F) -> Result<T, HandlerError>
    where
        F: Future<Output = Result<T, IntegrationError>>,
    {
        tokio::select! {
            () = self.cancel.cancelled() => Err(HandlerError::cancelled()),
            result = call => result.map_err(HandlerError::from),
        }
    }

    /// Waits for a concurrency permit within the deadline.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` on cancellation, `Timeout` if the deadline passes
    /// first, or `Upstream` if the limiter is closed.
    pub async fn acquire_permit(
        &self,
        limiter: &ConcurrencyLimiter,
    ) -> Result<OwnedSemaphorePermit, HandlerError> {
        let wait = tokio::time::timeout(self.remaining(), limiter.acquire(&self.action));
        tokio::select! {
            () = self.cancel.cancelled() => Err(HandlerError::cancelled()),
            result = wait => match result {
                Ok(permit) => permit.map_err(HandlerError::from),
                Err(_) => Err(HandlerError::new(
                    HandlerErrorKind::Timeout,
                    format!("no {} permit before the deadline", self.action),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haulflow_core::{BusinessUnitId, OrganizationId};
    use haulflow_integration::LimitConfig;
    use serde::Deserialize;
    use serde_json::json;

    fn context(config: JsonValue) -> ExecutionContext {
        let tenant = TenantScope::new(OrganizationId::new(), BusinessUnitId::new());
        ExecutionContext::new(tenant, InstanceId::new(), "notify", config)
            .with_action("notification.send_email")
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct EmailConfig {
        to: String,
    }

    #[test]
    fn idempotency_key_includes_attempt() {
        let ctx = context(json!({})).with_attempt(3);
        assert_eq!(
            ctx.idempotency_key(),
            format!("{}:notify:3", ctx.instance)
        );
    }

    #[test]
    fn typed_config_rejects_unknown_fields() {
        let ctx = context(json!({"to": "a@example.com", "cc": "b@example.com"}));
        let err = ctx.config::<EmailConfig>().unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);

        let ctx = context(json!({"to": "a@example.com"}));
        assert_eq!(ctx.config::<EmailConfig>().expect("config").to, "a@example.com");
    }

    #[tokio::test]
    async fn cancelled_call_returns_cancelled() {
        let ctx = context(json!({}));
        ctx.cancellation().cancel();
        let result = ctx
            .call(std::future::pending::<Result<(), IntegrationError>>())
            .await;
        assert_eq!(result.unwrap_err().kind, HandlerErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn permit_wait_honors_cancellation() {
        let limiter = ConcurrencyLimiter::new(
            LimitConfig::default().with_limit("notification.send_email", 1),
        );
        let ctx = context(json!({}));
        let _held = ctx.acquire_permit(&limiter).await.expect("first permit");
        ctx.cancellation().cancel();
        let err = ctx.acquire_permit(&limiter).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::Cancelled);
    }
}
