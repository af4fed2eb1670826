//! External signals: event payloads and approval decisions addressed to a
//! suspended step.
//!
//! The broker validates an envelope, turns it into a [`Signal`] and hands it
//! to the store, which resolves the wait at most once.

use crate::error::{EngineError, StoreError};
use crate::step::StepId;
use crate::store::StateStore;
use crate::wait::{PendingWait, Signal, WaitResolution};
use haulflow_core::{InstanceId, SharedClock, UserId};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Event,
    Approval,
}

/// A signal as received from outside the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub instance: InstanceId,
    pub step: StepId,
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<UserId>,
}

impl SignalEnvelope {
    /// Validates the payload for its kind.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSignal` when an approval payload carries no decision.
    pub fn into_signal(self) -> Result<Signal, EngineError> {
        let resolution = match self.kind {
            SignalKind::Event => WaitResolution::Event {
                payload: self.payload,
                event_id: None,
            },
            SignalKind::Approval => WaitResolution::Approval {
                approved: approval_decision(&self.payload)?,
                decided_by: self.decided_by,
                comment: self
                    .payload
                    .get("comment")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
            },
        };
        Ok(Signal {
            instance: self.instance,
            step: self.step,
            resolution,
        })
    }
}

/// Reads `decision: "approved" | "rejected"` or `approved: bool`.
fn approval_decision(payload: &JsonValue) -> Result<bool, EngineError> {
    if let Some(decision) = payload.get("decision") {
        return match decision.as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("approved") => Ok(true),
            Some("rejected") => Ok(false),
            _ => Err(EngineError::InvalidSignal {
                reason: format!("unknown approval decision {decision}"),
            }),
        };
    }
    payload
        .get("approved")
        .and_then(JsonValue::as_bool)
        .ok_or_else(|| EngineError::InvalidSignal {
            reason: "approval payload needs 'decision' or 'approved'".to_string(),
        })
}

/// What happened to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The wait was resolved; the instance will resume.
    Delivered,
    /// No wait of that kind was pending, for example because it was already
    /// resolved or timed out.
    NotWaiting,
}

/// Hands signals to the state store.
#[derive(Clone)]
pub struct SignalBroker {
    store: Arc<dyn StateStore>,
    clock: SharedClock,
}

impl SignalBroker {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Resolves a wait.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delivery could not be persisted.
    #[instrument(skip(self, signal), fields(instance = %signal.instance, step = %signal.step))]
    pub async fn deliver(&self, signal: Signal) -> Result<SignalOutcome, Report<EngineError>> {
        let delivered = self
            .store
            .deliver_signal(signal, self.clock.now())
            .await
            .map_err(EngineError::from)?;
        debug!(delivered, "signal handed to store");
        Ok(if delivered {
            SignalOutcome::Delivered
        } else {
            SignalOutcome::NotWaiting
        })
    }

    /// Resolves an expired wait with a timeout.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn expire(&self, wait: &PendingWait) -> Result<SignalOutcome, StoreError> {
        let signal = Signal {
            instance: wait.instance,
            step: wait.step.clone(),
            resolution: WaitResolution::Timeout,
        };
        let delivered = self.store.deliver_signal(signal, self.clock.now()).await?;
        Ok(if delivered {
            SignalOutcome::Delivered
        } else {
            SignalOutcome::NotWaiting
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: SignalKind, payload: JsonValue) -> SignalEnvelope {
        SignalEnvelope {
            instance: InstanceId::new(),
            step: StepId::from("approve"),
            kind,
            payload,
            decided_by: None,
        }
    }

    #[test]
    fn approval_accepts_decision_or_flag() {
        let signal = envelope(
            SignalKind::Approval,
            json!({"decision": "Rejected", "comment": "rate too high"}),
        )
        .into_signal()
        .expect("valid");
        assert_eq!(
            signal.resolution,
            WaitResolution::Approval {
                approved: false,
                decided_by: None,
                comment: Some("rate too high".to_string()),
            }
        );

        let signal = envelope(SignalKind::Approval, json!({"approved": true}))
            .into_signal()
            .expect("valid");
        assert!(matches!(
            signal.resolution,
            WaitResolution::Approval { approved: true, .. }
        ));
    }

    #[test]
    fn approval_without_decision_is_rejected() {
        let err = envelope(SignalKind::Approval, json!({"comment": "ok"}))
            .into_signal()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignal { .. }));

        let err = envelope(SignalKind::Approval, json!({"decision": "maybe"}))
            .into_signal()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignal { .. }));
    }

    #[test]
    fn envelope_deserializes() {
        let envelope: SignalEnvelope = serde_json::from_value(json!({
            "instance": InstanceId::new(),
            "step": "wait_pod",
            "kind": "event",
            "payload": {"document_type": "pod"}
        }))
        .expect("deserialize");
        let signal = envelope.into_signal().expect("valid");
        assert!(matches!(signal.resolution, WaitResolution::Event { .. }));
    }
}
