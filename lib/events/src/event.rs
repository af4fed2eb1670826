//! Domain events and their wire envelope.
//!
//! Events arrive wrapped in a versioned envelope so the payload schema can
//! evolve across rolling deployments:
//!
//! ```json
//! {"version": 1, "payload": {"id": "…", "kind": "shipment.created", "tenant": {…}, …}}
//! ```
//!
//! Approval decisions and other external signals use the same envelope
//! around a [`TenantSignal`].

use crate::error::BusError;
use chrono::{DateTime, Utc};
use haulflow_core::{EventId, TenantScope};
use haulflow_workflow::SignalEnvelope;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// Something that happened in the TMS, e.g. a shipment was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Idempotency key; an id is processed at most once.
    pub id: EventId,
    pub kind: String,
    pub tenant: TenantScope,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl DomainEvent {
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        tenant: TenantScope,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: EventId::new(),
            kind: kind.into(),
            tenant,
            occurred_at,
            payload,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }
}

/// A versioned envelope around serialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A signal addressed to an instance of `tenant`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSignal {
    pub tenant: TenantScope,
    #[serde(flatten)]
    pub signal: SignalEnvelope,
}

/// Decodes an enveloped payload, checking the version before the payload.
fn decode_enveloped<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    let raw: Envelope<JsonValue> =
        serde_json::from_slice(bytes).map_err(|e| BusError::Decode {
            reason: e.to_string(),
        })?;
    if raw.version != CURRENT_VERSION {
        return Err(BusError::UnsupportedVersion {
            version: raw.version,
        });
    }
    serde_json::from_value(raw.payload).map_err(|e| BusError::Decode {
        reason: e.to_string(),
    })
}

/// Decodes an enveloped event.
///
/// # Errors
///
/// Returns `UnsupportedVersion` for envelopes from a newer schema and
/// `Decode` for malformed JSON.
pub fn decode_event(bytes: &[u8]) -> Result<DomainEvent, BusError> {
    decode_enveloped(bytes)
}

/// Decodes an enveloped signal.
///
/// # Errors
///
/// Same as [`decode_event`].
pub fn decode_signal(bytes: &[u8]) -> Result<TenantSignal, BusError> {
    decode_enveloped(bytes)
}
