//! Event ingestion for haulflow.
//!
//! Domain events from the TMS start workflow instances through trigger
//! subscriptions and resume instances suspended in `wait_for_event` steps.
//!
//! - **Bus**: idempotent ingest plus per-tenant ordered lanes
//! - **Triggers**: publishing and retiring definitions
//! - **NATS**: the production event source

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod nats;
pub mod subscription;

pub use bus::{EventBus, Ingested, LaneSender, lane_for};
pub use config::{BusConfig, NatsConfig};
pub use error::{BusError, TriggerError};
pub use event::{DomainEvent, Envelope, TenantSignal, decode_event, decode_signal};
pub use manager::{CatalogTriggerManager, TriggerManager};
pub use nats::NatsEventSource;
pub use subscription::{Subscription, SubscriptionIndex};
