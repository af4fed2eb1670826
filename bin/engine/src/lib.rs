//! haulflow engine daemon.
//!
//! Wires the workflow runtime to Postgres, the TMS API and NATS:
//!
//! - **Config**: `EngineConfig` loaded from a file and the environment
//! - **Database**: the durable state store, definitions, read-only queries
//! - **TMS**: REST implementations of the integration ports

pub mod config;
pub mod db;
pub mod error;
pub mod tms;

pub use config::EngineConfig;
pub use error::DaemonError;
pub use tms::{TmsApi, TmsConfig};
