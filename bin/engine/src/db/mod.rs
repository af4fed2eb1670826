//! Postgres persistence for the engine daemon.
//!
//! This module provides:
//! - The durable [`StateStore`](haulflow_workflow::StateStore)
//! - Loading of published workflow definitions
//! - The read-only query port used by `data.db_query`

pub mod definitions;
pub mod query;
pub mod state;

pub use definitions::{DefinitionRepository, StoredDefinition, SyncSummary, sync_definitions};
pub use query::PgQueryService;
pub use state::PgStateStore;
