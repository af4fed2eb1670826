//! Core domain types and utilities for the haulflow workflow engine.
//!
//! This crate provides the identifiers, tenant scoping, clocks, and the
//! error-handling foundation shared by every other haulflow crate.

pub mod clock;
pub mod error;
pub mod id;
pub mod tenant;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, after};
pub use error::Result;
pub use id::{
    ApprovalRequestId, BusinessUnitId, CorrelationId, DefinitionId, EventId, InstanceId,
    OrganizationId, ParseIdError, SubscriptionId, UserId, WorkerId,
};
pub use tenant::TenantScope;
