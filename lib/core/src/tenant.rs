//! Tenant scoping.

use crate::id::{BusinessUnitId, OrganizationId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The (organization, business unit) pair that isolates definitions, events,
/// and instances from one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    pub organization: OrganizationId,
    pub business_unit: BusinessUnitId,
}

impl TenantScope {
    #[must_use]
    pub const fn new(organization: OrganizationId, business_unit: BusinessUnitId) -> Self {
        Self {
            organization,
            business_unit,
        }
    }

    /// Stable key used to index per-tenant data, e.g. `org_…:bu_…`.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.organization, self.business_unit)
    }
}
