//! Strongly-typed identifiers for engine entities.
//!
//! All IDs are ULIDs drawn from one process-wide monotonic generator, so two
//! identifiers created in sequence always compare in creation order, even
//! within the same millisecond.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};
use ulid::{Generator, Ulid};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Returns the next ULID from the process-wide monotonic generator.
///
/// Falls back to a fresh random ULID if the generator is poisoned or its
/// random component overflows within one millisecond.
#[must_use]
pub fn next_ulid() -> Ulid {
    GENERATOR
        .lock()
        .ok()
        .and_then(|mut generator| generator.generate().ok())
        .unwrap_or_else(Ulid::new)
}

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID from the monotonic generator.
            #[must_use]
            pub fn new() -> Self {
                Self(next_ulid())
            }

            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let ulid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of a carrier organization (the top-level tenant).
    OrganizationId,
    "org"
);

define_id!(
    /// Identifier of a business unit within an organization.
    BusinessUnitId,
    "bu"
);

define_id!(
    /// Identifier of a user.
    UserId,
    "usr"
);

define_id!(
    /// Identifier of a published workflow definition.
    DefinitionId,
    "wfd"
);

define_id!(
    /// Identifier of a workflow instance.
    InstanceId,
    "wfi"
);

define_id!(
    /// Identifier of an ingested domain event.
    EventId,
    "evt"
);

define_id!(
    /// Identifier linking an instance to the request or event that caused it.
    CorrelationId,
    "cor"
);

define_id!(
    /// Identifier of an approval request raised by an approval step.
    ApprovalRequestId,
    "apr"
);

define_id!(
    /// Identifier of a trigger subscription.
    SubscriptionId,
    "sub"
);

define_id!(
    /// Identifier of a worker holding instance leases.
    WorkerId,
    "wrk"
);
