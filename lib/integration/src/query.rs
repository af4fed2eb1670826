//! Read-only query port for `data.db_query`.

use crate::error::IntegrationError;
use async_trait::async_trait;
use haulflow_core::TenantScope;
use serde_json::{Map, Value as JsonValue};

pub type Row = Map<String, JsonValue>;

#[async_trait]
pub trait QueryService: Send + Sync {
    /// Runs one read-only statement scoped to the tenant.
    ///
    /// Implementations must execute inside a read-only transaction and cap
    /// the number of returned rows at `max_rows`.
    async fn read_only(
        &self,
        tenant: &TenantScope,
        statement: &str,
        params: &[JsonValue],
        max_rows: usize,
    ) -> Result<Vec<Row>, IntegrationError>;
}

/// Accepts a single `SELECT` or `WITH` statement and nothing else.
///
/// # Errors
///
/// Returns `Rejected` for empty, multi-statement, or data-modifying text.
pub fn ensure_read_only(statement: &str) -> Result<&str, IntegrationError> {
    let trimmed = statement.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(IntegrationError::rejected("query is empty"));
    }
    if trimmed.contains(';') {
        return Err(IntegrationError::rejected(
            "only a single statement is allowed",
        ));
    }

    let lowered = trimmed.to_ascii_lowercase();
    let first = lowered.split_whitespace().next().unwrap_or_default();
    if first != "select" && first != "with" {
        return Err(IntegrationError::rejected(
            "only SELECT or WITH queries are allowed",
        ));
    }

    const FORBIDDEN: [&str; 9] = [
        "insert", "update", "delete", "drop", "alter", "truncate", "create", "grant", "merge",
    ];
    let modifies = lowered
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| FORBIDDEN.contains(&word));
    if modifies {
        return Err(IntegrationError::rejected(
            "data-modifying keywords are not allowed",
        ));
    }

    Ok(trimmed)
}
