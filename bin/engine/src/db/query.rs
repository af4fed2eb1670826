//! Read-only queries for the `data.db_query` action.
//!
//! Statements run inside a `READ ONLY` transaction with a local statement
//! timeout. The tenant is exposed to row-level security policies through the
//! `haulflow.organization_id` and `haulflow.business_unit_id` settings.

use async_trait::async_trait;
use haulflow_core::TenantScope;
use haulflow_integration::{IntegrationError, QueryService, Row, ensure_read_only};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, instrument};

const SERVICE: &str = "database";
const QUERY_CANCELED: &str = "57014";

fn query_error(e: sqlx::Error) -> IntegrationError {
    match e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            IntegrationError::Timeout {
                service: SERVICE.to_string(),
            }
        }
        sqlx::Error::Database(db) => IntegrationError::rejected(db.message().to_string()),
        sqlx::Error::PoolTimedOut => IntegrationError::Timeout {
            service: SERVICE.to_string(),
        },
        other => IntegrationError::unavailable(SERVICE, other.to_string()),
    }
}

/// Wraps a statement so each row comes back as one JSON object.
fn wrap(statement: &str, max_rows: usize) -> String {
    format!("SELECT row_to_json(q)::jsonb AS row FROM ({statement}) AS q LIMIT {max_rows}")
}

/// [`QueryService`] over the engine's Postgres pool.
#[derive(Debug, Clone)]
pub struct PgQueryService {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgQueryService {
    #[must_use]
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }
}

#[async_trait]
impl QueryService for PgQueryService {
    #[instrument(skip(self, tenant, statement, params), fields(tenant = %tenant))]
    async fn read_only(
        &self,
        tenant: &TenantScope,
        statement: &str,
        params: &[JsonValue],
        max_rows: usize,
    ) -> Result<Vec<Row>, IntegrationError> {
        let statement = ensure_read_only(statement)?;
        let mut tx = self.pool.begin().await.map_err(query_error)?;

        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        sqlx::query(
            "SELECT set_config('statement_timeout', $1, true), \
                    set_config('haulflow.organization_id', $2, true), \
                    set_config('haulflow.business_unit_id', $3, true)",
        )
        .bind(format!("{}ms", self.statement_timeout.as_millis()))
        .bind(tenant.organization.to_string())
        .bind(tenant.business_unit.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        let wrapped = wrap(statement, max_rows);
        let mut query = sqlx::query_scalar::<_, JsonValue>(&wrapped);
        for param in params {
            query = match param {
                JsonValue::Null => query.bind(None::<String>),
                JsonValue::Bool(b) => query.bind(*b),
                JsonValue::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                JsonValue::String(s) => query.bind(s.clone()),
                other => query.bind(other.clone()),
            };
        }
        let values = query.fetch_all(&mut *tx).await.map_err(query_error)?;
        tx.rollback().await.map_err(query_error)?;

        debug!(rows = values.len(), "read-only query finished");
        values
            .into_iter()
            .map(|value| match value {
                JsonValue::Object(row) => Ok(row),
                other => Err(IntegrationError::unavailable(
                    SERVICE,
                    format!("expected a row object, got {other}"),
                )),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_wrapped_and_capped() {
        assert_eq!(
            wrap("SELECT id FROM shipments", 50),
            "SELECT row_to_json(q)::jsonb AS row FROM (SELECT id FROM shipments) AS q LIMIT 50"
        );
    }

    #[test]
    fn pool_timeouts_are_reported_as_timeouts() {
        assert_eq!(
            query_error(sqlx::Error::PoolTimedOut),
            IntegrationError::Timeout {
                service: "database".to_string()
            }
        );
        assert!(matches!(
            query_error(sqlx::Error::RowNotFound),
            IntegrationError::Unavailable { .. }
        ));
    }
}
