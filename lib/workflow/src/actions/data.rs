//! Data actions: in-process transforms, outbound API calls and read-only
//! queries.

use super::non_empty;
use crate::context::ExecutionContext;
use crate::error::RegistryError;
use crate::handler::{ActionHandler, HandlerError, HandlerErrorKind};
use crate::registry::{ActionRegistry, ConfigSchema, FieldType};
use async_trait::async_trait;
use haulflow_integration::{
    ConcurrencyLimiter, HttpClient, HttpMethod, HttpRequest, HttpResponse, Ports, QueryService,
    ensure_read_only,
};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on rows returned by `data.db_query`.
pub const MAX_QUERY_ROWS: usize = 1000;

pub(crate) fn register(
    registry: &mut ActionRegistry,
    ports: &Ports,
    limiter: &Arc<ConcurrencyLimiter>,
) -> Result<(), RegistryError> {
    registry.register(
        "data.transform",
        ConfigSchema::new()
            .required("input", FieldType::Any)
            .required(
                "operation",
                FieldType::one_of(TransformOp::ALL.iter().map(|op| op.as_str())),
            )
            .optional("fields", FieldType::Array),
        Arc::new(Transform),
    )?;
    registry.register(
        "data.api_call",
        ConfigSchema::new()
            .required("url", FieldType::String)
            .optional(
                "method",
                FieldType::one_of(["GET", "POST", "PUT", "PATCH", "DELETE"]),
            )
            .optional("headers", FieldType::Object)
            .optional("body", FieldType::Any),
        Arc::new(ApiCall {
            http: Arc::clone(&ports.http),
            limiter: Arc::clone(limiter),
        }),
    )?;
    registry.register(
        "data.db_query",
        ConfigSchema::new()
            .required("query", FieldType::String)
            .optional("params", FieldType::Array),
        Arc::new(DbQuery {
            queries: Arc::clone(&ports.queries),
            limiter: Arc::clone(limiter),
        }),
    )
}

/// Maps a non-2xx response onto a handler error.
///
/// 404 is `NotFound`, 409 is `Conflict`, 429 and 5xx are `Upstream`, and any
/// other 4xx is `InvalidInput`.
pub(crate) fn check_status(url: &str, response: &HttpResponse) -> Result<(), HandlerError> {
    let kind = match response.status {
        status if status < 400 => return Ok(()),
        404 => HandlerErrorKind::NotFound,
        409 => HandlerErrorKind::Conflict,
        429 => HandlerErrorKind::Upstream,
        status if status >= 500 => HandlerErrorKind::Upstream,
        _ => HandlerErrorKind::InvalidInput,
    };
    Err(HandlerError::new(
        kind,
        format!("{url} answered {}: {}", response.status, response.body),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TransformOp {
    Uppercase,
    Lowercase,
    Trim,
    Pick,
    Omit,
    Length,
}

impl TransformOp {
    const ALL: [Self; 6] = [
        Self::Uppercase,
        Self::Lowercase,
        Self::Trim,
        Self::Pick,
        Self::Omit,
        Self::Length,
    ];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Uppercase => "uppercase",
            Self::Lowercase => "lowercase",
            Self::Trim => "trim",
            Self::Pick => "pick",
            Self::Omit => "omit",
            Self::Length => "length",
        }
    }

    fn map_str(self, value: &str) -> String {
        match self {
            Self::Uppercase => value.to_uppercase(),
            Self::Lowercase => value.to_lowercase(),
            _ => value.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TransformConfig {
    input: JsonValue,
    operation: TransformOp,
    fields: Option<Vec<String>>,
}

/// Applies a string operation to every string in `value`.
///
/// With `fields`, only those keys of a top-level object are touched.
fn map_strings(op: TransformOp, value: JsonValue, fields: Option<&[String]>) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(op.map_str(&s)),
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| map_strings(op, item, None))
            .collect(),
        JsonValue::Object(map) => map
            .into_iter()
            .map(|(key, item)| {
                let selected = fields.is_none_or(|f| f.iter().any(|name| *name == key));
                let item = if selected {
                    map_strings(op, item, None)
                } else {
                    item
                };
                (key, item)
            })
            .collect::<Map<_, _>>()
            .into(),
        other => other,
    }
}

fn transform(config: TransformConfig) -> Result<JsonValue, HandlerError> {
    let TransformConfig {
        input,
        operation,
        fields,
    } = config;
    match operation {
        TransformOp::Uppercase | TransformOp::Lowercase | TransformOp::Trim => {
            Ok(map_strings(operation, input, fields.as_deref()))
        }
        TransformOp::Pick | TransformOp::Omit => {
            let Some(fields) = fields else {
                return Err(HandlerError::invalid_input(format!(
                    "{} needs fields",
                    operation.as_str()
                )));
            };
            let JsonValue::Object(map) = input else {
                return Err(HandlerError::invalid_input(format!(
                    "{} needs an object input",
                    operation.as_str()
                )));
            };
            let keep = operation == TransformOp::Pick;
            Ok(map
                .into_iter()
                .filter(|(key, _)| fields.contains(key) == keep)
                .collect::<Map<_, _>>()
                .into())
        }
        TransformOp::Length => match input {
            JsonValue::String(s) => Ok(json!(s.chars().count())),
            JsonValue::Array(items) => Ok(json!(items.len())),
            JsonValue::Object(map) => Ok(json!(map.len())),
            other => Err(HandlerError::invalid_input(format!(
                "length is undefined for {other}"
            ))),
        },
    }
}

struct Transform;

#[async_trait]
impl ActionHandler for Transform {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: TransformConfig = ctx.config()?;
        Ok(json!({ "result": transform(config)? }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApiCallConfig {
    url: String,
    #[serde(default)]
    method: HttpMethod,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    body: Option<JsonValue>,
}

struct ApiCall {
    http: Arc<dyn HttpClient>,
    limiter: Arc<ConcurrencyLimiter>,
}

#[async_trait]
impl ActionHandler for ApiCall {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: ApiCallConfig = ctx.config()?;
        let url = non_empty("url", &config.url)?;

        let _permit = ctx.acquire_permit(&self.limiter).await?;
        let mut request = HttpRequest::new(config.method, url).with_timeout(ctx.remaining());
        if config.method != HttpMethod::Get {
            request = request.with_idempotency_key(ctx.idempotency_key());
        }
        if let Some(body) = config.body {
            request = request.with_body(body);
        }
        for (name, value) in config.headers {
            request = request.with_header(name, value);
        }

        let response = ctx.call(self.http.send(request)).await?;
        debug!(
            instance = %ctx.instance,
            attempt = ctx.attempt,
            status = response.status,
            "api call answered"
        );
        check_status(url, &response)?;
        Ok(json!({
            "status_code": response.status,
            "response": response.body,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DbQueryConfig {
    query: String,
    #[serde(default)]
    params: Vec<JsonValue>,
}

struct DbQuery {
    queries: Arc<dyn QueryService>,
    limiter: Arc<ConcurrencyLimiter>,
}

#[async_trait]
impl ActionHandler for DbQuery {
    async fn invoke(&self, ctx: &ExecutionContext) -> Result<JsonValue, HandlerError> {
        let config: DbQueryConfig = ctx.config()?;
        let statement = ensure_read_only(&config.query)?;

        let _permit = ctx.acquire_permit(&self.limiter).await?;
        let rows = ctx
            .call(
                self.queries
                    .read_only(&ctx.tenant, statement, &config.params, MAX_QUERY_ROWS),
            )
            .await?;
        Ok(json!({
            "count": rows.len(),
            "rows": rows,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{context, tenant};
    use haulflow_integration::memory::{ScriptedHttpClient, StaticQueries};

    fn api_call(http: Arc<ScriptedHttpClient>) -> ApiCall {
        ApiCall {
            http,
            limiter: Arc::new(ConcurrencyLimiter::default()),
        }
    }

    #[test]
    fn status_mapping_follows_http_semantics() {
        let kind = |status| {
            check_status("u", &HttpResponse {
                status,
                body: JsonValue::Null,
            })
            .err()
            .map(|e| e.kind)
        };
        assert_eq!(kind(200), None);
        assert_eq!(kind(404), Some(HandlerErrorKind::NotFound));
        assert_eq!(kind(409), Some(HandlerErrorKind::Conflict));
        assert_eq!(kind(429), Some(HandlerErrorKind::Upstream));
        assert_eq!(kind(502), Some(HandlerErrorKind::Upstream));
        assert_eq!(kind(422), Some(HandlerErrorKind::InvalidInput));
    }

    #[test]
    fn transforms_reshape_values() {
        let run = |config: JsonValue| {
            transform(serde_json::from_value(config).expect("config"))
        };
        assert_eq!(
            run(json!({"input": {"a": "x", "b": "y"}, "operation": "uppercase", "fields": ["a"]}))
                .expect("uppercase"),
            json!({"a": "X", "b": "y"})
        );
        assert_eq!(
            run(json!({"input": {"a": 1, "b": 2, "c": 3}, "operation": "omit", "fields": ["b"]}))
                .expect("omit"),
            json!({"a": 1, "c": 3})
        );
        assert_eq!(
            run(json!({"input": [" a ", "b "], "operation": "trim"})).expect("trim"),
            json!(["a", "b"])
        );
        assert_eq!(
            run(json!({"input": [1, 2, 3], "operation": "length"})).expect("length"),
            json!(3)
        );
        let err = run(json!({"input": "x", "operation": "pick"})).unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn api_call_returns_status_and_body() {
        let http = Arc::new(ScriptedHttpClient::default());
        http.push_status(200, json!({"rate": 1250}));
        let ctx = context(
            tenant(),
            "data.api_call",
            json!({"url": "https://rates.example.com/quote", "method": "POST", "body": {"lane": "A-B"}}),
        );

        let result = api_call(http.clone()).invoke(&ctx).await.expect("invoke");
        assert_eq!(result["status_code"], 200);
        assert_eq!(result["response"]["rate"], 1250);
        assert!(http.requests()[0].idempotency_key.is_some());
    }

    #[tokio::test]
    async fn api_call_get_has_no_idempotency_key() {
        let http = Arc::new(ScriptedHttpClient::default());
        let ctx = context(tenant(), "data.api_call", json!({"url": "https://x.example.com"}));
        api_call(http.clone()).invoke(&ctx).await.expect("invoke");
        assert_eq!(http.requests()[0].method, HttpMethod::Get);
        assert!(http.requests()[0].idempotency_key.is_none());
    }

    #[tokio::test]
    async fn db_query_rejects_writes() {
        let queries = Arc::new(StaticQueries::default());
        let handler = DbQuery {
            queries: queries.clone(),
            limiter: Arc::new(ConcurrencyLimiter::default()),
        };
        let ctx = context(
            tenant(),
            "data.db_query",
            json!({"query": "DELETE FROM shipments"}),
        );
        let err = handler.invoke(&ctx).await.unwrap_err();
        assert_eq!(err.kind, HandlerErrorKind::InvalidInput);
        assert!(queries.statements().is_empty());
    }

    #[tokio::test]
    async fn db_query_counts_rows() {
        let queries = Arc::new(StaticQueries::default());
        let row = |id: &str| {
            let mut row = Map::new();
            row.insert("id".into(), json!(id));
            row
        };
        queries.set_rows(vec![row("S1"), row("S2")]);
        let handler = DbQuery {
            queries,
            limiter: Arc::new(ConcurrencyLimiter::default()),
        };
        let ctx = context(
            tenant(),
            "data.db_query",
            json!({"query": "SELECT id FROM shipments WHERE status = $1", "params": ["New"]}),
        );
        let result = handler.invoke(&ctx).await.expect("invoke");
        assert_eq!(result["count"], 2);
        assert_eq!(result["rows"][1]["id"], "S2");
    }
}
