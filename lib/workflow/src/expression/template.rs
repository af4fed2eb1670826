//! `{{ expr }}` placeholders inside step configs.
//!
//! A string that is exactly one placeholder is replaced by the typed result
//! (a number stays a number). Placeholders embedded in longer text are
//! interpolated as text.

use super::eval::Env;
use super::{EvalError, Expression};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// A placeholder that failed to resolve, with its JSON path in the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    pub path: String,
    pub error: EvalError,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

enum Segment<'s> {
    Text(&'s str),
    Expr(&'s str),
}

fn segments(text: &str) -> Result<Vec<Segment<'_>>, EvalError> {
    let mut out = Vec::new();
    let mut rest = text;
    let mut consumed = 0;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            out.push(Segment::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            return Err(EvalError::Syntax {
                offset: consumed + open,
                message: "unterminated placeholder".to_string(),
            });
        };
        out.push(Segment::Expr(after[..close].trim()));
        consumed += open + 2 + close + 2;
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Lists every placeholder expression with its path, for parse-time checks.
///
/// Unterminated placeholders are reported as an `Err` entry.
#[must_use]
pub fn placeholder_expressions(value: &JsonValue) -> Vec<(String, Result<String, EvalError>)> {
    let mut found = Vec::new();
    collect(value, String::new(), &mut found);
    found
}

fn collect(value: &JsonValue, path: String, found: &mut Vec<(String, Result<String, EvalError>)>) {
    match value {
        JsonValue::String(text) => match segments(text) {
            Ok(parts) => found.extend(parts.into_iter().filter_map(|part| match part {
                Segment::Expr(source) => Some((path.clone(), Ok(source.to_string()))),
                Segment::Text(_) => None,
            })),
            Err(e) => found.push((path, Err(e))),
        },
        JsonValue::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect(item, format!("{path}[{index}]"), found);
            }
        }
        JsonValue::Object(map) => {
            for (key, item) in map {
                collect(item, child_path(&path, key), found);
            }
        }
        _ => {}
    }
}

/// Resolves every placeholder in a config value.
///
/// # Errors
///
/// Returns every failing placeholder, not only the first.
pub fn resolve_template(value: &JsonValue, env: &Env<'_>) -> Result<JsonValue, Vec<TemplateError>> {
    let mut errors = Vec::new();
    let resolved = resolve(value, env, String::new(), &mut errors);
    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

fn resolve(value: &JsonValue, env: &Env<'_>, path: String, errors: &mut Vec<TemplateError>) -> JsonValue {
    match value {
        JsonValue::String(text) => resolve_string(text, env, path, errors),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(index, item)| resolve(item, env, format!("{path}[{index}]"), errors))
                .collect(),
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), resolve(item, env, child_path(&path, key), errors)))
                .collect::<Map<_, _>>(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(text: &str, env: &Env<'_>, path: String, errors: &mut Vec<TemplateError>) -> JsonValue {
    let parts = match segments(text) {
        Ok(parts) => parts,
        Err(error) => {
            errors.push(TemplateError { path, error });
            return JsonValue::Null;
        }
    };

    let evaluate = |source: &str| Expression::parse(source).and_then(|expr| expr.evaluate(env));

    if let [Segment::Expr(source)] = parts.as_slice() {
        return match evaluate(source) {
            Ok(value) => value.into_json(),
            Err(error) => {
                errors.push(TemplateError { path, error });
                JsonValue::Null
            }
        };
    }

    let mut out = String::with_capacity(text.len());
    for part in parts {
        match part {
            Segment::Text(literal) => out.push_str(literal),
            Segment::Expr(source) => match evaluate(source) {
                Ok(value) => out.push_str(&value.to_string()),
                Err(error) => errors.push(TemplateError {
                    path: path.clone(),
                    error,
                }),
            },
        }
    }
    JsonValue::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn whole_placeholder_keeps_type() {
        let vars = json!({"shipment_id": "S1", "amount": 150});
        let env = Env::new(&vars, Utc::now());
        let config = json!({"shipment_id": "{{ $.shipment_id }}", "limit": "{{ $.amount * 2 }}", "status": "Dispatched"});
        let resolved = resolve_template(&config, &env).expect("resolve");
        assert_eq!(
            resolved,
            json!({"shipment_id": "S1", "limit": 300, "status": "Dispatched"})
        );
    }

    #[test]
    fn embedded_placeholders_interpolate() {
        let vars = json!({"id": "S1", "stops": 3});
        let env = Env::new(&vars, Utc::now());
        let config = json!({"subject": "Shipment {{ $.id }} has {{$.stops}} stops"});
        let resolved = resolve_template(&config, &env).expect("resolve");
        assert_eq!(resolved, json!({"subject": "Shipment S1 has 3 stops"}));
    }

    #[test]
    fn every_failure_is_reported_with_its_path() {
        let vars = json!({});
        let env = Env::new(&vars, Utc::now());
        let config = json!({"to": ["{{ $.manager_email }}"], "body": "{{ 1 / 0 }}"});
        let errors = resolve_template(&config, &env).unwrap_err();
        let mut paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["body", "to[0]"]);
    }

    #[test]
    fn placeholders_are_listed_for_checking() {
        let config = json!({"a": "{{ $.x }}", "b": ["x {{ $.y }}"], "c": "{{ oops"});
        let found = placeholder_expressions(&config);
        assert_eq!(found.len(), 3);
        assert!(found.contains(&("a".to_string(), Ok("$.x".to_string()))));
        assert!(found.contains(&("b[0]".to_string(), Ok("$.y".to_string()))));
        assert!(found.iter().any(|(path, result)| path == "c" && result.is_err()));
    }
}
