//! Runtime values of the expression language.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Number, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A value produced by evaluating an expression.
///
/// Numbers are decimals so `0.1 + 0.2 = 0.3` holds exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Decimal),
    String(String),
    Date(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    #[must_use]
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => decimal_from_json(n).map_or(Self::Null, Self::Number),
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to JSON. Dates become RFC 3339 strings.
    #[must_use]
    pub fn into_json(self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(b),
            Self::Number(d) => decimal_to_json(d),
            Self::String(s) => JsonValue::String(s),
            Self::Date(d) => JsonValue::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::List(items) => JsonValue::Array(items.into_iter().map(Self::into_json).collect()),
            Self::Map(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, v.into_json())).collect())
            }
        }
    }
}

/// Text form used by `fmt()` and string interpolation.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(d) => write!(f, "{}", d.normalize()),
            Self::String(s) => f.write_str(s),
            Self::Date(d) => f.write_str(&d.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Self::List(_) | Self::Map(_) => write!(f, "{}", self.clone().into_json()),
        }
    }
}

fn decimal_from_json(n: &Number) -> Option<Decimal> {
    if let Some(i) = n.as_i64() {
        return Some(Decimal::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Some(Decimal::from(u));
    }
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok()))
}

fn decimal_to_json(d: Decimal) -> JsonValue {
    let d = d.normalize();
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return JsonValue::Number(i.into());
        }
    }
    d.to_f64()
        .and_then(Number::from_f64)
        .map_or_else(|| JsonValue::String(d.to_string()), JsonValue::Number)
}
