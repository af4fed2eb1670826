//! Expression evaluation and built-in functions.

use super::EvalError;
use super::parser::{ArithOp, CmpOp, Expr, LogicOp, PathSegment, VarRef};
use super::value::Value;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Variables visible to an expression.
///
/// `$.path` reads the primary scope, falling back to the fallback scope when
/// the first path segment is absent. `$name.path` reads a named root.
#[derive(Debug, Clone)]
pub struct Env<'a> {
    primary: &'a JsonValue,
    fallback: Option<&'a JsonValue>,
    roots: BTreeMap<&'a str, &'a JsonValue>,
    now: DateTime<Utc>,
}

impl<'a> Env<'a> {
    #[must_use]
    pub fn new(primary: &'a JsonValue, now: DateTime<Utc>) -> Self {
        Self {
            primary,
            fallback: None,
            roots: BTreeMap::new(),
            now,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: &'a JsonValue) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn with_root(mut self, name: &'a str, value: &'a JsonValue) -> Self {
        self.roots.insert(name, value);
        self
    }

    fn lookup(&self, var: &VarRef) -> Result<Value, EvalError> {
        let unbound = || EvalError::UnboundVariable {
            path: var.to_string(),
        };

        match &var.root {
            Some(root) => {
                let base = self.roots.get(root.as_str()).ok_or_else(unbound)?;
                walk(base, &var.path).map(Value::from_json).ok_or_else(unbound)
            }
            None => walk(self.primary, &var.path)
                .or_else(|| self.fallback.and_then(|fallback| walk(fallback, &var.path)))
                .map(Value::from_json)
                .ok_or_else(unbound),
        }
    }
}

fn walk<'v>(base: &'v JsonValue, path: &[PathSegment]) -> Option<&'v JsonValue> {
    path.iter().try_fold(base, |current, segment| match segment {
        PathSegment::Key(key) => current.as_object()?.get(key),
        PathSegment::Index(index) => current.as_array()?.get(*index),
    })
}

pub(super) fn evaluate(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(var) => env.lookup(var),
        Expr::Not(inner) => match evaluate(inner, env)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EvalError::type_error(format!(
                "not expects boolean, got {}",
                other.type_name()
            ))),
        },
        Expr::Neg(inner) => match evaluate(inner, env)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(EvalError::type_error(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        },
        Expr::Logic(op, left, right) => {
            let left = boolean(evaluate(left, env)?, *op)?;
            match (op, left) {
                (LogicOp::And, false) => Ok(Value::Bool(false)),
                (LogicOp::Or, true) => Ok(Value::Bool(true)),
                _ => boolean(evaluate(right, env)?, *op).map(Value::Bool),
            }
        }
        Expr::Compare(op, left, right) => {
            compare(*op, &evaluate(left, env)?, &evaluate(right, env)?).map(Value::Bool)
        }
        Expr::Arith(op, left, right) => arithmetic(*op, evaluate(left, env)?, evaluate(right, env)?),
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args, env)
        }
    }
}

fn boolean(value: Value, op: LogicOp) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::type_error(format!(
            "{} expects boolean operands, got {}",
            match op {
                LogicOp::And => "and",
                LogicOp::Or => "or",
            },
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = order(left, right)?;
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, EvalError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Ok(a.cmp(b)),
        (a, b) => Err(EvalError::type_error(format!(
            "cannot order {} against {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn arithmetic(op: ArithOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match (op, left, right) {
        (ArithOp::Add, Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (_, Value::Number(a), Value::Number(b)) => {
            let result = match op {
                ArithOp::Add => a.checked_add(b),
                ArithOp::Sub => a.checked_sub(b),
                ArithOp::Mul => a.checked_mul(b),
                ArithOp::Div => {
                    if b.is_zero() {
                        return Err(EvalError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
            };
            result
                .map(Value::Number)
                .ok_or_else(|| EvalError::type_error("numeric overflow"))
        }
        (op, a, b) => Err(EvalError::type_error(format!(
            "cannot apply {op:?} to {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn string_arg(name: &str, value: Value) -> Result<String, EvalError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(EvalError::type_error(format!(
            "{name}() expects a string, got {}",
            other.type_name()
        ))),
    }
}

fn date_arg(name: &str, value: Value) -> Result<DateTime<Utc>, EvalError> {
    match value {
        Value::Date(d) => Ok(d),
        Value::String(s) => parse_date(&s),
        other => Err(EvalError::type_error(format!(
            "{name}() expects a date, got {}",
            other.type_name()
        ))),
    }
}

fn parse_date(text: &str) -> Result<DateTime<Utc>, EvalError> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| EvalError::type_error(format!("cannot parse '{text}' as a date")))
}

fn unit_seconds(unit: &str) -> Result<i64, EvalError> {
    match unit {
        "s" | "second" | "seconds" => Ok(1),
        "m" | "minute" | "minutes" => Ok(60),
        "h" | "hour" | "hours" => Ok(3_600),
        "d" | "day" | "days" => Ok(86_400),
        other => Err(EvalError::type_error(format!("unknown time unit '{other}'"))),
    }
}

fn take(args: &mut impl Iterator<Item = Value>) -> Value {
    args.next().unwrap_or(Value::Null)
}

fn call(name: &str, args: Vec<Value>, env: &Env<'_>) -> Result<Value, EvalError> {
    let mut args = args.into_iter();

    match name {
        "now" => Ok(Value::Date(env.now)),
        "uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "fmt" => {
            let template = string_arg(name, take(&mut args))?;
            let mut out = String::with_capacity(template.len());
            let mut pieces = template.split("{}").peekable();
            while let Some(piece) = pieces.next() {
                out.push_str(piece);
                if pieces.peek().is_some() {
                    match args.next() {
                        Some(arg) => out.push_str(&arg.to_string()),
                        None => {
                            return Err(EvalError::type_error(
                                "fmt() has more placeholders than arguments",
                            ));
                        }
                    }
                }
            }
            Ok(Value::String(out))
        }
        "lower" => Ok(Value::String(string_arg(name, take(&mut args))?.to_lowercase())),
        "upper" => Ok(Value::String(string_arg(name, take(&mut args))?.to_uppercase())),
        "contains" => match (take(&mut args), take(&mut args)) {
            (Value::String(haystack), Value::String(needle)) => {
                Ok(Value::Bool(haystack.contains(&needle)))
            }
            (Value::List(items), needle) => Ok(Value::Bool(items.contains(&needle))),
            (a, b) => Err(EvalError::type_error(format!(
                "contains() expects (string, string) or (list, value), got ({}, {})",
                a.type_name(),
                b.type_name()
            ))),
        },
        "startsWith" => {
            let s = string_arg(name, take(&mut args))?;
            let prefix = string_arg(name, take(&mut args))?;
            Ok(Value::Bool(s.starts_with(&prefix)))
        }
        "parse" => date_arg(name, take(&mut args)).map(Value::Date),
        "add" => {
            let date = date_arg(name, take(&mut args))?;
            let amount = match take(&mut args) {
                Value::Number(n) => n,
                other => {
                    return Err(EvalError::type_error(format!(
                        "add() amount must be a number, got {}",
                        other.type_name()
                    )));
                }
            };
            let factor = match take(&mut args) {
                Value::Null => 1,
                Value::String(unit) => unit_seconds(&unit)?,
                other => {
                    return Err(EvalError::type_error(format!(
                        "add() unit must be a string, got {}",
                        other.type_name()
                    )));
                }
            };
            amount
                .checked_mul(Decimal::from(factor))
                .and_then(|seconds| seconds.trunc().to_i64())
                .and_then(Duration::try_seconds)
                .and_then(|delta| date.checked_add_signed(delta))
                .map(Value::Date)
                .ok_or_else(|| EvalError::type_error("add() result is out of range"))
        }
        "before" | "after" => {
            let a = date_arg(name, take(&mut args))?;
            let b = date_arg(name, take(&mut args))?;
            Ok(Value::Bool(if name == "before" { a < b } else { a > b }))
        }
        other => Err(EvalError::Syntax {
            offset: 0,
            message: format!("unknown function '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Expression;
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::str::FromStr;

    fn eval_with(source: &str, vars: &JsonValue) -> Result<Value, EvalError> {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Expression::parse(source)
            .expect("parse")
            .evaluate(&Env::new(vars, now))
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        eval_with(source, &json!({}))
    }

    #[test]
    fn decimal_arithmetic_is_exact() {
        assert_eq!(eval("0.1 + 0.2 = 0.3"), Ok(Value::Bool(true)));
        assert_eq!(
            eval("10 / 4"),
            Ok(Value::Number(Decimal::from_str("2.5").unwrap()))
        );
    }

    #[test]
    fn division_by_zero_is_tagged() {
        assert_eq!(eval("1 / 0"), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn unbound_variables_are_tagged() {
        assert_eq!(
            eval("$.missing.value = 1"),
            Err(EvalError::UnboundVariable {
                path: "$.missing.value".into()
            })
        );
    }

    #[test]
    fn null_variables_are_bound() {
        let vars = json!({"carrier": null});
        assert_eq!(eval_with("$.carrier = null", &vars), Ok(Value::Bool(true)));
    }

    #[test]
    fn fallback_scope_is_consulted() {
        let vars = json!({"a": 1});
        let trigger = json!({"shipment_id": "S1"});
        let env = Env::new(&vars, Utc::now()).with_fallback(&trigger);
        let expr = Expression::parse("$.shipment_id").expect("parse");
        assert_eq!(expr.evaluate(&env), Ok(Value::String("S1".into())));
    }

    #[test]
    fn named_roots_are_isolated() {
        let payload = json!({"shipment_id": "S1"});
        let vars = json!({"shipment_id": "S2"});
        let env = Env::new(&payload, Utc::now()).with_root("vars", &vars);
        let expr = Expression::parse("$.shipment_id = $vars.shipment_id").expect("parse");
        assert_eq!(expr.evaluate(&env), Ok(Value::Bool(false)));
        let missing = Expression::parse("$trigger.x").expect("parse");
        assert!(matches!(
            missing.evaluate(&env),
            Err(EvalError::UnboundVariable { .. })
        ));
    }

    #[test]
    fn boolean_operators_short_circuit() {
        assert_eq!(eval("false and $.nope"), Ok(Value::Bool(false)));
        assert_eq!(eval("true or $.nope"), Ok(Value::Bool(true)));
        assert!(matches!(eval("1 and true"), Err(EvalError::Type { .. })));
    }

    #[test]
    fn mixed_type_equality_is_false_but_ordering_errors() {
        assert_eq!(eval("'1' = 1"), Ok(Value::Bool(false)));
        assert!(matches!(eval("'1' < 1"), Err(EvalError::Type { .. })));
    }

    #[test]
    fn string_functions() {
        assert_eq!(eval("lower('ABC')"), Ok(Value::String("abc".into())));
        assert_eq!(eval("upper('abc')"), Ok(Value::String("ABC".into())));
        assert_eq!(eval("contains('freight', 'eig')"), Ok(Value::Bool(true)));
        assert_eq!(eval("startsWith('INV-1', 'INV')"), Ok(Value::Bool(true)));
        assert_eq!(eval("'a' + 'b'"), Ok(Value::String("ab".into())));
    }

    #[test]
    fn contains_works_on_lists() {
        let vars = json!({"docs": ["BOL", "POD"]});
        assert_eq!(eval_with("contains($.docs, 'POD')", &vars), Ok(Value::Bool(true)));
    }

    #[test]
    fn fmt_fills_placeholders() {
        let vars = json!({"id": "S1", "n": 3});
        assert_eq!(
            eval_with("fmt('shipment {} has {} stops', $.id, $.n)", &vars),
            Ok(Value::String("shipment S1 has 3 stops".into()))
        );
        assert!(matches!(eval("fmt('{} {}', 1)"), Err(EvalError::Type { .. })));
    }

    #[test]
    fn date_functions() {
        assert_eq!(
            eval("before(parse('2026-01-01'), now())"),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval("add(parse('2026-01-01T00:00:00Z'), 2, 'days') = parse('2026-01-03')"),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval("after(add(now(), 90), now())"),
            Ok(Value::Bool(true))
        );
        assert!(matches!(eval("parse('soon')"), Err(EvalError::Type { .. })));
        assert!(matches!(
            eval("add(now(), 1, 'fortnights')"),
            Err(EvalError::Type { .. })
        ));
    }

    #[test]
    fn uuid_produces_distinct_strings() {
        let a = eval("uuid()").expect("uuid");
        let b = eval("uuid()").expect("uuid");
        assert_ne!(a, b);
    }

    #[test]
    fn negation_and_precedence() {
        assert_eq!(eval("-2 * 3 = -6"), Ok(Value::Bool(true)));
        assert_eq!(eval("not (1 > 2)"), Ok(Value::Bool(true)));
    }
}
