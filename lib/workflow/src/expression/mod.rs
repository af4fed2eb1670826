//! The condition and template language.
//!
//! Expressions are side-effect free and total: parsing returns a tagged
//! [`EvalError::Syntax`], evaluation returns a tagged error, and neither
//! panics on any input. This makes them safe to run against trigger payloads
//! supplied by other systems.

mod eval;
mod parser;
mod template;
mod value;

pub use eval::Env;
pub use parser::{ArithOp, CmpOp, Expr, LogicOp, PathSegment, VarRef};
pub use template::{TemplateError, placeholder_expressions, resolve_template};
pub use value::Value;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Malformed text, unknown function, or wrong arity.
    Syntax { offset: usize, message: String },
    /// An operator or function received values of the wrong type.
    Type { message: String },
    /// A variable path did not resolve.
    UnboundVariable { path: String },
    DivisionByZero,
}

impl EvalError {
    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax { offset, message } => {
                write!(f, "syntax error at offset {offset}: {message}")
            }
            Self::Type { message } => write!(f, "type error: {message}"),
            Self::UnboundVariable { path } => write!(f, "unbound variable {path}"),
            Self::DivisionByZero => write!(f, "division by zero"),
        }
    }
}

impl std::error::Error for EvalError {}

/// A parsed expression together with its source text.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Syntax` when the text is not a valid expression.
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let ast = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluates against an environment.
    ///
    /// # Errors
    ///
    /// Returns a type, unbound-variable, or division error.
    pub fn evaluate(&self, env: &Env<'_>) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, env)
    }

    /// Evaluates and requires a boolean result.
    ///
    /// # Errors
    ///
    /// Returns `EvalError::Type` when the result is not a boolean.
    pub fn evaluate_bool(&self, env: &Env<'_>) -> Result<bool, EvalError> {
        match self.evaluate(env)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::type_error(format!(
                "condition must be boolean, got {}",
                other.type_name()
            ))),
        }
    }

    /// Flags sub-expressions whose operand types are known to be incompatible.
    ///
    /// Variables are untyped, so only literal and built-in results are checked.
    #[must_use]
    pub fn static_type_errors(&self) -> Vec<EvalError> {
        let mut errors = Vec::new();
        infer(&self.ast, &mut errors);
        errors
    }

    /// Returns the static type error list as a single check.
    ///
    /// # Errors
    ///
    /// Returns the first static type error.
    pub fn check(&self) -> Result<(), EvalError> {
        match self.static_type_errors().into_iter().next() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Expression {}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::parse(&source).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Unknown,
    Null,
    Bool,
    Number,
    String,
    Date,
    List,
    Map,
}

impl Ty {
    fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Date(_) => Self::Date,
            Value::List(_) => Self::List,
            Value::Map(_) => Self::Map,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Null => "null",
            Self::Bool => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Date => "date",
            Self::List => "list",
            Self::Map => "map",
        }
    }

    fn known(self) -> bool {
        self != Self::Unknown
    }
}

fn expect(ty: Ty, wanted: Ty, what: &str, errors: &mut Vec<EvalError>) {
    if ty.known() && ty != wanted {
        errors.push(EvalError::type_error(format!(
            "{what} expects {}, got {}",
            wanted.name(),
            ty.name()
        )));
    }
}

fn infer(expr: &Expr, errors: &mut Vec<EvalError>) -> Ty {
    match expr {
        Expr::Literal(value) => Ty::of(value),
        Expr::Var(_) => Ty::Unknown,
        Expr::Not(inner) => {
            let ty = infer(inner, errors);
            expect(ty, Ty::Bool, "not", errors);
            Ty::Bool
        }
        Expr::Neg(inner) => {
            let ty = infer(inner, errors);
            expect(ty, Ty::Number, "negation", errors);
            Ty::Number
        }
        Expr::Logic(op, left, right) => {
            let what = match op {
                LogicOp::And => "and",
                LogicOp::Or => "or",
            };
            let l = infer(left, errors);
            let r = infer(right, errors);
            expect(l, Ty::Bool, what, errors);
            expect(r, Ty::Bool, what, errors);
            Ty::Bool
        }
        Expr::Compare(op, left, right) => {
            let l = infer(left, errors);
            let r = infer(right, errors);
            if !matches!(op, CmpOp::Eq | CmpOp::Ne) && l.known() && r.known() {
                let orderable = matches!(l, Ty::Number | Ty::String | Ty::Date);
                if l != r || !orderable {
                    errors.push(EvalError::type_error(format!(
                        "cannot order {} against {}",
                        l.name(),
                        r.name()
                    )));
                }
            }
            Ty::Bool
        }
        Expr::Arith(op, left, right) => {
            let l = infer(left, errors);
            let r = infer(right, errors);
            match op {
                ArithOp::Add if l == Ty::String || r == Ty::String => {
                    if l.known() && r.known() && l != r {
                        errors.push(EvalError::type_error(format!(
                            "cannot add {} and {}",
                            l.name(),
                            r.name()
                        )));
                    }
                    Ty::String
                }
                _ => {
                    expect(l, Ty::Number, "arithmetic", errors);
                    expect(r, Ty::Number, "arithmetic", errors);
                    if l == Ty::Number && r == Ty::Number {
                        Ty::Number
                    } else {
                        Ty::Unknown
                    }
                }
            }
        }
        Expr::Call(name, args) => {
            let types: Vec<Ty> = args.iter().map(|arg| infer(arg, errors)).collect();
            match name.as_str() {
                "now" | "parse" | "add" => {
                    if name == "add" {
                        if let Some(amount) = types.get(1) {
                            expect(*amount, Ty::Number, "add() amount", errors);
                        }
                    }
                    Ty::Date
                }
                "uuid" | "fmt" => Ty::String,
                "lower" | "upper" => {
                    if let Some(ty) = types.first() {
                        expect(*ty, Ty::String, name, errors);
                    }
                    Ty::String
                }
                "startsWith" => {
                    for ty in &types {
                        expect(*ty, Ty::String, name, errors);
                    }
                    Ty::Bool
                }
                "contains" | "before" | "after" => Ty::Bool,
                _ => Ty::Unknown,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn evaluate_bool_rejects_non_boolean() {
        let vars = json!({"amount": 150});
        let env = Env::new(&vars, Utc::now());
        let expr = Expression::parse("$.amount + 1").expect("parse");
        assert!(matches!(
            expr.evaluate_bool(&env),
            Err(EvalError::Type { .. })
        ));
    }

    #[test]
    fn static_check_flags_constant_mismatches() {
        assert!(Expression::parse("'a' > 1").expect("parse").check().is_err());
        assert!(Expression::parse("not 5").expect("parse").check().is_err());
        assert!(Expression::parse("upper(3)").expect("parse").check().is_err());
        assert!(Expression::parse("'a' + 1").expect("parse").check().is_err());
    }

    #[test]
    fn static_check_allows_variables() {
        for source in ["$.amount > 100", "$.a + $.b", "not $.flag", "lower($.name) = 'x'"] {
            assert!(
                Expression::parse(source).expect("parse").check().is_ok(),
                "{source}"
            );
        }
    }

    #[test]
    fn serializes_as_source_text() {
        let expr = Expression::parse("$.origin = 'A'").expect("parse");
        let json = serde_json::to_value(&expr).expect("serialize");
        assert_eq!(json, json!("$.origin = 'A'"));
        let back: Expression = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, expr);
    }

    #[test]
    fn deserializing_invalid_source_fails() {
        assert!(serde_json::from_value::<Expression>(json!("1 +")).is_err());
    }
}
