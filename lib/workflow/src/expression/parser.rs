//! Expression syntax tree and its nom parser.

use super::EvalError;
use super::value::Value;
use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1};
use nom::character::complete::{char, digit1, multispace0, satisfy};
use nom::combinator::{all_consuming, map, map_res, not, opt, recognize, value};
use nom::error::VerboseError;
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::{Err as NomErr, IResult};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// `$.a.b[0]` or `$trigger.a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    /// Named root (`trigger`, `event`, `vars`); `None` is the primary scope.
    pub root: Option<String>,
    pub path: Vec<PathSegment>,
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.root.as_deref().unwrap_or_default())?;
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(VarRef),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Logic(LogicOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Built-in functions with their minimum and maximum arity.
pub(crate) const BUILTINS: &[(&str, usize, usize)] = &[
    ("now", 0, 0),
    ("uuid", 0, 0),
    ("fmt", 1, usize::MAX),
    ("lower", 1, 1),
    ("upper", 1, 1),
    ("contains", 2, 2),
    ("startsWith", 2, 2),
    ("parse", 1, 1),
    ("add", 2, 3),
    ("before", 2, 2),
    ("after", 2, 2),
];

/// Parses a complete expression.
///
/// # Errors
///
/// Returns `EvalError::Syntax` for malformed text, unknown functions, and
/// calls with the wrong number of arguments.
pub fn parse(source: &str) -> Result<Expr, EvalError> {
    let expr = match all_consuming(delimited(multispace0, expr, multispace0))(source) {
        Ok((_, expr)) => expr,
        Err(NomErr::Error(e) | NomErr::Failure(e)) => {
            let remaining = e.errors.first().map_or("", |(rest, _)| *rest);
            return Err(syntax_error(source, remaining));
        }
        Err(NomErr::Incomplete(_)) => {
            return Err(EvalError::Syntax {
                offset: source.len(),
                message: "unexpected end of input".to_string(),
            });
        }
    };
    check_calls(source, &expr)?;
    Ok(expr)
}

fn syntax_error(source: &str, remaining: &str) -> EvalError {
    let offset = source.len().saturating_sub(remaining.len());
    let message = if remaining.trim().is_empty() {
        "unexpected end of input".to_string()
    } else {
        let snippet: String = remaining.chars().take(12).collect();
        format!("unexpected input '{snippet}'")
    };
    EvalError::Syntax { offset, message }
}

fn check_calls(source: &str, expr: &Expr) -> Result<(), EvalError> {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => Ok(()),
        Expr::Not(inner) | Expr::Neg(inner) => check_calls(source, inner),
        Expr::Logic(_, l, r) | Expr::Compare(_, l, r) | Expr::Arith(_, l, r) => {
            check_calls(source, l)?;
            check_calls(source, r)
        }
        Expr::Call(name, args) => {
            let offset = source.find(name.as_str()).unwrap_or(0);
            let Some((_, min, max)) = BUILTINS.iter().find(|(n, _, _)| n == name) else {
                return Err(EvalError::Syntax {
                    offset,
                    message: format!("unknown function '{name}'"),
                });
            };
            if args.len() < *min || args.len() > *max {
                return Err(EvalError::Syntax {
                    offset,
                    message: format!("{name}() takes {} arguments, got {}", arity(*min, *max), args.len()),
                });
            }
            args.iter().try_for_each(|arg| check_calls(source, arg))
        }
    }
}

fn arity(min: usize, max: usize) -> String {
    if min == max {
        min.to_string()
    } else if max == usize::MAX {
        format!("at least {min}")
    } else {
        format!("{min} to {max}")
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> PResult<'a, O>
where
    F: FnMut(&'a str) -> PResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> PResult<'a, &'a str> {
    terminated(tag(word), not(satisfy(is_ident_char)))
}

fn identifier(i: &str) -> PResult<'_, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(i)
}

fn expr(i: &str) -> PResult<'_, Expr> {
    let (i, first) = and_expr(i)?;
    let (i, rest) = many0(preceded(ws(keyword("or")), and_expr))(i)?;
    Ok((i, fold_logic(LogicOp::Or, first, rest)))
}

fn and_expr(i: &str) -> PResult<'_, Expr> {
    let (i, first) = not_expr(i)?;
    let (i, rest) = many0(preceded(ws(keyword("and")), not_expr))(i)?;
    Ok((i, fold_logic(LogicOp::And, first, rest)))
}

fn fold_logic(op: LogicOp, first: Expr, rest: Vec<Expr>) -> Expr {
    rest.into_iter()
        .fold(first, |acc, next| Expr::Logic(op, Box::new(acc), Box::new(next)))
}

fn not_expr(i: &str) -> PResult<'_, Expr> {
    alt((
        map(
            preceded(terminated(keyword("not"), multispace0), not_expr),
            |inner| Expr::Not(Box::new(inner)),
        ),
        comparison,
    ))(i)
}

fn cmp_op(i: &str) -> PResult<'_, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Ne, tag("<>")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Ne, tag("≠")),
        value(CmpOp::Le, tag("≤")),
        value(CmpOp::Ge, tag("≥")),
        value(CmpOp::Eq, tag("=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(i)
}

fn comparison(i: &str) -> PResult<'_, Expr> {
    let (i, left) = sum(i)?;
    let (i, right) = opt(pair(ws(cmp_op), sum))(i)?;
    let expr = match right {
        Some((op, right)) => Expr::Compare(op, Box::new(left), Box::new(right)),
        None => left,
    };
    Ok((i, expr))
}

fn sum(i: &str) -> PResult<'_, Expr> {
    let (i, first) = product(i)?;
    let (i, rest) = many0(pair(
        ws(alt((value(ArithOp::Add, char('+')), value(ArithOp::Sub, char('-'))))),
        product,
    ))(i)?;
    Ok((i, fold_arith(first, rest)))
}

fn product(i: &str) -> PResult<'_, Expr> {
    let (i, first) = unary(i)?;
    let (i, rest) = many0(pair(
        ws(alt((value(ArithOp::Mul, char('*')), value(ArithOp::Div, char('/'))))),
        unary,
    ))(i)?;
    Ok((i, fold_arith(first, rest)))
}

fn fold_arith(first: Expr, rest: Vec<(ArithOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |acc, (op, next)| {
        Expr::Arith(op, Box::new(acc), Box::new(next))
    })
}

fn unary(i: &str) -> PResult<'_, Expr> {
    alt((
        map(preceded(pair(char('-'), multispace0), unary), |inner| {
            Expr::Neg(Box::new(inner))
        }),
        primary,
    ))(i)
}

fn primary(i: &str) -> PResult<'_, Expr> {
    alt((
        number,
        map(string_literal, |s| Expr::Literal(Value::String(s))),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        variable,
        call,
        delimited(
            pair(char('('), multispace0),
            expr,
            pair(multispace0, char(')')),
        ),
    ))(i)
}

fn number(i: &str) -> PResult<'_, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |digits: &str| Decimal::from_str(digits).map(|d| Expr::Literal(Value::Number(d))),
    )(i)
}

fn escape(i: &str) -> PResult<'_, &str> {
    alt((
        value("\\", char('\\')),
        value("'", char('\'')),
        value("\"", char('"')),
        value("\n", char('n')),
        value("\t", char('t')),
    ))(i)
}

fn string_literal(i: &str) -> PResult<'_, String> {
    alt((
        delimited(
            char('\''),
            map(opt(escaped_transform(is_not("\\'"), '\\', escape)), Option::unwrap_or_default),
            char('\''),
        ),
        delimited(
            char('"'),
            map(opt(escaped_transform(is_not("\\\""), '\\', escape)), Option::unwrap_or_default),
            char('"'),
        ),
    ))(i)
}

fn path_segment(i: &str) -> PResult<'_, PathSegment> {
    alt((
        map(preceded(char('.'), take_while1(is_ident_char)), |key: &str| {
            PathSegment::Key(key.to_string())
        }),
        map_res(delimited(char('['), digit1, char(']')), |digits: &str| {
            digits.parse::<usize>().map(PathSegment::Index)
        }),
    ))(i)
}

fn variable(i: &str) -> PResult<'_, Expr> {
    let (i, _) = char('$')(i)?;
    let (i, root) = opt(identifier)(i)?;
    let (i, path) = many0(path_segment)(i)?;
    Ok((
        i,
        Expr::Var(VarRef {
            root: root.map(str::to_string),
            path,
        }),
    ))
}

fn call(i: &str) -> PResult<'_, Expr> {
    let (i, name) = identifier(i)?;
    let (i, _) = preceded(multispace0, char('('))(i)?;
    let (i, args) = separated_list0(char(','), ws(expr))(i)?;
    let (i, _) = preceded(multispace0, char(')'))(i)?;
    Ok((i, Expr::Call(name.to_string(), args)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: i64) -> Box<Expr> {
        Box::new(Expr::Literal(Value::Number(Decimal::from(n))))
    }

    #[test]
    fn parses_comparison_against_variable() {
        let expr = parse("$.amount > 100").expect("parse");
        let Expr::Compare(CmpOp::Gt, left, right) = expr else {
            panic!("expected comparison");
        };
        assert_eq!(
            *left,
            Expr::Var(VarRef {
                root: None,
                path: vec![PathSegment::Key("amount".into())]
            })
        );
        assert_eq!(right, num(100));
    }

    #[test]
    fn arithmetic_binds_tighter_than_comparison() {
        let expr = parse("1 + 2 * 3 = 7").expect("parse");
        let expected = Expr::Compare(
            CmpOp::Eq,
            Box::new(Expr::Arith(
                ArithOp::Add,
                num(1),
                Box::new(Expr::Arith(ArithOp::Mul, num(2), num(3))),
            )),
            num(7),
        );
        assert_eq!(expr, expected);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("true or false and false").expect("parse");
        assert!(matches!(expr, Expr::Logic(LogicOp::Or, _, _)));
    }

    #[test]
    fn unicode_operators_are_accepted() {
        for source in ["1 ≠ 2", "1 ≤ 2", "2 ≥ 1", "1 <> 2"] {
            assert!(parse(source).is_ok(), "{source}");
        }
    }

    #[test]
    fn paths_with_roots_and_indexes() {
        let expr = parse("$trigger.items[2].sku").expect("parse");
        let Expr::Var(var) = expr else {
            panic!("expected variable");
        };
        assert_eq!(var.root.as_deref(), Some("trigger"));
        assert_eq!(var.to_string(), "$trigger.items[2].sku");
    }

    #[test]
    fn strings_support_escapes_and_empty() {
        assert_eq!(
            parse(r"'it\'s'").expect("parse"),
            Expr::Literal(Value::String("it's".into()))
        );
        assert_eq!(
            parse("\"\"").expect("parse"),
            Expr::Literal(Value::String(String::new()))
        );
    }

    #[test]
    fn calls_parse_with_and_without_arguments() {
        assert_eq!(parse("now()").expect("parse"), Expr::Call("now".into(), vec![]));
        let Expr::Call(name, args) = parse("fmt('{} {}', $.a, 2)").expect("parse") else {
            panic!("expected call");
        };
        assert_eq!(name, "fmt");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn keywords_need_word_boundaries() {
        assert!(parse("not $.flag").is_ok());
        assert!(parse("$.a and$.b").is_ok());
        assert!(parse("nothing()").is_err());
    }

    #[test]
    fn syntax_errors_carry_offsets() {
        let err = parse("$.amount > ").unwrap_err();
        assert!(matches!(err, EvalError::Syntax { .. }));

        let EvalError::Syntax { offset, .. } = parse("1 + 2 )").unwrap_err() else {
            panic!("expected syntax error");
        };
        assert_eq!(offset, 6);
    }

    #[test]
    fn unknown_functions_and_bad_arity_are_syntax_errors() {
        let EvalError::Syntax { message, .. } = parse("exec('rm')").unwrap_err() else {
            panic!("expected syntax error");
        };
        assert!(message.contains("unknown function"));
        assert!(parse("lower()").is_err());
        assert!(parse("add(now())").is_err());
    }
}
