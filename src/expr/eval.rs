//! Tree-walking evaluator.

use super::functions;
use super::parser::{parse, BinaryOp, Expr, UnaryOp};
use super::value::Value;
use crate::error::{Error, Result};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Variable lookup for the evaluator.
///
/// `resolve` returns `None` when `root` is not a name the scope knows about
/// at all, which is reported as a probable typo. A known root whose value is
/// simply absent should return `Some(Value::Undefined)`.
pub trait Scope {
    fn resolve(&self, root: &str) -> Option<Value>;
}

impl Scope for std::collections::BTreeMap<String, Value> {
    fn resolve(&self, root: &str) -> Option<Value> {
        self.get(root).cloned()
    }
}

/// Evaluate an expression to a value.
pub fn evaluate(source: &str, scope: &dyn Scope) -> Result<Value> {
    let expr = parse(source)?;
    eval(&expr, scope, source)
}

/// Evaluate a `when` guard. Accepts a bare expression or one wrapped in
/// `{{ }}`. An empty guard is true.
pub fn evaluate_guard(source: &str, scope: &dyn Scope) -> Result<bool> {
    let trimmed = source.trim();
    let inner = trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() {
        return Ok(true);
    }
    Ok(evaluate(inner, scope)?.truthy())
}

pub(crate) fn eval(expr: &Expr, scope: &dyn Scope, source: &str) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, scope, source))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Expr::Ident(name) => match scope.resolve(name) {
            Some(value) => Ok(value),
            None => {
                warn!(
                    identifier = %name,
                    expression = %source,
                    "Unknown identifier resolves to undefined (likely typo)"
                );
                Ok(Value::Undefined)
            }
        },
        Expr::Member(base, member) => {
            let value = eval(base, scope, source)?.member(member);
            if value.is_undefined() {
                note_absent(expr, source);
            }
            Ok(value)
        }
        Expr::Index(base, index) => {
            let base = eval(base, scope, source)?;
            let index = eval(index, scope, source)?;
            Ok(base.index(&index))
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope, source))
                .collect::<Result<Vec<_>>>()?;
            functions::call(name, &args, scope)
        }
        Expr::Unary(op, operand) => {
            let value = eval(operand, scope, source)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(Error::Evaluation(format!(
                        "cannot negate {} in '{}'",
                        other.type_name(),
                        source
                    ))),
                },
            }
        }
        Expr::Binary(BinaryOp::And, left, right) => {
            let left = eval(left, scope, source)?;
            if !left.truthy() {
                return Ok(left);
            }
            eval(right, scope, source)
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let left = eval(left, scope, source)?;
            if left.truthy() {
                return Ok(left);
            }
            eval(right, scope, source)
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope, source)?;
            let right = eval(right, scope, source)?;
            binary(*op, left, right, source)
        }
        Expr::Conditional(condition, then, otherwise) => {
            if eval(condition, scope, source)?.truthy() {
                eval(then, scope, source)
            } else {
                eval(otherwise, scope, source)
            }
        }
    }
}

fn note_absent(expr: &Expr, source: &str) {
    if let Some(path) = expr.path() {
        debug!(path = %path, expression = %source, "Member is absent, using undefined");
    }
}

fn binary(op: BinaryOp, left: Value, right: Value, source: &str) -> Result<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
            if left.is_undefined() || right.is_undefined() {
                return Ok(Value::Bool(false));
            }
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(mismatch(op, &left, &right, source));
                }
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Gt => ordering == Ordering::Greater,
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Ge => ordering != Ordering::Less,
                _ => ordering != Ordering::Greater,
            }))
        }
        _ => arithmetic(op, left, right, source),
    }
}

fn arithmetic(op: BinaryOp, left: Value, right: Value, source: &str) -> Result<Value> {
    if left.is_undefined() || right.is_undefined() {
        return Err(Error::Evaluation(format!(
            "undefined operand for '{}' in '{}'",
            op.symbol(),
            source
        )));
    }
    match (op, &left, &right) {
        (BinaryOp::Add, Value::String(_), _) | (BinaryOp::Add, _, Value::String(_)) => Ok(
            Value::String(left.to_display_string() + &right.to_display_string()),
        ),
        (_, Value::Number(a), Value::Number(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                    return Err(Error::Evaluation(format!(
                        "division by zero in '{}'",
                        source
                    )))
                }
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            Ok(Value::Number(result))
        }
        _ => Err(mismatch(op, &left, &right, source)),
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value, source: &str) -> Error {
    Error::Evaluation(format!(
        "cannot apply '{}' to {} and {} in '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name(),
        source
    ))
}
