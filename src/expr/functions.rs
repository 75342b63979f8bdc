//! Whitelisted functions callable from expressions.

use super::eval::Scope;
use super::value::Value;
use crate::error::{Error, Result};
use std::path::PathBuf;

pub const FUNCTION_NAMES: &[&str] = &[
    "which",
    "path.join",
    "path.exists",
    "os.is",
    "gpu.is",
    "lower",
    "upper",
    "contains",
];

pub fn call(name: &str, args: &[Value], scope: &dyn Scope) -> Result<Value> {
    match name {
        "which" => {
            let program = string_arg(name, args, 0)?;
            Ok(match which::which(&program) {
                Ok(path) => Value::String(path.to_string_lossy().into_owned()),
                Err(_) => Value::Null,
            })
        }
        "path.join" => {
            let mut path = PathBuf::new();
            for (i, _) in args.iter().enumerate() {
                path.push(string_arg(name, args, i)?);
            }
            Ok(Value::String(path.to_string_lossy().into_owned()))
        }
        "path.exists" => {
            let path = string_arg(name, args, 0)?;
            Ok(Value::Bool(std::path::Path::new(&path).exists()))
        }
        "os.is" => fact_is(name, "platform", args, scope),
        "gpu.is" => fact_is(name, "gpu", args, scope),
        "lower" => Ok(Value::String(string_arg(name, args, 0)?.to_lowercase())),
        "upper" => Ok(Value::String(string_arg(name, args, 0)?.to_uppercase())),
        "contains" => match args.first() {
            Some(Value::Array(items)) => {
                let needle = args.get(1).cloned().unwrap_or_default();
                Ok(Value::Bool(items.contains(&needle)))
            }
            _ => {
                let haystack = string_arg(name, args, 0)?;
                let needle = string_arg(name, args, 1)?;
                Ok(Value::Bool(haystack.contains(&needle)))
            }
        },
        _ => Err(Error::Evaluation(format!(
            "unknown function '{}' (available: {})",
            name,
            FUNCTION_NAMES.join(", ")
        ))),
    }
}

fn fact_is(name: &str, root: &str, args: &[Value], scope: &dyn Scope) -> Result<Value> {
    let wanted = string_arg(name, args, 0)?;
    let actual = scope.resolve(root).unwrap_or_default();
    Ok(Value::Bool(
        actual
            .as_str()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(&wanted)),
    ))
}

/// Argument `index` as text. Numbers and booleans are accepted; undefined is not.
fn string_arg(name: &str, args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(value @ (Value::Number(_) | Value::Bool(_))) => Ok(value.to_display_string()),
        Some(other) => Err(Error::Evaluation(format!(
            "{}() argument {} must be a string, got {}",
            name,
            index + 1,
            other.type_name()
        ))),
        None => Err(Error::Evaluation(format!(
            "{}() expects at least {} argument(s)",
            name,
            index + 1
        ))),
    }
}
