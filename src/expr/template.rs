//! `{{ expression }}` placeholder rendering.

use super::eval::{evaluate, Scope};
use super::value::Value;
use crate::error::Result;
use regex::Regex;
use std::sync::OnceLock;

/// Global template regex compiled once
static TEMPLATE_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_template_regex() -> &'static Regex {
    TEMPLATE_REGEX
        .get_or_init(|| Regex::new(r"(?s)\{\{(.*?)\}\}").expect("static regex pattern is valid"))
}

/// True if the string contains at least one placeholder.
pub fn has_placeholders(template: &str) -> bool {
    get_template_regex().is_match(template)
}

/// Expressions inside the placeholders of a template, in order.
pub fn extract_expressions(template: &str) -> Vec<String> {
    get_template_regex()
        .captures_iter(template)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_string()))
        .collect()
}

/// Render every placeholder to text. Undefined renders as "".
pub fn render(template: &str, scope: &dyn Scope) -> Result<String> {
    if !has_placeholders(template) {
        return Ok(template.to_string());
    }

    let mut result = String::with_capacity(template.len());
    let mut last = 0;
    for cap in get_template_regex().captures_iter(template) {
        let (Some(full), Some(inner)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        result.push_str(&template[last..full.start()]);
        let value = evaluate(inner.as_str().trim(), scope)?;
        result.push_str(&value.to_display_string());
        last = full.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

/// Render a template, keeping the value's type when the whole string is a
/// single placeholder (`"{{ local.port }}"` yields a number).
pub fn render_typed(template: &str, scope: &dyn Scope) -> Result<Value> {
    let trimmed = template.trim();
    if let Some(cap) = get_template_regex().captures(trimmed) {
        if let (Some(full), Some(inner)) = (cap.get(0), cap.get(1)) {
            if full.start() == 0 && full.end() == trimmed.len() {
                return evaluate(inner.as_str().trim(), scope);
            }
        }
    }
    render(template, scope).map(Value::String)
}

/// Recursively render every string inside a parameter value.
pub fn render_value(value: &Value, scope: &dyn Scope) -> Result<Value> {
    match value {
        Value::String(s) => render_typed(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), render_value(v, scope)?)))
            .collect::<Result<_>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scope() -> BTreeMap<String, Value> {
        let mut scope = BTreeMap::new();
        scope.insert("cwd".to_string(), Value::from("/apps/comfy"));
        scope.insert(
            "local".to_string(),
            Value::object([("port", Value::from(8188i64))]),
        );
        scope
    }

    #[test]
    fn test_render_interpolates() {
        let s = scope();
        assert_eq!(
            render("python main.py --port {{local.port}} --dir {{ cwd }}", &s).unwrap(),
            "python main.py --port 8188 --dir /apps/comfy"
        );
        assert_eq!(render("no placeholders", &s).unwrap(), "no placeholders");
    }

    #[test]
    fn test_undefined_renders_empty() {
        let s = scope();
        assert_eq!(render("x{{local.nope}}y", &s).unwrap(), "xy");
    }

    #[test]
    fn test_render_typed_single_placeholder() {
        let s = scope();
        assert_eq!(render_typed("{{ local.port }}", &s).unwrap(), Value::Number(8188.0));
        assert_eq!(
            render_typed("port {{ local.port }}", &s).unwrap(),
            Value::from("port 8188")
        );
    }

    #[test]
    fn test_render_value_recurses() {
        let s = scope();
        let params = Value::object([
            ("message", Value::Array(vec![Value::from("cd {{cwd}}")])),
            ("port", Value::from("{{local.port}}")),
            ("flag", Value::Bool(true)),
        ]);
        let rendered = render_value(&params, &s).unwrap();
        assert_eq!(rendered.member("port"), Value::Number(8188.0));
        assert_eq!(
            rendered.member("message").index(&Value::Number(0.0)),
            Value::from("cd /apps/comfy")
        );
        assert_eq!(rendered.member("flag"), Value::Bool(true));
    }

    #[test]
    fn test_extract_expressions() {
        assert_eq!(
            extract_expressions("{{ a }} and {{b.c}}"),
            vec!["a".to_string(), "b.c".to_string()]
        );
    }

    #[test]
    fn test_bad_expression_errors() {
        let s = scope();
        assert!(render("{{ 1 + }}", &s).is_err());
    }
}
