//! Script documents: parsing and discovery.
//!
//! A script is either JSON, YAML, or an object-literal file of the form
//! `module.exports = { run: [ ... ] }`. Object literals are normalised
//! (comments and export prefix dropped, strings re-quoted as JSON) and then
//! read as YAML flow syntax, which accepts unquoted keys.

use crate::error::{Error, Result};
use crate::expr::Value;
use std::path::{Path, PathBuf};

/// File extensions tried when looking for a script by stem, in order.
pub const SCRIPT_EXTENSIONS: &[&str] = &["json", "js", "yaml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Install,
    Start,
}

impl ScriptKind {
    pub fn stem(&self) -> &'static str {
        match self {
            ScriptKind::Install => "install",
            ScriptKind::Start => "start",
        }
    }
}

/// One guarded capability invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub guard: Option<String>,
    pub capability: String,
    /// Unrendered parameters; always an object
    pub arguments: Value,
    /// Inline sub-script given as `params.run` on `script.start`
    pub children: Option<ScriptDocument>,
}

/// Ordered, immutable step list.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptDocument {
    pub source_name: String,
    /// Directory relative script references resolve against
    pub base_dir: Option<PathBuf>,
    pub steps: Vec<Step>,
}

impl ScriptDocument {
    pub fn parse(content: &str, source_name: &str) -> Result<Self> {
        let raw = parse_raw(content, source_name)?;
        Self::from_value(&raw, source_name, None)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ScriptNotFound(format!("{}: {}", path.display(), e)))?;
        let source_name = path.display().to_string();
        let raw = parse_raw(&content, &source_name)?;
        Self::from_value(&raw, &source_name, path.parent().map(Path::to_path_buf))
    }

    /// Build from an already-parsed value (array of steps or `{run: [...]}`).
    pub fn from_value(raw: &Value, source_name: &str, base_dir: Option<PathBuf>) -> Result<Self> {
        let steps_value = match raw {
            Value::Array(_) => raw.clone(),
            Value::Object(map) => map.get("run").cloned().ok_or_else(|| Error::Parse {
                source_name: source_name.to_string(),
                reason: "expected a `run` array".to_string(),
            })?,
            other => {
                return Err(Error::Parse {
                    source_name: source_name.to_string(),
                    reason: format!("expected an array or object, found {}", other.type_name()),
                })
            }
        };
        let Value::Array(items) = steps_value else {
            return Err(Error::Parse {
                source_name: source_name.to_string(),
                reason: "`run` must be an array".to_string(),
            });
        };

        let steps = items
            .iter()
            .enumerate()
            .map(|(index, item)| parse_step(item, index, source_name, base_dir.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source_name: source_name.to_string(),
            base_dir,
            steps,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn parse_step(item: &Value, index: usize, source_name: &str, base_dir: Option<&Path>) -> Result<Step> {
    let fail = |reason: String| Error::Parse {
        source_name: source_name.to_string(),
        reason: format!("step {}: {}", index, reason),
    };
    let Value::Object(map) = item else {
        return Err(fail(format!("expected an object, found {}", item.type_name())));
    };

    let capability = map
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| fail("missing `method`".to_string()))?;

    let guard = match map.get("when") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => return Err(fail(format!("`when` must be a string, found {}", other.type_name()))),
    };

    let arguments = match map.get("params") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(params @ Value::Object(_)) => params.clone(),
        Some(other) => {
            return Err(fail(format!("`params` must be an object, found {}", other.type_name())))
        }
    };

    let children = match (capability.as_str(), arguments.member("run")) {
        ("script.start", inline @ Value::Array(_)) => Some(ScriptDocument::from_value(
            &inline,
            &format!("{}#{}", source_name, index),
            base_dir.map(Path::to_path_buf),
        )?),
        _ => None,
    };

    Ok(Step {
        guard,
        capability,
        arguments,
        children,
    })
}

/// Parse any accepted syntax into a value tree.
pub fn parse_raw(content: &str, source_name: &str) -> Result<Value> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(content) {
            return Ok(Value::from(json));
        }
    }
    let normalized = normalize_object_literal(content);
    serde_yaml::from_str::<serde_json::Value>(&normalized)
        .map(Value::from)
        .map_err(|e| Error::Parse {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })
}

/// Rewrite object-literal syntax into YAML flow syntax.
///
/// Drops `//` and `/* */` comments and a leading `module.exports =`,
/// re-quotes `'...'` and backtick strings as JSON strings, removes trailing
/// commas and the final `;`, and puts a space after every `:` outside
/// strings so unquoted keys parse.
pub fn normalize_object_literal(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let mut out = String::with_capacity(content.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' | '\'' | '`' => {
                let (text, next) = read_js_string(&chars, i);
                out.push_str(&serde_json::Value::String(text).to_string());
                i = next;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if !matches!(chars.get(j), Some(']') | Some('}')) {
                    out.push(',');
                }
                i += 1;
            }
            ':' => {
                out.push_str(": ");
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    let mut body = out.trim();
    for prefix in ["module.exports", "export default"] {
        if let Some(rest) = body.strip_prefix(prefix) {
            body = rest.trim_start();
            body = body.strip_prefix('=').unwrap_or(body).trim_start();
        }
    }
    body.strip_suffix(';').unwrap_or(body).trim_end().to_string()
}

/// Read a quoted JS string starting at `start`; returns the decoded text and
/// the index after the closing quote.
fn read_js_string(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return (text, i + 1);
        }
        if c == '\\' && i + 1 < chars.len() {
            let escaped = chars[i + 1];
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
            i += 2;
            continue;
        }
        text.push(c);
        i += 1;
    }
    (text, i)
}

/// Find `install.*` / `start.*` in an application directory.
pub fn find_script(dir: &Path, kind: ScriptKind) -> Option<PathBuf> {
    find_by_stem(dir, kind.stem())
}

/// True if the directory has an install or start script.
pub fn has_scripts(dir: &Path) -> bool {
    find_script(dir, ScriptKind::Install).is_some() || find_script(dir, ScriptKind::Start).is_some()
}

fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    SCRIPT_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|path| path.is_file())
}

/// Resolve a `script.start` reference: relative to the including script
/// first, then by name in the library directory.
pub fn resolve_script_ref(reference: &str, base_dir: Option<&Path>, library_dir: &Path) -> Result<PathBuf> {
    let candidate = Path::new(reference);
    if candidate.is_absolute() && candidate.is_file() {
        return Ok(candidate.to_path_buf());
    }
    let mut tried = Vec::new();
    for dir in base_dir.into_iter().chain(std::iter::once(library_dir)) {
        let direct = dir.join(reference);
        if direct.is_file() {
            return Ok(direct);
        }
        if let Some(found) = find_by_stem(dir, reference) {
            return Ok(found);
        }
        tried.push(dir.display().to_string());
    }
    Err(Error::ScriptNotFound(format!(
        "'{}' (searched {})",
        reference,
        tried.join(", ")
    )))
}
