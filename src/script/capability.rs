//! Capability dispatch: a registry mapping method names to handlers.

use super::context::RuntimeContext;
use super::document::Step;
use super::interpreter::Interpreter;
use super::progress::{EventKind, Level, Progress};
use crate::command::CommandRunner;
use crate::config::{parse_duration_string, EngineConfig};
use crate::daemon::DaemonManager;
use crate::environment::EnvironmentManager;
use crate::error::{Error, Result};
use crate::expr::Value;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Collaborators capabilities act through.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<EngineConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub environments: Arc<EnvironmentManager>,
    /// Present only when long-running launches are allowed (start scripts)
    pub daemons: Option<Arc<DaemonManager>>,
}

impl Services {
    pub fn with_daemons(&self, daemons: Arc<DaemonManager>) -> Self {
        Self {
            daemons: Some(daemons),
            ..self.clone()
        }
    }
}

/// Output a capability captured, kept for failure diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Everything a capability sees for one step.
pub struct StepCall<'a> {
    pub index: usize,
    pub step: &'a Step,
    /// Parameters with every placeholder rendered
    pub params: Value,
    pub ctx: &'a mut RuntimeContext,
    pub services: &'a Services,
    pub progress: &'a Progress,
    pub cancel: &'a CancellationToken,
    pub interpreter: &'a Interpreter,
    pub captured: CapturedOutput,
}

impl StepCall<'_> {
    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidArgument {
            capability: self.step.capability.clone(),
            reason: reason.into(),
        }
    }

    pub fn param(&self, name: &str) -> Value {
        self.params.member(name)
    }

    /// Optional string parameter. Numbers and booleans are stringified.
    pub fn str_param(&self, name: &str) -> Result<Option<String>> {
        match self.param(name) {
            Value::Undefined | Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            value @ (Value::Number(_) | Value::Bool(_)) => Ok(Some(value.to_display_string())),
            other => Err(self.invalid(format!(
                "`{}` must be a string, found {}",
                name,
                other.type_name()
            ))),
        }
    }

    pub fn required_str(&self, name: &str) -> Result<String> {
        self.str_param(name)?
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.invalid(format!("`{}` is required", name)))
    }

    pub fn bool_param(&self, name: &str, default: bool) -> Result<bool> {
        match self.param(name) {
            Value::Undefined | Value::Null => Ok(default),
            Value::Bool(b) => Ok(b),
            Value::String(s) if s == "true" => Ok(true),
            Value::String(s) if s == "false" || s.is_empty() => Ok(false),
            other => Err(self.invalid(format!(
                "`{}` must be a boolean, found {}",
                name,
                other.type_name()
            ))),
        }
    }

    /// A number of seconds or a duration string such as `"90s"`.
    pub fn duration_param(&self, name: &str) -> Result<Option<Duration>> {
        match self.param(name) {
            Value::Undefined | Value::Null => Ok(None),
            Value::Number(n) if n >= 0.0 => Ok(Some(Duration::from_secs_f64(n))),
            Value::String(s) => parse_duration_string(&s)
                .map(Some)
                .ok_or_else(|| self.invalid(format!("`{}`: invalid duration '{}'", name, s))),
            other => Err(self.invalid(format!(
                "`{}` must be a duration, found {}",
                name,
                other.type_name()
            ))),
        }
    }

    /// String parameter given either as one string or a list of strings.
    pub fn string_list(&self, name: &str) -> Result<Vec<String>> {
        match self.param(name) {
            Value::Undefined | Value::Null => Ok(Vec::new()),
            Value::String(s) => Ok(vec![s]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    value @ (Value::Number(_) | Value::Bool(_)) => Ok(value.to_display_string()),
                    other => Err(self.invalid(format!(
                        "`{}` entries must be strings, found {}",
                        name,
                        other.type_name()
                    ))),
                })
                .collect(),
            other => Err(self.invalid(format!(
                "`{}` must be a string or list, found {}",
                name,
                other.type_name()
            ))),
        }
    }

    /// String-to-string map parameter (e.g. `env`).
    pub fn string_map(&self, name: &str) -> Result<BTreeMap<String, String>> {
        match self.param(name) {
            Value::Undefined | Value::Null => Ok(BTreeMap::new()),
            Value::Object(map) => Ok(map
                .into_iter()
                .filter(|(_, v)| !v.is_undefined())
                .map(|(k, v)| (k, v.to_display_string()))
                .collect()),
            other => Err(self.invalid(format!(
                "`{}` must be an object, found {}",
                name,
                other.type_name()
            ))),
        }
    }

    pub fn emit(&self, level: Level, message: impl Into<String>) {
        self.progress
            .step(self.index, self.ctx.depth, EventKind::Message, level, message);
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// Method name steps use to invoke this capability.
    fn name(&self) -> &'static str;

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value>;
}

/// Method name to handler map, populated once at engine construction.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    handlers: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in capability.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::capabilities::register_builtins(&mut registry);
        registry
    }

    /// Add or replace a handler.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> &mut Self {
        self.handlers
            .insert(capability.name().to_string(), capability);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = CapabilityRegistry::with_builtins();
        for name in [
            "shell.run",
            "script.start",
            "fs.download",
            "fs.write",
            "fs.link",
            "local.set",
            "local.export",
            "env.install",
            "log",
        ] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("shell.exec").is_none());
    }
}
