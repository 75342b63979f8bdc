use crate::expr::{Scope, Value};
use crate::host::HostFacts;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// A long-running process launched by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedDaemon {
    pub app: String,
    pub pid: u32,
    pub port: Option<u16>,
}

/// Variable scope for one script invocation.
///
/// Locals are copied into a child context when a sub-script starts; the
/// child cannot change the caller's locals except through `local.export`.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub app: String,
    pub root: PathBuf,
    pub facts: Arc<HostFacts>,
    pub cwd: PathBuf,
    /// Directory of the script being executed
    pub script_dir: Option<PathBuf>,
    pub locals: BTreeMap<String, Value>,
    /// Inherited process environment
    pub process_env: Arc<BTreeMap<String, String>>,
    /// Variables from the application's ENVIRONMENT file; passed to commands
    pub app_env: Arc<HashMap<String, String>>,
    pub args: Value,
    /// Result of the previous step
    pub input: Value,
    pub depth: usize,
    /// Locals named by `local.export`, copied to the caller on return
    pub exports: BTreeMap<String, Value>,
    /// Shared by every context derived from the same top-level run
    launched: Arc<SyncMutex<Vec<LaunchedDaemon>>>,
}

impl RuntimeContext {
    pub fn new(app: &str, root: &Path, cwd: &Path, facts: Arc<HostFacts>) -> Self {
        Self {
            app: app.to_string(),
            root: root.to_path_buf(),
            facts,
            cwd: cwd.to_path_buf(),
            script_dir: None,
            locals: BTreeMap::new(),
            process_env: Arc::new(std::env::vars().collect()),
            app_env: Arc::new(HashMap::new()),
            args: Value::Undefined,
            input: Value::Undefined,
            depth: 0,
            exports: BTreeMap::new(),
            launched: Arc::new(SyncMutex::new(Vec::new())),
        }
    }

    pub fn with_app_env(mut self, vars: HashMap<String, String>) -> Self {
        self.app_env = Arc::new(vars);
        self
    }

    pub fn with_script_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.script_dir = dir;
        self
    }

    /// Context for a sub-script: inherits a copy of the locals, gets its own
    /// `args`, starts with no exports.
    pub fn child(&self, args: Value, script_dir: Option<PathBuf>) -> Self {
        let mut child = self.clone();
        child.args = args;
        child.input = Value::Undefined;
        child.exports = BTreeMap::new();
        child.depth = self.depth + 1;
        if script_dir.is_some() {
            child.script_dir = script_dir;
        }
        child
    }

    /// Copy a finished child's exports into this scope.
    pub fn absorb_exports(&mut self, child: &RuntimeContext) {
        for (key, value) in &child.exports {
            self.locals.insert(key.clone(), value.clone());
        }
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    /// Resolve a path parameter against the current working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.cwd.join(candidate)
        }
    }

    pub fn record_launch(&self, daemon: LaunchedDaemon) {
        self.launched.lock().push(daemon);
    }

    pub fn launched(&self) -> Vec<LaunchedDaemon> {
        self.launched.lock().clone()
    }

    fn env_value(&self) -> Value {
        let mut merged: BTreeMap<String, Value> = self
            .process_env
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        for (k, v) in self.app_env.iter() {
            merged.insert(k.clone(), Value::from(v.as_str()));
        }
        Value::Object(merged)
    }
}

impl Scope for RuntimeContext {
    fn resolve(&self, root: &str) -> Option<Value> {
        let path_value = |p: &Path| Value::String(p.to_string_lossy().into_owned());
        Some(match root {
            "platform" => Value::from(self.facts.platform.as_str()),
            "arch" => Value::from(self.facts.arch.as_str()),
            "gpu" => Value::from(self.facts.gpu_vendor.as_str()),
            "gpu_model" => self
                .facts
                .gpu_model
                .as_deref()
                .map(Value::from)
                .unwrap_or(Value::Undefined),
            "cwd" => path_value(&self.cwd),
            "local" => Value::Object(self.locals.clone()),
            "env" => self.env_value(),
            "args" => self.args.clone(),
            "input" => self.input.clone(),
            "app" => Value::from(self.app.as_str()),
            "root" => path_value(&self.root),
            "script_dir" => self
                .script_dir
                .as_deref()
                .map(path_value)
                .unwrap_or(Value::Undefined),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{evaluate, evaluate_guard};

    fn facts() -> Arc<HostFacts> {
        Arc::new(HostFacts {
            platform: "linux".into(),
            arch: "x86_64".into(),
            gpu_vendor: "nvidia".into(),
            gpu_model: Some("RTX 4090".into()),
        })
    }

    #[test]
    fn test_roots_resolve() {
        let mut ctx = RuntimeContext::new("comfy", Path::new("/srv"), Path::new("/srv/apps/comfy"), facts());
        ctx.set_local("port", Value::from(8188i64));
        assert!(evaluate_guard("gpu === 'nvidia' && platform === 'linux'", &ctx).unwrap());
        assert_eq!(evaluate("local.port", &ctx).unwrap(), Value::Number(8188.0));
        assert_eq!(evaluate("cwd", &ctx).unwrap(), Value::from("/srv/apps/comfy"));
        assert_eq!(evaluate("app", &ctx).unwrap(), Value::from("comfy"));
        assert!(evaluate_guard("contains(gpu_model, '4090')", &ctx).unwrap());
    }

    #[test]
    fn test_app_env_overrides_process_env() {
        let mut vars = HashMap::new();
        vars.insert("HF_HOME".to_string(), "/models".to_string());
        let ctx = RuntimeContext::new("a", Path::new("/"), Path::new("/"), facts()).with_app_env(vars);
        assert_eq!(evaluate("env.HF_HOME", &ctx).unwrap(), Value::from("/models"));
    }

    #[test]
    fn test_child_cannot_leak_locals_without_export() {
        let mut parent = RuntimeContext::new("a", Path::new("/"), Path::new("/"), facts());
        parent.set_local("shared", Value::from("parent"));

        let mut child = parent.child(Value::Undefined, None);
        assert_eq!(child.locals["shared"], Value::from("parent"));
        child.set_local("shared", Value::from("child"));
        child.set_local("secret", Value::from("x"));
        child.exports.insert("model".into(), Value::from("sdxl"));

        parent.absorb_exports(&child);
        assert_eq!(parent.locals["shared"], Value::from("parent"));
        assert!(!parent.locals.contains_key("secret"));
        assert_eq!(parent.locals["model"], Value::from("sdxl"));
        assert_eq!(child.depth, 1);
    }

    #[test]
    fn test_launches_are_shared_with_children() {
        let parent = RuntimeContext::new("a", Path::new("/"), Path::new("/"), facts());
        let child = parent.child(Value::Undefined, None);
        child.record_launch(LaunchedDaemon { app: "a".into(), pid: 42, port: Some(7860) });
        assert_eq!(parent.launched().len(), 1);
    }
}
