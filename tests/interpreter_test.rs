//! Script interpreter behaviour through the public API, using a recording
//! capability next to the built-ins.

mod common;

use appforge::command::ShellRunner;
use appforge::environment::EnvironmentManager;
use appforge::expr::Value;
use appforge::script::{
    Capability, CapabilityRegistry, ExecutionOutcome, Interpreter, MemorySink, Phase, Progress,
    RuntimeContext, ScriptDocument, Services, StepCall, StepStatus,
};
use appforge::{EngineConfig, Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records the rendered parameters of every invocation.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Value>>,
}

struct RecordCapability(Arc<Recorder>);

#[async_trait]
impl Capability for RecordCapability {
    fn name(&self) -> &'static str {
        "test.record"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        self.0.calls.lock().unwrap().push(call.params.clone());
        Ok(call.param("value"))
    }
}

struct FailCapability;

#[async_trait]
impl Capability for FailCapability {
    fn name(&self) -> &'static str {
        "test.fail"
    }

    async fn invoke(&self, _call: &mut StepCall<'_>) -> Result<Value> {
        Err(Error::CommandFailure {
            command: "false".to_string(),
            exit_code: 1,
            stderr: "boom".to_string(),
        })
    }
}

struct Harness {
    dir: tempfile::TempDir,
    interpreter: Interpreter,
    recorder: Arc<Recorder>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut config = EngineConfig::with_root(dir.path());
        config.max_include_depth = 3;
        let config = Arc::new(config);
        let runner = Arc::new(ShellRunner::new());
        let environments = Arc::new(EnvironmentManager::new(
            config.envs_dir(),
            config.python.clone(),
            Duration::from_secs(30),
            runner.clone(),
        ));

        let recorder = Arc::new(Recorder::default());
        let mut registry = CapabilityRegistry::with_builtins();
        registry.register(Arc::new(RecordCapability(recorder.clone())));
        registry.register(Arc::new(FailCapability));

        let interpreter = Interpreter::new(
            Arc::new(registry),
            Services {
                config,
                runner,
                environments,
                daemons: None,
            },
        );
        Self {
            dir,
            interpreter,
            recorder,
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn context(&self) -> RuntimeContext {
        RuntimeContext::new(
            "demo",
            self.dir.path(),
            self.dir.path(),
            Arc::new(common::test_facts()),
        )
    }

    async fn execute(&self, doc: &ScriptDocument, ctx: &mut RuntimeContext) -> appforge::script::ExecutionResult {
        let progress = Progress::new(self.sink.clone(), "demo", Phase::Exec);
        self.interpreter
            .execute(doc, ctx, &progress, &CancellationToken::new())
            .await
    }

    fn calls(&self) -> Vec<Value> {
        self.recorder.calls.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn false_guard_never_dispatches_or_renders() {
    let harness = Harness::new();
    // Rendering the skipped step would fail on the unknown function.
    let doc = ScriptDocument::parse(
        r#"{"run": [
            {"method": "test.record", "when": "{{ gpu === 'amd' }}", "params": {"value": "{{ nosuch(1) }}"}},
            {"method": "test.record", "when": "{{ gpu === 'nvidia' }}", "params": {"value": "cuda"}}
        ]}"#,
        "guards.json",
    )
    .unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    assert_eq!(result.outcome, ExecutionOutcome::Completed);
    assert_eq!(result.steps[0].status, StepStatus::Skipped);
    assert_eq!(result.steps[1].status, StepStatus::Completed);
    let calls = harness.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].member("value"), Value::from("cuda"));
}

#[tokio::test]
async fn steps_see_locals_and_previous_output() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(
        r#"{"run": [
            {"method": "local.set", "params": {"port": 7860}},
            {"method": "test.record", "params": {"value": "{{ local.port + 1 }}"}},
            {"method": "test.record", "params": {"value": "previous={{ input }}"}}
        ]}"#,
        "locals.json",
    )
    .unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    assert!(result.is_success());
    let calls = harness.calls();
    assert_eq!(calls[0].member("value"), Value::Number(7861.0));
    assert_eq!(calls[1].member("value"), Value::from("previous=7861"));
    assert_eq!(result.output, Value::from("previous=7861"));
}

#[tokio::test]
async fn first_failure_halts_with_step_index() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(
        r#"{"run": [
            {"method": "test.record", "params": {"value": 1}},
            {"method": "test.fail"},
            {"method": "test.record", "params": {"value": 3}}
        ]}"#,
        "fail.json",
    )
    .unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    let failure = result.failure().expect("execution should fail");
    assert_eq!(failure.step_index, 1);
    assert_eq!(failure.capability, "test.fail");
    assert_eq!(failure.kind, "command");
    assert_eq!(harness.calls().len(), 1);
    assert!(matches!(result.into_result(), Err(Error::StepFailure(_))));
}

#[tokio::test]
async fn unknown_capability_fails_the_step() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(r#"[{"method": "gpu.overclock"}]"#, "unknown.json").unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    let failure = result.failure().expect("execution should fail");
    assert_eq!(failure.step_index, 0);
    assert!(failure.reason.contains("gpu.overclock"));
}

#[tokio::test]
async fn inline_sub_script_gets_params_as_args_and_exports() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(
        r#"{"run": [
            {"method": "script.start", "params": {
                "params": {"model": "sdxl"},
                "run": [
                    {"method": "test.record", "params": {"value": "{{ args.model }}"}},
                    {"method": "local.export", "params": {"weights": "{{ args.model }}.safetensors"}}
                ]
            }},
            {"method": "test.record", "params": {"value": "{{ local.weights }}"}}
        ]}"#,
        "nested.json",
    )
    .unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    assert!(result.is_success(), "{:?}", result.failure());
    let calls = harness.calls();
    assert_eq!(calls[0].member("value"), Value::from("sdxl"));
    assert_eq!(calls[1].member("value"), Value::from("sdxl.safetensors"));
}

#[tokio::test]
async fn self_including_script_hits_depth_limit() {
    let harness = Harness::new();
    let path = harness.dir.path().join("loop.json");
    std::fs::write(
        &path,
        r#"{"run": [{"method": "script.start", "params": {"uri": "loop.json"}}]}"#,
    )
    .unwrap();
    let doc = ScriptDocument::from_file(&path).unwrap();

    let mut ctx = harness.context().with_script_dir(Some(harness.dir.path().to_path_buf()));
    let result = harness.execute(&doc, &mut ctx).await;

    let failure = result.failure().expect("execution should fail");
    assert!(
        failure.reason.contains("maximum depth"),
        "unexpected reason: {}",
        failure.reason
    );
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(r#"[{"method": "test.record"}]"#, "cancel.json").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let progress = Progress::new(harness.sink.clone(), "demo", Phase::Exec);
    let mut ctx = harness.context();
    let result = harness
        .interpreter
        .execute(&doc, &mut ctx, &progress, &cancel)
        .await;

    assert_eq!(
        result.outcome,
        ExecutionOutcome::Cancelled {
            step_index: Some(0)
        }
    );
    assert!(harness.calls().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn shell_failure_reports_stderr() {
    let harness = Harness::new();
    let doc = ScriptDocument::parse(
        r#"[
            {"method": "shell.run", "params": {"message": "echo fetching"}},
            {"method": "shell.run", "params": {"message": "echo 'CUDA not found' >&2; exit 3"}},
            {"method": "test.record"}
        ]"#,
        "shell.json",
    )
    .unwrap();

    let mut ctx = harness.context();
    let result = harness.execute(&doc, &mut ctx).await;

    let failure = result.failure().expect("execution should fail");
    assert_eq!(failure.step_index, 1);
    assert!(failure.stderr.contains("CUDA not found"));
    assert!(harness.calls().is_empty());
    assert!(harness
        .sink
        .events()
        .iter()
        .any(|e| e.message.contains("fetching")));
}
