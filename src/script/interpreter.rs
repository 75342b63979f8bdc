use super::capability::{CapabilityRegistry, CapturedOutput, Services, StepCall};
use super::context::RuntimeContext;
use super::document::{ScriptDocument, Step};
use super::progress::{EventKind, Level, Progress};
use crate::error::{Error, Result};
use crate::expr::{evaluate_guard, render_value, Value};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub capability: String,
    pub status: StepStatus,
}

/// Why a script stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step_index: usize,
    pub capability: String,
    /// Error classification, see [`Error::kind`]
    pub kind: String,
    pub reason: String,
    pub stdout: String,
    pub stderr: String,
    pub source_name: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Step {} ({}) of {} failed: {}",
            self.step_index, self.capability, self.source_name, self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Failed(Box<StepFailure>),
    /// Cancelled before or during the step at this index
    Cancelled { step_index: Option<usize> },
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub app: String,
    pub outcome: ExecutionOutcome,
    pub steps: Vec<StepReport>,
    /// Value returned by the last executed step
    pub output: Value,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Cancelled executions count as failed.
    pub fn state(&self) -> ExecutionState {
        match self.outcome {
            ExecutionOutcome::Completed => ExecutionState::Completed,
            _ => ExecutionState::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Completed
    }

    pub fn failure(&self) -> Option<&StepFailure> {
        match &self.outcome {
            ExecutionOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<Self> {
        match &self.outcome {
            ExecutionOutcome::Completed => Ok(self),
            ExecutionOutcome::Failed(failure) => Err(Error::StepFailure(failure.clone())),
            ExecutionOutcome::Cancelled { .. } => Err(Error::Cancelled(self.app)),
        }
    }
}

/// Executes script documents step by step.
///
/// Steps run strictly in order. A false guard skips the step without
/// rendering its parameters. The first failing step ends the execution.
pub struct Interpreter {
    registry: Arc<CapabilityRegistry>,
    services: Services,
    max_depth: usize,
}

impl Interpreter {
    pub fn new(registry: Arc<CapabilityRegistry>, services: Services) -> Self {
        let max_depth = services.config.max_include_depth;
        Self {
            registry,
            services,
            max_depth,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[tracing::instrument(
        skip_all,
        fields(app.name = %ctx.app, script = %doc.source_name, depth = ctx.depth)
    )]
    pub async fn execute(
        &self,
        doc: &ScriptDocument,
        ctx: &mut RuntimeContext,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.execute_nested(doc, ctx, progress, cancel).await
    }

    /// Boxed entry point used for sub-script recursion.
    pub fn execute_nested<'a>(
        &'a self,
        doc: &'a ScriptDocument,
        ctx: &'a mut RuntimeContext,
        progress: &'a Progress,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, ExecutionResult> {
        async move { self.run_steps(doc, ctx, progress, cancel).await }.boxed()
    }

    async fn run_steps(
        &self,
        doc: &ScriptDocument,
        ctx: &mut RuntimeContext,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let mut steps = Vec::with_capacity(doc.steps.len());
        let mut output = Value::Undefined;
        let depth = ctx.depth;
        let app = ctx.app.clone();

        let finish =
            |outcome: ExecutionOutcome, steps: Vec<StepReport>, output: Value| ExecutionResult {
                app: app.clone(),
                outcome,
                steps,
                output,
                duration: started.elapsed(),
            };

        if depth > self.max_depth {
            let failure = self.failure(
                doc,
                0,
                "script.start",
                &Error::IncludeDepthExceeded(self.max_depth),
                CapturedOutput::default(),
            );
            return finish(ExecutionOutcome::Failed(Box::new(failure)), steps, output);
        }

        tracing::debug!(steps = doc.steps.len(), "Executing script");

        for (index, step) in doc.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                progress.step(index, depth, EventKind::StepFailed, Level::Warn, "cancelled");
                return finish(
                    ExecutionOutcome::Cancelled {
                        step_index: Some(index),
                    },
                    steps,
                    output,
                );
            }

            if let Some(guard) = &step.guard {
                match evaluate_guard(guard, &*ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(
                            index,
                            capability = %step.capability,
                            "Guard false, skipping"
                        );
                        progress.step(
                            index,
                            depth,
                            EventKind::StepSkipped,
                            Level::Debug,
                            format!("skipped {} (when: {})", step.capability, guard),
                        );
                        steps.push(report(index, step, StepStatus::Skipped));
                        continue;
                    }
                    Err(e) => {
                        return self.fail(
                            doc,
                            index,
                            step,
                            e,
                            CapturedOutput::default(),
                            progress,
                            depth,
                            steps,
                            output,
                            &finish,
                        );
                    }
                }
            }

            progress.step(
                index,
                depth,
                EventKind::StepStarted,
                Level::Info,
                step.capability.clone(),
            );

            let result = self.dispatch(index, step, ctx, progress, cancel).await;
            match result {
                Ok(value) => {
                    ctx.input = value.clone();
                    output = value;
                    progress.step(
                        index,
                        depth,
                        EventKind::StepCompleted,
                        Level::Info,
                        step.capability.clone(),
                    );
                    steps.push(report(index, step, StepStatus::Completed));
                }
                Err((e, _)) if cancel.is_cancelled() || matches!(e, Error::Cancelled(_)) => {
                    progress.step(index, depth, EventKind::StepFailed, Level::Warn, "cancelled");
                    steps.push(report(index, step, StepStatus::Failed));
                    return finish(
                        ExecutionOutcome::Cancelled {
                            step_index: Some(index),
                        },
                        steps,
                        output,
                    );
                }
                Err((e, captured)) => {
                    return self.fail(
                        doc, index, step, e, captured, progress, depth, steps, output, &finish,
                    );
                }
            }
        }

        finish(ExecutionOutcome::Completed, steps, output)
    }

    /// Render parameters and invoke the capability.
    async fn dispatch(
        &self,
        index: usize,
        step: &Step,
        ctx: &mut RuntimeContext,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, (Error, CapturedOutput)> {
        let no_output = |e| (e, CapturedOutput::default());

        // Inline sub-scripts render against their own context when they run.
        let arguments = match (&step.children, &step.arguments) {
            (Some(_), Value::Object(map)) => {
                let mut map = map.clone();
                map.remove("run");
                Value::Object(map)
            }
            (_, arguments) => arguments.clone(),
        };
        let params = render_value(&arguments, &*ctx).map_err(no_output)?;

        let capability = self
            .registry
            .get(&step.capability)
            .ok_or_else(|| no_output(Error::UnknownCapability(step.capability.clone())))?;

        tracing::debug!(index, capability = %step.capability, "Dispatching step");
        let mut call = StepCall {
            index,
            step,
            params,
            ctx,
            services: &self.services,
            progress,
            cancel,
            interpreter: self,
            captured: CapturedOutput::default(),
        };
        let result = capability.invoke(&mut call).await;
        let captured = std::mem::take(&mut call.captured);
        result.map_err(|e| (e, captured))
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        doc: &ScriptDocument,
        index: usize,
        step: &Step,
        error: Error,
        captured: CapturedOutput,
        progress: &Progress,
        depth: usize,
        mut steps: Vec<StepReport>,
        output: Value,
        finish: &dyn Fn(ExecutionOutcome, Vec<StepReport>, Value) -> ExecutionResult,
    ) -> ExecutionResult {
        let failure = self.failure(doc, index, &step.capability, &error, captured);
        tracing::warn!(index, capability = %step.capability, "Step failed: {}", failure.reason);
        progress.step(index, depth, EventKind::StepFailed, Level::Error, failure.reason.clone());
        steps.push(report(index, step, StepStatus::Failed));
        finish(ExecutionOutcome::Failed(Box::new(failure)), steps, output)
    }

    fn failure(
        &self,
        doc: &ScriptDocument,
        index: usize,
        capability: &str,
        error: &Error,
        captured: CapturedOutput,
    ) -> StepFailure {
        let (mut stdout, mut stderr) = (captured.stdout, captured.stderr);
        if let Error::StepFailure(nested) = error {
            if stdout.is_empty() && stderr.is_empty() {
                stdout = nested.stdout.clone();
                stderr = nested.stderr.clone();
            }
        }
        if let Error::CommandFailure { stderr: command_stderr, .. } = error {
            if stderr.is_empty() {
                stderr = command_stderr.clone();
            }
        }
        StepFailure {
            step_index: index,
            capability: capability.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
            stdout,
            stderr,
            source_name: doc.source_name.clone(),
        }
    }
}

fn report(index: usize, step: &Step, status: StepStatus) -> StepReport {
    StepReport {
        index,
        capability: step.capability.clone(),
        status,
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("registry", &self.registry)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}
