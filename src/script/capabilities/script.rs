use crate::error::{Error, Result};
use crate::expr::Value;
use crate::script::capability::{Capability, StepCall};
use crate::script::document::{resolve_script_ref, ScriptDocument};
use crate::script::interpreter::ExecutionOutcome;
use crate::script::progress::Level;
use async_trait::async_trait;

/// `script.start`: run a library script, a relative script file, or an
/// inline `run` list in a child scope.
///
/// `params` becomes the child's `args`. Locals flow back to the caller only
/// through `local.export`.
pub struct ScriptStart;

#[async_trait]
impl Capability for ScriptStart {
    fn name(&self) -> &'static str {
        "script.start"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let max_depth = call.interpreter.max_depth();
        if call.ctx.depth + 1 > max_depth {
            return Err(Error::IncludeDepthExceeded(max_depth));
        }

        let document = match &call.step.children {
            Some(children) => children.clone(),
            None => {
                let uri = call.required_str("uri")?;
                let library = call.services.config.library_dir();
                let path = resolve_script_ref(&uri, call.ctx.script_dir.as_deref(), &library)?;
                call.emit(Level::Debug, format!("Including {}", path.display()));
                ScriptDocument::from_file(&path)?
            }
        };

        let args = call.param("params");
        let mut child = call.ctx.child(args, document.base_dir.clone());
        let result = call
            .interpreter
            .execute_nested(&document, &mut child, call.progress, call.cancel)
            .await;

        match result.outcome {
            ExecutionOutcome::Completed => {
                call.ctx.absorb_exports(&child);
                Ok(result.output)
            }
            ExecutionOutcome::Failed(failure) => Err(Error::StepFailure(failure)),
            ExecutionOutcome::Cancelled { .. } => Err(Error::Cancelled(call.ctx.app.clone())),
        }
    }
}
