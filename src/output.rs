use appforge::script::{EventKind, Level};
use appforge::{ProgressEvent, ProgressSink};
use std::sync::Arc;

/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// `--quiet` can suppress everything but errors.
pub trait UserOutput: Send + Sync {
    /// Informational status message (e.g., "Installing 'comfyui'...")
    fn status(&self, message: &str);

    /// Success message (e.g., "'comfyui' installed")
    fn success(&self, message: &str);

    fn warning(&self, message: &str);

    fn error(&self, message: &str);

    /// Raw output line from a command
    fn output_line(&self, line: &str, is_stderr: bool);
}

/// Standard CLI output: stdout/stderr with ANSI colors.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn output_line(&self, line: &str, is_stderr: bool) {
        if is_stderr {
            eprintln!("  {}", line);
        } else {
            println!("  {}", line);
        }
    }
}

/// Prints errors only.
pub struct QuietOutput;

impl UserOutput for QuietOutput {
    fn status(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, message: &str) {
        eprintln!("{}", message);
    }
    fn output_line(&self, _line: &str, _is_stderr: bool) {}
}

/// Renders engine progress events through a [`UserOutput`].
pub struct OutputSink(pub Arc<dyn UserOutput>);

impl ProgressSink for OutputSink {
    fn emit(&self, event: ProgressEvent) {
        let indent = "  ".repeat(event.depth);
        let step = event
            .step_index
            .map(|i| format!("[{}] ", i))
            .unwrap_or_default();
        match event.kind {
            EventKind::Output { stderr } => self.0.output_line(&event.message, stderr),
            EventKind::StepStarted => self.0.status(&format!("{}{}-> {}", indent, step, event.message)),
            EventKind::StepSkipped | EventKind::StepCompleted => {
                tracing::debug!(app = %event.app, "{}{}", step, event.message)
            }
            EventKind::StepFailed => self.0.error(&format!("{}{}failed: {}", indent, step, event.message)),
            EventKind::Message => match event.level {
                Level::Debug => tracing::debug!(app = %event.app, "{}", event.message),
                Level::Info => self.0.status(&format!("{}{}", indent, event.message)),
                Level::Warn => self.0.warning(&format!("{}{}", indent, event.message)),
                Level::Error => self.0.error(&format!("{}{}", indent, event.message)),
            },
        }
    }
}
