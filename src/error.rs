// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::script::StepFailure;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Expression error: {0}")]
    #[diagnostic(
        code(appforge::expr::evaluation),
        help("Check the {{{{ }}}} placeholders and `when` guards in the script")
    )]
    Evaluation(String),

    #[error("Command `{command}` exited with code {exit_code}")]
    #[diagnostic(code(appforge::command::failed))]
    CommandFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {after:?}")]
    #[diagnostic(
        code(appforge::command::timeout),
        help("The command was killed. Raise `timeout` on the step if it legitimately runs long")
    )]
    TimedOut { command: String, after: Duration },

    #[error("Environment error for '{app}': {reason}")]
    #[diagnostic(
        code(appforge::environment::error),
        help("Inspect the package installer output above, or recreate the environment with a fresh install")
    )]
    Environment { app: String, reason: String },

    #[error("{0}")]
    #[diagnostic(code(appforge::script::step_failed))]
    StepFailure(Box<StepFailure>),

    #[error("Registry conflict for '{app}': {detail}")]
    #[diagnostic(code(appforge::state::reconciliation))]
    ReconciliationConflict { app: String, detail: String },

    #[error("Another operation is already running for '{0}'")]
    #[diagnostic(
        code(appforge::coordinator::in_progress),
        help("Wait for the running operation to finish, or cancel it first")
    )]
    OperationInProgress(String),

    #[error("Application not found: {0}")]
    #[diagnostic(
        code(appforge::app::not_found),
        help("List known applications with `appforge status`")
    )]
    AppNotFound(String),

    #[error("Application '{app}' is {actual}, expected {expected}")]
    #[diagnostic(code(appforge::app::invalid_state))]
    InvalidState {
        app: String,
        expected: String,
        actual: String,
    },

    #[error("Script not found: {0}")]
    #[diagnostic(
        code(appforge::script::not_found),
        help("Scripts resolve relative to the including script first, then by name in the library directory")
    )]
    ScriptNotFound(String),

    #[error("Script parse error in {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("Unknown capability: {0}")]
    #[diagnostic(
        code(appforge::script::unknown_capability),
        help("Supported methods: shell.run, script.start, fs.download, fs.write, fs.link, local.set, local.export, env.install, log")
    )]
    UnknownCapability(String),

    #[error("Capability '{capability}' rejected its arguments: {reason}")]
    InvalidArgument { capability: String, reason: String },

    #[error("Sub-script inclusion exceeded the maximum depth of {0}")]
    #[diagnostic(
        code(appforge::script::depth),
        help("A script.start chain is probably including itself")
    )]
    IncludeDepthExceeded(usize),

    #[error("Operation cancelled for '{0}'")]
    Cancelled(String),

    #[error("Process error: {0}")]
    #[diagnostic(
        code(appforge::process::error),
        help("Check that the command exists and is executable")
    )]
    Process(String),

    #[error("Daemon error for '{app}': {reason}")]
    Daemon { app: String, reason: String },

    #[error("Application '{0}' health check failed: {1}")]
    HealthCheckFailed(String, String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(appforge::filesystem::error))]
    Filesystem(String),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::AppNotFound(name) => Some(format!(
                "Install it first with: appforge install {} <source>",
                name
            )),
            Error::OperationInProgress(name) => Some(format!(
                "'{}' is busy. Re-run the command once the current operation finishes.",
                name
            )),
            Error::InvalidState { app, expected, .. } if expected == "Stopped" => Some(format!(
                "Stop the application first with: appforge stop {}",
                app
            )),
            Error::InvalidState { app, expected, .. } if expected == "Installed" => Some(format!(
                "Install the application first with: appforge install {} <source>",
                app
            )),
            Error::StepFailure(failure) => Some(format!(
                "Step {} ({}) failed. The captured output above shows why; re-run the operation after fixing it.",
                failure.step_index, failure.capability
            )),
            Error::TimedOut { .. } => Some(
                "The command appears to hang. Raise the step `timeout` if it needs longer."
                    .to_string(),
            ),
            Error::Environment { app, .. } => Some(format!(
                "Uninstall and reinstall '{}' to rebuild its environment.",
                app
            )),
            Error::Config(_) => Some("Check appforge.yaml in the managed root.".to_string()),
            Error::Process(_) => {
                Some("Check that the command exists and is executable".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }

    /// Short machine-friendly classification used in progress events and
    /// registry `last_error` prefixes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Evaluation(_) => "evaluation",
            Error::CommandFailure { .. } => "command",
            Error::TimedOut { .. } => "timeout",
            Error::Environment { .. } => "environment",
            Error::StepFailure(_) => "step",
            Error::ReconciliationConflict { .. } => "reconciliation",
            Error::OperationInProgress(_) => "in-progress",
            Error::Cancelled(_) => "cancelled",
            _ => "error",
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, app_name: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for '{}' (refers to process group, not a process)",
                app_name
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("refusing to signal PID 1 (init) for '{}'", app_name),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("PID {} exceeds i32::MAX for '{}'", pid, app_name),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1, for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}
