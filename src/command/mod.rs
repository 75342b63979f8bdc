//! Running host commands.
//!
//! [`CommandRunner`] is the seam between the engine and the operating
//! system. [`ShellRunner`] is the real implementation; tests substitute a
//! recording fake.
//!
//! A non-zero exit code is data ([`CommandStatus::Exited`]), not an error.
//! A timeout is reported as [`CommandStatus::TimedOut`] after the process
//! group has been killed.

mod runner;
mod shell;

pub use runner::{CommandRunner, OutputCallback, StreamHandle};
pub use shell::ShellRunner;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A shell snippet run with `bash -c`
    Shell(String),
    /// A program and its arguments, no shell involved
    Exec { program: String, args: Vec<String> },
}

impl CommandLine {
    pub fn shell(script: impl Into<String>) -> Self {
        CommandLine::Shell(script.into())
    }

    pub fn exec<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Exec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandLine::Shell(script) => write!(f, "{}", script),
            CommandLine::Exec { program, args } => {
                write!(f, "{}", program)?;
                for arg in args {
                    write!(f, " {}", shell_escape::escape(arg.as_str().into()))?;
                }
                Ok(())
            }
        }
    }
}

/// An environment to activate for a command: its `bin` directory is put
/// first on `PATH` and `VIRTUAL_ENV` points at its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEnvironment {
    pub root: PathBuf,
    pub bin_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: CommandLine,
    pub cwd: Option<PathBuf>,
    /// Merged over the inherited environment; these win on conflict
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub target_env: Option<TargetEnvironment>,
    /// Cancelling kills the process group and reports `Cancelled`
    pub cancel: Option<CancellationToken>,
}

impl CommandSpec {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            cwd: None,
            env: HashMap::new(),
            timeout: None,
            target_env: None,
            cancel: None,
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(CommandLine::shell(script))
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target_env(mut self, target: TargetEnvironment) -> Self {
        self.target_env = Some(target);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Environment variables the child gets on top of the inherited ones.
    pub fn effective_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(target) = &self.target_env {
            let inherited_path = env
                .get("PATH")
                .cloned()
                .or_else(|| std::env::var("PATH").ok())
                .unwrap_or_default();
            let path = if inherited_path.is_empty() {
                target.bin_dir.to_string_lossy().into_owned()
            } else {
                format!("{}:{}", target.bin_dir.display(), inherited_path)
            };
            env.insert("PATH".to_string(), path);
            env.insert(
                "VIRTUAL_ENV".to_string(),
                target.root.to_string_lossy().into_owned(),
            );
        }
        env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Process exited; signal deaths map to `128 + signal`
    Exited(i32),
    /// Killed after exceeding its timeout
    TimedOut,
    /// Killed because its cancellation token fired
    Cancelled,
    /// Killed through [`StreamHandle::kill`]
    Killed,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            CommandStatus::Exited(code) => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_env_wins() {
        let spec = CommandSpec::shell("true")
            .env("PATH", "/usr/bin")
            .env("HF_HOME", "/cache");
        let env = spec.effective_env();
        assert_eq!(env["PATH"], "/usr/bin");
        assert_eq!(env["HF_HOME"], "/cache");
    }

    #[test]
    fn test_target_env_prefixes_path() {
        let spec = CommandSpec::shell("python -V")
            .env("PATH", "/usr/bin")
            .target_env(TargetEnvironment {
                root: PathBuf::from("/srv/envs/comfy"),
                bin_dir: PathBuf::from("/srv/envs/comfy/bin"),
            });
        let env = spec.effective_env();
        assert_eq!(env["PATH"], "/srv/envs/comfy/bin:/usr/bin");
        assert_eq!(env["VIRTUAL_ENV"], "/srv/envs/comfy");
    }

    #[test]
    fn test_display_escapes_exec_args() {
        let line = CommandLine::exec("pip", ["install", "torch==2.1 cu121"]);
        assert_eq!(line.to_string(), "pip install 'torch==2.1 cu121'");
    }
}
