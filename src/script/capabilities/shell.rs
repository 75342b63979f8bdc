use crate::command::{CommandOutput, CommandSpec, CommandStatus, TargetEnvironment};
use crate::daemon::DaemonSpec;
use crate::environment::{target_at, CreateOptions};
use crate::error::{Error, Result};
use crate::expr::Value;
use crate::script::capability::{Capability, StepCall};
use crate::script::context::LaunchedDaemon;
use crate::script::progress::{EventKind, Level};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Characters of stderr kept in a `CommandFailure`.
const STDERR_TAIL: usize = 4000;

/// `shell.run`: run one or more shell commands, or launch a daemon.
pub struct ShellRun;

#[async_trait]
impl Capability for ShellRun {
    fn name(&self) -> &'static str {
        "shell.run"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let commands = call.string_list("message")?;
        if commands.is_empty() {
            return Err(invalid("`message` is required"));
        }

        let cwd = match call.str_param("path")? {
            Some(path) => call.ctx.resolve_path(&path),
            None => call.ctx.cwd.clone(),
        };
        let mut env: HashMap<String, String> = call.ctx.app_env.as_ref().clone();
        env.extend(call.string_map("env")?);
        let target = activation(call, &cwd).await?;

        if call.bool_param("daemon", false)? {
            return launch_daemon(call, commands, cwd, env, target).await;
        }

        let timeout = call
            .duration_param("timeout")?
            .unwrap_or(call.services.config.command_timeout);
        let ignore_failure = call.bool_param("ignore_failure", false)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = 0;
        for command in &commands {
            let mut spec = CommandSpec::shell(command.as_str())
                .cwd(&cwd)
                .envs(env.clone())
                .timeout(timeout)
                .cancel_on(call.cancel.clone());
            if let Some(target) = &target {
                spec = spec.target_env(target.clone());
            }

            call.emit(Level::Info, format!("$ {}", command));
            let output = run_streamed(call, &spec).await?;
            stdout.push_str(&output.stdout);
            stderr.push_str(&output.stderr);

            match output.status {
                CommandStatus::Exited(0) => {}
                CommandStatus::Exited(code) => {
                    exit_code = code;
                    if ignore_failure {
                        call.emit(
                            Level::Warn,
                            format!("`{}` exited with code {} (ignored)", command, code),
                        );
                        continue;
                    }
                    call.captured.stdout = stdout;
                    call.captured.stderr = stderr;
                    return Err(Error::CommandFailure {
                        command: command.clone(),
                        exit_code: code,
                        stderr: tail_chars(&output.stderr, STDERR_TAIL),
                    });
                }
                CommandStatus::TimedOut => {
                    call.captured.stdout = stdout;
                    call.captured.stderr = stderr;
                    return Err(Error::TimedOut {
                        command: command.clone(),
                        after: timeout,
                    });
                }
                CommandStatus::Cancelled => return Err(Error::Cancelled(call.ctx.app.clone())),
                CommandStatus::Killed => {
                    call.captured.stdout = stdout;
                    call.captured.stderr = stderr;
                    return Err(Error::Process(format!("`{}` was killed", command)));
                }
            }
        }

        Ok(Value::object([
            ("stdout", Value::from(stdout)),
            ("stderr", Value::from(stderr)),
            ("exit_code", Value::from(exit_code as i64)),
        ]))
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidArgument {
        capability: "shell.run".to_string(),
        reason: reason.into(),
    }
}

fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        text.chars().skip(count - max).collect()
    }
}

/// Resolve the `venv` parameter. `true` activates the application's
/// environment; a string names an environment directory relative to `cwd`.
/// Either is created if missing.
async fn activation(call: &StepCall<'_>, cwd: &std::path::Path) -> Result<Option<TargetEnvironment>> {
    match call.param("venv") {
        Value::Undefined | Value::Null | Value::Bool(false) => Ok(None),
        Value::Bool(true) => {
            let environments = &call.services.environments;
            environments
                .create(&call.ctx.app, CreateOptions::default())
                .await?;
            Ok(Some(environments.target(&call.ctx.app)))
        }
        Value::String(path) if !path.is_empty() => {
            let root = cwd.join(&path);
            if !root.exists() {
                call.emit(Level::Info, format!("Creating environment {}", root.display()));
                let spec = CommandSpec::new(crate::command::CommandLine::exec(
                    call.services.config.python.clone(),
                    ["-m".to_string(), "venv".to_string(), root.to_string_lossy().into_owned()],
                ))
                .cwd(cwd)
                .timeout(call.services.config.command_timeout);
                let output = call.services.runner.run_sync(&spec).await?;
                if !output.success() {
                    return Err(Error::Environment {
                        app: call.ctx.app.clone(),
                        reason: format!("creating {} failed: {}", root.display(), output.stderr.trim()),
                    });
                }
            }
            Ok(Some(target_at(root)))
        }
        other => Err(invalid(format!(
            "`venv` must be a boolean or path, found {}",
            other.type_name()
        ))),
    }
}

/// Run one command, forwarding each line as a progress event.
async fn run_streamed(call: &StepCall<'_>, spec: &CommandSpec) -> Result<CommandOutput> {
    let progress = call.progress.clone();
    let index = call.index;
    let depth = call.ctx.depth;
    let on_output = Arc::new(move |line: &str, is_stderr: bool| {
        progress.step(
            index,
            depth,
            EventKind::Output { stderr: is_stderr },
            Level::Debug,
            line,
        );
    });
    let mut handle = call.services.runner.run_streamed(spec, on_output).await?;
    handle.wait().await
}

async fn launch_daemon(
    call: &mut StepCall<'_>,
    commands: Vec<String>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    target: Option<TargetEnvironment>,
) -> Result<Value> {
    let Some(daemons) = call.services.daemons.clone() else {
        return Err(invalid("`daemon: true` is only allowed in start scripts"));
    };

    let ready = match call.str_param("ready")? {
        Some(pattern) => Some(
            Regex::new(&pattern).map_err(|e| invalid(format!("invalid `ready` pattern: {}", e)))?,
        ),
        None => None,
    };
    let port = match call.param("port") {
        Value::Undefined | Value::Null => None,
        Value::Number(n) if n >= 1.0 && n <= u16::MAX as f64 && n.fract() == 0.0 => Some(n as u16),
        Value::String(s) => Some(s.parse().map_err(|_| invalid(format!("invalid `port` '{}'", s)))?),
        other => return Err(invalid(format!("invalid `port` {}", other))),
    };
    let ready_timeout = call
        .duration_param("timeout")?
        .unwrap_or(call.services.config.ready_timeout);

    let mut command = CommandSpec::shell(commands.join("\n")).cwd(cwd).envs(env);
    if let Some(target) = target {
        command = command.target_env(target);
    }

    let app = call.ctx.app.clone();
    call.emit(Level::Info, format!("Launching daemon for '{}'", app));
    let started = daemons
        .start(DaemonSpec {
            app: app.clone(),
            command,
            ready,
            port,
            restart_policy: None,
            ready_timeout,
        })
        .await?;

    call.ctx.record_launch(LaunchedDaemon {
        app,
        pid: started.pid,
        port: started.port,
    });
    Ok(Value::object([
        ("pid", Value::from(started.pid as i64)),
        (
            "port",
            started
                .port
                .map(|p| Value::from(p as i64))
                .unwrap_or(Value::Null),
        ),
    ]))
}
