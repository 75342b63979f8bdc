use super::{
    CommandLine, CommandOutput, CommandRunner, CommandSpec, CommandStatus, OutputCallback,
    StreamHandle,
};
use crate::error::{Error, Result};
use crate::process::signal_group;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines of each stream kept in [`CommandOutput`]; older lines are dropped.
const MAX_CAPTURED_LINES: usize = 5_000;

/// How long to keep draining pipes after the process has exited. Background
/// grandchildren can hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs commands on the host through tokio's process API.
///
/// Every command gets its own process group so that timeouts, cancellation
/// and `kill` reach the children a shell snippet starts.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    shell: Option<String>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific shell binary instead of `bash`.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: Some(shell.into()),
        }
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut cmd = match &spec.command {
            CommandLine::Shell(script) => {
                let shell = self.shell.clone().unwrap_or_else(default_shell);
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(script);
                cmd
            }
            CommandLine::Exec { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(spec.effective_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .process_group(0);
        cmd
    }
}

fn default_shell() -> String {
    which::which("bash")
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "/bin/sh".to_string())
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run_sync(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut handle = self.run_streamed(spec, Arc::new(|_, _| {})).await?;
        handle.wait().await
    }

    async fn run_streamed(
        &self,
        spec: &CommandSpec,
        on_output: OutputCallback,
    ) -> Result<StreamHandle> {
        let label = spec.command.to_string();
        tracing::debug!(command = %label, cwd = ?spec.cwd, "Spawning command");

        let mut child = self.build(spec).spawn().map_err(|e| {
            tracing::error!(command = %label, "Failed to spawn: {}", e);
            Error::Process(format!("Failed to spawn `{}`: {}", label, e))
        })?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, bool)>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, false, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, true, tx.clone()));
        }
        drop(tx);

        // Delivery runs apart from the readers so a slow callback never
        // blocks the pipes. Captured lines live outside the task so they
        // survive an abandoned drain.
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = captured.clone();
        let delivery = tokio::spawn(async move {
            while let Some((line, is_stderr)) = rx.recv().await {
                on_output(&line, is_stderr);
                sink.lock().push(line, is_stderr);
            }
        });

        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let external = spec.cancel.clone();
        let timeout = spec.timeout;
        let started = Instant::now();

        let completion = tokio::spawn(async move {
            enum Ending {
                Exited(std::io::Result<std::process::ExitStatus>),
                TimedOut,
                Cancelled,
                Killed,
            }

            let deadline = async {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            let cancelled = async {
                match &external {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            let ending = tokio::select! {
                status = child.wait() => Ending::Exited(status),
                _ = deadline => Ending::TimedOut,
                _ = cancelled => Ending::Cancelled,
                _ = kill_signal.cancelled() => Ending::Killed,
            };

            let status = match ending {
                Ending::Exited(Ok(status)) => CommandStatus::Exited(exit_code(status)),
                Ending::Exited(Err(e)) => {
                    delivery.abort();
                    return Err(Error::Process(format!("Failed to wait for `{}`: {}", label, e)));
                }
                other => {
                    if let Some(pid) = pid {
                        let _ = signal_group(pid, Signal::SIGKILL, &label);
                    }
                    let _ = child.wait().await;
                    match other {
                        Ending::TimedOut => {
                            tracing::warn!(command = %label, ?timeout, "Command timed out, killed");
                            CommandStatus::TimedOut
                        }
                        Ending::Cancelled => CommandStatus::Cancelled,
                        _ => CommandStatus::Killed,
                    }
                }
            };

            let abort = delivery.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, delivery).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(Error::Process(format!("Output delivery failed: {}", e)));
                }
                Err(_) => {
                    tracing::debug!(command = %label, "Output pipes still open after exit");
                    abort.abort();
                    for reader in &readers {
                        reader.abort();
                    }
                }
            }
            let (stdout, stderr) = std::mem::take(&mut *captured.lock()).into_strings();

            Ok(CommandOutput {
                status,
                stdout,
                stderr,
                duration: started.elapsed(),
            })
        });

        Ok(StreamHandle::new(pid, kill, completion))
    }
}

/// Tail of each stream, bounded by [`MAX_CAPTURED_LINES`].
#[derive(Debug, Default)]
struct Captured {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl Captured {
    fn push(&mut self, line: String, is_stderr: bool) {
        let buffer = if is_stderr {
            &mut self.stderr
        } else {
            &mut self.stdout
        };
        buffer.push_back(line);
        if buffer.len() > MAX_CAPTURED_LINES {
            buffer.pop_front();
        }
    }

    fn into_strings(self) -> (String, String) {
        (join_lines(self.stdout), join_lines(self.stderr))
    }
}

fn spawn_reader<R>(
    stream: R,
    is_stderr: bool,
    tx: mpsc::UnboundedSender<(String, bool)>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((line, is_stderr)).is_err() {
                break;
            }
        }
    })
}

fn join_lines(lines: VecDeque<String>) -> String {
    let mut out = Vec::from(lines).join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
