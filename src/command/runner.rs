use super::{CommandOutput, CommandSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives `(line, is_stderr)` for every output line of a streamed command.
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output.
    async fn run_sync(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Start the command and return immediately. Output lines go to
    /// `on_output` from a separate delivery task.
    async fn run_streamed(
        &self,
        spec: &CommandSpec,
        on_output: OutputCallback,
    ) -> Result<StreamHandle>;
}

/// Handle to a command started with [`CommandRunner::run_streamed`].
pub struct StreamHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    completion: JoinHandle<Result<CommandOutput>>,
}

impl StreamHandle {
    pub fn new(
        pid: Option<u32>,
        kill: CancellationToken,
        completion: JoinHandle<Result<CommandOutput>>,
    ) -> Self {
        Self {
            pid,
            kill,
            completion,
        }
    }

    /// PID of the process group leader, if the command was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Force-kill the process group. `wait` then reports `Killed`.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Wait for the command to end and all of its output to be delivered.
    ///
    /// Cancel-safe: dropping this future before it resolves leaves the
    /// handle usable. Must not be awaited again after it has resolved.
    pub async fn wait(&mut self) -> Result<CommandOutput> {
        match (&mut self.completion).await {
            Ok(result) => result,
            Err(e) => Err(Error::Process(format!("command task failed: {}", e))),
        }
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("pid", &self.pid)
            .field("finished", &self.completion.is_finished())
            .finish()
    }
}
