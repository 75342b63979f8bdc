//! Structured progress events produced while operations run.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

type SyncMutex<T> = parking_lot::Mutex<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Install,
    Run,
    Stop,
    Uninstall,
    /// Ad-hoc script execution
    Exec,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Install => "install",
            Phase::Run => "run",
            Phase::Stop => "stop",
            Phase::Uninstall => "uninstall",
            Phase::Exec => "exec",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StepStarted,
    StepSkipped,
    StepCompleted,
    StepFailed,
    /// One line of command output
    Output { stderr: bool },
    Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub app: String,
    pub phase: Phase,
    pub step_index: Option<usize>,
    /// Sub-script nesting level of the step
    pub depth: usize,
    pub kind: EventKind,
    pub message: String,
    pub level: Level,
}

/// Receives progress events. Implementations must be cheap; they are called
/// inline from the interpreter and from output delivery tasks.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::UnboundedSender<ProgressEvent>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.0.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: SyncMutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

/// Sends events to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink(pub Vec<Arc<dyn ProgressSink>>);

impl ProgressSink for FanoutSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.0 {
            sink.emit(event.clone());
        }
    }
}

/// Fills in app and phase for every event of one operation.
#[derive(Clone)]
pub struct Progress {
    sink: Arc<dyn ProgressSink>,
    app: String,
    phase: Phase,
}

impl Progress {
    pub fn new(sink: Arc<dyn ProgressSink>, app: &str, phase: Phase) -> Self {
        Self {
            sink,
            app: app.to_string(),
            phase,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step(&self, index: usize, depth: usize, kind: EventKind, level: Level, message: impl Into<String>) {
        self.sink.emit(ProgressEvent {
            app: self.app.clone(),
            phase: self.phase,
            step_index: Some(index),
            depth,
            kind,
            message: message.into(),
            level,
        });
    }

    pub fn message(&self, level: Level, message: impl Into<String>) {
        self.sink.emit(ProgressEvent {
            app: self.app.clone(),
            phase: self.phase,
            step_index: None,
            depth: 0,
            kind: EventKind::Message,
            message: message.into(),
            level,
        });
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("app", &self.app)
            .field("phase", &self.phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        let progress = Progress::new(Arc::new(sink), "comfy", Phase::Install);
        progress.step(0, 0, EventKind::StepStarted, Level::Info, "one");
        progress.step(0, 0, EventKind::StepCompleted, Level::Info, "two");
        progress.message(Level::Warn, "three");
        drop(progress);
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event.message);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink(vec![a.clone(), b.clone()]);
        Progress::new(Arc::new(fanout), "x", Phase::Run).message(Level::Info, "hi");
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events()[0].phase, Phase::Run);
    }
}
