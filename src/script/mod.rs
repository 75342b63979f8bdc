//! Script interpretation: documents, runtime scope, capabilities and the
//! step interpreter.

pub mod capabilities;
pub mod capability;
pub mod context;
pub mod document;
pub mod interpreter;
pub mod progress;

pub use capability::{CapabilityRegistry, Capability, CapturedOutput, Services, StepCall};
pub use context::{LaunchedDaemon, RuntimeContext};
pub use document::{find_script, has_scripts, resolve_script_ref, ScriptDocument, ScriptKind, Step};
pub use interpreter::{
    ExecutionOutcome, ExecutionResult, ExecutionState, Interpreter, StepFailure, StepReport,
    StepStatus,
};
pub use progress::{
    ChannelSink, EventKind, FanoutSink, Level, MemorySink, NullSink, Phase, Progress,
    ProgressEvent, ProgressSink,
};
