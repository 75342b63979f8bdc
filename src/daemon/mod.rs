//! Long-running server supervision.

mod log_capture;
mod manager;
mod types;

pub use log_capture::{read_file_tail, LogCapture, DEFAULT_MAX_LOG_LINES};
pub use manager::{calculate_backoff_delay, detect_port, DaemonManager};
pub use types::{DaemonEvent, DaemonInfo, DaemonSpec, DaemonStarted, DaemonState};
