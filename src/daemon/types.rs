use crate::command::CommandSpec;
use crate::config::RestartPolicy;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    /// Exited without being asked to
    Crashed,
    /// Waiting out the backoff before the next start
    Restarting,
}

impl DaemonState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DaemonState::Starting | DaemonState::Running | DaemonState::Restarting
        )
    }

    /// Valid supervision transitions.
    pub fn can_transition_to(&self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Crashed)
                | (Crashed, Restarting)
                | (Crashed, Stopped)
                | (Restarting, Starting)
                | (Restarting, Stopped)
        )
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Crashed => "crashed",
            DaemonState::Restarting => "restarting",
        };
        f.write_str(name)
    }
}

/// How to launch a daemon.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub app: String,
    pub command: CommandSpec,
    /// Output line that marks the daemon ready
    pub ready: Option<Regex>,
    /// Port the daemon listens on, if known up front
    pub port: Option<u16>,
    /// Overrides the manager's policy for this app
    pub restart_policy: Option<RestartPolicy>,
    pub ready_timeout: Duration,
}

/// Returned once a daemon is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStarted {
    pub pid: u32,
    pub port: Option<u16>,
}

/// Broadcast on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEvent {
    pub app: String,
    pub state: DaemonState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub detail: Option<String>,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonInfo {
    pub app: String,
    pub state: DaemonState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    /// True for daemons found alive after an engine restart
    pub adopted: bool,
}
