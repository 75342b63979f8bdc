use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Registry format version written to disk.
pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallState {
    NotInstalled,
    Installing,
    Installed,
    Failed,
}

impl InstallState {
    /// Forward-only, except retry after failure and uninstall.
    pub fn can_transition_to(&self, next: InstallState) -> bool {
        use InstallState::*;
        matches!(
            (self, next),
            (NotInstalled, Installing)
                | (Installing, Installed)
                | (Installing, Failed)
                | (Failed, Installing)
                | (Installed, NotInstalled)
                | (Failed, NotInstalled)
        )
    }
}

impl std::fmt::Display for InstallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Crashed,
}

impl RunState {
    /// States in which a process is expected to exist.
    pub fn expects_process(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running | RunState::Unhealthy)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Identifies a process across engine restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub pid: u32,
    /// Start time in clock ticks, guards against PID reuse
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub name: String,
    pub install_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<PathBuf>,
    /// Where the application was installed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub install_state: InstallState,
    pub run_state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_handle: Option<ProcessHandle>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl AppRecord {
    pub fn new(name: &str, install_path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            install_path,
            environment_ref: None,
            source: None,
            install_state: InstallState::NotInstalled,
            run_state: RunState::Stopped,
            process_handle: None,
            exposed_ports: Vec::new(),
            last_error: None,
            installed_at: None,
            last_run_at: None,
        }
    }

    /// Apply an install-state transition, rejecting illegal ones.
    pub fn set_install_state(&mut self, next: InstallState) -> Result<()> {
        if self.install_state == next {
            return Ok(());
        }
        if !self.install_state.can_transition_to(next) {
            return Err(Error::InvalidState {
                app: self.name.clone(),
                expected: format!("a state that can become {}", next),
                actual: self.install_state.to_string(),
            });
        }
        self.install_state = next;
        if next == InstallState::Installed {
            self.installed_at = Some(Utc::now());
            self.last_error = None;
        }
        Ok(())
    }

    /// Reset the run state and forget the process.
    pub fn mark_stopped(&mut self) {
        self.run_state = RunState::Stopped;
        self.process_handle = None;
        self.exposed_ports.clear();
    }
}

/// All records, keyed by application name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    #[serde(default)]
    pub apps: BTreeMap<String, AppRecord>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            apps: BTreeMap::new(),
        }
    }
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<&AppRecord> {
        self.apps.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AppRecord> {
        self.apps.get_mut(name)
    }

    pub fn insert(&mut self, record: AppRecord) -> Option<AppRecord> {
        self.apps.insert(record.name.clone(), record)
    }

    pub fn remove(&mut self, name: &str) -> Option<AppRecord> {
        self.apps.remove(name)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &AppRecord> {
        self.apps.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_state_transitions() {
        use InstallState::*;
        assert!(NotInstalled.can_transition_to(Installing));
        assert!(Failed.can_transition_to(Installing));
        assert!(Installed.can_transition_to(NotInstalled));
        assert!(!Installed.can_transition_to(Installing));
        assert!(!Installed.can_transition_to(Failed));
        assert!(!NotInstalled.can_transition_to(Installed));
    }

    #[test]
    fn test_set_install_state_stamps_time() {
        let mut record = AppRecord::new("comfyui", PathBuf::from("/apps/comfyui"));
        record.set_install_state(InstallState::Installing).unwrap();
        record.last_error = Some("previous".into());
        record.set_install_state(InstallState::Installed).unwrap();
        assert!(record.installed_at.is_some());
        assert!(record.last_error.is_none());
        assert!(matches!(
            record.set_install_state(InstallState::Failed),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_record_json_shape() {
        let mut record = AppRecord::new("fooocus", PathBuf::from("/apps/fooocus"));
        record.run_state = RunState::Running;
        record.process_handle = Some(ProcessHandle {
            pid: 4242,
            fingerprint: Some(99),
        });
        record.exposed_ports = vec![7865];
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["installPath"], "/apps/fooocus");
        assert_eq!(json["runState"], "Running");
        assert_eq!(json["processHandle"]["pid"], 4242);
        assert_eq!(json["exposedPorts"][0], 7865);
        assert!(json.get("lastError").is_none());
    }
}
