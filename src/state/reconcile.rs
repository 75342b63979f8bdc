//! Startup reconciliation of the registry against the filesystem and the
//! process table.
//!
//! Filesystem truth wins for existence; an install interrupted by an engine
//! crash is never resumed and becomes `Failed`.

use super::types::{AppRecord, InstallState, ProcessHandle, Registry};
use crate::error::Error;
use crate::script::has_scripts;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Application directories found under the apps directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemScan {
    /// Directories that contain an install or start script, by name
    pub candidates: BTreeMap<String, PathBuf>,
}

impl FilesystemScan {
    /// List direct subdirectories of `apps_dir` that hold script files.
    pub fn scan(apps_dir: &Path) -> std::io::Result<Self> {
        let mut candidates = BTreeMap::new();
        let entries = match std::fs::read_dir(apps_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !has_scripts(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if !name.starts_with('.') {
                    candidates.insert(name.to_string(), path);
                }
            }
        }
        Ok(Self { candidates })
    }
}

/// What reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records dropped because their install path is gone
    pub removed: Vec<String>,
    /// Interrupted installs marked `Failed`
    pub demoted: Vec<String>,
    /// Records whose process is gone, reset to `Stopped`
    pub reset: Vec<String>,
    /// Records whose process is still alive
    pub alive: Vec<String>,
    /// Records created for discovered directories
    pub discovered: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.demoted.is_empty()
            && self.reset.is_empty()
            && self.discovered.is_empty()
    }
}

fn conflict(app: &str, detail: impl Into<String>) {
    let error = Error::ReconciliationConflict {
        app: app.to_string(),
        detail: detail.into(),
    };
    tracing::warn!("{}", error);
}

pub fn reconcile<F>(registry: &mut Registry, scan: &FilesystemScan, is_alive: F) -> ReconcileReport
where
    F: Fn(&ProcessHandle) -> bool,
{
    let mut report = ReconcileReport::default();

    for record in registry.apps.values_mut() {
        if record.install_state == InstallState::Installing {
            conflict(&record.name, "install was interrupted; marking Failed");
            record.install_state = InstallState::Failed;
            record.last_error = Some("install interrupted by engine restart".to_string());
            report.demoted.push(record.name.clone());
        }
    }

    // A failed install may never have created its directory; it stays so
    // the failure remains visible and retryable.
    let missing: Vec<String> = registry
        .records()
        .filter(|record| record.install_state != InstallState::Failed)
        .filter(|record| !record.install_path.exists())
        .map(|record| record.name.clone())
        .collect();
    for name in missing {
        conflict(&name, "install path no longer exists; dropping record");
        registry.remove(&name);
        report.removed.push(name);
    }

    for record in registry.apps.values_mut() {
        let live = record.process_handle.as_ref().is_some_and(&is_alive);
        if live {
            report.alive.push(record.name.clone());
        } else if record.run_state.expects_process() || record.process_handle.is_some() {
            tracing::info!(app = %record.name, was = %record.run_state, "Process gone; resetting to Stopped");
            record.mark_stopped();
            report.reset.push(record.name.clone());
        }
    }

    for (name, path) in &scan.candidates {
        if registry.get(name).is_some() {
            continue;
        }
        let mut record = AppRecord::new(name, path.clone());
        record.install_state = InstallState::Installed;
        tracing::info!(app = %name, path = %path.display(), "Discovered application");
        registry.insert(record);
        report.discovered.push(name.clone());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::RunState;

    fn record(name: &str, path: PathBuf, install: InstallState, run: RunState) -> AppRecord {
        let mut record = AppRecord::new(name, path);
        record.install_state = install;
        record.run_state = run;
        record
    }

    #[test]
    fn test_interrupted_install_becomes_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        registry.insert(record(
            "comfyui",
            dir.path().to_path_buf(),
            InstallState::Installing,
            RunState::Stopped,
        ));

        let report = reconcile(&mut registry, &FilesystemScan::default(), |_| false);
        assert_eq!(report.demoted, vec!["comfyui".to_string()]);
        let record = registry.get("comfyui").unwrap();
        assert_eq!(record.install_state, InstallState::Failed);
        assert!(record.last_error.is_some());
    }

    #[test]
    fn test_interrupted_install_without_directory_becomes_failed() {
        let mut registry = Registry::default();
        registry.insert(record(
            "forge",
            PathBuf::from("/definitely/not/here/forge"),
            InstallState::Installing,
            RunState::Stopped,
        ));
        registry.insert(record(
            "tts",
            PathBuf::from("/definitely/not/here/tts"),
            InstallState::Failed,
            RunState::Stopped,
        ));

        let report = reconcile(&mut registry, &FilesystemScan::default(), |_| false);
        assert_eq!(report.demoted, vec!["forge".to_string()]);
        assert!(report.removed.is_empty());
        let forge = registry.get("forge").unwrap();
        assert_eq!(forge.install_state, InstallState::Failed);
        assert!(forge.last_error.is_some());
        assert_eq!(registry.get("tts").unwrap().install_state, InstallState::Failed);
    }

    #[test]
    fn test_missing_path_dropped() {
        let mut registry = Registry::default();
        registry.insert(record(
            "gone",
            PathBuf::from("/definitely/not/here"),
            InstallState::Installed,
            RunState::Stopped,
        ));
        let report = reconcile(&mut registry, &FilesystemScan::default(), |_| false);
        assert_eq!(report.removed, vec!["gone".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dead_process_reset_live_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::default();
        for (name, pid) in [("dead", 10), ("live", 20)] {
            let mut r = record(name, dir.path().to_path_buf(), InstallState::Installed, RunState::Running);
            r.process_handle = Some(ProcessHandle { pid, fingerprint: None });
            r.exposed_ports = vec![7860];
            registry.insert(r);
        }

        let report = reconcile(&mut registry, &FilesystemScan::default(), |h| h.pid == 20);
        assert_eq!(report.reset, vec!["dead".to_string()]);
        assert_eq!(report.alive, vec!["live".to_string()]);
        let dead = registry.get("dead").unwrap();
        assert_eq!(dead.run_state, RunState::Stopped);
        assert!(dead.process_handle.is_none());
        assert!(dead.exposed_ports.is_empty());
        assert_eq!(registry.get("live").unwrap().run_state, RunState::Running);
    }

    #[test]
    fn test_discovers_script_directories() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("fooocus");
        std::fs::create_dir(&app).unwrap();
        std::fs::write(app.join("install.json"), "[]").unwrap();
        std::fs::create_dir(dir.path().join("no-scripts")).unwrap();

        let scan = FilesystemScan::scan(dir.path()).unwrap();
        assert_eq!(scan.candidates.len(), 1);

        let mut registry = Registry::default();
        let report = reconcile(&mut registry, &scan, |_| false);
        assert_eq!(report.discovered, vec!["fooocus".to_string()]);
        assert_eq!(
            registry.get("fooocus").unwrap().install_state,
            InstallState::Installed
        );
    }
}
