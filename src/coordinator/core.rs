use super::guard::OperationGuards;
use crate::config::EngineConfig;
use crate::daemon::{DaemonEvent, DaemonManager, DaemonState};
use crate::environment::EnvironmentManager;
use crate::error::{Error, Result};
use crate::healthcheck::{HealthChecker, HealthMonitor, HealthStatus, HttpChecker};
use crate::host::HostFacts;
use crate::process::{same_process_alive, start_fingerprint, ProcessTracker};
use crate::script::{Interpreter, ProgressSink};
use crate::state::{
    AppRecord, FilesystemScan, ProcessHandle, ReconcileReport, RunState, StateStore,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// Timeout of the HTTP probe registered for a daemon's port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A running application as seen by port-forwarding collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningApp {
    pub app_name: String,
    pub pid: u32,
    pub exposed_ports: Vec<u16>,
}

/// The installation coordinator.
///
/// Composes the interpreter, environments, daemons, health monitoring and
/// the registry into `install`/`run`/`stop`/`uninstall`. Operations on one
/// application are mutually exclusive; different applications proceed in
/// parallel.
///
/// # Example
///
/// ```no_run
/// use appforge::Engine;
///
/// # async fn example() -> Result<(), appforge::Error> {
/// let engine = Engine::builder().root("/srv/appforge").build().await?;
/// engine.install("comfyui", "https://github.com/example/comfyui.pinokio.git").await?;
/// engine.run("comfyui").await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    pub(super) config: Arc<EngineConfig>,
    pub(super) facts: Arc<HostFacts>,
    pub(super) store: Arc<StateStore>,
    pub(super) tracker: Arc<ProcessTracker>,
    pub(super) daemons: Arc<DaemonManager>,
    pub(super) health: Arc<HealthMonitor>,
    pub(super) environments: Arc<EnvironmentManager>,
    /// Interpreter for install and exec scripts; cannot launch daemons
    pub(super) install_interpreter: Arc<Interpreter>,
    /// Interpreter for start scripts
    pub(super) run_interpreter: Arc<Interpreter>,
    pub(super) sink: Arc<dyn ProgressSink>,
    pub(super) guards: OperationGuards,
    health_watches: SyncMutex<HashMap<String, CancellationToken>>,
    event_task: SyncMutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    pub fn builder() -> super::EngineBuilder {
        super::EngineBuilder::new()
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn assemble(
        config: Arc<EngineConfig>,
        facts: Arc<HostFacts>,
        store: Arc<StateStore>,
        tracker: Arc<ProcessTracker>,
        daemons: Arc<DaemonManager>,
        health: Arc<HealthMonitor>,
        environments: Arc<EnvironmentManager>,
        install_interpreter: Arc<Interpreter>,
        run_interpreter: Arc<Interpreter>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            facts,
            store,
            tracker,
            daemons,
            health,
            environments,
            install_interpreter,
            run_interpreter,
            sink,
            guards: OperationGuards::default(),
            health_watches: SyncMutex::new(HashMap::new()),
            event_task: SyncMutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn facts(&self) -> &HostFacts {
        &self.facts
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn daemons(&self) -> &DaemonManager {
        &self.daemons
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    /// Reconcile the registry, adopt daemons that survived the last engine
    /// process, and start recording daemon events. Runs once; later calls
    /// return an empty report.
    pub async fn start(&self) -> Result<ReconcileReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(ReconcileReport::default());
        }
        self.config.ensure_layout()?;

        let scan = FilesystemScan::scan(&self.config.apps_dir()).map_err(|e| {
            Error::Filesystem(format!(
                "Failed to scan '{}': {}",
                self.config.apps_dir().display(),
                e
            ))
        })?;
        let report = self
            .store
            .reconcile(&scan, |handle| same_process_alive(handle.pid, handle.fingerprint))
            .await?;
        if !report.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                demoted = report.demoted.len(),
                reset = report.reset.len(),
                discovered = report.discovered.len(),
                "Registry reconciled"
            );
        }

        self.spawn_event_recorder();

        for name in &report.alive {
            let Some(record) = self.store.get(name).await? else {
                continue;
            };
            let Some(handle) = record.process_handle else {
                continue;
            };
            let port = record.exposed_ports.first().copied();
            match self.daemons.adopt(name, handle.pid, handle.fingerprint, port) {
                Ok(()) => self.watch_health(name, port),
                Err(e) => tracing::warn!(app = %name, "Could not adopt running process: {}", e),
            }
        }
        Ok(report)
    }

    /// Mirror daemon state changes into the registry.
    fn spawn_event_recorder(&self) {
        let mut events = self.daemons.subscribe();
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => record_daemon_event(&store, event).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Daemon event recorder fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *self.event_task.lock() = Some(task);
    }

    /// Register the app with the health monitor and keep the registry's
    /// `Unhealthy` flag current.
    pub(super) fn watch_health(&self, app: &str, port: Option<u16>) {
        let probe = port.map(|port| Arc::new(HttpChecker::for_port(port, PROBE_TIMEOUT)) as Arc<dyn HealthChecker>);
        self.health.register(app, probe);

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .health_watches
            .lock()
            .insert(app.to_string(), cancel.clone())
        {
            previous.cancel();
        }

        let store = Arc::clone(&self.store);
        let name = app.to_string();
        self.health.watch(
            app,
            self.config.health_interval,
            move |status| {
                let store = Arc::clone(&store);
                let name = name.clone();
                tokio::spawn(async move { record_health(&store, &name, status).await });
            },
            cancel,
        );
    }

    pub(super) fn unwatch_health(&self, app: &str) {
        if let Some(cancel) = self.health_watches.lock().remove(app) {
            cancel.cancel();
        }
        self.health.unregister(app);
    }

    /// Stop background tasks. Daemons keep running; use
    /// [`stop_all`](Self::stop_all) to end them too.
    pub fn shutdown(&self) {
        for (_, cancel) in self.health_watches.lock().drain() {
            cancel.cancel();
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }

    /// Stop every daemon and record it.
    pub async fn stop_all(&self) {
        let running: Vec<String> = self.daemons.list().into_iter().map(|d| d.app).collect();
        for app in running {
            if let Err(e) = self.stop(&app).await {
                tracing::warn!(app = %app, "Failed to stop: {}", e);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn record_daemon_event(store: &StateStore, event: DaemonEvent) {
    let result = store
        .update_app(&event.app, |record| {
            match event.state {
                DaemonState::Starting | DaemonState::Restarting => {
                    record.run_state = RunState::Starting;
                }
                DaemonState::Running => {
                    record.run_state = RunState::Running;
                    if let Some(pid) = event.pid {
                        record.process_handle = Some(ProcessHandle {
                            pid,
                            fingerprint: start_fingerprint(pid),
                        });
                    }
                    if let Some(port) = event.port {
                        if !record.exposed_ports.contains(&port) {
                            record.exposed_ports.push(port);
                        }
                    }
                }
                DaemonState::Crashed => {
                    record.run_state = RunState::Crashed;
                    record.process_handle = None;
                    record.last_error = event.detail.clone();
                }
                // A supervisor that gave up leaves the record Crashed
                DaemonState::Stopped
                    if record.run_state == RunState::Crashed && event.detail.is_some() =>
                {
                    record.process_handle = None;
                }
                DaemonState::Stopped => record.mark_stopped(),
            }
            Ok(())
        })
        .await;
    match result {
        Ok(()) | Err(Error::AppNotFound(_)) => {}
        Err(e) => tracing::warn!(app = %event.app, "Failed to record daemon event: {}", e),
    }
}

/// Fold one health verdict into the record. Only a process the registry
/// believes is up is affected.
fn apply_health(record: &mut AppRecord, status: HealthStatus) {
    match (status, record.run_state) {
        (HealthStatus::Unresponsive, RunState::Running) => {
            record.run_state = RunState::Unhealthy;
        }
        (HealthStatus::Healthy, RunState::Unhealthy) => {
            record.run_state = RunState::Running;
        }
        (HealthStatus::Dead, RunState::Running | RunState::Unhealthy) => {
            record.run_state = RunState::Crashed;
            record.process_handle = None;
            record.last_error = Some("process is no longer alive".to_string());
        }
        _ => {}
    }
}

async fn record_health(store: &StateStore, app: &str, status: HealthStatus) {
    let result = store
        .update_app(app, |record| {
            apply_health(record, status);
            Ok(())
        })
        .await;
    if let Err(e) = result {
        tracing::debug!(app, "Failed to record health: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstallState;

    fn running(name: &str) -> AppRecord {
        let mut record = AppRecord::new(name, std::path::PathBuf::from("/srv/apps").join(name));
        record.install_state = InstallState::Installed;
        record.run_state = RunState::Running;
        record.process_handle = Some(ProcessHandle {
            pid: 4242,
            fingerprint: None,
        });
        record
    }

    #[test]
    fn test_health_toggles_unhealthy() {
        let mut record = running("forge");
        apply_health(&mut record, HealthStatus::Unresponsive);
        assert_eq!(record.run_state, RunState::Unhealthy);
        apply_health(&mut record, HealthStatus::Healthy);
        assert_eq!(record.run_state, RunState::Running);
    }

    #[test]
    fn test_dead_process_marks_crashed() {
        let mut record = running("forge");
        apply_health(&mut record, HealthStatus::Dead);
        assert_eq!(record.run_state, RunState::Crashed);
        assert!(record.process_handle.is_none());
        assert!(record.last_error.is_some());
    }

    #[test]
    fn test_dead_ignored_when_not_running() {
        let mut record = running("forge");
        record.mark_stopped();
        apply_health(&mut record, HealthStatus::Dead);
        assert_eq!(record.run_state, RunState::Stopped);
        assert!(record.last_error.is_none());
    }
}
