use super::core::RunningApp;
use super::source::{fetch, SourceLocation};
use super::Engine;
use crate::config::load_app_environment;
use crate::environment::CreateOptions;
use crate::error::{Error, Result};
use crate::healthcheck::HealthStatus;
use crate::process::start_fingerprint;
use crate::script::{
    find_script, ExecutionOutcome, ExecutionResult, Interpreter, Level, Phase, Progress,
    RuntimeContext, ScriptDocument, ScriptKind,
};
use crate::state::{AppRecord, InstallState, ProcessHandle, RunState};
use chrono::Utc;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Characters of captured stderr kept in a record's `last_error`.
const LAST_ERROR_STDERR: usize = 2000;

fn validate_app_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid application name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

fn tail(text: &str, max: usize) -> &str {
    let trimmed = text.trim_end();
    match trimmed.char_indices().rev().nth(max.saturating_sub(1)) {
        Some((index, _)) if index > 0 => &trimmed[index..],
        _ => trimmed,
    }
}

/// `last_error` text for a failed execution.
/// Record a finished start script. Only a record still `Starting`, or
/// already moved to `Running` by the daemon's own event, takes the launch;
/// a crash or stop recorded meanwhile is kept.
fn apply_launch(record: &mut AppRecord, handle: Option<ProcessHandle>, ports: &[u16]) {
    if !matches!(record.run_state, RunState::Starting | RunState::Running) {
        return;
    }
    match handle {
        Some(handle) => {
            record.run_state = RunState::Running;
            record.process_handle = Some(handle);
            record.exposed_ports = ports.to_vec();
        }
        // A start script that only ran to completion
        None => record.mark_stopped(),
    }
}

fn describe_failure(result: &ExecutionResult) -> String {
    match &result.outcome {
        ExecutionOutcome::Failed(failure) => {
            let stderr = tail(&failure.stderr, LAST_ERROR_STDERR);
            if stderr.is_empty() {
                failure.to_string()
            } else {
                format!("{}\n{}", failure, stderr)
            }
        }
        ExecutionOutcome::Cancelled { step_index } => match step_index {
            Some(index) => format!("cancelled at step {}", index),
            None => "cancelled".to_string(),
        },
        ExecutionOutcome::Completed => String::new(),
    }
}

impl Engine {
    fn context_for(&self, app: &str, install_path: &Path, script: &Path) -> Result<RuntimeContext> {
        let app_env = load_app_environment(install_path)?;
        Ok(RuntimeContext::new(app, self.config.root(), install_path, self.facts.clone())
            .with_app_env(app_env)
            .with_script_dir(script.parent().map(Path::to_path_buf)))
    }

    async fn execute_script(
        &self,
        interpreter: &Interpreter,
        app: &str,
        install_path: &Path,
        kind: ScriptKind,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Option<(ExecutionResult, RuntimeContext)>> {
        let Some(script) = find_script(install_path, kind) else {
            return Ok(None);
        };
        let document = ScriptDocument::from_file(&script)?;
        let mut ctx = self.context_for(app, install_path, &script)?;
        progress.message(
            Level::Info,
            format!("Running {} ({} steps)", script.display(), document.len()),
        );
        let result = interpreter
            .execute(&document, &mut ctx, progress, cancel)
            .await;
        Ok(Some((result, ctx)))
    }

    /// Fetch sources, create the environment and run the install script.
    ///
    /// An app that is already `Installed` is returned unchanged. A failed
    /// install leaves the record `Failed` with the captured output; running
    /// `install` again retries from the start.
    #[tracing::instrument(skip(self, source), fields(app.name = %app))]
    pub async fn install(&self, app: &str, source: &str) -> Result<AppRecord> {
        validate_app_name(app)?;
        let guard = self.guards.acquire(app)?;
        let progress = Progress::new(self.sink.clone(), app, Phase::Install);
        let install_path = self.config.app_dir(app);
        let location = SourceLocation::parse(source);

        let record = self
            .store
            .update(|registry| {
                let record = registry
                    .apps
                    .entry(app.to_string())
                    .or_insert_with(|| AppRecord::new(app, install_path.clone()));
                if record.install_state != InstallState::Installed {
                    record.set_install_state(InstallState::Installing)?;
                    record.source = Some(location.to_string());
                    record.last_error = None;
                }
                Ok(record.clone())
            })
            .await?;
        if record.install_state == InstallState::Installed {
            progress.message(Level::Info, format!("'{}' is already installed", app));
            return Ok(record);
        }

        progress.message(Level::Info, format!("Installing '{}' from {}", app, location));
        let outcome = self
            .install_steps(app, &install_path, &location, &progress, guard.cancel_token())
            .await;

        match outcome {
            Ok(()) => {
                let record = self
                    .store
                    .update_app(app, |record| {
                        record.set_install_state(InstallState::Installed)?;
                        record.environment_ref = Some(self.environments.root_for(app));
                        Ok(record.clone())
                    })
                    .await?;
                tracing::info!("Installed");
                progress.message(Level::Info, format!("'{}' installed", app));
                Ok(record)
            }
            Err((error, detail)) => {
                tracing::warn!("Install failed: {}", error);
                progress.message(Level::Error, format!("Install of '{}' failed: {}", app, error));
                self.store
                    .update_app(app, |record| {
                        record.set_install_state(InstallState::Failed)?;
                        record.last_error = Some(detail);
                        Ok(())
                    })
                    .await?;
                Err(error)
            }
        }
    }

    /// Everything between `Installing` and the final state. Errors carry the
    /// text to store as `last_error`.
    async fn install_steps(
        &self,
        app: &str,
        install_path: &Path,
        location: &SourceLocation,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), (Error, String)> {
        let plain = |e: Error| {
            let detail = e.to_string();
            (e, detail)
        };

        let fetched = fetch(location, install_path).await.map_err(plain)?;
        progress.message(Level::Debug, format!("Sources {:?}", fetched));

        self.environments
            .create(app, CreateOptions::default())
            .await
            .map_err(plain)?;

        let executed = self
            .execute_script(
                &self.install_interpreter,
                app,
                install_path,
                ScriptKind::Install,
                progress,
                cancel,
            )
            .await
            .map_err(plain)?;
        match executed {
            None => {
                progress.message(Level::Warn, "No install script; nothing to run");
                Ok(())
            }
            Some((result, _)) if result.is_success() => Ok(()),
            Some((result, _)) => {
                let detail = describe_failure(&result);
                let error = match result.into_result() {
                    Err(error) => error,
                    Ok(_) => Error::Cancelled(app.to_string()),
                };
                Err((error, detail))
            }
        }
    }

    /// Run the start script. Long-running steps become supervised daemons.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn run(&self, app: &str) -> Result<Vec<RunningApp>> {
        let guard = self.guards.acquire(app)?;
        let progress = Progress::new(self.sink.clone(), app, Phase::Run);

        let record = self
            .store
            .update_app(app, |record| {
                if record.install_state != InstallState::Installed {
                    return Err(Error::InvalidState {
                        app: app.to_string(),
                        expected: "Installed".to_string(),
                        actual: record.install_state.to_string(),
                    });
                }
                if self.daemons.state(app).is_active() {
                    return Err(Error::InvalidState {
                        app: app.to_string(),
                        expected: "Stopped".to_string(),
                        actual: record.run_state.to_string(),
                    });
                }
                record.run_state = RunState::Starting;
                record.last_run_at = Some(Utc::now());
                record.last_error = None;
                Ok(record.clone())
            })
            .await?;

        let executed = self
            .execute_script(
                &self.run_interpreter,
                app,
                &record.install_path,
                ScriptKind::Start,
                &progress,
                guard.cancel_token(),
            )
            .await;

        let (result, ctx) = match executed {
            Ok(Some(executed)) => executed,
            Ok(None) => {
                let error = Error::ScriptNotFound(format!(
                    "no start script in '{}'",
                    record.install_path.display()
                ));
                self.record_run_failure(app, error.to_string()).await?;
                return Err(error);
            }
            Err(error) => {
                self.record_run_failure(app, error.to_string()).await?;
                return Err(error);
            }
        };

        if !result.is_success() {
            let detail = describe_failure(&result);
            if let Err(e) = self.daemons.stop(app, None).await {
                tracing::warn!("Failed to stop partially started daemon: {}", e);
            }
            self.record_run_failure(app, detail).await?;
            progress.message(Level::Error, format!("Start of '{}' failed", app));
            return match result.into_result() {
                Err(error) => Err(error),
                Ok(_) => Err(Error::Cancelled(app.to_string())),
            };
        }

        let launched: Vec<RunningApp> = ctx
            .launched()
            .into_iter()
            .map(|daemon| RunningApp {
                app_name: daemon.app,
                pid: daemon.pid,
                exposed_ports: daemon.port.into_iter().collect(),
            })
            .collect();

        let ports: Vec<u16> = launched
            .iter()
            .flat_map(|l| l.exposed_ports.iter().copied())
            .collect();
        let primary = launched.first().map(|l| l.pid);
        let handle = primary.map(|pid| ProcessHandle {
            pid,
            fingerprint: start_fingerprint(pid),
        });
        let state = self
            .store
            .update_app(app, |record| {
                apply_launch(record, handle, &ports);
                Ok(record.run_state)
            })
            .await?;
        match (primary, state) {
            (Some(_), RunState::Running) => {
                self.watch_health(app, ports.first().copied());
                tracing::info!(ports = ?ports, "Running");
                progress.message(Level::Info, format!("'{}' is running", app));
            }
            (Some(_), state) => {
                tracing::warn!(%state, "Daemon left Running before the start script finished");
                progress.message(Level::Warn, format!("'{}' is {}", app, state));
            }
            (None, _) => {
                progress.message(Level::Info, format!("'{}' start script finished", app));
            }
        }
        Ok(launched)
    }

    async fn record_run_failure(&self, app: &str, detail: String) -> Result<()> {
        self.store
            .update_app(app, |record| {
                record.mark_stopped();
                record.last_error = Some(detail);
                Ok(())
            })
            .await
    }

    /// Stop the app's daemon (SIGTERM, then SIGKILL after the grace period).
    /// Returns false if nothing was running.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn stop(&self, app: &str) -> Result<bool> {
        let _guard = self.guards.acquire(app)?;
        let progress = Progress::new(self.sink.clone(), app, Phase::Stop);
        if self.store.get(app).await?.is_none() {
            return Err(Error::AppNotFound(app.to_string()));
        }

        self.unwatch_health(app);
        let was_active = self.daemons.state(app).is_active();
        self.daemons.stop(app, None).await?;
        self.store
            .update_app(app, |record| {
                record.mark_stopped();
                Ok(())
            })
            .await?;

        if was_active {
            tracing::info!("Stopped");
            progress.message(Level::Info, format!("'{}' stopped", app));
        }
        Ok(was_active)
    }

    /// Remove the environment, the install path and the record.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn uninstall(&self, app: &str) -> Result<()> {
        let _guard = self.guards.acquire(app)?;
        let progress = Progress::new(self.sink.clone(), app, Phase::Uninstall);
        let record = self
            .store
            .get(app)
            .await?
            .ok_or_else(|| Error::AppNotFound(app.to_string()))?;
        if record.run_state.expects_process() || self.daemons.state(app).is_active() {
            return Err(Error::InvalidState {
                app: app.to_string(),
                expected: "Stopped".to_string(),
                actual: record.run_state.to_string(),
            });
        }

        self.unwatch_health(app);
        // Reap a crashed daemon's supervisor before its files go away
        self.daemons.stop(app, None).await?;

        if self.environments.destroy(app).await? {
            progress.message(Level::Info, "Environment removed");
        }
        match tokio::fs::remove_dir_all(&record.install_path).await {
            Ok(()) => progress.message(Level::Info, "Install path removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "Failed to remove '{}': {}",
                    record.install_path.display(),
                    e
                )))
            }
        }
        let log = self.config.logs_dir().join(format!("{}.log", app));
        let _ = tokio::fs::remove_file(&log).await;

        self.store
            .update(|registry| {
                registry.remove(app);
                Ok(())
            })
            .await?;
        tracing::info!("Uninstalled");
        progress.message(Level::Info, format!("'{}' uninstalled", app));
        Ok(())
    }

    /// Cancel the in-flight operation for `app`. The running command is
    /// killed; completed side effects stay.
    pub fn cancel(&self, app: &str) -> bool {
        let cancelled = self.guards.cancel(app);
        if cancelled {
            tracing::info!(app, "Operation cancelled");
        }
        cancelled
    }

    pub fn is_busy(&self, app: &str) -> bool {
        self.guards.is_busy(app)
    }

    pub async fn status(&self, app: &str) -> Result<AppRecord> {
        self.store
            .get(app)
            .await?
            .ok_or_else(|| Error::AppNotFound(app.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<AppRecord>> {
        self.store.list().await
    }

    /// PID and ports of every running application.
    pub async fn running_apps(&self) -> Result<Vec<RunningApp>> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|record| matches!(record.run_state, RunState::Running | RunState::Unhealthy))
            .filter_map(|record| {
                record.process_handle.map(|handle| RunningApp {
                    app_name: record.name,
                    pid: handle.pid,
                    exposed_ports: record.exposed_ports,
                })
            })
            .collect())
    }

    pub async fn health(&self, app: &str) -> Result<HealthStatus> {
        if !self.health.is_registered(app) {
            self.status(app).await?;
            return Ok(HealthStatus::Dead);
        }
        self.health.check_once(app).await
    }

    pub async fn logs(&self, app: &str, tail: Option<usize>) -> Result<Vec<String>> {
        self.daemons.logs(app, tail).await
    }

    /// Run an arbitrary script against a scratch context rooted at the
    /// script's directory. Daemons cannot be launched.
    pub async fn exec(&self, script: &Path, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let document = ScriptDocument::from_file(script)?;
        let cwd = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let name = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "exec".to_string());
        let progress = Progress::new(self.sink.clone(), &name, Phase::Exec);
        let mut ctx = self.context_for(&name, &cwd, script)?;
        let result = self
            .install_interpreter
            .execute(&document, &mut ctx, &progress, cancel)
            .await;
        Ok(result)
    }
}
