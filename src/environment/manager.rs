use super::types::{EnvironmentRecord, PackageFailure, PackageInstallReport};
use crate::command::{CommandLine, CommandRunner, CommandSpec, TargetEnvironment};
use crate::error::{Error, Result};
use crate::sync::KeyedLocks;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Record file kept inside every environment directory.
pub const ENV_RECORD_FILE: &str = "appforge-env.json";

#[cfg(windows)]
const BIN_DIR: &str = "Scripts";
#[cfg(not(windows))]
const BIN_DIR: &str = "bin";

#[cfg(windows)]
const PYTHON_EXE: &str = "python.exe";
#[cfg(not(windows))]
const PYTHON_EXE: &str = "python";

/// Activation for an environment rooted at an arbitrary directory.
pub fn target_at(root: PathBuf) -> TargetEnvironment {
    TargetEnvironment {
        bin_dir: root.join(BIN_DIR),
        root,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Destroy an existing environment before creating
    pub force_recreate: bool,
}

/// Creates and destroys one virtual environment per application under
/// `<root>/envs/<app>`.
///
/// Create, destroy and package installation for one application name are
/// serialized; different names proceed concurrently.
pub struct EnvironmentManager {
    envs_dir: PathBuf,
    python: String,
    timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    locks: KeyedLocks,
}

impl EnvironmentManager {
    pub fn new(
        envs_dir: impl Into<PathBuf>,
        python: impl Into<String>,
        timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            envs_dir: envs_dir.into(),
            python: python.into(),
            timeout,
            runner,
            locks: KeyedLocks::new(),
        }
    }

    pub fn root_for(&self, app: &str) -> PathBuf {
        self.envs_dir.join(app)
    }

    /// Interpreter inside the application's environment.
    pub fn path_for(&self, app: &str) -> PathBuf {
        self.root_for(app).join(BIN_DIR).join(PYTHON_EXE)
    }

    /// PATH/VIRTUAL_ENV activation for commands run inside the environment.
    pub fn target(&self, app: &str) -> TargetEnvironment {
        target_at(self.root_for(app))
    }

    fn record_path(&self, app: &str) -> PathBuf {
        self.root_for(app).join(ENV_RECORD_FILE)
    }

    /// The stored record, if the environment exists.
    pub async fn record(&self, app: &str) -> Result<Option<EnvironmentRecord>> {
        read_record(&self.record_path(app)).await
    }

    pub async fn exists(&self, app: &str) -> bool {
        matches!(self.record(app).await, Ok(Some(_)))
    }

    /// Names of every application with an environment directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.envs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            if entry.path().join(ENV_RECORD_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create the environment, or return the existing record.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn create(&self, app: &str, options: CreateOptions) -> Result<EnvironmentRecord> {
        let _guard = self.locks.lock(app).await;
        let root = self.root_for(app);

        if let Some(existing) = read_record(&self.record_path(app)).await? {
            if !options.force_recreate {
                tracing::debug!("Environment already exists, reusing");
                return Ok(existing);
            }
            tracing::info!("Recreating environment");
        }
        if root.exists() {
            remove_dir(&root, app).await?;
        }
        if let Some(parent) = root.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let spec = CommandSpec::new(CommandLine::exec(
            self.python.clone(),
            ["-m".to_string(), "venv".to_string(), root.to_string_lossy().into_owned()],
        ))
        .timeout(self.timeout);
        let output = self.runner.run_sync(&spec).await?;
        if !output.success() {
            // Leave nothing half-built behind
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(Error::Environment {
                app: app.to_string(),
                reason: format!(
                    "`{}` failed ({:?}): {}",
                    spec.command,
                    output.status,
                    output.stderr.trim()
                ),
            });
        }

        let record = EnvironmentRecord::new(app, root, self.path_for(app));
        write_record(&self.record_path(app), &record).await?;
        tracing::info!(interpreter = %record.interpreter_path.display(), "Environment created");
        Ok(record)
    }

    /// Remove the environment. Returns false if there was none.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn destroy(&self, app: &str) -> Result<bool> {
        let _guard = self.locks.lock(app).await;
        let root = self.root_for(app);
        if !root.exists() {
            return Ok(false);
        }
        remove_dir(&root, app).await?;
        tracing::info!("Environment destroyed");
        Ok(true)
    }

    /// Install packages one at a time, stopping at the first failure.
    ///
    /// A failing package is reported in the returned report, not as an
    /// error, so the caller can decide whether partial success is enough.
    #[tracing::instrument(skip(self, packages), fields(app.name = %app, count = packages.len()))]
    pub async fn install_packages(
        &self,
        app: &str,
        packages: &[String],
    ) -> Result<PackageInstallReport> {
        let _guard = self.locks.lock(app).await;
        let record_path = self.record_path(app);
        let mut record = read_record(&record_path).await?.ok_or_else(|| Error::Environment {
            app: app.to_string(),
            reason: "environment does not exist".to_string(),
        })?;

        let mut report = PackageInstallReport::default();
        let mut remaining = packages.iter();
        for package in remaining.by_ref() {
            let spec = CommandSpec::new(CommandLine::exec(
                record.interpreter_path.to_string_lossy().into_owned(),
                ["-m", "pip", "install", package.as_str()],
            ))
            .target_env(self.target(app))
            .timeout(self.timeout);
            let output = self.runner.run_sync(&spec).await?;
            if output.success() {
                tracing::debug!(package = %package, "Package installed");
                report.installed.push(package.clone());
            } else {
                tracing::warn!(package = %package, status = ?output.status, "Package install failed");
                report.failed = Some(PackageFailure {
                    package: package.clone(),
                    exit_code: output.exit_code(),
                    stderr: output.stderr,
                });
                break;
            }
        }
        report.skipped = remaining.cloned().collect();

        if !report.installed.is_empty() {
            record.add_packages(&report.installed);
            write_record(&record_path, &record).await?;
        }
        Ok(report)
    }
}

async fn read_record(path: &Path) -> Result<Option<EnvironmentRecord>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_record(path: &Path, record: &EnvironmentRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

async fn remove_dir(root: &Path, app: &str) -> Result<()> {
    tokio::fs::remove_dir_all(root)
        .await
        .map_err(|e| Error::Environment {
            app: app.to_string(),
            reason: format!("failed to remove '{}': {}", root.display(), e),
        })
}
