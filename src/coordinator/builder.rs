use super::Engine;
use crate::command::{CommandRunner, ShellRunner};
use crate::config::EngineConfig;
use crate::daemon::DaemonManager;
use crate::environment::EnvironmentManager;
use crate::error::Result;
use crate::healthcheck::HealthMonitor;
use crate::host::HostFacts;
use crate::process::ProcessTracker;
use crate::script::{CapabilityRegistry, Interpreter, NullSink, ProgressSink, Services};
use crate::state::StateStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Builder for [`Engine`] with injectable collaborators.
///
/// `build()` calls [`Engine::start`] automatically.
///
/// # Example
///
/// ```no_run
/// use appforge::Engine;
///
/// # async fn example() -> Result<(), appforge::Error> {
/// let engine = Engine::builder()
///     .root("/srv/appforge")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    root: Option<PathBuf>,
    runner: Option<Arc<dyn CommandRunner>>,
    capabilities: Option<CapabilityRegistry>,
    sink: Option<Arc<dyn ProgressSink>>,
    facts: Option<HostFacts>,
    skip_startup: bool,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of loading `<root>/appforge.yaml`.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Managed root. Defaults to `$APPFORGE_ROOT`, then `~/appforge`.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Replace the built-in capability set.
    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Some(registry);
        self
    }

    /// Where progress events go. Defaults to discarding them.
    pub fn progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Skip GPU probing and use these facts.
    pub fn host_facts(mut self, facts: HostFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    /// Do not reconcile or adopt daemons during `build()`.
    pub fn skip_startup(mut self, skip: bool) -> Self {
        self.skip_startup = skip;
        self
    }

    pub async fn build(self) -> Result<Engine> {
        let config = match self.config {
            Some(mut config) => {
                if let Some(root) = self.root {
                    config.root = root;
                }
                config
            }
            None => EngineConfig::load(EngineConfig::resolve_root(self.root))?,
        };
        config.validate()?;
        let config = Arc::new(config);
        config.ensure_layout()?;

        let runner: Arc<dyn CommandRunner> = self
            .runner
            .unwrap_or_else(|| Arc::new(ShellRunner::new()));
        let facts = match self.facts {
            Some(facts) => facts,
            None => HostFacts::detect(runner.as_ref(), &config.gpu).await,
        };
        tracing::debug!(?facts, "Host facts");

        let tracker = Arc::new(ProcessTracker::new(config.sample_interval));
        let environments = Arc::new(EnvironmentManager::new(
            config.envs_dir(),
            config.python.clone(),
            config.command_timeout,
            Arc::clone(&runner),
        ));
        let daemons = Arc::new(DaemonManager::new(
            Arc::clone(&runner),
            Arc::clone(&tracker),
            &config,
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&tracker),
            config.unhealthy_threshold,
        ));
        let store = Arc::new(StateStore::new(config.registry_file()));

        let registry = Arc::new(
            self.capabilities
                .unwrap_or_else(CapabilityRegistry::with_builtins),
        );
        let services = Services {
            config: Arc::clone(&config),
            runner: Arc::clone(&runner),
            environments: Arc::clone(&environments),
            daemons: None,
        };
        let install_interpreter = Arc::new(Interpreter::new(Arc::clone(&registry), services.clone()));
        let run_interpreter = Arc::new(Interpreter::new(
            registry,
            services.with_daemons(Arc::clone(&daemons)),
        ));

        let engine = Engine::assemble(
            config,
            Arc::new(facts),
            store,
            tracker,
            daemons,
            health,
            environments,
            install_interpreter,
            run_interpreter,
            self.sink.unwrap_or_else(|| Arc::new(NullSink)),
        );
        if !self.skip_startup {
            engine.start().await?;
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_injected_config_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        for tweak in [
            (|c: &mut EngineConfig| c.max_include_depth = 0) as fn(&mut EngineConfig),
            |c: &mut EngineConfig| c.unhealthy_threshold = 0,
        ] {
            let mut config = EngineConfig::with_root(dir.path());
            tweak(&mut config);
            let result = Engine::builder()
                .config(config)
                .skip_startup(true)
                .build()
                .await;
            assert!(matches!(result, Err(Error::Config(_))));
        }
        assert!(!dir.path().join("apps").exists());
    }
}
