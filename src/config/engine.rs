//! Engine-wide settings.
//!
//! Everything lives under one managed root directory:
//!
//! ```text
//! <root>/
//!   appforge.yaml      optional settings file (this struct)
//!   registry.json      application registry (State Store)
//!   apps/<name>/       install paths
//!   envs/<name>/       per-application environments
//!   library/           shared scripts for `script.start`
//!   cache/             content-addressed download cache
//!   logs/<name>.log    daemon output
//! ```

use super::duration::duration_str;
use super::RestartPolicy;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file name inside the managed root.
pub const CONFIG_FILE_NAME: &str = "appforge.yaml";

/// Environment variable naming the managed root.
pub const ROOT_ENV_VAR: &str = "APPFORGE_ROOT";

/// GPU facts supplied by the operator instead of being probed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuOverride {
    pub vendor: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Managed root. Filled in by [`EngineConfig::load`]; not read from the file.
    #[serde(skip)]
    pub root: PathBuf,

    /// Interpreter used to create per-application environments
    pub python: String,

    /// Default timeout for non-daemon shell steps
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,

    /// How long `stop` waits after SIGTERM before SIGKILL
    #[serde(with = "duration_str")]
    pub grace_timeout: Duration,

    /// Health monitor polling interval
    #[serde(with = "duration_str")]
    pub health_interval: Duration,

    /// Consecutive probe failures before an alive process is `Unresponsive`
    pub unhealthy_threshold: u32,

    /// Process tracker CPU sampling interval
    #[serde(with = "duration_str")]
    pub sample_interval: Duration,

    /// Maximum `script.start` nesting
    pub max_include_depth: usize,

    /// Default restart policy for daemons
    pub restart_policy: RestartPolicy,

    /// Base delay of the exponential restart backoff
    #[serde(with = "duration_str")]
    pub restart_backoff: Duration,

    /// How long a daemon step waits for its `ready` pattern
    #[serde(with = "duration_str")]
    pub ready_timeout: Duration,

    /// Operator-supplied GPU facts
    pub gpu: GpuOverride,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            python: "python3".to_string(),
            command_timeout: Duration::from_secs(3600),
            grace_timeout: Duration::from_secs(10),
            health_interval: Duration::from_secs(5),
            unhealthy_threshold: 3,
            sample_interval: Duration::from_millis(500),
            max_include_depth: 8,
            restart_policy: RestartPolicy::default(),
            restart_backoff: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(300),
            gpu: GpuOverride::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `root`, ignoring any settings file.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load `<root>/appforge.yaml` if present, otherwise defaults.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let path = root.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("Failed to read '{}': {}", path.display(), e))
            })?;
            if content.trim().is_empty() {
                Self::default()
            } else {
                serde_yaml::from_str::<Self>(&content).map_err(|e| {
                    Error::Config(format!("Invalid '{}': {}", path.display(), e))
                })?
            }
        } else {
            Self::default()
        };
        config.root = root;
        config.validate()?;
        Ok(config)
    }

    /// Pick the managed root: explicit value, then `$APPFORGE_ROOT`, then `~/appforge`.
    pub fn resolve_root(explicit: Option<PathBuf>) -> PathBuf {
        if let Some(root) = explicit {
            return root;
        }
        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            if !root.trim().is_empty() {
                return PathBuf::from(root);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("appforge")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_include_depth == 0 {
            return Err(Error::Config(
                "max_include_depth must be at least 1".to_string(),
            ));
        }
        if self.unhealthy_threshold == 0 {
            return Err(Error::Config(
                "unhealthy_threshold must be at least 1".to_string(),
            ));
        }
        if self.health_interval.is_zero() || self.sample_interval.is_zero() {
            return Err(Error::Config(
                "health_interval and sample_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.root.join("library")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// Install path for an application.
    pub fn app_dir(&self, name: &str) -> PathBuf {
        self.apps_dir().join(name)
    }

    /// Create every managed directory.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.apps_dir(),
            self.envs_dir(),
            self.library_dir(),
            self.cache_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Filesystem(format!("Failed to create '{}': {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.root, dir.path());
        assert_eq!(config.max_include_depth, 8);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.restart_policy, RestartPolicy::No);
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "grace_timeout: 3s\nrestart_policy: always\ngpu:\n  vendor: nvidia\n",
        )
        .unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.grace_timeout, Duration::from_secs(3));
        assert_eq!(config.restart_policy, RestartPolicy::Always);
        assert_eq!(config.gpu.vendor.as_deref(), Some("nvidia"));
        assert_eq!(config.python, "python3");
    }

    #[test]
    fn test_rejects_zero_depth() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "max_include_depth: 0\n").unwrap();
        assert!(EngineConfig::load(dir.path()).is_err());
    }

    #[test]
    fn test_layout_paths() {
        let config = EngineConfig::with_root("/srv/appforge");
        assert_eq!(config.app_dir("comfy"), PathBuf::from("/srv/appforge/apps/comfy"));
        assert_eq!(
            config.registry_file(),
            PathBuf::from("/srv/appforge/registry.json")
        );
    }
}
