//! Shared helpers for integration tests.
#![allow(dead_code)]

use appforge::{Engine, EngineConfig, HostFacts};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Fixed facts so scripts branch the same way on every machine.
pub fn test_facts() -> HostFacts {
    HostFacts {
        platform: "linux".to_string(),
        arch: "x86_64".to_string(),
        gpu_vendor: "nvidia".to_string(),
        gpu_model: Some("RTX 4090".to_string()),
    }
}

/// A stand-in interpreter: `-m venv <dir>` copies itself to `<dir>/bin/python`, anything
/// else (pip) succeeds unless the package name contains "broken".
#[cfg(unix)]
pub fn fake_python(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-python");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         if [ \"$2\" = venv ]; then mkdir -p \"$3/bin\" && cp \"$0\" \"$3/bin/python\"; exit 0; fi\n\
         case \"$4\" in *broken*) echo \"no matching distribution for $4\" >&2; exit 1;; esac\n\
         exit 0\n",
    )
    .expect("Failed to write fake python");
    let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

/// Managed root plus a directory holding application sources.
pub struct TestRoot {
    pub dir: TempDir,
}

impl TestRoot {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("root")).expect("root");
        std::fs::create_dir_all(dir.path().join("sources")).expect("sources");
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    /// Write `install.json` and `start.json` for a source named `name`.
    pub fn source(&self, name: &str, install: &str, start: &str) -> PathBuf {
        let dir = self.dir.path().join("sources").join(name);
        std::fs::create_dir_all(&dir).expect("source dir");
        std::fs::write(dir.join("install.json"), install).expect("install script");
        std::fs::write(dir.join("start.json"), start).expect("start script");
        dir
    }

    #[cfg(unix)]
    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::with_root(self.root());
        config.python = fake_python(self.dir.path()).to_string_lossy().into_owned();
        config.grace_timeout = Duration::from_secs(2);
        config.health_interval = Duration::from_millis(200);
        config.ready_timeout = Duration::from_secs(10);
        config.command_timeout = Duration::from_secs(30);
        config
    }

    #[cfg(unix)]
    pub async fn engine(&self) -> Engine {
        Engine::builder()
            .config(self.config())
            .host_facts(test_facts())
            .build()
            .await
            .expect("Failed to build engine")
    }
}
