//! Facts about the host that scripts branch on.

use crate::command::{CommandLine, CommandRunner, CommandSpec};
use crate::config::GpuOverride;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFacts {
    /// `linux`, `darwin` or `win32`
    pub platform: String,
    pub arch: String,
    /// `nvidia`, `amd`, `apple` or `none`
    pub gpu_vendor: String,
    pub gpu_model: Option<String>,
}

impl HostFacts {
    /// Facts known without running anything; GPU is `none`.
    pub fn current() -> Self {
        Self {
            platform: platform_name().to_string(),
            arch: std::env::consts::ARCH.to_string(),
            gpu_vendor: "none".to_string(),
            gpu_model: None,
        }
    }

    /// Probe the GPU with vendor tools unless the operator supplied it.
    pub async fn detect(runner: &dyn CommandRunner, overrides: &GpuOverride) -> Self {
        let mut facts = Self::current();

        if let Some(vendor) = &overrides.vendor {
            facts.gpu_vendor = vendor.to_lowercase();
            facts.gpu_model = overrides.model.clone();
            return facts;
        }

        if let Some(model) = probe(runner, "nvidia-smi", &["--query-gpu=name", "--format=csv,noheader"]).await {
            facts.gpu_vendor = "nvidia".to_string();
            facts.gpu_model = Some(model);
        } else if let Some(model) = probe(runner, "rocm-smi", &["--showproductname"]).await {
            facts.gpu_vendor = "amd".to_string();
            facts.gpu_model = parse_rocm_product(&model).or(Some(model));
        } else if facts.platform == "darwin" && facts.arch == "aarch64" {
            facts.gpu_vendor = "apple".to_string();
        }

        if overrides.model.is_some() {
            facts.gpu_model = overrides.model.clone();
        }
        tracing::info!(
            platform = %facts.platform,
            gpu = %facts.gpu_vendor,
            model = ?facts.gpu_model,
            "Detected host"
        );
        facts
    }
}

pub fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// First non-empty stdout line of a successful probe.
async fn probe(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Option<String> {
    if which::which(program).is_err() {
        return None;
    }
    let spec = CommandSpec::new(CommandLine::exec(program, args.iter().copied())).timeout(PROBE_TIMEOUT);
    match runner.run_sync(&spec).await {
        Ok(output) if output.success() => output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string),
        Ok(output) => {
            tracing::debug!(program, status = ?output.status, "GPU probe failed");
            None
        }
        Err(e) => {
            tracing::debug!(program, "GPU probe could not run: {}", e);
            None
        }
    }
}

/// `rocm-smi --showproductname` prints `GPU[0] : Card series: <model>`.
fn parse_rocm_product(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("Card series") || line.contains("Card Series"))
        .and_then(|line| line.rsplit(':').next())
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
}
