use crate::error::{Error, Result};
use crate::hash::hex_digest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Description of one application's environment, stored as JSON inside the
/// environment directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRecord {
    pub application_name: String,
    pub root: PathBuf,
    pub interpreter_path: PathBuf,
    /// Digest of the sorted package list
    pub package_manifest_hash: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl EnvironmentRecord {
    pub fn new(application_name: &str, root: PathBuf, interpreter_path: PathBuf) -> Self {
        Self {
            application_name: application_name.to_string(),
            root,
            interpreter_path,
            package_manifest_hash: manifest_hash(&[]),
            packages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Add packages to the manifest and refresh the digest.
    pub fn add_packages(&mut self, installed: &[String]) {
        for package in installed {
            if !self.packages.contains(package) {
                self.packages.push(package.clone());
            }
        }
        self.packages.sort();
        self.package_manifest_hash = manifest_hash(&self.packages);
    }
}

pub fn manifest_hash(packages: &[String]) -> String {
    let mut sorted = packages.to_vec();
    sorted.sort();
    hex_digest(sorted.join("\n").as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFailure {
    pub package: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// Outcome of `install_packages`. Installation stops at the first failing
/// package; everything before it stays installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInstallReport {
    pub installed: Vec<String>,
    pub failed: Option<PackageFailure>,
    /// Packages after the failing one that were never attempted
    pub skipped: Vec<String>,
}

impl PackageInstallReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Turn a partial failure into an [`Error::Environment`] naming what did
    /// get installed.
    pub fn into_result(self, app: &str) -> Result<Vec<String>> {
        match self.failed {
            None => Ok(self.installed),
            Some(failure) => {
                let installed = if self.installed.is_empty() {
                    "none".to_string()
                } else {
                    self.installed.join(", ")
                };
                Err(Error::Environment {
                    app: app.to_string(),
                    reason: format!(
                        "installing '{}' failed (exit {}); installed before failure: {}; stderr: {}",
                        failure.package,
                        failure
                            .exit_code
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                        installed,
                        failure.stderr.trim()
                    ),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_hash_ignores_order() {
        let a = manifest_hash(&["torch".into(), "numpy".into()]);
        let b = manifest_hash(&["numpy".into(), "torch".into()]);
        assert_eq!(a, b);
        assert_ne!(a, manifest_hash(&[]));
    }

    #[test]
    fn test_partial_failure_lists_installed() {
        let report = PackageInstallReport {
            installed: vec!["numpy".into()],
            failed: Some(PackageFailure {
                package: "xformers".into(),
                exit_code: Some(1),
                stderr: "no matching distribution".into(),
            }),
            skipped: vec!["triton".into()],
        };
        let err = report.into_result("comfy").unwrap_err().to_string();
        assert!(err.contains("xformers"));
        assert!(err.contains("numpy"));
    }
}
