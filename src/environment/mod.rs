//! Per-application isolated dependency environments.

mod manager;
mod types;

pub use manager::{target_at, CreateOptions, EnvironmentManager, ENV_RECORD_FILE};
pub use types::{EnvironmentRecord, PackageFailure, PackageInstallReport};
