//! Per-application `ENVIRONMENT` files.
//!
//! Applications may ship (or the operator may write) an `ENVIRONMENT` file in
//! the install path using dotenv syntax. Its variables are merged into every
//! command the application runs; step-level `env` entries win over it.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// File name looked up in an application's install path.
pub const ENVIRONMENT_FILE: &str = "ENVIRONMENT";

/// Load `<install_path>/ENVIRONMENT` if it exists.
///
/// A missing file yields an empty map; a malformed file is an error so that a
/// typo does not silently drop variables.
pub fn load_app_environment(install_path: &Path) -> Result<HashMap<String, String>> {
    let path = install_path.join(ENVIRONMENT_FILE);
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let iter = dotenvy::from_path_iter(&path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;

    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        vars.insert(key, value);
    }
    tracing::debug!("Loaded {} variables from {}", vars.len(), path.display());
    Ok(vars)
}
