//! Engine configuration.
//!
//! - `engine` - [`EngineConfig`], loaded from `<root>/appforge.yaml`
//! - `restart` - daemon [`RestartPolicy`]
//! - `duration` - human duration strings (`"500ms"`, `"30s"`, `"5m"`)
//! - `env_file` - per-application `ENVIRONMENT` files

mod duration;
mod engine;
mod env_file;
mod restart;

pub use duration::*;
pub use engine::*;
pub use env_file::*;
pub use restart::*;
