//! Built-in step capabilities.

mod env;
mod fs;
mod local;
mod log;
mod script;
mod shell;

pub use env::EnvInstall;
pub use fs::{FsDownload, FsLink, FsWrite};
pub use local::{LocalExport, LocalSet};
pub use log::Log;
pub use script::ScriptStart;
pub use shell::ShellRun;

use super::capability::CapabilityRegistry;
use std::sync::Arc;

pub(crate) fn register_builtins(registry: &mut CapabilityRegistry) {
    registry
        .register(Arc::new(ShellRun))
        .register(Arc::new(ScriptStart))
        .register(Arc::new(FsDownload))
        .register(Arc::new(FsWrite))
        .register(Arc::new(FsLink))
        .register(Arc::new(LocalSet))
        .register(Arc::new(LocalExport))
        .register(Arc::new(EnvInstall))
        .register(Arc::new(Log));
}
