mod install;
mod lifecycle;
mod logs;
mod script;
mod status;

pub use install::run_install;
pub use lifecycle::{run_run, run_stop, run_uninstall};
pub use logs::run_logs;
pub use script::run_exec;
pub use status::{run_facts, run_status};
