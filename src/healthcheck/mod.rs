//! Application health: liveness plus optional HTTP probing.

mod checker;
mod http;
mod monitor;

pub use checker::HealthChecker;
pub use http::HttpChecker;
pub use monitor::{HealthMonitor, HealthStatus};
