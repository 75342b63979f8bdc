use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A readiness probe for a running application.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Ok(false)` for an unhealthy answer; `Err` only for a broken probe.
    async fn check(&self) -> Result<bool>;

    fn timeout(&self) -> Duration;

    /// Human-readable target, used in logs.
    fn describe(&self) -> String;
}
