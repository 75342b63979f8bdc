use super::HealthChecker;
use crate::error::{Error, Result};
use crate::process::ProcessTracker;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SyncMutex<T> = parking_lot::Mutex<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Alive, but the probe failed `threshold` times in a row
    Unresponsive,
    Dead,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unresponsive => "unresponsive",
            HealthStatus::Dead => "dead",
        })
    }
}

struct Target {
    probe: Option<Arc<dyn HealthChecker>>,
    consecutive_failures: u32,
}

/// Classifies application health from process liveness and an optional
/// probe.
///
/// Liveness is read from the process tracker by application name, so a
/// daemon restarted under a new PID stays monitored.
pub struct HealthMonitor {
    tracker: Arc<ProcessTracker>,
    threshold: u32,
    targets: SyncMutex<HashMap<String, Target>>,
}

impl HealthMonitor {
    pub fn new(tracker: Arc<ProcessTracker>, threshold: u32) -> Self {
        Self {
            tracker,
            threshold: threshold.max(1),
            targets: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, app: &str, probe: Option<Arc<dyn HealthChecker>>) {
        if let Some(probe) = &probe {
            tracing::debug!(app, probe = %probe.describe(), "Health target registered");
        }
        self.targets.lock().insert(
            app.to_string(),
            Target {
                probe,
                consecutive_failures: 0,
            },
        );
    }

    pub fn unregister(&self, app: &str) -> bool {
        self.targets.lock().remove(app).is_some()
    }

    pub fn is_registered(&self, app: &str) -> bool {
        self.targets.lock().contains_key(app)
    }

    fn alive(&self, app: &str) -> bool {
        self.tracker
            .pids_for(app)
            .into_iter()
            .any(|pid| self.tracker.is_alive(pid))
    }

    /// One liveness check plus one probe.
    pub async fn check_once(&self, app: &str) -> Result<HealthStatus> {
        let probe = {
            let targets = self.targets.lock();
            let target = targets
                .get(app)
                .ok_or_else(|| Error::AppNotFound(app.to_string()))?;
            target.probe.clone()
        };

        if !self.alive(app) {
            self.record(app, None);
            return Ok(HealthStatus::Dead);
        }
        let Some(probe) = probe else {
            return Ok(HealthStatus::Healthy);
        };

        let passed = match probe.check().await {
            Ok(passed) => passed,
            Err(e) => {
                tracing::debug!(app, "Probe error: {}", e);
                false
            }
        };
        let failures = self.record(app, Some(passed));
        if failures >= self.threshold {
            Ok(HealthStatus::Unresponsive)
        } else {
            Ok(HealthStatus::Healthy)
        }
    }

    /// Update the failure streak; `None` resets it. Returns the new streak.
    fn record(&self, app: &str, passed: Option<bool>) -> u32 {
        let mut targets = self.targets.lock();
        let Some(target) = targets.get_mut(app) else {
            return 0;
        };
        target.consecutive_failures = match passed {
            Some(false) => target.consecutive_failures.saturating_add(1),
            _ => 0,
        };
        target.consecutive_failures
    }

    /// Poll every `interval` and call `on_change` whenever the status
    /// differs from the previous one (the first result always counts as a
    /// change). Stops within one interval of `cancel`.
    pub fn watch<F>(
        self: &Arc<Self>,
        app: &str,
        interval: Duration,
        on_change: F,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn(HealthStatus) + Send + Sync + 'static,
    {
        let monitor = Arc::clone(self);
        let app = app.to_string();
        tokio::spawn(async move {
            let mut last: Option<HealthStatus> = None;
            loop {
                let status = tokio::select! {
                    _ = cancel.cancelled() => break,
                    status = monitor.check_once(&app) => status,
                };
                match status {
                    Ok(status) if last != Some(status) => {
                        tracing::info!(app = %app, %status, "Health changed");
                        last = Some(status);
                        on_change(status);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(app = %app, "Health watch ended: {}", e);
                        break;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle(AtomicBool);

    #[async_trait]
    impl HealthChecker for Toggle {
        async fn check(&self) -> Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn describe(&self) -> String {
            "toggle".to_string()
        }
    }

    fn monitor_with_self(threshold: u32) -> HealthMonitor {
        let tracker = Arc::new(ProcessTracker::new(Duration::from_millis(50)));
        tracker.track(std::process::id(), "me");
        HealthMonitor::new(tracker, threshold)
    }

    #[tokio::test]
    async fn test_unregistered_is_error() {
        let monitor = monitor_with_self(3);
        assert!(matches!(
            monitor.check_once("ghost").await,
            Err(Error::AppNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_no_process_is_dead() {
        let monitor = monitor_with_self(3);
        monitor.register("other", None);
        assert_eq!(monitor.check_once("other").await.unwrap(), HealthStatus::Dead);
    }

    #[tokio::test]
    async fn test_unresponsive_after_threshold() {
        let monitor = monitor_with_self(3);
        let probe = Arc::new(Toggle(AtomicBool::new(false)));
        monitor.register("me", Some(probe.clone()));

        assert_eq!(monitor.check_once("me").await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.check_once("me").await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.check_once("me").await.unwrap(), HealthStatus::Unresponsive);

        probe.0.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_once("me").await.unwrap(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let monitor = Arc::new(monitor_with_self(1));
        monitor.register("me", None);
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();
        let cancel = CancellationToken::new();
        let interval = Duration::from_millis(200);
        let task = monitor.watch("me", interval, move |s| sink.lock().push(s), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(interval, task).await.unwrap().unwrap();
        assert_eq!(seen.lock().as_slice(), &[HealthStatus::Healthy]);
    }
}
