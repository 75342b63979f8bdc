use super::resources::{clock_ticks_per_second, read_sample, start_fingerprint, ResourceUsage};
use super::is_pid_alive;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

type SyncMutex<T> = parking_lot::Mutex<T>;

/// A process the engine started or adopted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: u32,
    pub app: String,
    /// Start time in clock ticks; `None` where the OS does not expose it
    pub fingerprint: Option<u64>,
    pub tracked_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    process: TrackedProcess,
    last_sample: Option<(Instant, u64)>,
}

/// Polling-based process registry.
///
/// Liveness compares the recorded start-time fingerprint with the current
/// one, so a recycled PID is reported as dead.
#[derive(Debug)]
pub struct ProcessTracker {
    sample_interval: Duration,
    /// Uses SyncMutex (parking_lot::Mutex) - never held across await.
    entries: SyncMutex<HashMap<u32, Entry>>,
}

impl ProcessTracker {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            sample_interval,
            entries: SyncMutex::new(HashMap::new()),
        }
    }

    /// Start tracking `pid`, fingerprinting it now.
    pub fn track(&self, pid: u32, app: &str) -> TrackedProcess {
        self.track_with_fingerprint(pid, app, start_fingerprint(pid))
    }

    /// Track a process whose fingerprint was recorded earlier (e.g. read back
    /// from the registry after an engine restart).
    pub fn track_with_fingerprint(
        &self,
        pid: u32,
        app: &str,
        fingerprint: Option<u64>,
    ) -> TrackedProcess {
        let process = TrackedProcess {
            pid,
            app: app.to_string(),
            fingerprint,
            tracked_at: Utc::now(),
        };
        tracing::debug!(pid, app, ?fingerprint, "Tracking process");
        self.entries.lock().insert(
            pid,
            Entry {
                process: process.clone(),
                last_sample: None,
            },
        );
        process
    }

    pub fn untrack(&self, pid: u32) -> Option<TrackedProcess> {
        self.entries.lock().remove(&pid).map(|entry| entry.process)
    }

    pub fn get(&self, pid: u32) -> Option<TrackedProcess> {
        self.entries.lock().get(&pid).map(|entry| entry.process.clone())
    }

    pub fn tracked(&self) -> Vec<TrackedProcess> {
        let mut all: Vec<_> = self
            .entries
            .lock()
            .values()
            .map(|entry| entry.process.clone())
            .collect();
        all.sort_by_key(|p| p.pid);
        all
    }

    pub fn pids_for(&self, app: &str) -> Vec<u32> {
        self.tracked()
            .into_iter()
            .filter(|p| p.app == app)
            .map(|p| p.pid)
            .collect()
    }

    /// True if `pid` is running and, when tracked with a fingerprint, is
    /// still the same process.
    pub fn is_alive(&self, pid: u32) -> bool {
        let expected = self
            .entries
            .lock()
            .get(&pid)
            .and_then(|entry| entry.process.fingerprint);
        same_process_alive(pid, expected)
    }

    /// CPU and memory snapshot. CPU is measured over the time since the
    /// previous call; the first call samples twice, `sample_interval` apart.
    pub async fn resource_usage(&self, pid: u32) -> Result<ResourceUsage> {
        if !self.is_alive(pid) {
            return Err(Error::Process(format!("PID {} is not running", pid)));
        }

        let previous = self
            .entries
            .lock()
            .get(&pid)
            .and_then(|entry| entry.last_sample);
        let (before_at, before_ticks) = match previous {
            Some(sample) => sample,
            None => {
                let first = read_sample(pid).ok_or_else(|| unreadable(pid))?;
                let at = Instant::now();
                tokio::time::sleep(self.sample_interval).await;
                (at, first.cpu_ticks)
            }
        };

        let now = read_sample(pid).ok_or_else(|| unreadable(pid))?;
        let now_at = Instant::now();
        if let Some(entry) = self.entries.lock().get_mut(&pid) {
            entry.last_sample = Some((now_at, now.cpu_ticks));
        }

        let elapsed = now_at.duration_since(before_at).as_secs_f64();
        let cpu_secs = now.cpu_ticks.saturating_sub(before_ticks) as f64 / clock_ticks_per_second();
        let cpu_percent = if elapsed > 0.0 {
            100.0 * cpu_secs / elapsed
        } else {
            0.0
        };

        Ok(ResourceUsage {
            cpu_percent,
            memory_bytes: now.rss_bytes,
        })
    }

    /// Remove and return every tracked process that is no longer alive.
    pub fn poll_terminated(&self) -> Vec<TrackedProcess> {
        let mut entries = self.entries.lock();
        let dead: Vec<u32> = entries
            .iter()
            .filter(|(pid, entry)| !same_process_alive(**pid, entry.process.fingerprint))
            .map(|(pid, _)| *pid)
            .collect();
        let mut terminated: Vec<TrackedProcess> = dead
            .into_iter()
            .filter_map(|pid| entries.remove(&pid).map(|entry| entry.process))
            .collect();
        terminated.sort_by_key(|p| p.pid);
        for process in &terminated {
            tracing::debug!(pid = process.pid, app = %process.app, "Tracked process terminated");
        }
        terminated
    }
}

/// Liveness plus fingerprint comparison.
pub(crate) fn same_process_alive(pid: u32, expected: Option<u64>) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }
    match (expected, start_fingerprint(pid)) {
        (Some(expected), Some(actual)) if expected != actual => {
            tracing::warn!(
                pid,
                expected,
                actual,
                "PID was reused by another process"
            );
            false
        }
        _ => true,
    }
}

fn unreadable(pid: u32) -> Error {
    Error::Process(format!("Resource usage for PID {} is unavailable on this platform", pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_untrack() {
        let tracker = ProcessTracker::new(Duration::from_millis(10));
        let me = std::process::id();
        tracker.track(me, "self");
        assert!(tracker.is_alive(me));
        assert_eq!(tracker.pids_for("self"), vec![me]);
        assert!(tracker.untrack(me).is_some());
        assert!(tracker.tracked().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_fingerprint_mismatch_means_dead() {
        let tracker = ProcessTracker::new(Duration::from_millis(10));
        let me = std::process::id();
        let real = start_fingerprint(me).unwrap();
        tracker.track_with_fingerprint(me, "self", Some(real + 1));
        assert!(!tracker.is_alive(me));
        let terminated = tracker.poll_terminated();
        assert_eq!(terminated.len(), 1);
        assert!(tracker.tracked().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_resource_usage_of_self() {
        let tracker = ProcessTracker::new(Duration::from_millis(20));
        let me = std::process::id();
        tracker.track(me, "self");
        let usage = tracker.resource_usage(me).await.unwrap();
        assert!(usage.memory_bytes > 0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_terminated_detects_exit() {
        let tracker = ProcessTracker::new(Duration::from_millis(10));
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        tracker.track(pid, "short");
        child.wait().await.unwrap();
        let terminated = tracker.poll_terminated();
        assert_eq!(terminated.iter().map(|p| p.pid).collect::<Vec<_>>(), vec![pid]);
    }

    #[tokio::test]
    async fn test_resource_usage_of_unknown_pid_fails() {
        let tracker = ProcessTracker::new(Duration::from_millis(10));
        assert!(tracker.resource_usage(4_194_303).await.is_err());
    }
}
