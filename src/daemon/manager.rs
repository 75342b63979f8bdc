use super::log_capture::{read_file_tail, LogCapture, DEFAULT_MAX_LOG_LINES};
use super::types::{DaemonEvent, DaemonInfo, DaemonSpec, DaemonStarted, DaemonState};
use crate::command::{CommandOutput, CommandRunner, CommandStatus, StreamHandle};
use crate::config::{EngineConfig, RestartPolicy};
use crate::error::{Error, Result};
use crate::process::{is_pid_alive, signal_group, ProcessTracker};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use nix::sys::signal::Signal;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type SyncMutex<T> = parking_lot::Mutex<T>;

/// How long a daemon without a `ready` pattern must stay up before `start`
/// reports success.
const STARTUP_SETTLE: Duration = Duration::from_millis(500);

/// Extra wait after SIGKILL for the process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Liveness polling interval for adopted daemons.
const ADOPTED_POLL: Duration = Duration::from_secs(1);

/// A daemon that stayed up this long has its crash counter reset.
const STABLE_UPTIME: Duration = Duration::from_secs(60);

static URL_PORT_REGEX: OnceLock<Regex> = OnceLock::new();

fn url_port_regex() -> &'static Regex {
    URL_PORT_REGEX.get_or_init(|| {
        Regex::new(r"https?://[^\s/:]+:(\d{2,5})").expect("static regex pattern is valid")
    })
}

/// Port of the first `http(s)://host:port` URL in a line.
pub fn detect_port(line: &str) -> Option<u16> {
    url_port_regex()
        .captures(line)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Delay before restart attempt `attempt` (1-based): `base` doubled per
/// attempt, capped at 60 s, with ±50% jitter.
pub fn calculate_backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = attempt.saturating_sub(1).min(16);
    let base_ms = (base.as_millis() as u64)
        .saturating_mul(1u64 << exponent)
        .min(60_000);

    use rand::Rng;
    let jitter = base_ms / 2;
    let min = base_ms.saturating_sub(jitter);
    let max = base_ms.saturating_add(jitter);
    let delay = if min < max {
        rand::thread_rng().gen_range(min..=max)
    } else {
        base_ms
    };
    Duration::from_millis(delay)
}

struct Slot {
    app: String,
    state: watch::Sender<DaemonState>,
    pid: SyncMutex<Option<u32>>,
    port: SyncMutex<Option<u16>>,
    restarts: AtomicU32,
    started_at: SyncMutex<Option<DateTime<Utc>>>,
    adopted: bool,
    stop: CancellationToken,
    grace: SyncMutex<Duration>,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
    logs: Arc<LogCapture>,
}

impl Slot {
    fn new(app: &str, logs: Arc<LogCapture>, adopted: bool, grace: Duration) -> Self {
        let (state, _) = watch::channel(DaemonState::Stopped);
        Self {
            app: app.to_string(),
            state,
            pid: SyncMutex::new(None),
            port: SyncMutex::new(None),
            restarts: AtomicU32::new(0),
            started_at: SyncMutex::new(None),
            adopted,
            stop: CancellationToken::new(),
            grace: SyncMutex::new(grace),
            supervisor: SyncMutex::new(None),
            logs,
        }
    }

    fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    fn info(&self) -> DaemonInfo {
        DaemonInfo {
            app: self.app.clone(),
            state: self.state(),
            pid: *self.pid.lock(),
            port: *self.port.lock(),
            restarts: self.restarts.load(Ordering::Relaxed),
            started_at: *self.started_at.lock(),
            adopted: self.adopted,
        }
    }
}

struct Inner {
    runner: Arc<dyn CommandRunner>,
    tracker: Arc<ProcessTracker>,
    logs_dir: PathBuf,
    default_policy: RestartPolicy,
    backoff_base: Duration,
    grace: Duration,
    slots: SyncMutex<HashMap<String, Arc<Slot>>>,
    policies: SyncMutex<HashMap<String, RestartPolicy>>,
    events: broadcast::Sender<DaemonEvent>,
}

impl Inner {
    fn transition(&self, slot: &Slot, next: DaemonState, detail: Option<String>) {
        let previous = slot.state();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::debug!(app = %slot.app, %previous, %next, "Unusual daemon transition");
        }
        slot.state.send_replace(next);
        tracing::info!(app = %slot.app, %previous, %next, detail = ?detail, "Daemon state changed");
        let _ = self.events.send(DaemonEvent {
            app: slot.app.clone(),
            state: next,
            pid: *slot.pid.lock(),
            port: *slot.port.lock(),
            detail,
        });
    }

    fn policy_for(&self, app: &str, spec_policy: Option<RestartPolicy>) -> RestartPolicy {
        self.policies
            .lock()
            .get(app)
            .copied()
            .or(spec_policy)
            .unwrap_or(self.default_policy)
    }

    /// Spawn one run of the daemon. `ready` fires with the detected port the
    /// first time a line matches the daemon's `ready` pattern.
    async fn spawn(
        &self,
        slot: &Arc<Slot>,
        spec: &DaemonSpec,
        ready: Option<watch::Sender<Option<Option<u16>>>>,
    ) -> Result<StreamHandle> {
        let logs = slot.logs.clone();
        let pattern = spec.ready.clone();
        let default_port = spec.port;
        let on_output = Arc::new(move |line: &str, is_stderr: bool| {
            logs.push(line, is_stderr);
            if let (Some(pattern), Some(ready)) = (&pattern, &ready) {
                if ready.borrow().is_none() && pattern.is_match(line) {
                    ready.send_replace(Some(detect_port(line).or(default_port)));
                }
            }
        });

        let handle = self.runner.run_streamed(&spec.command, on_output).await?;
        let pid = handle.pid().ok_or_else(|| Error::Daemon {
            app: spec.app.clone(),
            reason: "spawned process has no PID".to_string(),
        })?;
        self.tracker.track(pid, &spec.app);
        *slot.pid.lock() = Some(pid);
        *slot.started_at.lock() = Some(Utc::now());
        if slot.port.lock().is_none() {
            *slot.port.lock() = spec.port;
        }
        Ok(handle)
    }

    /// SIGTERM the group, wait up to the grace period, then SIGKILL.
    async fn terminate(&self, slot: &Slot, handle: &mut StreamHandle) {
        let grace = *slot.grace.lock();
        if let Some(pid) = handle.pid() {
            if let Err(e) = signal_group(pid, Signal::SIGTERM, &slot.app) {
                tracing::debug!(app = %slot.app, "SIGTERM failed: {}", e);
            }
        }
        match tokio::time::timeout(grace, handle.wait()).await {
            Ok(_) => tracing::debug!(app = %slot.app, "Daemon exited gracefully"),
            Err(_) => {
                tracing::warn!(
                    app = %slot.app,
                    "Daemon did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
                    grace
                );
                handle.kill();
                let _ = tokio::time::timeout(KILL_WAIT, handle.wait()).await;
            }
        }
    }

    /// Same sequence for a process known only by PID.
    async fn terminate_pid(&self, slot: &Slot, pid: u32) {
        let grace = *slot.grace.lock();
        if signal_group(pid, Signal::SIGTERM, &slot.app).is_err() {
            return;
        }
        let poll = Duration::from_millis(100);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !is_pid_alive(pid) {
                return;
            }
            tokio::time::sleep(poll).await;
        }
        if is_pid_alive(pid) {
            tracing::warn!(
                app = %slot.app,
                "Daemon did not exit after SIGTERM (grace period: {:?}), sending SIGKILL",
                grace
            );
            let _ = signal_group(pid, Signal::SIGKILL, &slot.app);
            let deadline = Instant::now() + KILL_WAIT;
            while is_pid_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(poll).await;
            }
        }
    }

    fn forget_pid(&self, slot: &Slot) {
        if let Some(pid) = slot.pid.lock().take() {
            self.tracker.untrack(pid);
        }
    }
}

/// Supervises long-running application servers.
///
/// One daemon per application. Each daemon gets a supervision task that
/// waits for the process to exit or for a stop request; crashes are handled
/// according to the restart policy.
#[derive(Clone)]
pub struct DaemonManager {
    inner: Arc<Inner>,
}

impl DaemonManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tracker: Arc<ProcessTracker>,
        config: &EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                runner,
                tracker,
                logs_dir: config.logs_dir(),
                default_policy: config.restart_policy,
                backoff_base: config.restart_backoff,
                grace: config.grace_timeout,
                slots: SyncMutex::new(HashMap::new()),
                policies: SyncMutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.inner.events.subscribe()
    }

    /// Set the restart policy used after the app's next crash.
    pub fn restart_policy(&self, app: &str, policy: RestartPolicy) {
        self.inner.policies.lock().insert(app.to_string(), policy);
    }

    pub fn state(&self, app: &str) -> DaemonState {
        self.slot(app)
            .map(|slot| slot.state())
            .unwrap_or(DaemonState::Stopped)
    }

    pub fn info(&self, app: &str) -> Option<DaemonInfo> {
        self.slot(app).map(|slot| slot.info())
    }

    pub fn list(&self) -> Vec<DaemonInfo> {
        let mut infos: Vec<_> = self
            .inner
            .slots
            .lock()
            .values()
            .map(|slot| slot.info())
            .collect();
        infos.sort_by(|a, b| a.app.cmp(&b.app));
        infos
    }

    fn slot(&self, app: &str) -> Option<Arc<Slot>> {
        self.inner.slots.lock().get(app).cloned()
    }

    fn log_path(&self, app: &str) -> PathBuf {
        self.inner.logs_dir.join(format!("{}.log", app))
    }

    /// Launch a daemon and wait until it is ready.
    ///
    /// Ready means a line matched `spec.ready`, or, without a pattern, that
    /// the process survived a short settling period.
    #[tracing::instrument(skip(self, spec), fields(app.name = %spec.app))]
    pub async fn start(&self, spec: DaemonSpec) -> Result<DaemonStarted> {
        let app = spec.app.clone();
        if let Some(existing) = self.slot(&app) {
            if existing.state().is_active() {
                return Err(Error::Daemon {
                    app,
                    reason: format!("already {}", existing.state()),
                });
            }
        }

        let logs = LogCapture::with_file(&app, self.log_path(&app), DEFAULT_MAX_LOG_LINES);
        let slot = Arc::new(Slot::new(&app, logs, false, self.inner.grace));
        self.inner.slots.lock().insert(app.clone(), slot.clone());
        self.inner.transition(&slot, DaemonState::Starting, None);

        let (ready_tx, mut ready_rx) = watch::channel(None);
        let handle = match self.inner.spawn(&slot, &spec, Some(ready_tx)).await {
            Ok(handle) => handle,
            Err(e) => {
                self.inner
                    .transition(&slot, DaemonState::Stopped, Some(e.to_string()));
                return Err(e);
            }
        };

        let mut state_rx = slot.state.subscribe();
        let task = tokio::spawn(supervise(self.inner.clone(), slot.clone(), spec.clone(), handle));
        *slot.supervisor.lock() = Some(task);

        enum Startup {
            Ready(Option<u16>),
            Exited,
            TimedOut,
        }

        let startup = if spec.ready.is_some() {
            tokio::select! {
                ready = ready_rx.wait_for(|v| v.is_some()) => match ready {
                    Ok(port) => Startup::Ready((*port).flatten()),
                    Err(_) => Startup::Exited,
                },
                _ = state_rx.wait_for(|s| *s != DaemonState::Starting) => Startup::Exited,
                _ = tokio::time::sleep(spec.ready_timeout) => Startup::TimedOut,
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(STARTUP_SETTLE) => Startup::Ready(spec.port),
                _ = state_rx.wait_for(|s| *s != DaemonState::Starting) => Startup::Exited,
            }
        };

        match startup {
            Startup::Ready(port) => {
                if port.is_some() {
                    *slot.port.lock() = port;
                }
                self.inner.transition(&slot, DaemonState::Running, None);
                let pid = (*slot.pid.lock()).unwrap_or_default();
                Ok(DaemonStarted { pid, port: *slot.port.lock() })
            }
            Startup::Exited => {
                let tail = slot.logs.tail(Some(20)).join("\n");
                self.stop(&app, None).await?;
                Err(Error::Daemon {
                    app,
                    reason: format!("exited before becoming ready; last output:\n{}", tail),
                })
            }
            Startup::TimedOut => {
                self.stop(&app, None).await?;
                Err(Error::Daemon {
                    app,
                    reason: format!("not ready after {:?}", spec.ready_timeout),
                })
            }
        }
    }

    /// Supervise a daemon that was started by an earlier engine process.
    /// Only liveness is polled; adopted daemons are not restarted.
    pub fn adopt(&self, app: &str, pid: u32, fingerprint: Option<u64>, port: Option<u16>) -> Result<()> {
        if self.state(app).is_active() {
            return Err(Error::Daemon {
                app: app.to_string(),
                reason: "already supervised".to_string(),
            });
        }
        self.inner.tracker.track_with_fingerprint(pid, app, fingerprint);
        if !self.inner.tracker.is_alive(pid) {
            self.inner.tracker.untrack(pid);
            return Err(Error::Daemon {
                app: app.to_string(),
                reason: format!("PID {} is no longer running", pid),
            });
        }

        let slot = Arc::new(Slot::new(
            app,
            LogCapture::in_memory(app, DEFAULT_MAX_LOG_LINES),
            true,
            self.inner.grace,
        ));
        *slot.pid.lock() = Some(pid);
        *slot.port.lock() = port;
        self.inner.slots.lock().insert(app.to_string(), slot.clone());
        self.inner.transition(&slot, DaemonState::Starting, Some("adopted".to_string()));
        self.inner.transition(&slot, DaemonState::Running, None);

        let task = tokio::spawn(supervise_adopted(self.inner.clone(), slot.clone(), pid));
        *slot.supervisor.lock() = Some(task);
        tracing::info!(app, pid, "Adopted running daemon");
        Ok(())
    }

    /// Stop a daemon: SIGTERM, wait `grace` (default from config), SIGKILL.
    /// Returns false if the app had no daemon.
    #[tracing::instrument(skip(self), fields(app.name = %app))]
    pub async fn stop(&self, app: &str, grace: Option<Duration>) -> Result<bool> {
        let Some(slot) = self.slot(app) else {
            return Ok(false);
        };
        if let Some(grace) = grace {
            *slot.grace.lock() = grace;
        }
        slot.stop.cancel();
        let task = slot.supervisor.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Supervisor task failed: {}", e);
            }
        }
        self.inner.forget_pid(&slot);
        self.inner.transition(&slot, DaemonState::Stopped, None);
        Ok(true)
    }

    /// Stop every daemon concurrently.
    pub async fn stop_all(&self) {
        let apps: Vec<String> = self.inner.slots.lock().keys().cloned().collect();
        let results = join_all(apps.iter().map(|app| self.stop(app, None))).await;
        for (app, result) in apps.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(app = %app, "Failed to stop daemon: {}", e);
            }
        }
    }

    /// Captured output, falling back to the log file on disk.
    pub async fn logs(&self, app: &str, tail: Option<usize>) -> Result<Vec<String>> {
        if let Some(slot) = self.slot(app) {
            let lines = slot.logs.tail(tail);
            if !lines.is_empty() {
                return Ok(lines);
            }
        }
        read_file_tail(&self.log_path(app), tail).await
    }
}

fn describe_exit(output: &Result<CommandOutput>) -> String {
    match output {
        Ok(output) => match output.status {
            CommandStatus::Exited(code) => format!("exited with code {}", code),
            other => format!("ended: {:?}", other),
        },
        Err(e) => format!("wait failed: {}", e),
    }
}

async fn supervise(inner: Arc<Inner>, slot: Arc<Slot>, spec: DaemonSpec, mut handle: StreamHandle) {
    let mut attempt = 0u32;
    let mut run_started = Instant::now();

    loop {
        let exit = tokio::select! {
            output = handle.wait() => Some(output),
            _ = slot.stop.cancelled() => None,
        };

        let Some(output) = exit else {
            inner.terminate(&slot, &mut handle).await;
            inner.forget_pid(&slot);
            inner.transition(&slot, DaemonState::Stopped, None);
            break;
        };

        inner.forget_pid(&slot);
        if slot.stop.is_cancelled() {
            inner.transition(&slot, DaemonState::Stopped, None);
            break;
        }

        if run_started.elapsed() >= STABLE_UPTIME {
            attempt = 0;
        }
        attempt += 1;
        let detail = describe_exit(&output);
        inner.transition(&slot, DaemonState::Crashed, Some(detail.clone()));

        let policy = inner.policy_for(&slot.app, spec.restart_policy);
        if !policy.allows_restart(attempt) {
            inner.transition(
                &slot,
                DaemonState::Stopped,
                Some(format!("not restarting after crash {} ({})", attempt, detail)),
            );
            break;
        }

        inner.transition(&slot, DaemonState::Restarting, None);
        let delay = calculate_backoff_delay(inner.backoff_base, attempt);
        tracing::info!(app = %slot.app, attempt, ?delay, "Restarting daemon after backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = slot.stop.cancelled() => {
                inner.transition(&slot, DaemonState::Stopped, None);
                break;
            }
        }

        inner.transition(&slot, DaemonState::Starting, None);
        match inner.spawn(&slot, &spec, None).await {
            Ok(next) => {
                handle = next;
                run_started = Instant::now();
                slot.restarts.fetch_add(1, Ordering::Relaxed);
                inner.transition(&slot, DaemonState::Running, None);
            }
            Err(e) => {
                tracing::error!(app = %slot.app, "Restart failed: {}", e);
                inner.transition(&slot, DaemonState::Crashed, Some(e.to_string()));
                inner.transition(&slot, DaemonState::Stopped, None);
                break;
            }
        }
    }

    slot.logs.shutdown().await;
}

async fn supervise_adopted(inner: Arc<Inner>, slot: Arc<Slot>, pid: u32) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ADOPTED_POLL) => {
                if !inner.tracker.is_alive(pid) {
                    inner.forget_pid(&slot);
                    inner.transition(&slot, DaemonState::Crashed, Some("adopted process exited".to_string()));
                    inner.transition(&slot, DaemonState::Stopped, None);
                    break;
                }
            }
            _ = slot.stop.cancelled() => {
                inner.terminate_pid(&slot, pid).await;
                inner.forget_pid(&slot);
                inner.transition(&slot, DaemonState::Stopped, None);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_port() {
        assert_eq!(detect_port("Running on local URL:  http://127.0.0.1:7860"), Some(7860));
        assert_eq!(detect_port("To see the GUI go to: http://0.0.0.0:8188/"), Some(8188));
        assert_eq!(detect_port("no url here"), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(calculate_backoff_delay(base, 0), Duration::ZERO);
        for _ in 0..20 {
            let first = calculate_backoff_delay(base, 1);
            assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
            let capped = calculate_backoff_delay(base, 30);
            assert!(capped >= Duration::from_secs(30) && capped <= Duration::from_secs(90));
        }
    }

    #[cfg(unix)]
    mod supervision {
        use super::*;
        use crate::command::{CommandSpec, ShellRunner};

        fn manager(root: &std::path::Path, grace: Duration) -> DaemonManager {
            let mut config = EngineConfig::with_root(root);
            config.grace_timeout = grace;
            config.restart_backoff = Duration::from_millis(10);
            std::fs::create_dir_all(config.logs_dir()).unwrap();
            DaemonManager::new(
                Arc::new(ShellRunner::new()),
                Arc::new(ProcessTracker::new(Duration::from_millis(100))),
                &config,
            )
        }

        fn spec(app: &str, script: &str) -> DaemonSpec {
            DaemonSpec {
                app: app.to_string(),
                command: CommandSpec::shell(script),
                ready: None,
                port: None,
                restart_policy: None,
                ready_timeout: Duration::from_secs(5),
            }
        }

        #[tokio::test]
        async fn test_start_and_stop() {
            let dir = tempfile::tempdir().unwrap();
            let daemons = manager(dir.path(), Duration::from_secs(5));
            let started = daemons.start(spec("web", "sleep 30")).await.unwrap();
            assert!(is_pid_alive(started.pid));
            assert_eq!(daemons.state("web"), DaemonState::Running);

            assert!(daemons.stop("web", None).await.unwrap());
            assert_eq!(daemons.state("web"), DaemonState::Stopped);
            assert!(!is_pid_alive(started.pid));
            assert!(!daemons.stop("missing", None).await.unwrap());
        }

        #[tokio::test]
        async fn test_ready_pattern_detects_port() {
            let dir = tempfile::tempdir().unwrap();
            let daemons = manager(dir.path(), Duration::from_secs(5));
            let mut spec = spec("ui", "echo booting; echo 'Running on local URL: http://127.0.0.1:7860'; sleep 30");
            spec.ready = Some(Regex::new("Running on").unwrap());
            let started = daemons.start(spec).await.unwrap();
            assert_eq!(started.port, Some(7860));
            let logs = daemons.logs("ui", None).await.unwrap();
            assert!(logs.iter().any(|l| l.contains("booting")));
            daemons.stop("ui", None).await.unwrap();
        }

        #[tokio::test]
        async fn test_exit_before_ready_is_error() {
            let dir = tempfile::tempdir().unwrap();
            let daemons = manager(dir.path(), Duration::from_secs(5));
            let mut spec = spec("broken", "echo 'ModuleNotFoundError: torch' >&2; exit 1");
            spec.ready = Some(Regex::new("Running on").unwrap());
            let err = daemons.start(spec).await.unwrap_err();
            assert!(matches!(err, Error::Daemon { .. }));
            assert!(err.to_string().contains("torch"));
            assert!(!daemons.state("broken").is_active());
        }

        #[tokio::test]
        async fn test_stubborn_daemon_killed_after_grace() {
            let dir = tempfile::tempdir().unwrap();
            let daemons = manager(dir.path(), Duration::from_millis(300));
            let started = daemons
                .start(spec("stubborn", "trap '' TERM; while true; do sleep 0.1; done"))
                .await
                .unwrap();

            let begin = Instant::now();
            daemons.stop("stubborn", None).await.unwrap();
            assert!(begin.elapsed() < Duration::from_millis(300) + Duration::from_secs(3));
            assert!(!is_pid_alive(started.pid));
        }

        #[tokio::test]
        async fn test_crash_restarts_until_policy_gives_up() {
            let dir = tempfile::tempdir().unwrap();
            let daemons = manager(dir.path(), Duration::from_secs(1));
            let mut events = daemons.subscribe();
            let mut spec = spec("flaky", "sleep 0.6; exit 3");
            spec.restart_policy = Some(RestartPolicy::OnFailure { max_retries: Some(1) });
            daemons.start(spec).await.unwrap();

            let mut seen = Vec::new();
            let deadline = tokio::time::sleep(Duration::from_secs(10));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let event = event.unwrap();
                        seen.push(event.state);
                        if event.state == DaemonState::Stopped {
                            break;
                        }
                    }
                    _ = &mut deadline => panic!("no terminal event, saw {:?}", seen),
                }
            }
            assert!(seen.contains(&DaemonState::Restarting));
            assert_eq!(seen.iter().filter(|s| **s == DaemonState::Crashed).count(), 2);
            assert_eq!(daemons.info("flaky").unwrap().restarts, 1);
        }
    }
}
