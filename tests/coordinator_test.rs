//! End-to-end lifecycle tests: install, run, stop and uninstall against a
//! temporary managed root with a stand-in Python.
#![cfg(unix)]

mod common;

use appforge::state::{AppRecord, ProcessHandle, StateStore};
use appforge::{Error, InstallState, RunState};
use common::TestRoot;
use std::time::Duration;

const SLOW_INSTALL: &str = r#"{"run": [{"method": "shell.run", "params": {"message": "sleep 1"}}]}"#;
const EMPTY_START: &str = r#"{"run": []}"#;

fn is_pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_for_pid_exit(pid: u32, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !is_pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn install_from_local_source() {
    let root = TestRoot::new();
    let source = root.source(
        "demo",
        r#"{"run": [
            {"method": "shell.run", "params": {"message": "echo ok > marker.txt"}},
            {"method": "env.install", "params": {"packages": ["torch", "gradio"]}}
        ]}"#,
        EMPTY_START,
    );
    let engine = root.engine().await;

    let record = engine
        .install("demo", source.to_str().unwrap())
        .await
        .expect("install should succeed");

    assert_eq!(record.install_state, InstallState::Installed);
    assert_eq!(record.run_state, RunState::Stopped);
    assert!(record.installed_at.is_some());
    assert!(record.install_path.join("marker.txt").is_file());
    let env = record.environment_ref.expect("environment recorded");
    assert!(env.join("appforge-env.json").is_file());

    // Installing again is a no-op
    let again = engine.install("demo", source.to_str().unwrap()).await.unwrap();
    assert_eq!(again.installed_at, record.installed_at);
}

#[tokio::test]
async fn concurrent_install_of_same_app_is_rejected() {
    let root = TestRoot::new();
    let source = root.source("slow", SLOW_INSTALL, EMPTY_START);
    let engine = root.engine().await;
    let source = source.to_str().unwrap();

    let (first, second) = tokio::join!(engine.install("slow", source), engine.install("slow", source));

    let outcomes = [first, second];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    let busy = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::OperationInProgress(name)) if name == "slow"))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(busy, 1);
    assert!(!engine.is_busy("slow"));
}

#[tokio::test]
async fn different_apps_install_in_parallel() {
    let root = TestRoot::new();
    let a = root.source("a", SLOW_INSTALL, EMPTY_START);
    let b = root.source("b", SLOW_INSTALL, EMPTY_START);
    let engine = root.engine().await;

    let started = std::time::Instant::now();
    let (ra, rb) = tokio::join!(
        engine.install("a", a.to_str().unwrap()),
        engine.install("b", b.to_str().unwrap())
    );
    ra.unwrap();
    rb.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1900));
    assert_eq!(engine.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_install_is_recorded_and_retryable() {
    let root = TestRoot::new();
    let source = root.source(
        "flaky",
        r#"{"run": [{"method": "env.install", "params": {"packages": ["numpy", "broken-pkg"]}}]}"#,
        EMPTY_START,
    );
    let engine = root.engine().await;

    let err = engine
        .install("flaky", source.to_str().unwrap())
        .await
        .expect_err("install should fail");
    assert!(matches!(err, Error::StepFailure(_)), "unexpected error: {err:?}");

    let record = engine.status("flaky").await.unwrap();
    assert_eq!(record.install_state, InstallState::Failed);
    let last_error = record.last_error.expect("failure recorded");
    assert!(last_error.contains("broken-pkg"), "last_error: {last_error}");

    // Fix the script in place; the install path is reused on retry.
    std::fs::write(
        record.install_path.join("install.json"),
        r#"{"run": [{"method": "env.install", "params": {"packages": ["numpy"]}}]}"#,
    )
    .unwrap();
    let record = engine.install("flaky", source.to_str().unwrap()).await.unwrap();
    assert_eq!(record.install_state, InstallState::Installed);
    assert!(record.last_error.is_none());
}

#[tokio::test]
async fn uninstall_removes_everything() {
    let root = TestRoot::new();
    let source = root.source("gone", r#"{"run": []}"#, EMPTY_START);
    let engine = root.engine().await;
    let record = engine.install("gone", source.to_str().unwrap()).await.unwrap();
    let env = record.environment_ref.clone().unwrap();

    engine.uninstall("gone").await.unwrap();

    assert!(!record.install_path.exists());
    assert!(!env.exists());
    assert!(matches!(engine.status("gone").await, Err(Error::AppNotFound(_))));
    // Source directory is untouched
    assert!(source.join("install.json").is_file());
}

#[tokio::test]
async fn run_requires_installed_app() {
    let root = TestRoot::new();
    let engine = root.engine().await;

    assert!(matches!(engine.run("missing").await, Err(Error::AppNotFound(_))));
    assert!(matches!(engine.uninstall("missing").await, Err(Error::AppNotFound(_))));
}

#[tokio::test]
async fn run_and_stop_daemon() {
    let root = TestRoot::new();
    let source = root.source(
        "server",
        r#"{"run": []}"#,
        r#"{"run": [{"method": "shell.run", "params": {
            "message": "echo 'Running on local URL:  http://127.0.0.1:7860'; exec sleep 60",
            "daemon": true,
            "ready": "Running on"
        }}]}"#,
    );
    let engine = root.engine().await;
    engine.install("server", source.to_str().unwrap()).await.unwrap();

    let running = engine.run("server").await.expect("run should succeed");
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].app_name, "server");
    assert_eq!(running[0].exposed_ports, vec![7860]);
    let pid = running[0].pid;
    assert!(is_pid_alive(pid));

    let record = engine.status("server").await.unwrap();
    assert!(record.run_state.expects_process());
    assert_eq!(record.process_handle.as_ref().map(|h| h.pid), Some(pid));
    assert_eq!(engine.running_apps().await.unwrap().len(), 1);

    // Second run while active is refused
    assert!(matches!(
        engine.run("server").await,
        Err(Error::InvalidState { .. })
    ));
    // So is uninstall
    assert!(matches!(
        engine.uninstall("server").await,
        Err(Error::InvalidState { .. })
    ));

    assert!(engine.stop("server").await.unwrap());
    assert!(wait_for_pid_exit(pid, Duration::from_secs(5)).await);
    let record = engine.status("server").await.unwrap();
    assert_eq!(record.run_state, RunState::Stopped);
    assert!(record.process_handle.is_none());
    assert!(engine.running_apps().await.unwrap().is_empty());

    let logs = engine.logs("server", None).await.unwrap();
    assert!(logs.iter().any(|l| l.contains("Running on local URL")));
}

#[tokio::test]
async fn failing_start_script_leaves_app_stopped() {
    let root = TestRoot::new();
    let source = root.source(
        "crashy",
        r#"{"run": []}"#,
        r#"{"run": [{"method": "shell.run", "params": {"message": "echo 'ModuleNotFoundError: torch' >&2; exit 1"}}]}"#,
    );
    let engine = root.engine().await;
    engine.install("crashy", source.to_str().unwrap()).await.unwrap();

    assert!(engine.run("crashy").await.is_err());
    let record = engine.status("crashy").await.unwrap();
    assert_eq!(record.run_state, RunState::Stopped);
    assert!(record.last_error.unwrap().contains("torch"));
}

#[tokio::test]
async fn startup_reconciles_registry_with_disk() {
    let root = TestRoot::new();
    let config = root.config();
    config.ensure_layout().unwrap();

    // Interrupted install, dead process, vanished install path, and an
    // unregistered app directory.
    let interrupted = config.app_dir("interrupted");
    let stale = config.app_dir("stale");
    std::fs::create_dir_all(&interrupted).unwrap();
    std::fs::create_dir_all(&stale).unwrap();
    let orphan = config.app_dir("orphan");
    std::fs::create_dir_all(&orphan).unwrap();
    std::fs::write(orphan.join("start.json"), EMPTY_START).unwrap();

    let store = StateStore::new(config.registry_file());
    store
        .update(|registry| {
            let mut record = AppRecord::new("interrupted", interrupted.clone());
            record.install_state = InstallState::Installing;
            registry.insert(record);

            let mut record = AppRecord::new("stale", stale.clone());
            record.install_state = InstallState::Installed;
            record.run_state = RunState::Running;
            record.process_handle = Some(ProcessHandle {
                pid: 2_147_483_000,
                fingerprint: None,
            });
            record.exposed_ports = vec![7860];
            registry.insert(record);

            let mut record = AppRecord::new("vanished", config.app_dir("vanished"));
            record.install_state = InstallState::Installed;
            registry.insert(record);
            Ok(())
        })
        .await
        .unwrap();

    let engine = root.engine().await;

    let interrupted = engine.status("interrupted").await.unwrap();
    assert_eq!(interrupted.install_state, InstallState::Failed);
    assert!(interrupted.last_error.is_some());

    let stale = engine.status("stale").await.unwrap();
    assert_eq!(stale.run_state, RunState::Stopped);
    assert!(stale.process_handle.is_none());
    assert!(stale.exposed_ports.is_empty());

    assert!(matches!(engine.status("vanished").await, Err(Error::AppNotFound(_))));

    let orphan = engine.status("orphan").await.unwrap();
    assert_eq!(orphan.install_state, InstallState::Installed);
}

#[tokio::test]
async fn exec_runs_a_standalone_script() {
    let root = TestRoot::new();
    let engine = root.engine().await;
    let script = root.dir.path().join("hello.json");
    std::fs::write(
        &script,
        r#"[
            {"method": "fs.write", "params": {"path": "out.txt", "text": "{{ gpu }}"}},
            {"method": "local.set", "params": {"done": true}}
        ]"#,
    )
    .unwrap();

    let result = engine
        .exec(&script, &tokio_util::sync::CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.failure());
    assert_eq!(
        std::fs::read_to_string(root.dir.path().join("out.txt")).unwrap(),
        "nvidia"
    );
}
