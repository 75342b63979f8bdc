use crate::output::UserOutput;
use appforge::daemon::DaemonState;
use appforge::Engine;

/// Run in the foreground. Daemon output is piped through this process, so
/// the application lives only as long as the command does.
pub async fn run_run(
    engine: &Engine,
    name: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    out.status(&format!("Starting '{}'", name));
    let running = engine.run(name).await?;

    if running.is_empty() {
        out.success(&format!("'{}' start script finished (no daemon launched)", name));
        return Ok(());
    }

    for app in &running {
        let ports = app
            .exposed_ports
            .iter()
            .map(|p| format!("http://127.0.0.1:{}", p))
            .collect::<Vec<_>>()
            .join(", ");
        if ports.is_empty() {
            out.success(&format!("'{}' running (pid {})", app.app_name, app.pid));
        } else {
            out.success(&format!("'{}' running (pid {}) at {}", app.app_name, app.pid, ports));
        }
    }

    out.status("Press Ctrl+C to stop");
    let mut events = engine.daemons().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                out.status(&format!("\nStopping '{}'", name));
                engine.stop(name).await?;
                out.success(&format!("'{}' stopped", name));
                return Ok(());
            }
            event = events.recv() => {
                match event {
                    Ok(event) if event.app == name && event.state == DaemonState::Stopped => {
                        if let Some(detail) = &event.detail {
                            out.warning(&format!("'{}' exited: {}", name, detail));
                        } else {
                            out.warning(&format!("'{}' exited", name));
                        }
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Skipped {} daemon events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

pub async fn run_stop(engine: &Engine, name: &str, out: &dyn UserOutput) -> anyhow::Result<()> {
    if engine.stop(name).await? {
        out.success(&format!("'{}' stopped", name));
    } else {
        out.status(&format!("'{}' was not running", name));
    }
    Ok(())
}

pub async fn run_uninstall(
    engine: &Engine,
    name: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    out.status(&format!("Uninstalling '{}'", name));
    engine.uninstall(name).await?;
    out.success(&format!("'{}' removed", name));
    Ok(())
}
