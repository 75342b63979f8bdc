use crate::output::UserOutput;
use appforge::{AppRecord, Engine};

pub async fn run_status(
    engine: &Engine,
    name: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let records = match name {
        Some(name) => vec![engine.status(name).await?],
        None => engine.list().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        out.status("No applications installed");
        return Ok(());
    }

    out.status(&format!(
        "{:<24} {:<14} {:<10} {:<8} PORTS",
        "NAME", "INSTALL", "RUN", "PID"
    ));
    for record in &records {
        print_record(engine, record, out).await;
    }
    Ok(())
}

async fn print_record(engine: &Engine, record: &AppRecord, out: &dyn UserOutput) {
    let pid = record
        .process_handle
        .as_ref()
        .map(|h| h.pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    let ports = record
        .exposed_ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",");
    out.status(&format!(
        "{:<24} {:<14} {:<10} {:<8} {}",
        record.name, record.install_state, record.run_state, pid, ports
    ));

    if record.run_state.expects_process() {
        if let Ok(health) = engine.health(&record.name).await {
            out.status(&format!("  health: {}", health));
        }
    }
    if let Some(error) = &record.last_error {
        out.warning(&format!("  last error: {}", error));
    }
}

/// Running applications as JSON, for the host agent.
pub async fn run_facts(engine: &Engine) -> anyhow::Result<()> {
    let running = engine.running_apps().await?;
    println!("{}", serde_json::to_string_pretty(&running)?);
    Ok(())
}
