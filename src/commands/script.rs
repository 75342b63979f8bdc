use crate::output::UserOutput;
use appforge::Engine;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn run_exec(engine: &Engine, script: &Path, out: &dyn UserOutput) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = engine.exec(script, &cancel).await;
    watcher.abort();
    let result = result?;

    let completed = result.steps.len();
    let result = result.into_result()?;
    out.success(&format!(
        "{} finished: {} step(s) in {:.1}s",
        script.display(),
        completed,
        result.duration.as_secs_f64()
    ));
    let output = result.output.to_json();
    if !output.is_null() {
        out.status(&serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}
