use crate::output::UserOutput;
use appforge::Engine;

pub async fn run_install(
    engine: &Engine,
    name: &str,
    source: &str,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    out.status(&format!("Installing '{}' from {}", name, source));

    let record = engine.install(name, source).await?;

    out.success(&format!(
        "'{}' installed at {}",
        record.name,
        record.install_path.display()
    ));
    if let Some(env) = &record.environment_ref {
        out.status(&format!("  environment: {}", env.display()));
    }
    Ok(())
}
