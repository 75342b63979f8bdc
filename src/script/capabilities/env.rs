use crate::environment::CreateOptions;
use crate::error::Result;
use crate::expr::Value;
use crate::script::capability::{Capability, StepCall};
use crate::script::progress::Level;
use async_trait::async_trait;

/// `env.install`: install `packages` into the application's environment,
/// creating it first if needed.
pub struct EnvInstall;

#[async_trait]
impl Capability for EnvInstall {
    fn name(&self) -> &'static str {
        "env.install"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let packages = call.string_list("packages")?;
        let app = call.ctx.app.clone();
        let environments = call.services.environments.clone();

        environments.create(&app, CreateOptions::default()).await?;
        if packages.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }

        call.emit(Level::Info, format!("Installing {}", packages.join(" ")));
        let report = environments.install_packages(&app, &packages).await?;
        if let Some(failure) = &report.failed {
            call.captured.stderr = failure.stderr.clone();
        }
        let installed = report.into_result(&app)?;
        Ok(Value::Array(installed.into_iter().map(Value::from).collect()))
    }
}
