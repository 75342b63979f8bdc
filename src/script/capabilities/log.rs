use crate::error::Result;
use crate::expr::Value;
use crate::script::capability::{Capability, StepCall};
use crate::script::progress::Level;
use async_trait::async_trait;

/// `log`: emit a progress message (`text` or `message`, optional `level`).
pub struct Log;

#[async_trait]
impl Capability for Log {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let text = match call.str_param("text")? {
            Some(text) => text,
            None => call.str_param("message")?.unwrap_or_default(),
        };
        let level = match call.str_param("level")?.as_deref() {
            Some("debug") => Level::Debug,
            Some("warn") | Some("warning") => Level::Warn,
            Some("error") => Level::Error,
            _ => Level::Info,
        };
        tracing::info!(app.name = %call.ctx.app, "{}", text);
        call.emit(level, text.clone());
        Ok(Value::from(text))
    }
}
