use crate::error::{Error, Result};
use crate::expr::Value;
use crate::script::capability::{Capability, StepCall};
use async_trait::async_trait;

/// `local.set`: every parameter becomes a local variable.
pub struct LocalSet;

#[async_trait]
impl Capability for LocalSet {
    fn name(&self) -> &'static str {
        "local.set"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let Value::Object(values) = call.params.clone() else {
            return Err(Error::InvalidArgument {
                capability: self.name().to_string(),
                reason: "params must be an object".to_string(),
            });
        };
        for (key, value) in &values {
            tracing::debug!(key = %key, "local.set");
            call.ctx.set_local(key.clone(), value.clone());
        }
        Ok(Value::Object(values))
    }
}

/// `local.export`: mark locals to be copied into the calling script's scope
/// when this sub-script completes.
///
/// `keys` names existing locals; any other parameter is set and exported in
/// one go.
pub struct LocalExport;

#[async_trait]
impl Capability for LocalExport {
    fn name(&self) -> &'static str {
        "local.export"
    }

    async fn invoke(&self, call: &mut StepCall<'_>) -> Result<Value> {
        let keys = call.string_list("keys")?;
        let mut exported = std::collections::BTreeMap::new();

        for key in keys {
            let value = call.ctx.locals.get(&key).cloned().ok_or_else(|| Error::InvalidArgument {
                capability: self.name().to_string(),
                reason: format!("no local named '{}'", key),
            })?;
            exported.insert(key, value);
        }
        if let Value::Object(values) = &call.params {
            for (key, value) in values.iter().filter(|(k, _)| k.as_str() != "keys") {
                call.ctx.set_local(key.clone(), value.clone());
                exported.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in &exported {
            call.ctx.exports.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(exported))
    }
}
