use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::{CallContext, Capability, CapabilityError, FunctionSchema};

/// Lets the model hang up: closes the call, the model socket and the
/// observer socket.
pub struct DisconnectCall;

#[derive(Debug, Default, Deserialize)]
struct Args {
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl Capability for DisconnectCall {
    fn schema(&self) -> FunctionSchema {
        FunctionSchema::new(
            "disconnect_call",
            "Immediately disconnect the active phone call and associated realtime model + log websocket sessions.",
            json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string", "description": "Optional human readable reason" }
                },
                "required": []
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &CallContext) -> Result<Value, CapabilityError> {
        // A malformed reason should not keep the call alive
        let args: Args = serde_json::from_value(args).unwrap_or_default();
        tracing::info!(
            conn = ctx.model(),
            reason = args.reason.as_deref().unwrap_or(""),
            "Model requested hang up"
        );

        ctx.hang_up(args.reason.clone());

        let mut out = json!({ "status": "disconnected" });
        if let Some(reason) = args.reason {
            out["reason"] = Value::String(reason);
        }
        Ok(out)
    }
}
