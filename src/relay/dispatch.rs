use std::sync::Arc;

use serde_json::{json, Value};

use crate::codec::{ConversationItem, FunctionCall, ModelCommand};
use crate::registry::{CallContext, CapabilityRegistry};
use crate::session::ConnId;

use super::{Relay, RelayEvent};

/// Resolves model-issued function calls against the capability registry.
///
/// Every outcome is a JSON value for the model: failures become an
/// `{"error": ...}` payload rather than an `Err`, so the conversation
/// always continues.
#[derive(Clone)]
pub struct FunctionCallDispatcher {
    registry: Arc<CapabilityRegistry>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DispatchError {
    #[error("No handler found for function: {0}")]
    NoHandler(String),
    #[error("Invalid JSON arguments for {name}: {reason}")]
    InvalidArguments { name: String, reason: String },
    #[error("Arguments for {name} do not match its schema (missing: {missing:?})")]
    SchemaMismatch { name: String, missing: Vec<String> },
    #[error("Error running function {name}: {message}")]
    Failed { name: String, message: String },
}

impl DispatchError {
    /// The error as the model sees it.
    pub fn payload(&self) -> Value {
        match self {
            DispatchError::InvalidArguments { .. } => json!({ "error": "invalid arguments" }),
            DispatchError::SchemaMismatch { missing, .. } => {
                json!({ "error": "invalid arguments", "missing": missing })
            }
            DispatchError::NoHandler(_) | DispatchError::Failed { .. } => {
                json!({ "error": self.to_string() })
            }
        }
    }
}

impl FunctionCallDispatcher {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Run `call` once and return what should be fed back to the model.
    pub async fn dispatch(&self, call: &FunctionCall, ctx: &CallContext) -> Value {
        match self.try_dispatch(call, ctx).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(name = %call.name, call_id = %call.call_id, "Function call failed: {e}");
                e.payload()
            }
        }
    }

    pub async fn try_dispatch(
        &self,
        call: &FunctionCall,
        ctx: &CallContext,
    ) -> Result<Value, DispatchError> {
        let descriptor = self
            .registry
            .get(&call.name)
            .ok_or_else(|| DispatchError::NoHandler(call.name.clone()))?;

        let args: Value =
            serde_json::from_str(&call.arguments).map_err(|e| DispatchError::InvalidArguments {
                name: call.name.clone(),
                reason: e.to_string(),
            })?;

        descriptor
            .schema
            .check_arguments(&args)
            .map_err(|missing| DispatchError::SchemaMismatch {
                name: call.name.clone(),
                missing,
            })?;

        tracing::info!(name = %call.name, call_id = %call.call_id, "Calling function");
        descriptor
            .handler
            .call(args, ctx)
            .await
            .map_err(|e| DispatchError::Failed {
                name: call.name.clone(),
                message: e.to_string(),
            })
    }
}

impl Relay {
    /// Run the capability off the relay loop; its output comes back as a
    /// [`RelayEvent::FunctionOutput`] tagged with the requesting model socket.
    pub(super) fn dispatch_function_call(&mut self, model: ConnId, call: FunctionCall) {
        tracing::debug!(name = %call.name, call_id = %call.call_id, "Function call requested");
        let dispatcher = self.dispatcher.clone();
        let relay = self.handle.clone();
        tokio::spawn(async move {
            let ctx = CallContext::new(relay.clone(), model);
            let output = dispatcher.dispatch(&call, &ctx).await;
            relay.send(RelayEvent::FunctionOutput {
                model,
                call_id: call.call_id,
                output,
            });
        });
    }

    pub(super) fn on_function_output(&mut self, call_id: &str, output: Value) {
        let Some(model) = self.session.model.connection() else {
            tracing::debug!(call_id, "Model closed before function output, dropping");
            return;
        };
        model.send(&ModelCommand::CreateItem {
            item: ConversationItem::FunctionCallOutput {
                call_id,
                output: output.to_string(),
            },
        });
        model.send(&ModelCommand::CreateResponse);
    }
}
