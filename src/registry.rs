use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::relay::RelayHandle;
use crate::session::ConnId;

/// Tool description advertised to the model and listed on `/tools`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionSchema {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl FunctionSchema {
    pub fn new(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function",
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    /// Check parsed arguments against the object schema: they must be an
    /// object carrying every `required` key. Returns the missing keys.
    pub fn check_arguments(&self, args: &Value) -> Result<(), Vec<String>> {
        if self.parameters.get("type").and_then(Value::as_str) != Some("object") {
            return Ok(());
        }
        let Some(object) = args.as_object() else {
            return Err(Vec::new());
        };
        let missing: Vec<String> = self
            .parameters
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .filter(|key| !object.contains_key(*key))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}

/// What a capability may do to the call it runs in.
///
/// Bound to the model connection that issued the function call, so a
/// handler outliving its call cannot touch the next one.
#[derive(Clone)]
pub struct CallContext {
    relay: RelayHandle,
    model: ConnId,
}

impl CallContext {
    pub fn new(relay: RelayHandle, model: ConnId) -> Self {
        Self { relay, model }
    }

    pub fn model(&self) -> ConnId {
        self.model
    }

    /// Close the phone call, the model socket and the observer socket.
    pub fn hang_up(&self, reason: Option<String>) {
        self.relay.disconnect_all(self.model, reason);
    }
}

/// A tool the model can call mid-conversation.
#[async_trait]
pub trait Capability: Send + Sync {
    fn schema(&self) -> FunctionSchema;

    async fn call(&self, args: Value, ctx: &CallContext) -> Result<Value, CapabilityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("capability {0:?} is already registered")]
    Duplicate(String),
}

/// A registered capability: its schema, captured once, and its handler.
#[derive(Clone)]
pub struct FunctionCallDescriptor {
    pub schema: FunctionSchema,
    pub handler: Arc<dyn Capability>,
}

/// Name-keyed set of capabilities. Built at startup, read-only afterwards.
#[derive(Default)]
pub struct CapabilityRegistry {
    by_name: HashMap<String, FunctionCallDescriptor>,
    /// Registration order, for stable listings.
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) -> Result<(), RegistryError> {
        let schema = capability.schema();
        if self.by_name.contains_key(&schema.name) {
            return Err(RegistryError::Duplicate(schema.name));
        }
        tracing::debug!(name = %schema.name, "Capability registered");
        self.order.push(schema.name.clone());
        self.by_name.insert(
            schema.name.clone(),
            FunctionCallDescriptor {
                schema,
                handler: Arc::new(capability),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FunctionCallDescriptor> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> Vec<FunctionSchema> {
        self.order
            .iter()
            .filter_map(|name| self.by_name.get(name))
            .map(|d| d.schema.clone())
            .collect()
    }

    /// Schemas as JSON values, ready for a `session.update` `tools` list.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.schemas()
            .iter()
            .filter_map(|s| serde_json::to_value(s).ok())
            .collect()
    }
}
