//! Memory tools exposed to the model.
//!
//! The tools are implemented as an MCP server (`MemoryService`) that runs
//! in-process over a duplex pipe. `ToolRegistry` holds the client side: it
//! lists the server's tools once to build the definitions declared in the
//! session configuration, and routes function calls from the model to the
//! server. Whatever goes wrong during a call, the model gets an empty result.

use crate::{error::ToolInvocationError, memory::MemoryStore};
use indexmap::IndexMap;
use oracle_realtime::types::ToolDefinition;
use rmcp::{
    ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolRequestParam, ServerCapabilities, ServerInfo},
    service::{RoleClient, RunningService},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

pub const SET_MEMORY: &str = "set_memory";
pub const CLEAR_MEMORY: &str = "clear_memory";

/// Arguments of the `set_memory` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct SetMemoryArgs {
    #[schemars(description = "Key to store the information under")]
    pub key: String,
    #[schemars(description = "Information to remember")]
    pub value: String,
}

/// MCP server backing the memory tools.
pub struct MemoryService {
    memory: Arc<MemoryStore>,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for MemoryService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl MemoryService {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self {
            memory,
            tool_router: Self::tool_router(),
        }
    }

    /// Appends a fact under a key. Acknowledges with an empty string.
    #[tool(description = "Stores information in memory that can be recalled later")]
    pub async fn set_memory(&self, args: Parameters<SetMemoryArgs>) -> Result<String, String> {
        info!(key = %args.0.key, "Executing tool 'set_memory'");
        self.memory
            .append_fact(&args.0.key, &args.0.value)
            .await
            .map(|_| String::new())
            .map_err(|e| e.to_string())
    }

    #[tool(description = "Clears all stored memory")]
    pub async fn clear_memory(&self) -> Result<String, String> {
        info!("Executing tool 'clear_memory'");
        self.memory
            .clear()
            .await
            .map(|_| String::new())
            .map_err(|e| e.to_string())
    }
}

/// Removes schema metadata the realtime service does not need.
fn function_parameters(schema: &serde_json::Map<String, Value>) -> Value {
    let mut schema = schema.clone();
    schema.remove("$schema");
    schema.remove("title");
    schema
        .entry("type")
        .or_insert_with(|| Value::String("object".to_string()));
    schema
        .entry("properties")
        .or_insert_with(|| Value::Object(Default::default()));
    Value::Object(schema)
}

/// Text of a tool result, or the reason the call failed.
fn result_text(name: &str, result: &Value) -> Result<String, ToolInvocationError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(ToolInvocationError::Failed {
            name: name.to_string(),
            reason: text,
        });
    }
    Ok(text)
}

pub struct ToolRegistry {
    definitions: IndexMap<String, ToolDefinition>,
    client: RunningService<RoleClient, ()>,
    server_task: JoinHandle<()>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    /// Starts the memory tool server and registers every tool it lists.
    #[instrument(skip_all)]
    pub async fn start(memory: Arc<MemoryStore>) -> Result<Self, ToolInvocationError> {
        let service = MemoryService::new(memory);
        let (server_transport, client_transport) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            match service.serve(server_transport).await {
                Ok(running) => {
                    let _ = running.waiting().await;
                }
                Err(e) => warn!(error = %e, "Memory tool server failed to start"),
            }
        });
        let client = match ().serve(client_transport).await {
            Ok(client) => client,
            Err(e) => {
                server_task.abort();
                return Err(ToolInvocationError::Service(e.to_string()));
            }
        };

        let mut registry = Self {
            definitions: IndexMap::new(),
            client,
            server_task,
        };
        let tools = registry
            .client
            .list_all_tools()
            .await
            .map_err(|e| ToolInvocationError::Service(e.to_string()))?;
        for tool in tools {
            registry.register(ToolDefinition::function(
                tool.name.to_string(),
                tool.description.map(|d| d.to_string()).unwrap_or_default(),
                function_parameters(&tool.input_schema),
            ));
        }
        info!(tools = ?registry.definitions.keys().collect::<Vec<_>>(), "Tool registry ready");
        Ok(registry)
    }

    /// Adds or replaces a tool definition by name.
    pub fn register(&mut self, definition: ToolDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.values().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Runs a tool call from the model. Failures are logged and yield an
    /// empty result.
    pub async fn invoke(&self, name: &str, arguments: &str) -> String {
        match self.try_invoke(name, arguments).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, error = %e, "Tool invocation failed");
                String::new()
            }
        }
    }

    async fn try_invoke(&self, name: &str, arguments: &str) -> Result<String, ToolInvocationError> {
        if !self.contains(name) {
            return Err(ToolInvocationError::UnknownTool(name.to_string()));
        }
        let arguments = if arguments.trim().is_empty() {
            serde_json::Map::new()
        } else {
            serde_json::from_str(arguments).map_err(|e| ToolInvocationError::InvalidArguments {
                name: name.to_string(),
                reason: e.to_string(),
            })?
        };
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| ToolInvocationError::Failed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let result = serde_json::to_value(&result).map_err(|e| ToolInvocationError::Failed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        result_text(name, &result)
    }

    /// Stops the client and the in-process server.
    pub async fn shutdown(self) {
        self.server_task.abort();
        if let Err(e) = self.client.cancel().await {
            warn!(error = %e, "Tool client did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMap, MockMemoryBackend};
    use serde_json::json;

    async fn store() -> Arc<MemoryStore> {
        let mut backend = MockMemoryBackend::new();
        backend.expect_load().returning(|| Ok(None::<MemoryMap>));
        backend.expect_save().returning(|_| Ok(()));
        backend.expect_remove().returning(|| Ok(()));
        Arc::new(MemoryStore::open(Arc::new(backend)).await.unwrap())
    }

    #[test]
    fn test_result_text_reads_text_parts() {
        let ok = json!({ "content": [{ "type": "text", "text": "" }], "isError": false });
        assert_eq!(result_text(SET_MEMORY, &ok).unwrap(), "");
        let failed = json!({ "content": [{ "type": "text", "text": "disk full" }], "isError": true });
        assert!(matches!(
            result_text(SET_MEMORY, &failed),
            Err(ToolInvocationError::Failed { reason, .. }) if reason == "disk full"
        ));
    }

    #[test]
    fn test_function_parameters_strip_metadata() {
        let schema = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "title": "SetMemoryArgs",
            "type": "object",
            "properties": { "key": { "type": "string" } },
            "required": ["key"]
        });
        let params = function_parameters(schema.as_object().unwrap());
        assert!(params.get("$schema").is_none());
        assert!(params.get("title").is_none());
        assert_eq!(params["required"], json!(["key"]));

        let empty = function_parameters(&serde_json::Map::new());
        assert_eq!(empty, json!({ "type": "object", "properties": {} }));
    }

    #[tokio::test]
    async fn test_registry_declares_memory_tools() {
        let registry = ToolRegistry::start(store().await).await.unwrap();
        let definitions = registry.definitions();
        let set_memory = definitions.iter().find(|d| d.name == SET_MEMORY).unwrap();
        assert_eq!(set_memory.kind, "function");
        assert_eq!(
            set_memory.description,
            "Stores information in memory that can be recalled later"
        );
        assert_eq!(set_memory.parameters["type"], "object");
        assert_eq!(set_memory.parameters["properties"]["key"]["type"], "string");
        let required = set_memory.parameters["required"].as_array().unwrap();
        assert!(required.contains(&json!("key")) && required.contains(&json!("value")));
        assert!(registry.contains(CLEAR_MEMORY));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invoke_routes_to_memory() {
        let memory = store().await;
        let registry = ToolRegistry::start(memory.clone()).await.unwrap();

        let output = registry
            .invoke(SET_MEMORY, r#"{"key": "name", "value": "Alex"}"#)
            .await;
        assert_eq!(output, "");
        assert_eq!(memory.snapshot()["name"], vec!["Alex"]);

        assert_eq!(registry.invoke(CLEAR_MEMORY, "{}").await, "");
        assert!(memory.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invocation_failures_degrade_to_empty() {
        let memory = store().await;
        let registry = ToolRegistry::start(memory.clone()).await.unwrap();

        assert_eq!(registry.invoke("launch_rockets", "{}").await, "");
        assert_eq!(registry.invoke(SET_MEMORY, "not json").await, "");
        assert_eq!(registry.invoke(SET_MEMORY, r#"{"key": "name"}"#).await, "");
        assert!(memory.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_overwrites_by_name() {
        let mut registry = ToolRegistry::start(store().await).await.unwrap();
        let before = registry.definitions().len();
        registry.register(ToolDefinition::function(SET_MEMORY, "Replaced", json!({ "type": "object" })));
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), before);
        assert_eq!(
            definitions.iter().find(|d| d.name == SET_MEMORY).unwrap().description,
            "Replaced"
        );
        registry.shutdown().await;
    }
}
