//! Unified tool system.
//!
//! One registry spans five executor backends: server-local plugins,
//! server-side MCP services, device-side MCP, device IoT descriptors, and a
//! remote MCP endpoint. Every backend implements `ToolExecutor`; the
//! manager composes them and routes calls by name.

pub mod device_iot;
pub mod device_mcp;
pub mod dispatcher;
pub mod manager;
pub mod mcp_endpoint;
pub mod reminders;
pub mod server_mcp;
pub mod server_plugins;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

pub use dispatcher::ToolDispatcher;
pub use manager::ToolManager;

/// Which executor owns a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolBackend {
    ServerPlugin,
    ServerMcp,
    DeviceMcp,
    DeviceIot,
    McpEndpoint,
}

impl ToolBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolBackend::ServerPlugin => "server_plugin",
            ToolBackend::ServerMcp => "server_mcp",
            ToolBackend::DeviceMcp => "device_mcp",
            ToolBackend::DeviceIot => "device_iot",
            ToolBackend::McpEndpoint => "mcp_endpoint",
        }
    }
}

/// Registry entry: the OpenAI function description plus owning backend.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    /// OpenAI function-call shape: `{"type":"function","function":{...}}`.
    pub description: Value,
    pub backend: ToolBackend,
}

/// Outcome of a tool invocation, steering the rest of the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResponse {
    /// Nothing further to do.
    None,
    /// Speak this text directly, no extra LLM round.
    Response(String),
    /// Feed this result back into the LLM for another round.
    ReqLlm(String),
    /// Execution failed; text is surfaced and recorded.
    Error(String),
    /// No executor owns the requested name.
    NotFound,
}

impl ActionResponse {
    /// Combine the results of several calls from one LLM turn: any error
    /// wins, otherwise responses concatenate, and any REQLLM makes the
    /// combination REQLLM.
    pub fn combine(responses: Vec<ActionResponse>) -> ActionResponse {
        if responses.is_empty() {
            return ActionResponse::None;
        }
        if let Some(err) = responses
            .iter()
            .find(|r| matches!(r, ActionResponse::Error(_)))
        {
            return err.clone();
        }

        let mut texts = Vec::new();
        let mut req_llm = false;
        for response in &responses {
            match response {
                ActionResponse::Response(text) | ActionResponse::ReqLlm(text) => {
                    if !text.is_empty() {
                        texts.push(text.clone());
                    }
                    if matches!(response, ActionResponse::ReqLlm(_)) {
                        req_llm = true;
                    }
                }
                ActionResponse::NotFound => {
                    texts.push("tool not found".to_string());
                }
                ActionResponse::None | ActionResponse::Error(_) => {}
            }
        }

        let joined = texts.join("; ");
        if req_llm {
            ActionResponse::ReqLlm(joined)
        } else if joined.is_empty() {
            ActionResponse::None
        } else {
            ActionResponse::Response(joined)
        }
    }
}

/// One executor backend.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Snapshot of every tool this backend currently serves.
    fn get_tools(&self) -> HashMap<String, ToolDefinition>;

    fn has_tool(&self, name: &str) -> bool;

    async fn execute(&self, name: &str, arguments: Value) -> ActionResponse;
}
