//! Device-side MCP: tool discovery and invocation over the session's own
//! WebSocket.
//!
//! The device embeds an MCP server; the gateway is its client. JSON-RPC
//! envelopes ride inside `{type:"mcp", payload:{…}}` control messages.
//! Message ids are monotonic: 1 is reserved for initialize, 2 for
//! tools/list (including cursor continuations), calls start at 3 and each
//! registers a oneshot future resolved by the matching response. Tool
//! names are sanitized for the LLM; a reverse map preserves the original
//! names for wire calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::types::{Outbound, OutboundSender};

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

const MCP_INITIALIZE_ID: u64 = 1;
const MCP_TOOLS_LIST_ID: u64 = 2;
const FIRST_CALL_ID: u64 = 3;
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Replace anything outside `[A-Za-z0-9_-]` so the name is acceptable to
/// function-calling APIs.
pub fn sanitize_tool_name(name: &str) -> String {
    static UNSAFE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_\-]").unwrap());
    UNSAFE.replace_all(name, "_").into_owned()
}

#[derive(Debug, Clone)]
struct DeviceTool {
    original_name: String,
    description: String,
    input_schema: Value,
}

#[derive(Default)]
struct ClientState {
    tools: HashMap<String, DeviceTool>,
    ready: bool,
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value, String>>>,
}

/// MCP client state for one session.
pub struct DeviceMcpClient {
    outbound: OutboundSender,
    state: Mutex<ClientState>,
    discovery_started: std::sync::atomic::AtomicBool,
}

impl DeviceMcpClient {
    pub fn new(outbound: OutboundSender) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            state: Mutex::new(ClientState {
                next_id: FIRST_CALL_ID,
                ..Default::default()
            }),
            discovery_started: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    async fn send_payload(&self, payload: Value) -> bool {
        let envelope = json!({"type": "mcp", "payload": payload});
        if self
            .outbound
            .send(Outbound::Text(envelope.to_string()))
            .await
            .is_err()
        {
            error!("mcp send failed, outbound channel closed");
            return false;
        }
        true
    }

    /// Kick off the handshake: initialize, then request the tool list.
    /// Idempotent; only the first call sends anything.
    pub async fn start_discovery(&self, session_id: &str) {
        if self
            .discovery_started
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let initialize = json!({
            "jsonrpc": "2.0",
            "id": MCP_INITIALIZE_ID,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"roots": {"listChanged": true}, "sampling": {}},
                "clientInfo": {"name": "voxbridge", "version": env!("CARGO_PKG_VERSION")},
            },
        });
        debug!(%session_id, "sending MCP initialize");
        if self.send_payload(initialize).await {
            self.send_tools_list_request(None).await;
        }
    }

    async fn send_tools_list_request(&self, cursor: Option<&str>) {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "id": MCP_TOOLS_LIST_ID,
            "method": "tools/list",
        });
        if let Some(cursor) = cursor {
            payload["params"] = json!({"cursor": cursor});
        }
        self.send_payload(payload).await;
    }

    /// Route one inbound `mcp` payload. Returns true when the tool table
    /// changed and the registry cache must be invalidated.
    pub async fn handle_message(&self, payload: &Value) -> bool {
        let Some(payload) = payload.as_object() else {
            warn!("mcp payload is not an object");
            return false;
        };
        let msg_id = payload.get("id").and_then(Value::as_u64).unwrap_or(0);

        if let Some(result) = payload.get("result") {
            // Tool call responses first: ids overlap nothing else.
            if self.resolve_pending(msg_id, Ok(result.clone())) {
                return false;
            }
            match msg_id {
                MCP_INITIALIZE_ID => {
                    if let Some(info) = result.get("serverInfo") {
                        debug!(server = %info, "device MCP initialized");
                    }
                    false
                }
                MCP_TOOLS_LIST_ID => self.ingest_tools_list(result).await,
                _ => false,
            }
        } else if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown MCP error")
                .to_string();
            error!(%message, "device MCP error response");
            self.resolve_pending(msg_id, Err(message));
            false
        } else if let Some(method) = payload.get("method").and_then(Value::as_str) {
            info!(%method, "device MCP request received");
            false
        } else {
            false
        }
    }

    async fn ingest_tools_list(&self, result: &Value) -> bool {
        let Some(tools) = result.get("tools").and_then(Value::as_array) else {
            warn!("malformed MCP tools list");
            return false;
        };

        {
            let mut state = self.state.lock().unwrap();
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let sanitized = sanitize_tool_name(name);
                let input_schema = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                state.tools.insert(
                    sanitized,
                    DeviceTool {
                        original_name: name.to_string(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input_schema,
                    },
                );
            }

            // Descriptions referencing other tools must use the names the
            // model will actually call.
            let name_map: Vec<(String, String)> = state
                .tools
                .iter()
                .filter(|(sanitized, tool)| **sanitized != tool.original_name)
                .map(|(sanitized, tool)| (sanitized.clone(), tool.original_name.clone()))
                .collect();
            for tool in state.tools.values_mut() {
                for (sanitized, original) in &name_map {
                    if tool.description.contains(original.as_str()) {
                        tool.description = tool.description.replace(original, sanitized);
                    }
                }
            }
        }

        match result.get("nextCursor").and_then(Value::as_str) {
            Some(cursor) if !cursor.is_empty() => {
                info!(%cursor, "device MCP tool list continues");
                self.send_tools_list_request(Some(cursor)).await;
                false
            }
            _ => {
                let count = {
                    let mut state = self.state.lock().unwrap();
                    state.ready = true;
                    state.tools.len()
                };
                info!(count, "device MCP ready");
                true
            }
        }
    }

    fn resolve_pending(&self, id: u64, result: Result<Value, String>) -> bool {
        let sender = self.state.lock().unwrap().pending.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn tool_definitions(&self) -> HashMap<String, ToolDefinition> {
        let state = self.state.lock().unwrap();
        state
            .tools
            .iter()
            .map(|(name, tool)| {
                let schema = tool.input_schema.as_object().cloned().unwrap_or_default();
                (
                    name.clone(),
                    ToolDefinition {
                        name: name.clone(),
                        description: json!({
                            "type": "function",
                            "function": {
                                "name": name,
                                "description": tool.description,
                                "parameters": {
                                    "type": schema.get("type").cloned().unwrap_or(json!("object")),
                                    "properties": schema
                                        .get("properties")
                                        .cloned()
                                        .unwrap_or(json!({})),
                                    "required": schema
                                        .get("required")
                                        .cloned()
                                        .unwrap_or(json!([])),
                                },
                            },
                        }),
                        backend: ToolBackend::DeviceMcp,
                    },
                )
            })
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.state.lock().unwrap().tools.contains_key(name)
    }

    /// Invoke a device tool and wait for the matching response.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, String> {
        let (original_name, id, rx) = {
            let mut state = self.state.lock().unwrap();
            if !state.ready {
                return Err("device MCP client not ready".to_string());
            }
            let Some(tool) = state.tools.get(name) else {
                return Err(format!("device tool {name} does not exist"));
            };
            let original_name = tool.original_name.clone();
            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);
            (original_name, id, rx)
        };

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": original_name, "arguments": arguments},
        });
        if !self.send_payload(payload).await {
            self.state.lock().unwrap().pending.remove(&id);
            return Err("could not reach the device".to_string());
        }

        let raw = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err("device dropped the call".to_string());
            }
            Err(_) => {
                self.state.lock().unwrap().pending.remove(&id);
                return Err("device tool call timed out".to_string());
            }
        };

        Ok(unwrap_call_result(&raw))
    }
}

/// MCP tool results carry `content: [{type:"text", text}]`; errors set
/// `isError`. Anything unexpected is stringified.
fn unwrap_call_result(raw: &Value) -> String {
    if raw.get("isError").and_then(Value::as_bool) == Some(true) {
        let detail = raw
            .get("error")
            .map(Value::to_string)
            .unwrap_or_else(|| "tool reported an error".to_string());
        return format!("error: {detail}");
    }
    if let Some(content) = raw.get("content").and_then(Value::as_array) {
        if let Some(first) = content.first() {
            if let Some(text) = first.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    raw.to_string()
}

pub struct DeviceMcpExecutor {
    client: Arc<DeviceMcpClient>,
}

impl DeviceMcpExecutor {
    pub fn new(client: Arc<DeviceMcpClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolExecutor for DeviceMcpExecutor {
    fn get_tools(&self) -> HashMap<String, ToolDefinition> {
        if !self.client.is_ready() {
            return HashMap::new();
        }
        self.client.tool_definitions()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.client.has_tool(name)
    }

    async fn execute(&self, name: &str, arguments: Value) -> ActionResponse {
        match self.client.call_tool(name, arguments).await {
            Ok(text) if text.starts_with("error: ") => ActionResponse::Error(text),
            Ok(text) => ActionResponse::ReqLlm(text),
            Err(message) => ActionResponse::Error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client() -> (Arc<DeviceMcpClient>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        (DeviceMcpClient::new(tx), rx)
    }

    fn tools_list_result(names: &[&str]) -> Value {
        json!({
            "tools": names
                .iter()
                .map(|n| json!({
                    "name": n,
                    "description": format!("tool {n}"),
                    "inputSchema": {"type": "object", "properties": {}, "required": []},
                }))
                .collect::<Vec<_>>(),
        })
    }

    #[test]
    fn sanitize_replaces_special_characters() {
        assert_eq!(sanitize_tool_name("self.get_state"), "self_get_state");
        assert_eq!(sanitize_tool_name("ok_name-1"), "ok_name-1");
        assert_eq!(sanitize_tool_name("weird name!"), "weird_name_");
    }

    #[tokio::test]
    async fn discovery_makes_client_ready() {
        let (client, mut rx) = client();
        client.start_discovery("s1").await;
        // initialize + tools/list on the wire
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));
        assert!(matches!(rx.recv().await, Some(Outbound::Text(_))));

        let changed = client
            .handle_message(&json!({"id": 2, "result": tools_list_result(&["self.play", "stop"])}))
            .await;
        assert!(changed);
        assert!(client.is_ready());
        assert!(client.has_tool("self_play"));
        assert!(client.has_tool("stop"));
    }

    #[tokio::test]
    async fn cursor_continuation_requests_next_page() {
        let (client, mut rx) = client();
        let changed = client
            .handle_message(&json!({
                "id": 2,
                "result": {
                    "tools": [{"name": "a", "description": "", "inputSchema": {}}],
                    "nextCursor": "page-2",
                },
            }))
            .await;
        assert!(!changed);
        assert!(!client.is_ready());

        match rx.recv().await.unwrap() {
            Outbound::Text(text) => {
                let envelope: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(envelope["payload"]["method"], "tools/list");
                assert_eq!(envelope["payload"]["params"]["cursor"], "page-2");
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_tool_resolves_on_response() {
        let (client, mut rx) = client();
        client
            .handle_message(&json!({"id": 2, "result": tools_list_result(&["self.play"])}))
            .await;

        let call_client = client.clone();
        let call = tokio::spawn(async move {
            call_client
                .call_tool("self_play", json!({"song": "test"}))
                .await
        });

        // Read the outgoing call to learn its id and original name.
        let outgoing = loop {
            match rx.recv().await.unwrap() {
                Outbound::Text(text) => {
                    let envelope: Value = serde_json::from_str(&text).unwrap();
                    if envelope["payload"]["method"] == "tools/call" {
                        break envelope;
                    }
                }
                _ => continue,
            }
        };
        assert_eq!(outgoing["payload"]["params"]["name"], "self.play");
        let id = outgoing["payload"]["id"].as_u64().unwrap();
        assert!(id >= FIRST_CALL_ID);

        client
            .handle_message(&json!({
                "id": id,
                "result": {"content": [{"type": "text", "text": "playing"}]},
            }))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), "playing");
    }

    #[tokio::test]
    async fn call_before_ready_is_rejected() {
        let (client, _rx) = client();
        assert!(client.call_tool("anything", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn error_response_rejects_pending_call() {
        let (client, mut rx) = client();
        client
            .handle_message(&json!({"id": 2, "result": tools_list_result(&["t"])}))
            .await;

        let call_client = client.clone();
        let call = tokio::spawn(async move { call_client.call_tool("t", json!({})).await });

        let id = loop {
            match rx.recv().await.unwrap() {
                Outbound::Text(text) => {
                    let envelope: Value = serde_json::from_str(&text).unwrap();
                    if envelope["payload"]["method"] == "tools/call" {
                        break envelope["payload"]["id"].as_u64().unwrap();
                    }
                }
                _ => continue,
            }
        };

        client
            .handle_message(&json!({"id": id, "error": {"message": "nope"}}))
            .await;
        assert!(call.await.unwrap().is_err());
    }
}
