//! Remote MCP endpoint: a tool service reached over its own WebSocket.
//!
//! Unlike device MCP (which rides the session socket) this executor owns
//! an outbound connection. The device MAC is injected into every
//! `tools/call` argument object so the remote service can scope its
//! behavior per device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const INITIALIZE_ID: u64 = 1;
const TOOLS_LIST_ID: u64 = 2;

struct EndpointState {
    tools: HashMap<String, Value>,
    ready: bool,
    pending: HashMap<u64, oneshot::Sender<Result<Value, String>>>,
}

/// Protocol state for one endpoint connection. The wire is abstracted to
/// an outgoing text channel so the handshake and routing logic are
/// independent of the socket.
pub struct McpEndpointClient {
    mac_address: String,
    outgoing: mpsc::Sender<String>,
    state: Mutex<EndpointState>,
    next_id: AtomicU64,
}

impl McpEndpointClient {
    pub fn new(mac_address: &str, outgoing: mpsc::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            mac_address: mac_address.to_string(),
            outgoing,
            state: Mutex::new(EndpointState {
                tools: HashMap::new(),
                ready: false,
                pending: HashMap::new(),
            }),
            next_id: AtomicU64::new(TOOLS_LIST_ID + 1),
        })
    }

    /// Open the WebSocket and drive the connection until it closes.
    /// Returns the client once the handshake is underway.
    pub async fn connect(url: &str, mac_address: &str) -> Result<Arc<Self>, String> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| format!("MCP endpoint connect failed: {e}"))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(32);
        let client = Self::new(mac_address, out_tx);

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        let reader = client.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        if let Ok(payload) = serde_json::from_str::<Value>(&text) {
                            reader.handle_message(&payload).await;
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            reader.fail_pending("MCP endpoint connection closed");
            info!("MCP endpoint disconnected");
        });

        client.start_handshake().await;
        Ok(client)
    }

    pub async fn start_handshake(&self) {
        let initialize = json!({
            "jsonrpc": "2.0",
            "id": INITIALIZE_ID,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "voxbridge", "version": env!("CARGO_PKG_VERSION")},
            },
        });
        let _ = self.outgoing.send(initialize.to_string()).await;
        let list = json!({"jsonrpc": "2.0", "id": TOOLS_LIST_ID, "method": "tools/list"});
        let _ = self.outgoing.send(list.to_string()).await;
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    fn fail_pending(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    /// Route one inbound JSON-RPC message.
    pub async fn handle_message(&self, payload: &Value) {
        let msg_id = payload.get("id").and_then(Value::as_u64).unwrap_or(0);

        if let Some(result) = payload.get("result") {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(tx) = state.pending.remove(&msg_id) {
                    let _ = tx.send(Ok(result.clone()));
                    return;
                }
            }
            match msg_id {
                INITIALIZE_ID => debug!("MCP endpoint initialized"),
                TOOLS_LIST_ID => {
                    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
                        warn!("malformed MCP endpoint tool list");
                        return;
                    };
                    let mut state = self.state.lock().unwrap();
                    for tool in tools {
                        if let Some(name) = tool.get("name").and_then(Value::as_str) {
                            state.tools.insert(name.to_string(), tool.clone());
                        }
                    }
                    state.ready = true;
                    info!(count = state.tools.len(), "MCP endpoint ready");
                }
                _ => {}
            }
        } else if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown MCP endpoint error")
                .to_string();
            error!(%message, "MCP endpoint error");
            let mut state = self.state.lock().unwrap();
            if let Some(tx) = state.pending.remove(&msg_id) {
                let _ = tx.send(Err(message));
            }
        }
    }

    pub fn tool_definitions(&self) -> HashMap<String, ToolDefinition> {
        let state = self.state.lock().unwrap();
        state
            .tools
            .iter()
            .map(|(name, tool)| {
                (
                    name.clone(),
                    ToolDefinition {
                        name: name.clone(),
                        description: json!({
                            "type": "function",
                            "function": {
                                "name": name,
                                "description": tool
                                    .get("description")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default(),
                                "parameters": tool
                                    .get("inputSchema")
                                    .cloned()
                                    .unwrap_or(json!({"type": "object", "properties": {}})),
                            },
                        }),
                        backend: ToolBackend::McpEndpoint,
                    },
                )
            })
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.state.lock().unwrap().tools.contains_key(name)
    }

    /// Call a remote tool. The device MAC is always injected into the
    /// argument object.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, String> {
        let (id, rx) = {
            let mut state = self.state.lock().unwrap();
            if !state.ready {
                return Err("MCP endpoint not ready".to_string());
            }
            if !state.tools.contains_key(name) {
                return Err(format!("endpoint tool {name} does not exist"));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            state.pending.insert(id, tx);
            (id, rx)
        };

        let mut arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        arguments.insert("mac_address".to_string(), json!(self.mac_address));

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        });
        if self.outgoing.send(payload.to_string()).await.is_err() {
            self.state.lock().unwrap().pending.remove(&id);
            return Err("MCP endpoint connection lost".to_string());
        }

        let raw = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err("MCP endpoint dropped the call".to_string()),
            Err(_) => {
                self.state.lock().unwrap().pending.remove(&id);
                return Err("MCP endpoint call timed out".to_string());
            }
        };

        if raw.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(raw
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "endpoint tool error".to_string()));
        }
        if let Some(text) = raw
            .get("content")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
        {
            return Ok(text.to_string());
        }
        Ok(raw.to_string())
    }
}

pub struct McpEndpointExecutor {
    client: Arc<McpEndpointClient>,
}

impl McpEndpointExecutor {
    pub fn new(client: Arc<McpEndpointClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ToolExecutor for McpEndpointExecutor {
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
            Ok(text) => ActionResponse::ReqLlm(text),
            Err(message) => ActionResponse::Error(message),
        }
    }
}

/// Endpoint URLs must be websocket MCP paths without embedded credentials.
pub fn validate_endpoint_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    matches!(parsed.scheme(), "ws" | "wss")
        && parsed.path().contains("/mcp/")
        && parsed.password().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_client() -> (Arc<McpEndpointClient>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let client = McpEndpointClient::new("AA:BB:CC:DD:EE:FF", tx);
        (client, rx)
    }

    async fn make_ready(client: &Arc<McpEndpointClient>) {
        client
            .handle_message(&json!({
                "id": TOOLS_LIST_ID,
                "result": {
                    "tools": [{
                        "name": "lookup",
                        "description": "remote lookup",
                        "inputSchema": {"type": "object", "properties": {}},
                    }],
                },
            }))
            .await;
    }

    #[tokio::test]
    async fn tools_list_marks_ready() {
        let (client, _rx) = ready_client();
        assert!(!client.is_ready());
        make_ready(&client).await;
        assert!(client.is_ready());
        assert!(client.has_tool("lookup"));
    }

    #[tokio::test]
    async fn mac_is_injected_into_call_arguments() {
        let (client, mut rx) = ready_client();
        make_ready(&client).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller.call_tool("lookup", json!({"query": "weather"})).await
        });

        let outgoing = rx.recv().await.unwrap();
        let payload: Value = serde_json::from_str(&outgoing).unwrap();
        assert_eq!(payload["method"], "tools/call");
        assert_eq!(
            payload["params"]["arguments"]["mac_address"],
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(payload["params"]["arguments"]["query"], "weather");

        let id = payload["id"].as_u64().unwrap();
        client
            .handle_message(&json!({
                "id": id,
                "result": {"content": [{"type": "text", "text": "sunny"}]},
            }))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), "sunny");
    }

    #[tokio::test]
    async fn endpoint_error_fails_the_call() {
        let (client, mut rx) = ready_client();
        make_ready(&client).await;

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call_tool("lookup", json!({})).await });
        let payload: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let id = payload["id"].as_u64().unwrap();

        client
            .handle_message(&json!({"id": id, "error": {"message": "denied"}}))
            .await;
        assert_eq!(call.await.unwrap().unwrap_err(), "denied");
    }

    #[test]
    fn url_validation() {
        assert!(validate_endpoint_url("wss://tools.example.com/mcp/abc"));
        assert!(!validate_endpoint_url("https://tools.example.com/mcp/abc"));
        assert!(!validate_endpoint_url("wss://user:pw@example.com/mcp/x"));
        assert!(!validate_endpoint_url("wss://example.com/other/x"));
        assert!(!validate_endpoint_url("not a url"));
    }
}
