//! Server-side MCP: out-of-process tool servers owned by the session.
//!
//! Each configured server is launched as a child process speaking
//! newline-delimited JSON-RPC on stdio. A central manager multiplexes the
//! clients and wraps every tool call in a reconnect-and-retry policy:
//! three attempts with a two-second backoff before the error surfaces.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::agent::McpServerConfig;

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

/// Attempts per tool call before giving up.
const MAX_CALL_ATTEMPTS: u32 = 3;
/// Pause between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One JSON-RPC connection to an MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, String>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Child process speaking line-delimited JSON-RPC on stdio.
pub struct StdioTransport {
    stdin: tokio::sync::Mutex<tokio::process::ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    _child: tokio::process::Child,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, String> {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("could not launch {command}: {e}"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "child stdin unavailable".to_string())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "child stdout unavailable".to_string())?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    debug!("skipping non-JSON line from MCP server");
                    continue;
                };
                let Some(id) = message.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                let sender = reader_pending.lock().unwrap().remove(&id);
                if let Some(tx) = sender {
                    let outcome = if let Some(err) = message.get("error") {
                        Err(err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("MCP server error")
                            .to_string())
                    } else {
                        Ok(message.get("result").cloned().unwrap_or(Value::Null))
                    };
                    let _ = tx.send(outcome);
                }
            }
            // Reader ending means the process died; fail the waiters.
            let mut pending = reader_pending.lock().unwrap();
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err("MCP server exited".to_string()));
            }
        });

        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut line = payload.to_string();
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("MCP server write failed: {e}"))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("MCP server flush failed: {e}"))?;
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("MCP server dropped the request".to_string()),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err("MCP server request timed out".to_string())
            }
        }
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Box<dyn McpTransport>, String>> + Send>>;
type Connector = Box<dyn Fn() -> ConnectFuture + Send + Sync>;

/// Client for one configured MCP server, reconnecting on demand.
pub struct ServerMcpClient {
    pub name: String,
    connector: Connector,
    transport: tokio::sync::Mutex<Option<Box<dyn McpTransport>>>,
    tools: Mutex<Vec<Value>>,
}

impl ServerMcpClient {
    pub fn from_config(config: &McpServerConfig) -> Option<Self> {
        let Some(command) = config.command.clone() else {
            // URL-based servers go through the MCP-endpoint executor.
            warn!(server = %config.name, "server MCP config has no command, skipping");
            return None;
        };
        let args = config.args.clone();
        Some(Self::with_connector(
            &config.name,
            Box::new(move || {
                let command = command.clone();
                let args = args.clone();
                Box::pin(async move {
                    StdioTransport::spawn(&command, &args)
                        .map(|t| Box::new(t) as Box<dyn McpTransport>)
                })
            }),
        ))
    }

    pub fn with_connector(name: &str, connector: Connector) -> Self {
        Self {
            name: name.to_string(),
            connector,
            transport: tokio::sync::Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        }
    }

    /// Connect if needed: spawn, initialize, list tools.
    pub async fn ensure_connected(&self) -> Result<(), String> {
        let mut transport = self.transport.lock().await;
        if transport.is_some() {
            return Ok(());
        }

        let conn = (self.connector)().await?;
        conn.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "voxbridge", "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;

        let listed = conn.request("tools/list", json!({})).await?;
        let tools: Vec<Value> = listed
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        info!(server = %self.name, count = tools.len(), "server MCP connected");
        *self.tools.lock().unwrap() = tools;
        *transport = Some(conn);
        Ok(())
    }

    async fn drop_connection(&self) {
        *self.transport.lock().await = None;
    }

    /// OpenAI-shaped function descriptions for this server's tools.
    pub fn function_descriptions(&self) -> Vec<(String, Value)> {
        self.tools
            .lock()
            .unwrap()
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                let description = json!({
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
                });
                Some((name, description))
            })
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools
            .lock()
            .unwrap()
            .iter()
            .any(|tool| tool.get("name").and_then(Value::as_str) == Some(name))
    }

    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<String, String> {
        self.ensure_connected().await?;
        let transport = self.transport.lock().await;
        let Some(conn) = transport.as_ref() else {
            return Err("not connected".to_string());
        };
        let result = conn
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        Ok(unwrap_text_content(&result))
    }
}

fn unwrap_text_content(result: &Value) -> String {
    if let Some(content) = result.get("content").and_then(Value::as_array) {
        if let Some(text) = content
            .first()
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
        {
            return text.to_string();
        }
    }
    result.to_string()
}

/// Central manager multiplexing every configured server for one session.
pub struct ServerMcpManager {
    clients: Vec<Arc<ServerMcpClient>>,
}

impl ServerMcpManager {
    pub fn new(configs: &[&McpServerConfig]) -> Self {
        let clients = configs
            .iter()
            .filter_map(|cfg| ServerMcpClient::from_config(cfg))
            .map(Arc::new)
            .collect();
        Self { clients }
    }

    pub fn with_clients(clients: Vec<Arc<ServerMcpClient>>) -> Self {
        Self { clients }
    }

    /// Connect every server, tolerating individual failures.
    pub async fn initialize(&self) {
        for client in &self.clients {
            if let Err(e) = client.ensure_connected().await {
                error!(server = %client.name, error = %e, "server MCP connect failed");
            }
        }
    }

    pub fn all_tools(&self) -> Vec<(String, Value)> {
        self.clients
            .iter()
            .flat_map(|c| c.function_descriptions())
            .collect()
    }

    pub fn is_mcp_tool(&self, name: &str) -> bool {
        self.clients.iter().any(|c| c.has_tool(name))
    }

    /// Execute with the reconnect-and-retry policy.
    pub async fn execute_tool(&self, name: &str, arguments: &Value) -> Result<String, String> {
        let Some(client) = self.clients.iter().find(|c| c.has_tool(name)) else {
            return Err(format!("no MCP server provides {name}"));
        };

        let mut last_error = String::new();
        for attempt in 1..=MAX_CALL_ATTEMPTS {
            match client.call_tool(name, arguments).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        server = %client.name,
                        tool = %name,
                        attempt,
                        error = %e,
                        "server MCP call failed"
                    );
                    last_error = e;
                    client.drop_connection().await;
                    if attempt < MAX_CALL_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}

pub struct ServerMcpExecutor {
    manager: Arc<ServerMcpManager>,
}

impl ServerMcpExecutor {
    pub fn new(manager: Arc<ServerMcpManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolExecutor for ServerMcpExecutor {
    fn get_tools(&self) -> HashMap<String, ToolDefinition> {
        self.manager
            .all_tools()
            .into_iter()
            .map(|(name, description)| {
                (
                    name.clone(),
                    ToolDefinition {
                        name,
                        description,
                        backend: ToolBackend::ServerMcp,
                    },
                )
            })
            .collect()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.manager.is_mcp_tool(name)
    }

    async fn execute(&self, name: &str, arguments: Value) -> ActionResponse {
        match self.manager.execute_tool(name, &arguments).await {
            Ok(result) => ActionResponse::ReqLlm(result),
            Err(message) => ActionResponse::Error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FakeTransport {
        fail_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        async fn request(&self, method: &str, _params: Value) -> Result<Value, String> {
            match method {
                "initialize" => Ok(json!({"serverInfo": {"name": "fake"}})),
                "tools/list" => Ok(json!({
                    "tools": [{
                        "name": "echo",
                        "description": "echo input",
                        "inputSchema": {"type": "object", "properties": {}},
                    }],
                })),
                "tools/call" => {
                    if self.fail_calls.fetch_update(
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        |n| if n > 0 { Some(n - 1) } else { None },
                    ).is_ok()
                    {
                        Err("synthetic transport failure".to_string())
                    } else {
                        Ok(json!({"content": [{"type": "text", "text": "echoed"}]}))
                    }
                }
                other => Err(format!("unexpected method {other}")),
            }
        }
    }

    fn fake_client(failures: u32) -> Arc<ServerMcpClient> {
        let counter = Arc::new(AtomicU32::new(failures));
        Arc::new(ServerMcpClient::with_connector(
            "fake",
            Box::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    Ok(Box::new(FakeTransport {
                        fail_calls: counter,
                    }) as Box<dyn McpTransport>)
                })
            }),
        ))
    }

    #[tokio::test]
    async fn connect_discovers_tools() {
        let client = fake_client(0);
        client.ensure_connected().await.unwrap();
        assert!(client.has_tool("echo"));
        let descriptions = client.function_descriptions();
        assert_eq!(descriptions[0].0, "echo");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_recovers_after_transient_failures() {
        let client = fake_client(2);
        client.ensure_connected().await.unwrap();
        let manager = ServerMcpManager::with_clients(vec![client]);

        let result = manager.execute_tool("echo", &json!({})).await;
        assert_eq!(result.unwrap(), "echoed");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_three_attempts() {
        let client = fake_client(10);
        client.ensure_connected().await.unwrap();
        let manager = ServerMcpManager::with_clients(vec![client]);

        let result = manager.execute_tool("echo", &json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected() {
        let manager = ServerMcpManager::with_clients(vec![fake_client(0)]);
        assert!(manager.execute_tool("missing", &json!({})).await.is_err());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        assert!(StdioTransport::spawn("/definitely/not/a/binary", &[]).is_err());
    }
}
