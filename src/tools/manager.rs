//! Central registry over every tool executor backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

/// Composes the executors and serves a cached union of their tool tables.
///
/// Executors register in a fixed order; on a name conflict the first
/// registration wins. The union (and the derived function-description
/// list) is cached and invalidated on any registry mutation — IoT
/// descriptor registration, MCP discovery completion, executor swap.
pub struct ToolManager {
    executors: Mutex<Vec<(ToolBackend, Arc<dyn ToolExecutor>)>>,
    cached_union: Mutex<Option<HashMap<String, ToolDefinition>>>,
}

impl ToolManager {
    pub fn new() -> Self {
        Self {
            executors: Mutex::new(Vec::new()),
            cached_union: Mutex::new(None),
        }
    }

    pub fn register_executor(&self, backend: ToolBackend, executor: Arc<dyn ToolExecutor>) {
        self.executors.lock().unwrap().push((backend, executor));
        self.invalidate();
        debug!(backend = backend.as_str(), "registered tool executor");
    }

    /// Drop the cached union; next read rebuilds it.
    pub fn invalidate(&self) {
        *self.cached_union.lock().unwrap() = None;
    }

    /// Union of every backend's tools, first registration winning.
    pub fn all_tools(&self) -> HashMap<String, ToolDefinition> {
        if let Some(cached) = self.cached_union.lock().unwrap().as_ref() {
            return cached.clone();
        }

        let mut union: HashMap<String, ToolDefinition> = HashMap::new();
        let executors = self.executors.lock().unwrap().clone();
        for (backend, executor) in &executors {
            for (name, definition) in executor.get_tools() {
                if union.contains_key(&name) {
                    warn!(
                        tool = %name,
                        backend = backend.as_str(),
                        "tool name conflict, first registration wins"
                    );
                    continue;
                }
                union.insert(name, definition);
            }
        }

        *self.cached_union.lock().unwrap() = Some(union.clone());
        union
    }

    /// Function descriptions in the shape the LLM expects.
    pub fn function_descriptions(&self) -> Vec<Value> {
        self.all_tools()
            .into_values()
            .map(|def| def.description)
            .collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.all_tools().contains_key(name)
    }

    pub fn tool_backend(&self, name: &str) -> Option<ToolBackend> {
        self.all_tools().get(name).map(|def| def.backend)
    }

    pub fn supported_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.all_tools().into_keys().collect();
        names.sort();
        names
    }

    /// Per-backend tool counts for diagnostics.
    pub fn statistics(&self) -> HashMap<&'static str, usize> {
        let executors = self.executors.lock().unwrap().clone();
        executors
            .iter()
            .map(|(backend, executor)| (backend.as_str(), executor.get_tools().len()))
            .collect()
    }

    /// Execute a call, routing by the owning backend.
    pub async fn execute_tool(&self, name: &str, arguments: Value) -> ActionResponse {
        let Some(backend) = self.tool_backend(name) else {
            return ActionResponse::NotFound;
        };

        let executor = {
            let executors = self.executors.lock().unwrap();
            executors
                .iter()
                .find(|(b, _)| *b == backend)
                .map(|(_, e)| e.clone())
        };

        match executor {
            Some(executor) => {
                debug!(tool = %name, backend = backend.as_str(), "executing tool");
                executor.execute(name, arguments).await
            }
            None => ActionResponse::Error(format!(
                "no executor registered for backend {}",
                backend.as_str()
            )),
        }
    }
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedExecutor {
        backend: ToolBackend,
        names: Vec<&'static str>,
        reply: ActionResponse,
    }

    #[async_trait]
    impl ToolExecutor for FixedExecutor {
        fn get_tools(&self) -> HashMap<String, ToolDefinition> {
            self.names
                .iter()
                .map(|&name| {
                    (
                        name.to_string(),
                        ToolDefinition {
                            name: name.to_string(),
                            description: json!({"type": "function", "function": {"name": name}}),
                            backend: self.backend,
                        },
                    )
                })
                .collect()
        }

        fn has_tool(&self, name: &str) -> bool {
            self.names.contains(&name)
        }

        async fn execute(&self, _name: &str, _arguments: Value) -> ActionResponse {
            self.reply.clone()
        }
    }

    #[tokio::test]
    async fn routes_to_owning_backend() {
        let manager = ToolManager::new();
        manager.register_executor(
            ToolBackend::ServerPlugin,
            Arc::new(FixedExecutor {
                backend: ToolBackend::ServerPlugin,
                names: vec!["get_weather"],
                reply: ActionResponse::Response("sunny".to_string()),
            }),
        );
        manager.register_executor(
            ToolBackend::DeviceIot,
            Arc::new(FixedExecutor {
                backend: ToolBackend::DeviceIot,
                names: vec!["lamp_turn_on"],
                reply: ActionResponse::ReqLlm("done".to_string()),
            }),
        );

        assert_eq!(
            manager.execute_tool("get_weather", json!({})).await,
            ActionResponse::Response("sunny".to_string())
        );
        assert_eq!(
            manager.execute_tool("lamp_turn_on", json!({})).await,
            ActionResponse::ReqLlm("done".to_string())
        );
        assert_eq!(
            manager.execute_tool("missing", json!({})).await,
            ActionResponse::NotFound
        );
    }

    #[tokio::test]
    async fn first_registration_wins_on_conflict() {
        let manager = ToolManager::new();
        manager.register_executor(
            ToolBackend::ServerPlugin,
            Arc::new(FixedExecutor {
                backend: ToolBackend::ServerPlugin,
                names: vec!["shared"],
                reply: ActionResponse::Response("plugin".to_string()),
            }),
        );
        manager.register_executor(
            ToolBackend::ServerMcp,
            Arc::new(FixedExecutor {
                backend: ToolBackend::ServerMcp,
                names: vec!["shared"],
                reply: ActionResponse::Response("mcp".to_string()),
            }),
        );

        assert_eq!(
            manager.tool_backend("shared"),
            Some(ToolBackend::ServerPlugin)
        );
        assert_eq!(
            manager.execute_tool("shared", json!({})).await,
            ActionResponse::Response("plugin".to_string())
        );
    }

    #[test]
    fn statistics_counts_per_backend() {
        let manager = ToolManager::new();
        manager.register_executor(
            ToolBackend::ServerPlugin,
            Arc::new(FixedExecutor {
                backend: ToolBackend::ServerPlugin,
                names: vec!["a", "b"],
                reply: ActionResponse::None,
            }),
        );
        let stats = manager.statistics();
        assert_eq!(stats.get("server_plugin"), Some(&2));
    }
}
