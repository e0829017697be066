//! Server-local plugin tools.
//!
//! Plugins are registered explicitly at construction: `builtin_plugins()`
//! returns the full table and the executor filters it down to the agent
//! binding's tool references. Handlers receive a `PluginContext` so tools
//! that need the session (role change, reminders) can reach its dialogue
//! and identity without owning it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::agent::ToolRef;
use crate::dialogue::Dialogue;
use crate::scheduler::store::ReminderStore;
use crate::scheduler::ReminderScheduler;
use crate::types::{DeviceIdentity, OutboundSender};

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

/// Session surface exposed to plugin handlers.
pub struct PluginContext {
    pub identity: DeviceIdentity,
    pub agent_id: String,
    pub outbound: OutboundSender,
    pub dialogue: Arc<Mutex<Dialogue>>,
    pub reminder_store: Arc<dyn ReminderStore>,
    pub scheduler: Arc<ReminderScheduler>,
    /// Owning user's UTC offset in minutes, for local display times.
    pub utc_offset_minutes: i32,
}

pub type PluginFuture = Pin<Box<dyn Future<Output = ActionResponse> + Send>>;
pub type PluginHandler = Arc<dyn Fn(Arc<PluginContext>, Value) -> PluginFuture + Send + Sync>;

pub struct Plugin {
    pub definition: ToolDefinition,
    pub handler: PluginHandler,
}

impl Plugin {
    pub fn new<F, Fut>(name: &str, description: Value, handler: F) -> Self
    where
        F: Fn(Arc<PluginContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResponse> + Send + 'static,
    {
        Self {
            definition: ToolDefinition {
                name: name.to_string(),
                description,
                backend: ToolBackend::ServerPlugin,
            },
            handler: Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
        }
    }
}

/// The complete built-in plugin table.
pub fn builtin_plugins() -> Vec<Plugin> {
    let mut plugins = vec![change_role_plugin()];
    plugins.extend(super::reminders::reminder_plugins());
    plugins
}

/// Executor over the filtered plugin table.
pub struct ServerPluginExecutor {
    ctx: Arc<PluginContext>,
    plugins: HashMap<String, Plugin>,
}

impl ServerPluginExecutor {
    /// Build from the builtin table. With tool references present, only
    /// referenced system functions are exposed; a reference naming no
    /// builtin was validated away at binding time, so it only warns here.
    pub fn new(ctx: Arc<PluginContext>, tool_refs: Option<&[ToolRef]>) -> Self {
        let mut plugins: HashMap<String, Plugin> = builtin_plugins()
            .into_iter()
            .map(|p| (p.definition.name.clone(), p))
            .collect();

        if let Some(refs) = tool_refs {
            let wanted: Vec<&str> = refs.iter().filter_map(|r| r.system_name()).collect();
            for name in &wanted {
                if !plugins.contains_key(*name) {
                    warn!(tool = %name, "tool reference names no builtin plugin");
                }
            }
            plugins.retain(|name, _| wanted.contains(&name.as_str()));
        }

        debug!(count = plugins.len(), "server plugins registered");
        Self { ctx, plugins }
    }
}

#[async_trait]
impl ToolExecutor for ServerPluginExecutor {
    fn get_tools(&self) -> HashMap<String, ToolDefinition> {
        self.plugins
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.definition.clone()))
            .collect()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    async fn execute(&self, name: &str, arguments: Value) -> ActionResponse {
        match self.plugins.get(name) {
            Some(plugin) => (plugin.handler)(self.ctx.clone(), arguments).await,
            None => ActionResponse::NotFound,
        }
    }
}

// ─── change_role ─────────────────────────────────────────────

const ROLE_PROMPTS: &[(&str, &str)] = &[
    (
        "assistant",
        "You are a helpful voice assistant. Keep answers short and speakable.",
    ),
    (
        "teacher",
        "You are a patient teacher. Explain step by step in plain spoken language.",
    ),
    (
        "friend",
        "You are a warm, casual friend. Chat naturally and keep it light.",
    ),
    (
        "storyteller",
        "You are a storyteller. Answer with vivid, short spoken narratives.",
    ),
];

fn change_role_plugin() -> Plugin {
    Plugin::new(
        "change_role",
        json!({
            "type": "function",
            "function": {
                "name": "change_role",
                "description": "Switch the assistant persona for this conversation.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "role": {
                            "type": "string",
                            "enum": ROLE_PROMPTS.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
                            "description": "The persona to switch to.",
                        }
                    },
                    "required": ["role"],
                },
            },
        }),
        |ctx, args| async move {
            let role = args
                .get("role")
                .and_then(Value::as_str)
                .unwrap_or("assistant")
                .to_string();
            let Some((_, prompt)) = ROLE_PROMPTS.iter().find(|(n, _)| *n == role) else {
                return ActionResponse::Error(format!("unknown role {role}"));
            };
            ctx.dialogue.lock().await.update_system_message(*prompt);
            ActionResponse::Response(format!("Okay, switching to {role} mode."))
        },
    )
}
