//! Agent binding: the immutable snapshot describing which providers a
//! session uses, its prompt template, history retention, and tool set.

pub mod prompt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// How much conversation history is reported. 0 = off, 1 = text,
/// 2 = text plus reference audio bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChatHistoryLevel {
    #[default]
    Off,
    Text,
    TextAndAudio,
}

impl TryFrom<u8> for ChatHistoryLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChatHistoryLevel::Off),
            1 => Ok(ChatHistoryLevel::Text),
            2 => Ok(ChatHistoryLevel::TextAndAudio),
            other => Err(format!("invalid chat_history_conf {other}")),
        }
    }
}

impl From<ChatHistoryLevel> for u8 {
    fn from(level: ChatHistoryLevel) -> u8 {
        match level {
            ChatHistoryLevel::Off => 0,
            ChatHistoryLevel::Text => 1,
            ChatHistoryLevel::TextAndAudio => 2,
        }
    }
}

/// Which MCP server configurations a binding activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum McpSelectionMode {
    #[default]
    All,
    Selected,
}

/// A tool reference: either a built-in system function by name, or a
/// user-owned tool configuration by UUID. Validated once at binding time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRef {
    System(String),
    UserTool(Uuid),
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("empty tool reference")]
    EmptyToolRef,
}

impl ToolRef {
    pub fn parse(raw: &str) -> Result<Self, BindingError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BindingError::EmptyToolRef);
        }
        match Uuid::parse_str(raw) {
            Ok(uuid) => Ok(ToolRef::UserTool(uuid)),
            Err(_) => Ok(ToolRef::System(raw.to_string())),
        }
    }

    /// The system function name, when this reference names one.
    pub fn system_name(&self) -> Option<&str> {
        match self {
            ToolRef::System(name) => Some(name),
            ToolRef::UserTool(_) => None,
        }
    }
}

/// One named MCP server configuration (command + args, or url).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Immutable configuration snapshot a session runs against. Built from a
/// repository record or a static config file; the runtime cannot tell
/// which.
#[derive(Debug, Clone)]
pub struct AgentBinding {
    pub agent_id: String,
    pub prompt_template: String,
    pub user_profile: Option<String>,
    pub chat_history: ChatHistoryLevel,
    pub tool_refs: Vec<ToolRef>,
    pub mcp_selection: McpSelectionMode,
    pub mcp_servers: Vec<McpServerConfig>,
    pub mcp_endpoint_url: Option<String>,
    /// Optional overrides naming concrete provider drivers.
    pub providers: ProviderSelection,
}

/// Which driver each adapter slot uses; `None` selects the built-in
/// default.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelection {
    pub vad: Option<String>,
    pub asr: Option<String>,
    pub llm: Option<String>,
    pub tts: Option<String>,
    pub memory: Option<String>,
    pub intent: Option<String>,
    pub voiceprint: Option<String>,
}

impl AgentBinding {
    /// Validate raw tool references once; invalid entries are rejected
    /// here so the runtime never sees them.
    pub fn with_tool_refs(
        mut self,
        raw_refs: &[String],
    ) -> Result<Self, BindingError> {
        self.tool_refs = raw_refs
            .iter()
            .map(|r| ToolRef::parse(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self)
    }

    pub fn default_with_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt_template: "You are a helpful voice assistant. Keep answers short and speakable."
                .to_string(),
            user_profile: None,
            chat_history: ChatHistoryLevel::Off,
            tool_refs: Vec::new(),
            mcp_selection: McpSelectionMode::All,
            mcp_servers: Vec::new(),
            mcp_endpoint_url: None,
            providers: ProviderSelection::default(),
        }
    }

    /// MCP server configs active under the selection mode. In `Selected`
    /// mode only explicitly listed servers load; `All` takes everything.
    pub fn active_mcp_servers(&self) -> Vec<&McpServerConfig> {
        match self.mcp_selection {
            McpSelectionMode::All => self.mcp_servers.iter().collect(),
            McpSelectionMode::Selected => self
                .mcp_servers
                .iter()
                .filter(|cfg| {
                    self.tool_refs
                        .iter()
                        .any(|r| r.system_name() == Some(cfg.name.as_str()))
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_ref_distinguishes_uuid_from_name() {
        let system = ToolRef::parse("create_reminder").unwrap();
        assert_eq!(system.system_name(), Some("create_reminder"));

        let uuid = "6fa459ea-ee8a-3ca4-894e-db77e160355e";
        let user = ToolRef::parse(uuid).unwrap();
        assert!(matches!(user, ToolRef::UserTool(_)));
    }

    #[test]
    fn empty_tool_ref_is_rejected() {
        assert!(ToolRef::parse("  ").is_err());
    }

    #[test]
    fn chat_history_level_roundtrip() {
        assert_eq!(ChatHistoryLevel::try_from(2u8), Ok(ChatHistoryLevel::TextAndAudio));
        assert!(ChatHistoryLevel::try_from(3u8).is_err());
        assert_eq!(u8::from(ChatHistoryLevel::Text), 1);
    }

    #[test]
    fn selected_mode_filters_mcp_servers() {
        let mut binding = AgentBinding::default_with_agent("a1");
        binding.mcp_servers = vec![
            McpServerConfig {
                name: "files".to_string(),
                command: Some("mcp-files".to_string()),
                args: vec![],
                url: None,
            },
            McpServerConfig {
                name: "search".to_string(),
                command: Some("mcp-search".to_string()),
                args: vec![],
                url: None,
            },
        ];
        binding.mcp_selection = McpSelectionMode::Selected;
        binding = binding
            .with_tool_refs(&["files".to_string()])
            .unwrap();

        let active: Vec<_> = binding
            .active_mcp_servers()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(active, vec!["files".to_string()]);
    }
}
