//! Configuration management
//!
//! Serde-backed TOML configuration with per-field defaults so a partial
//! file (or none at all) still yields a runnable gateway.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Advertised WebSocket URL; empty means derive from host/port.
    #[serde(default)]
    pub websocket_url: String,
    #[serde(default)]
    pub auth_enabled: bool,
    /// Secret for device token issue/validate.
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: u64,
    /// MACs allowed to fetch config when auth is on; empty allows all.
    #[serde(default)]
    pub allowed_devices: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_auth_key() -> String {
    // Overridden in any real deployment; a fixed key keeps dev setups
    // working out of the box.
    "voxbridge-dev-key".to_string()
}
fn default_token_ttl() -> u64 {
    24 * 60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_url: String::new(),
            auth_enabled: false,
            auth_key: default_auth_key(),
            token_ttl_minutes: default_token_ttl(),
            allowed_devices: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn websocket_url_or_default(&self) -> String {
        if !self.websocket_url.is_empty() {
            return self.websocket_url.clone();
        }
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle ceiling before the session is closed.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u32,
    /// UTC offset of the deployment's users, minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_timeout_seconds() -> u64 {
    180
}
fn default_frame_duration_ms() -> u32 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            frame_duration_ms: default_frame_duration_ms(),
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_llm_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Static agent template used when no repository record resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub chat_history_conf: u8,
    #[serde(default)]
    pub mcp_endpoint: String,
    #[serde(default)]
    pub mcp_servers: Vec<crate::agent::McpServerConfig>,
}

fn default_prompt() -> String {
    "You are a helpful voice assistant. Keep answers short and speakable.".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            tools: Vec::new(),
            chat_history_conf: 0,
            mcp_endpoint: String::new(),
            mcp_servers: Vec::new(),
        }
    }
}

/// Broker settings surfaced to devices via the OTA response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Gateway endpoint for framed audio; empty disables MQTT bridging.
    #[serde(default)]
    pub gateway_endpoint: String,
    #[serde(default)]
    pub signature_key: String,
    /// Common broker endpoint devices subscribe to for pushes.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Config {
    /// Load from the default path, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("could not parse config {}", path.display()))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxbridge")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.session.timeout_seconds, 180);
        assert_eq!(config.session.frame_duration_ms, 60);
        assert_eq!(config.server.port, 8000);
        assert!(config
            .server
            .websocket_url_or_default()
            .starts_with("ws://"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();

        let config = Config::load_from(path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.session.timeout_seconds, 180);
    }

    #[test]
    fn missing_file_is_defaults() {
        let config = Config::load_from(PathBuf::from("/nonexistent/voxbridge.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not toml [[").unwrap();
        assert!(Config::load_from(path).is_err());
    }
}
