//! JSON control envelopes exchanged over the device WebSocket.
//!
//! Every text message is an object tagged by `type`. Inbound envelopes come
//! from the device (hello/listen/abort/iot/mcp), outbound envelopes are
//! produced by the server (tts/stt/emotion/notification/server). `iot` and
//! `mcp` travel both directions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope received from the device.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientEnvelope {
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        features: Option<Features>,
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Listen {
        mode: ListenMode,
        state: ListenState,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Iot {
        #[serde(default)]
        descriptors: Option<Vec<Value>>,
        #[serde(default)]
        states: Option<Vec<IotState>>,
    },
    Mcp {
        payload: Value,
    },
    Server {
        #[serde(default)]
        action: Option<String>,
    },
}

/// Feature flags negotiated in `hello`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub mcp: bool,
}

/// Audio parameters negotiated in `hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_frame_duration")]
    pub frame_duration: u32,
}

fn default_format() -> String {
    "opus".to_string()
}
fn default_sample_rate() -> u32 {
    16000
}
fn default_channels() -> u8 {
    1
}
fn default_frame_duration() -> u32 {
    crate::protocol::frame::DEFAULT_FRAME_DURATION_MS
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: default_format(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_duration: default_frame_duration(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// IoT telemetry entry: `{name, state: {prop: value}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct IotState {
    pub name: String,
    pub state: serde_json::Map<String, Value>,
}

/// Envelope sent to the device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEnvelope {
    Hello {
        transport: &'static str,
        session_id: String,
        audio_params: AudioParams,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
        sentence_id: String,
    },
    Stt {
        text: String,
        session_id: String,
    },
    Emotion {
        emotion: String,
        session_id: String,
    },
    Notification {
        #[serde(rename = "useLLM")]
        use_llm: bool,
        title: String,
        content: String,
    },
    Iot {
        commands: Vec<Value>,
    },
    Mcp {
        payload: Value,
    },
    Server {
        status: String,
        message: String,
        content: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    SentenceEnd,
}

impl ServerEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
