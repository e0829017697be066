//! Language-model adapter: streaming chat completion plus the normalized
//! tool-call event parser.
//!
//! Models emit tool invocations two ways: structured `tool_calls` deltas in
//! the stream, or inline `<tool_call>{…}</tool_call>` JSON in the prose.
//! Drivers feed raw chunks into `ToolCallStreamParser`, which emits one
//! normalized `LlmEvent` enum for the session runtime.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::providers::ProviderError;

/// One delta from the model stream.
#[derive(Debug, Clone, Default)]
pub struct LlmChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
}

/// Partial structured tool call; fields accumulate across deltas.
#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A fully assembled tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Normalized stream event consumed by the session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmEvent {
    Text(String),
    ToolCall(ToolCallRequest),
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<LlmChunk, ProviderError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming completion. `messages` is the dialogue view in
    /// chat-completions wire shape; `tools` the OpenAI function list.
    async fn stream_chat(
        &self,
        messages: Vec<Value>,
        tools: Option<Vec<Value>>,
    ) -> Result<LlmStream, ProviderError>;
}

// ─── Tool-call stream parser ─────────────────────────────────

const INLINE_TAG: &str = "<tool_call>";

/// Consumes raw chunks, emits normalized events. One parser per LLM turn.
#[derive(Debug, Default)]
pub struct ToolCallStreamParser {
    structured: ToolCallDelta,
    saw_structured: bool,
    inline_mode: bool,
    head: String,
    head_decided: bool,
}

impl ToolCallStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns any events it completes.
    pub fn push(&mut self, chunk: &LlmChunk) -> Vec<LlmEvent> {
        let mut events = Vec::new();

        for delta in &chunk.tool_calls {
            self.saw_structured = true;
            if let Some(id) = &delta.id {
                if !id.is_empty() {
                    self.structured.id = Some(id.clone());
                }
            }
            if let Some(name) = &delta.name {
                if !name.is_empty() {
                    self.structured.name = Some(name.clone());
                }
            }
            if let Some(args) = &delta.arguments {
                let buf = self.structured.arguments.get_or_insert_with(String::new);
                buf.push_str(args);
            }
        }

        if let Some(content) = &chunk.content {
            if content.is_empty() {
                return events;
            }
            if self.saw_structured || self.inline_mode {
                // Prose after a call started belongs to the call payload.
                self.head.push_str(content);
                return events;
            }
            if self.head_decided {
                events.push(LlmEvent::Text(content.clone()));
                return events;
            }

            // Hold text back until it can no longer be an inline tag head.
            self.head.push_str(content);
            if self.head.starts_with(INLINE_TAG) {
                self.inline_mode = true;
                debug!("inline tool_call tag detected in stream");
            } else if !INLINE_TAG.starts_with(self.head.as_str()) {
                self.head_decided = true;
                events.push(LlmEvent::Text(std::mem::take(&mut self.head)));
            }
        }

        events
    }

    /// Stream ended: flush whatever was accumulated.
    pub fn finish(&mut self) -> Vec<LlmEvent> {
        let mut events = Vec::new();

        if self.saw_structured {
            let name = self.structured.name.take().unwrap_or_default();
            if !name.is_empty() {
                events.push(LlmEvent::ToolCall(ToolCallRequest {
                    id: self
                        .structured
                        .id
                        .take()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
                    name,
                    arguments: self.structured.arguments.take().unwrap_or_default(),
                }));
            }
            return events;
        }

        if self.inline_mode {
            match extract_json_object(&self.head) {
                Some(json) => match serde_json::from_str::<InlineCall>(&json) {
                    Ok(call) => events.push(LlmEvent::ToolCall(ToolCallRequest {
                        id: Uuid::new_v4().simple().to_string(),
                        name: call.name,
                        arguments: serde_json::to_string(&call.arguments)
                            .unwrap_or_else(|_| "{}".to_string()),
                    })),
                    Err(e) => {
                        debug!(error = %e, "inline tool_call payload did not parse");
                        events.push(LlmEvent::Text(std::mem::take(&mut self.head)));
                    }
                },
                None => {
                    events.push(LlmEvent::Text(std::mem::take(&mut self.head)));
                }
            }
            return events;
        }

        if !self.head.is_empty() {
            // Text shorter than the tag that never resolved.
            events.push(LlmEvent::Text(std::mem::take(&mut self.head)));
        }
        events
    }

    pub fn saw_tool_call(&self) -> bool {
        self.saw_structured || self.inline_mode
    }
}

#[derive(Deserialize)]
struct InlineCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Extract the outermost `{…}` span from a string.
pub fn extract_json_object(input: &str) -> Option<String> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    if end > start {
        Some(input[start..=end].to_string())
    } else {
        None
    }
}

// ─── OpenAI-compatible streaming transport ───────────────────

/// Streaming client for any chat-completions-shaped endpoint.
pub struct OpenAiCompatLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl OpenAiCompatLlm {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn parse_sse_data(data: &str) -> Option<LlmChunk> {
        let resp: StreamResponse = serde_json::from_str(data).ok()?;
        let choice = resp.choices.into_iter().next()?;
        let tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let function = tc.function.unwrap_or_default();
                ToolCallDelta {
                    id: tc.id,
                    name: function.name,
                    arguments: function.arguments,
                }
            })
            .collect();
        Some(LlmChunk {
            content: choice.delta.content,
            tool_calls,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatLlm {
    async fn stream_chat(
        &self,
        messages: Vec<Value>,
        tools: Option<Vec<Value>>,
    ) -> Result<LlmStream, ProviderError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(tools) = tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools);
            }
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let (tx, rx) = mpsc::channel::<Result<LlmChunk, ProviderError>>(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Transport(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines.
                while let Some(pos) = buffer.find("\n\n") {
                    let event: String = buffer.drain(..pos + 2).collect();
                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        if let Some(parsed) = Self::parse_sse_data(data) {
                            if tx.send(Ok(parsed)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunk(text: &str) -> LlmChunk {
        LlmChunk {
            content: Some(text.to_string()),
            tool_calls: vec![],
        }
    }

    #[test]
    fn plain_text_passes_through() {
        let mut parser = ToolCallStreamParser::new();
        let mut events = parser.push(&text_chunk("Hello there, "));
        events.extend(parser.push(&text_chunk("how are you?")));
        events.extend(parser.finish());
        assert_eq!(
            events,
            vec![
                LlmEvent::Text("Hello there, ".to_string()),
                LlmEvent::Text("how are you?".to_string()),
            ]
        );
        assert!(!parser.saw_tool_call());
    }

    #[test]
    fn structured_tool_call_is_assembled_across_deltas() {
        let mut parser = ToolCallStreamParser::new();
        parser.push(&LlmChunk {
            content: None,
            tool_calls: vec![ToolCallDelta {
                id: Some("call_1".to_string()),
                name: Some("create_reminder".to_string()),
                arguments: Some("{\"content\":".to_string()),
            }],
        });
        parser.push(&LlmChunk {
            content: None,
            tool_calls: vec![ToolCallDelta {
                id: None,
                name: None,
                arguments: Some("\"water\"}".to_string()),
            }],
        });
        let events = parser.finish();
        assert_eq!(
            events,
            vec![LlmEvent::ToolCall(ToolCallRequest {
                id: "call_1".to_string(),
                name: "create_reminder".to_string(),
                arguments: "{\"content\":\"water\"}".to_string(),
            })]
        );
    }

    #[test]
    fn inline_tool_call_is_detected_even_when_split() {
        let mut parser = ToolCallStreamParser::new();
        let mut events = parser.push(&text_chunk("<tool_"));
        events.extend(parser.push(&text_chunk("call>{\"name\":\"get_weather\",")));
        events.extend(parser.push(&text_chunk("\"arguments\":{\"city\":\"Hanoi\"}}</tool_call>")));
        assert!(events.is_empty());
        let events = parser.finish();
        match &events[0] {
            LlmEvent::ToolCall(call) => {
                assert_eq!(call.name, "get_weather");
                assert!(call.arguments.contains("Hanoi"));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn short_non_tag_text_is_flushed_on_finish() {
        let mut parser = ToolCallStreamParser::new();
        let events = parser.push(&text_chunk("<to"));
        assert!(events.is_empty());
        assert_eq!(parser.finish(), vec![LlmEvent::Text("<to".to_string())]);
    }

    #[test]
    fn malformed_inline_payload_degrades_to_text() {
        let mut parser = ToolCallStreamParser::new();
        parser.push(&text_chunk("<tool_call>not json at all"));
        let events = parser.finish();
        assert!(matches!(events[0], LlmEvent::Text(_)));
    }

    #[test]
    fn extract_json_object_finds_outer_braces() {
        assert_eq!(
            extract_json_object("prefix {\"a\": {\"b\": 1}} suffix"),
            Some("{\"a\": {\"b\": 1}}".to_string())
        );
        assert_eq!(extract_json_object("no braces"), None);
    }

    #[test]
    fn sse_data_parses_tool_call_delta() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"id":"c1","function":{"name":"f","arguments":"{}"}}]}}]}"#;
        let chunk = OpenAiCompatLlm::parse_sse_data(data).unwrap();
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].name.as_deref(), Some("f"));
    }
}
