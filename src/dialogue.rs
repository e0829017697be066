//! Rolling dialogue log for one session.
//!
//! Insertion order is significant: within a turn the runtime records
//! assistant text, tool calls, and tool responses in exactly the order the
//! model stream produced them. The single system message is addressed by
//! replacement, never appended twice.

use serde_json::{json, Value};

/// One dialogue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    System(String),
    User(String),
    Assistant(String),
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResponse {
        tool_call_id: String,
        content: String,
    },
}

impl Message {
    /// Render into chat-completions wire shape.
    pub fn to_wire(&self) -> Value {
        match self {
            Message::System(content) => json!({"role": "system", "content": content}),
            Message::User(content) => json!({"role": "user", "content": content}),
            Message::Assistant(content) => json!({"role": "assistant", "content": content}),
            Message::ToolCall {
                id,
                name,
                arguments,
            } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }],
            }),
            Message::ToolResponse {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Dialogue {
    messages: Vec<Message>,
}

impl Dialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the system message, inserting one at the front if absent.
    pub fn update_system_message(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        for message in &mut self.messages {
            if let Message::System(content) = message {
                *content = prompt;
                return;
            }
        }
        self.messages.insert(0, Message::System(prompt));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Wire view for the LLM.
    pub fn llm_view(&self) -> Vec<Value> {
        self.messages.iter().map(Message::to_wire).collect()
    }

    /// Wire view with retrieved memory injected after the system prompt,
    /// in the order a chat model expects: system, memory context, trail.
    pub fn llm_view_with_memory(&self, memory: Option<&str>) -> Vec<Value> {
        let mut view = Vec::with_capacity(self.messages.len() + 1);
        let mut memory = memory.filter(|m| !m.is_empty());

        for message in &self.messages {
            view.push(message.to_wire());
            if matches!(message, Message::System(_)) {
                if let Some(context) = memory.take() {
                    view.push(json!({
                        "role": "system",
                        "content": format!("Relevant context from memory:\n{context}"),
                    }));
                }
            }
        }

        // No system message yet: memory context leads the view.
        if let Some(context) = memory {
            view.insert(
                0,
                json!({
                    "role": "system",
                    "content": format!("Relevant context from memory:\n{context}"),
                }),
            );
        }
        view
    }
}
