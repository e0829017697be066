//! Dispatch of LLM-issued function calls onto the tool registry.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::providers::llm::ToolCallRequest;

use super::{ActionResponse, ToolManager};

/// Thin front end the session runtime calls with assembled tool requests.
/// Owns argument normalization; execution is delegated to the manager.
pub struct ToolDispatcher {
    manager: Arc<ToolManager>,
}

impl ToolDispatcher {
    pub fn new(manager: Arc<ToolManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ToolManager> {
        &self.manager
    }

    /// Handle one call from the LLM stream.
    pub async fn handle_call(&self, call: &ToolCallRequest) -> ActionResponse {
        let arguments = match normalize_arguments(&call.arguments) {
            Ok(args) => args,
            Err(raw) => {
                error!(tool = %call.name, "unparseable tool arguments: {raw}");
                return ActionResponse::ReqLlm(format!(
                    "The arguments for {} could not be parsed as JSON.",
                    call.name
                ));
            }
        };

        debug!(tool = %call.name, %arguments, "dispatching tool call");
        self.manager.execute_tool(&call.name, arguments).await
    }

    /// Handle several calls from one LLM turn and combine the outcomes.
    pub async fn handle_calls(&self, calls: &[ToolCallRequest]) -> ActionResponse {
        let mut responses = Vec::with_capacity(calls.len());
        for call in calls {
            responses.push(self.handle_call(call).await);
        }
        ActionResponse::combine(responses)
    }
}

/// Arguments arrive as a JSON string, an empty string, or occasionally
/// several concatenated objects from a confused model. Normalize to one
/// object, merging keys when multiple objects are glued together.
fn normalize_arguments(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
        return Err(trimmed.to_string());
    }

    // Glued objects like `{"a":1}{"b":2}`: merge what parses.
    static FLAT_OBJECT: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\{[^{}]*\}").unwrap());

    let mut merged = serde_json::Map::new();
    let mut merged_any = false;
    for candidate in FLAT_OBJECT.find_iter(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate.as_str()) {
            merged.extend(map);
            merged_any = true;
        }
    }
    if merged_any {
        Ok(Value::Object(merged))
    } else {
        Err(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_arguments_become_empty_object() {
        assert_eq!(normalize_arguments("").unwrap(), json!({}));
        assert_eq!(normalize_arguments("   ").unwrap(), json!({}));
    }

    #[test]
    fn valid_object_passes() {
        assert_eq!(
            normalize_arguments(r#"{"city":"Hanoi"}"#).unwrap(),
            json!({"city":"Hanoi"})
        );
    }

    #[test]
    fn glued_objects_are_merged() {
        let merged = normalize_arguments(r#"{"a":1}{"b":2}"#).unwrap();
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(normalize_arguments("[1,2]").is_err());
        assert!(normalize_arguments("garbage").is_err());
    }

    #[tokio::test]
    async fn unknown_tool_surfaces_not_found() {
        let dispatcher = ToolDispatcher::new(Arc::new(ToolManager::new()));
        let response = dispatcher
            .handle_call(&ToolCallRequest {
                id: "c1".to_string(),
                name: "nope".to_string(),
                arguments: "{}".to_string(),
            })
            .await;
        assert_eq!(response, ActionResponse::NotFound);
    }
}
