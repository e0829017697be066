//! Device-IoT executor: a flat command plane synthesized from the
//! descriptors a device publishes at start-up.
//!
//! Each descriptor property becomes a query tool `get_<device>_<property>`
//! and each method a control tool `<device>_<method>`. Both take
//! `response_success` / `response_failure` phrasing arguments the model
//! fills in; `{value}` and parameter placeholders are substituted before
//! the text is spoken. Commands travel back over the same WebSocket as an
//! `iot` envelope.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::protocol::envelope::IotState;
use crate::types::{Outbound, OutboundSender};

use super::{ActionResponse, ToolBackend, ToolDefinition, ToolExecutor};

#[derive(Debug, Clone)]
pub struct IotProperty {
    pub name: String,
    pub description: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct IotMethod {
    pub name: String,
    pub description: String,
    /// parameter name -> {description, type}
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct IotDescriptor {
    pub name: String,
    pub description: String,
    pub properties: Vec<IotProperty>,
    pub methods: Vec<IotMethod>,
}

impl IotDescriptor {
    /// Parse one descriptor from the `iot` envelope. Properties default
    /// their value by declared type; a descriptor without properties
    /// derives them from method parameters so state updates have a slot.
    pub fn parse(raw: &Value) -> Option<Self> {
        let name = raw.get("name")?.as_str()?.to_string();
        let description = raw
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut property_specs: Map<String, Value> = raw
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let methods: Vec<IotMethod> = raw
            .get("methods")
            .and_then(Value::as_object)
            .map(|methods| {
                methods
                    .iter()
                    .map(|(method_name, info)| IotMethod {
                        name: method_name.clone(),
                        description: info
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        parameters: info
                            .get("parameters")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        if property_specs.is_empty() {
            for method in &methods {
                for (param, info) in &method.parameters {
                    property_specs.insert(param.clone(), info.clone());
                }
            }
        }

        if property_specs.is_empty() && methods.is_empty() {
            return None;
        }

        let properties = property_specs
            .iter()
            .map(|(prop_name, info)| {
                let default = match info.get("type").and_then(Value::as_str) {
                    Some("number") => json!(0),
                    Some("boolean") => json!(false),
                    _ => json!(""),
                };
                IotProperty {
                    name: prop_name.clone(),
                    description: info
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    value: default,
                }
            })
            .collect();

        Some(Self {
            name,
            description,
            properties,
            methods,
        })
    }
}

struct IotTables {
    descriptors: HashMap<String, IotDescriptor>,
    tools: HashMap<String, ToolDefinition>,
}

pub struct DeviceIotExecutor {
    outbound: OutboundSender,
    tables: Mutex<IotTables>,
}

const RESPONSE_PARAM_DOCS: [(&str, &str); 2] = [
    (
        "response_success",
        "Friendly spoken reply for success; use {value} as the placeholder for the result",
    ),
    (
        "response_failure",
        "Friendly spoken reply for failure",
    ),
];

impl DeviceIotExecutor {
    pub fn new(outbound: OutboundSender) -> Self {
        Self {
            outbound,
            tables: Mutex::new(IotTables {
                descriptors: HashMap::new(),
                tools: HashMap::new(),
            }),
        }
    }

    /// Register descriptors from an `iot` envelope; returns how many tools
    /// the registry gained. The caller invalidates the manager cache.
    pub fn register_descriptors(&self, raw_descriptors: &[Value]) -> usize {
        let mut added = 0;
        let mut tables = self.tables.lock().unwrap();

        for raw in raw_descriptors {
            let Some(descriptor) = IotDescriptor::parse(raw) else {
                warn!("skipping malformed IoT descriptor");
                continue;
            };
            let device = descriptor.name.to_lowercase();

            for property in &descriptor.properties {
                let tool_name = format!("get_{}_{}", device, property.name.to_lowercase());
                let mut params = Map::new();
                for (name, doc) in RESPONSE_PARAM_DOCS {
                    params.insert(
                        name.to_string(),
                        json!({"type": "string", "description": doc}),
                    );
                }
                tables.tools.insert(
                    tool_name.clone(),
                    ToolDefinition {
                        name: tool_name.clone(),
                        description: json!({
                            "type": "function",
                            "function": {
                                "name": tool_name,
                                "description": format!(
                                    "Query {} of {}",
                                    property.description, descriptor.description
                                ),
                                "parameters": {
                                    "type": "object",
                                    "properties": params,
                                    "required": ["response_success", "response_failure"],
                                },
                            },
                        }),
                        backend: ToolBackend::DeviceIot,
                    },
                );
                added += 1;
            }

            for method in &descriptor.methods {
                let tool_name = format!("{}_{}", device, method.name.to_lowercase());
                let mut params = Map::new();
                let mut required: Vec<String> = Vec::new();
                for (param, info) in &method.parameters {
                    params.insert(
                        param.clone(),
                        json!({
                            "type": info.get("type").and_then(Value::as_str).unwrap_or("string"),
                            "description": info
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default(),
                        }),
                    );
                    required.push(param.clone());
                }
                for (name, doc) in RESPONSE_PARAM_DOCS {
                    params.insert(
                        name.to_string(),
                        json!({"type": "string", "description": doc}),
                    );
                    required.push(name.to_string());
                }
                tables.tools.insert(
                    tool_name.clone(),
                    ToolDefinition {
                        name: tool_name.clone(),
                        description: json!({
                            "type": "function",
                            "function": {
                                "name": tool_name,
                                "description": format!(
                                    "{} - {}",
                                    descriptor.description, method.description
                                ),
                                "parameters": {
                                    "type": "object",
                                    "properties": params,
                                    "required": required,
                                },
                            },
                        }),
                        backend: ToolBackend::DeviceIot,
                    },
                );
                added += 1;
            }

            tables
                .descriptors
                .insert(descriptor.name.clone(), descriptor);
        }

        if added > 0 {
            info!(count = added, "registered device IoT tools");
        }
        added
    }

    /// Apply telemetry from an `iot` states envelope, with type checking
    /// against the stored value.
    pub fn update_states(&self, states: &[IotState]) {
        let mut tables = self.tables.lock().unwrap();
        for state in states {
            let Some(descriptor) = tables.descriptors.get_mut(&state.name) else {
                continue;
            };
            for (key, value) in &state.state {
                if let Some(property) = descriptor.properties.iter_mut().find(|p| &p.name == key) {
                    if std::mem::discriminant(&property.value) != std::mem::discriminant(value)
                        && !(property.value.is_number() && value.is_number())
                    {
                        warn!(device = %state.name, property = %key, "IoT state type mismatch");
                        continue;
                    }
                    property.value = value.clone();
                    debug!(device = %state.name, property = %key, value = %value, "IoT state updated");
                }
            }
        }
    }

    fn property_value(&self, device: &str, property: &str) -> Option<Value> {
        let tables = self.tables.lock().unwrap();
        let descriptor = tables
            .descriptors
            .values()
            .find(|d| d.name.eq_ignore_ascii_case(device))?;
        descriptor
            .properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(property))
            .map(|p| p.value.clone())
    }

    /// Resolve the stored method name and device name case-sensitively.
    fn resolve_method(&self, device: &str, method: &str) -> Option<(String, String)> {
        let tables = self.tables.lock().unwrap();
        let descriptor = tables
            .descriptors
            .values()
            .find(|d| d.name.eq_ignore_ascii_case(device))?;
        let method = descriptor
            .methods
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(method))?;
        Some((descriptor.name.clone(), method.name.clone()))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn fill_template(template: &str, value: Option<&Value>, params: &Map<String, Value>) -> String {
    let mut text = template.to_string();
    for (key, val) in params {
        let placeholder = format!("{{{key}}}");
        if text.contains(&placeholder) {
            text = text.replace(&placeholder, &value_to_text(val));
        }
    }
    if let Some(value) = value {
        text = text.replace("{value}", &value_to_text(value));
    } else if let Some(first) = params.values().next() {
        text = text.replace("{value}", &value_to_text(first));
    }
    text
}

#[async_trait]
impl ToolExecutor for DeviceIotExecutor {
    fn get_tools(&self) -> HashMap<String, ToolDefinition> {
        self.tables.lock().unwrap().tools.clone()
    }

    fn has_tool(&self, name: &str) -> bool {
        self.tables.lock().unwrap().tools.contains_key(name)
    }

    async fn execute(&self, name: &str, arguments: Value) -> ActionResponse {
        if !self.has_tool(name) {
            return ActionResponse::NotFound;
        }
        let args = arguments.as_object().cloned().unwrap_or_default();
        let success_template = args
            .get("response_success")
            .and_then(Value::as_str)
            .unwrap_or("Done: {value}")
            .to_string();
        let failure_template = args
            .get("response_failure")
            .and_then(Value::as_str)
            .unwrap_or("The device did not respond")
            .to_string();

        if let Some(rest) = name.strip_prefix("get_") {
            // Query tool: get_<device>_<property>.
            let Some((device, property)) = rest.split_once('_') else {
                return ActionResponse::Error("unparseable IoT tool name".to_string());
            };
            return match self.property_value(device, property) {
                Some(value) => ActionResponse::Response(fill_template(
                    &success_template,
                    Some(&value),
                    &Map::new(),
                )),
                None => ActionResponse::Error(failure_template),
            };
        }

        // Control tool: <device>_<method>.
        let Some((device, method)) = name.split_once('_') else {
            return ActionResponse::Error("unparseable IoT tool name".to_string());
        };
        let Some((device_name, method_name)) = self.resolve_method(device, method) else {
            return ActionResponse::Error(failure_template);
        };

        let control_params: Map<String, Value> = args
            .iter()
            .filter(|(k, _)| *k != "response_success" && *k != "response_failure")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut command = json!({"name": device_name, "method": method_name});
        if !control_params.is_empty() {
            command["parameters"] = Value::Object(control_params.clone());
        }
        let envelope = json!({"type": "iot", "commands": [command]});

        if self
            .outbound
            .send(Outbound::Text(envelope.to_string()))
            .await
            .is_err()
        {
            return ActionResponse::Error(failure_template);
        }

        ActionResponse::ReqLlm(fill_template(&success_template, None, &control_params))
    }
}
