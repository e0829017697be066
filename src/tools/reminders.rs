//! Reminder tool surface consumed by the LLM.
//!
//! Four functions: create, list, delete, update status. All results are
//! JSON strings with a `message` field the model can render; creation and
//! mutation return REQLLM so the model phrases the confirmation itself.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::scheduler::store::{ListPeriod, NewReminder, Reminder, ReminderStatus, StoreError};

use super::server_plugins::{Plugin, PluginContext};
use super::ActionResponse;

pub fn reminder_plugins() -> Vec<Plugin> {
    vec![
        create_reminder_plugin(),
        list_reminder_plugin(),
        delete_reminder_plugin(),
        update_status_reminder_plugin(),
    ]
}

fn reminder_json(reminder: &Reminder) -> Value {
    json!({
        "id": reminder.id.to_string(),
        "title": reminder.title.clone().unwrap_or_default(),
        "content": reminder.content,
        "remind_at": reminder.remind_at.to_rfc3339(),
        "remind_at_local": reminder.remind_at_local.to_rfc3339(),
        "status": reminder.status.as_str(),
    })
}

fn req_llm(payload: Value) -> ActionResponse {
    ActionResponse::ReqLlm(payload.to_string())
}

/// Parse the ISO-8601 `remind_at` argument. Naive times are interpreted in
/// the user's timezone.
fn parse_remind_at(raw: &str, offset: FixedOffset) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return naive
            .and_local_timezone(offset)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| "ambiguous local time".to_string());
    }
    Err(format!(
        "remind_at must be ISO-8601 with offset, e.g. 2024-05-01T18:00:00+07:00, got {raw}"
    ))
}

fn user_offset(ctx: &PluginContext) -> FixedOffset {
    FixedOffset::east_opt(ctx.utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
}

fn create_reminder_plugin() -> Plugin {
    Plugin::new(
        "create_reminder",
        json!({
            "type": "function",
            "function": {
                "name": "create_reminder",
                "description": "Create a reminder for the user at the given time. The time must be ISO 8601 with offset and strictly in the future.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "remind_at": {
                            "type": "string",
                            "description": "When to fire, ISO-8601 with offset, e.g. 2024-05-01T18:00:00+07:00",
                        },
                        "content": {
                            "type": "string",
                            "description": "What to say to the user when the reminder fires",
                        },
                        "title": {
                            "type": "string",
                            "description": "Short optional title",
                        },
                        "metadata": {
                            "type": "object",
                            "description": "Optional extra data stored with the reminder",
                        },
                    },
                    "required": ["remind_at", "content"],
                },
            },
        }),
        |ctx: Arc<PluginContext>, args: Value| async move {
            let Some(raw_time) = args.get("remind_at").and_then(Value::as_str) else {
                return req_llm(json!({"message": "create_failed", "reason": "remind_at missing"}));
            };
            let Some(content) = args.get("content").and_then(Value::as_str) else {
                return req_llm(json!({"message": "create_failed", "reason": "content missing"}));
            };

            let offset = user_offset(&ctx);
            let remind_at = match parse_remind_at(raw_time, offset) {
                Ok(dt) => dt,
                Err(reason) => {
                    return req_llm(json!({"message": "create_failed", "reason": reason}));
                }
            };

            let new = NewReminder {
                agent_id: ctx.agent_id.clone(),
                device_id: ctx.identity.device_id,
                mac_address: ctx.identity.mac.clone(),
                content: content.to_string(),
                title: args
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                remind_at,
                remind_at_local: remind_at.with_timezone(&offset),
                metadata: args.get("metadata").cloned().filter(|m| m.is_object()),
            };

            match ctx.reminder_store.create(new).await {
                Ok(reminder) => {
                    ctx.scheduler
                        .schedule(&reminder.public_id, reminder.remind_at)
                        .await;
                    debug!(id = %reminder.id, "reminder created and scheduled");
                    let mut payload = reminder_json(&reminder);
                    payload["message"] = json!("created");
                    req_llm(payload)
                }
                Err(StoreError::NotInFuture) => req_llm(json!({
                    "message": "create_failed",
                    "reason": "remind_at must be strictly in the future",
                })),
                Err(e) => ActionResponse::Error(format!("could not create reminder: {e}")),
            }
        },
    )
}

fn list_reminder_plugin() -> Plugin {
    Plugin::new(
        "get_list_reminder",
        json!({
            "type": "function",
            "function": {
                "name": "get_list_reminder",
                "description": "List the user's reminders, filtered by period and status.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "period": {
                            "type": "string",
                            "enum": ["today", "week"],
                            "description": "Time window, default today",
                        },
                        "status": {
                            "type": "string",
                            "enum": ["pending", "completed"],
                            "description": "pending = not yet fired, completed = delivered or acknowledged",
                        },
                    },
                },
            },
        }),
        |ctx: Arc<PluginContext>, args: Value| async move {
            let period = args
                .get("period")
                .and_then(Value::as_str)
                .and_then(ListPeriod::parse)
                .unwrap_or(ListPeriod::Today);

            // "completed" covers both delivered and received records.
            let status_filter = args.get("status").and_then(Value::as_str);
            let statuses: Option<Vec<ReminderStatus>> = match status_filter {
                Some("pending") => Some(vec![ReminderStatus::Pending]),
                Some("completed") => {
                    Some(vec![ReminderStatus::Delivered, ReminderStatus::Received])
                }
                _ => None,
            };

            let all = match ctx.reminder_store.list(&ctx.agent_id, period, None).await {
                Ok(list) => list,
                Err(e) => return ActionResponse::Error(format!("could not list reminders: {e}")),
            };
            let filtered: Vec<Value> = all
                .iter()
                .filter(|r| match &statuses {
                    Some(wanted) => wanted.contains(&r.status),
                    None => true,
                })
                .map(reminder_json)
                .collect();

            let message = if filtered.is_empty() {
                "no_reminders"
            } else {
                "reminder_list"
            };
            req_llm(json!({"message": message, "reminders": filtered}))
        },
    )
}

fn delete_reminder_plugin() -> Plugin {
    Plugin::new(
        "delete_reminder",
        json!({
            "type": "function",
            "function": {
                "name": "delete_reminder",
                "description": "Delete one or more reminders by their record UUIDs.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "ids": {
                            "type": "array",
                            "items": {"type": "string"},
                            "minItems": 1,
                            "description": "Reminder record UUIDs",
                        },
                    },
                    "required": ["ids"],
                },
            },
        }),
        |ctx: Arc<PluginContext>, args: Value| async move {
            let Some(ids) = args.get("ids").and_then(Value::as_array) else {
                return req_llm(json!({"message": "delete_failed", "reason": "ids missing"}));
            };

            let mut deleted = Vec::new();
            let mut missing = Vec::new();
            for raw in ids {
                let Some(id) = raw.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                    missing.push(raw.to_string());
                    continue;
                };
                match ctx.reminder_store.soft_delete(id).await {
                    Ok(()) => deleted.push(id.to_string()),
                    Err(_) => missing.push(id.to_string()),
                }
            }

            req_llm(json!({
                "message": if deleted.is_empty() { "delete_failed" } else { "deleted" },
                "deleted": deleted,
                "not_found": missing,
            }))
        },
    )
}

fn update_status_reminder_plugin() -> Plugin {
    Plugin::new(
        "update_status_reminder",
        json!({
            "type": "function",
            "function": {
                "name": "update_status_reminder",
                "description": "Update the status of a reminder by its record UUID.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "id": {
                            "type": "string",
                            "description": "Reminder record UUID",
                        },
                        "status": {
                            "type": "string",
                            "enum": ["pending", "delivered", "received", "failed"],
                            "description": "New status",
                        },
                    },
                    "required": ["id", "status"],
                },
            },
        }),
        |ctx: Arc<PluginContext>, args: Value| async move {
            let Some(id) = args
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                return req_llm(json!({"message": "update_failed", "reason": "invalid id"}));
            };
            let Some(status) = args
                .get("status")
                .and_then(Value::as_str)
                .and_then(ReminderStatus::parse)
            else {
                return req_llm(json!({"message": "update_failed", "reason": "invalid status"}));
            };

            match ctx.reminder_store.update_status(id, status).await {
                Ok(reminder) => {
                    let mut payload = reminder_json(&reminder);
                    payload["message"] = json!("updated");
                    if let Some(at) = reminder.received_at {
                        payload["received_at"] = json!(at.to_rfc3339());
                    }
                    req_llm(payload)
                }
                Err(StoreError::InvalidTransition { from, to }) => req_llm(json!({
                    "message": "update_failed",
                    "reason": format!("cannot move {} to {}", from.as_str(), to.as_str()),
                })),
                Err(StoreError::NotFound(_)) => {
                    req_llm(json!({"message": "update_failed", "reason": "reminder not found"}))
                }
                Err(e) => ActionResponse::Error(format!("could not update reminder: {e}")),
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::server_plugins::test_support::plugin_context;
    use super::super::server_plugins::ServerPluginExecutor;
    use super::super::ToolExecutor;
    use super::*;

    fn future_time(secs: i64) -> String {
        (Utc::now() + chrono::Duration::seconds(secs)).to_rfc3339()
    }

    #[tokio::test]
    async fn create_then_list_then_delete() {
        let (ctx, _rx) = plugin_context();
        let executor = ServerPluginExecutor::new(ctx.clone(), None);

        let response = executor
            .execute(
                "create_reminder",
                json!({"remind_at": future_time(300), "content": "drink water", "title": "Drink"}),
            )
            .await;
        let ActionResponse::ReqLlm(body) = response else {
            panic!("expected REQLLM, got {response:?}");
        };
        let payload: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(payload["message"], "created");
        let id = payload["id"].as_str().unwrap().to_string();

        let ActionResponse::ReqLlm(body) = executor
            .execute("get_list_reminder", json!({"period": "today", "status": "pending"}))
            .await
        else {
            panic!("expected REQLLM");
        };
        let listed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listed["message"], "reminder_list");
        assert_eq!(listed["reminders"].as_array().unwrap().len(), 1);

        let ActionResponse::ReqLlm(body) = executor
            .execute("delete_reminder", json!({"ids": [id]}))
            .await
        else {
            panic!("expected REQLLM");
        };
        let deleted: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(deleted["message"], "deleted");

        let ActionResponse::ReqLlm(body) = executor
            .execute("get_list_reminder", json!({}))
            .await
        else {
            panic!("expected REQLLM");
        };
        let relisted: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(relisted["message"], "no_reminders");
    }

    #[tokio::test]
    async fn past_time_is_rejected() {
        let (ctx, _rx) = plugin_context();
        let executor = ServerPluginExecutor::new(ctx, None);
        let ActionResponse::ReqLlm(body) = executor
            .execute(
                "create_reminder",
                json!({"remind_at": future_time(-60), "content": "too late"}),
            )
            .await
        else {
            panic!("expected REQLLM");
        };
        let payload: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(payload["message"], "create_failed");
    }

    #[tokio::test]
    async fn update_status_sets_received_at() {
        let (ctx, _rx) = plugin_context();
        let executor = ServerPluginExecutor::new(ctx.clone(), None);

        let ActionResponse::ReqLlm(body) = executor
            .execute(
                "create_reminder",
                json!({"remind_at": future_time(120), "content": "stretch"}),
            )
            .await
        else {
            panic!("expected REQLLM");
        };
        let payload: Value = serde_json::from_str(&body).unwrap();
        let id = Uuid::parse_str(payload["id"].as_str().unwrap()).unwrap();

        // Walk the record forward so "received" is a legal transition.
        ctx.reminder_store
            .update_status(id, ReminderStatus::Delivered)
            .await
            .unwrap();

        let ActionResponse::ReqLlm(body) = executor
            .execute(
                "update_status_reminder",
                json!({"id": id.to_string(), "status": "received"}),
            )
            .await
        else {
            panic!("expected REQLLM");
        };
        let updated: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(updated["message"], "updated");
        assert!(updated["received_at"].is_string());
    }

    #[tokio::test]
    async fn naive_time_uses_user_offset() {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let parsed = parse_remind_at("2031-05-01T18:00:00", offset).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2031-05-01T11:00:00+00:00");
    }
}
