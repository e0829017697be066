//! Agent webhook: external systems push notifications through the same
//! router the reminder scheduler uses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::scheduler::notify::{push_agent_notification, DeliveryOutcome, NotificationPayload};

use super::ServerState;

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub mac_address: String,
    #[serde(rename = "useLLM", default)]
    pub use_llm: bool,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

/// `POST /agents/{id}/webhook`
pub async fn agent_webhook(
    State(state): State<ServerState>,
    Path(agent_id): Path<String>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<Value>, StatusCode> {
    let payload = NotificationPayload {
        use_llm: body.use_llm,
        title: body.title,
        content: body.content,
    };
    let mac = body.mac_address.trim().to_uppercase();
    info!(%agent_id, %mac, "webhook notification");

    let outcome = push_agent_notification(
        &state.ctx.registry,
        state.broker.as_ref(),
        &mac,
        &payload,
    )
    .await;

    let delivered_via = match outcome {
        DeliveryOutcome::LiveSession => "live",
        DeliveryOutcome::Broker => "broker",
        DeliveryOutcome::Unavailable => return Err(StatusCode::SERVICE_UNAVAILABLE),
    };
    Ok(Json(json!({"status": "delivered", "via": delivered_via})))
}
