//! HTTP/WebSocket server: device socket accept, OTA provisioning, and the
//! agent webhook.

pub mod auth;
pub mod ota;
pub mod registry;
pub mod webhook;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::scheduler::notify::MqttPublisher;
use crate::session::{run_session, GatewayContext};
use crate::types::DeviceIdentity;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub ctx: GatewayContext,
    pub devices: Arc<dyn ota::DeviceRepository>,
    pub broker: Option<Arc<dyn MqttPublisher>>,
}

/// Build the application router.
pub fn build_router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/ota", get(ota::ota_get).post(ota::ota_post))
        .route("/ota/activate", post(ota::ota_activate))
        .route("/agents/{id}/webhook", post(webhook::agent_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and run until shutdown.
pub async fn start(state: ServerState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid listen address")?;
    let app = build_router(state);

    info!(%addr, "voxbridge listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("could not bind listener")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// Device WebSocket accept.
///
/// Identity comes from the `device-id` header (or query parameter for
/// firmwares that cannot set headers). With auth enabled a valid token is
/// required and must match the claimed MAC; failures drop the connection
/// without a handshake response.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mac = headers
        .get("device-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.get("device-id").cloned());

    let Some(mac) = mac.filter(|m| !m.trim().is_empty()) else {
        warn!("websocket connect without device-id");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let identity = DeviceIdentity::from_mac(mac);

    if state.ctx.config.server.auth_enabled {
        let token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
            .or_else(|| params.get("token").cloned());

        let Some(token) = token else {
            warn!(mac = %identity.mac, "websocket connect without token");
            return StatusCode::UNAUTHORIZED.into_response();
        };
        match auth::validate_device_token(&state.ctx.config.server.auth_key, &token) {
            Ok(token_mac) if token_mac == identity.mac => {}
            Ok(token_mac) => {
                warn!(claimed = %identity.mac, issued = %token_mac, "token MAC mismatch");
                return StatusCode::UNAUTHORIZED.into_response();
            }
            Err(e) => {
                warn!(error = %e, "device token rejected");
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    }

    let via_mqtt_gateway = params.get("from").map(String::as_str) == Some("mqtt_gateway");
    let ctx = state.ctx.clone();
    ws.on_upgrade(move |socket| run_session(socket, ctx, identity, via_mqtt_gateway))
}
