//! Provisioning handshake for unclaimed devices.
//!
//! `POST /ota` is the first contact: registered devices get their
//! connection config (WebSocket URL + token, MQTT credentials when a
//! gateway is configured); unknown devices get a one-time 6-digit
//! activation code held in the cache for 24 hours, plus a challenge the
//! firmware can display or verify. `POST /ota/activate` is the device's
//! poll while it waits for the user to complete binding.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::cache::{CacheKind, CacheStore};

use super::{auth, ServerState};

/// Decimal digits in an activation code.
pub const ACTIVATION_CODE_LENGTH: u32 = 6;
const ACTIVATION_TIMEOUT_MS: u64 = 30_000;

/// Narrow repository contract: is this MAC bound to an account, and bind
/// it. Binding completion itself is driven by a user-facing flow.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn is_registered(&self, mac: &str) -> Result<bool, String>;
    async fn register(&self, mac: &str) -> Result<(), String>;
}

pub struct InMemoryDeviceRepository {
    macs: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self {
            macs: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }
}

impl Default for InMemoryDeviceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn is_registered(&self, mac: &str) -> Result<bool, String> {
        Ok(self.macs.lock().unwrap().contains(&mac.to_uppercase()))
    }

    async fn register(&self, mac: &str) -> Result<(), String> {
        self.macs.lock().unwrap().insert(mac.to_uppercase());
        Ok(())
    }
}

/// `base64(HMAC-SHA256(signing_key, content))` for MQTT passwords.
pub fn generate_password_signature(content: &str, signing_key: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(content.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// First 32 base64 chars of SHA-256(code).
pub fn activation_challenge(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    let encoded = BASE64.encode(digest);
    encoded.chars().take(32).collect()
}

fn generate_activation_code() -> String {
    let code: u32 = rand::rng().random_range(0..10u32.pow(ACTIVATION_CODE_LENGTH));
    format!("{code:0width$}", width = ACTIVATION_CODE_LENGTH as usize)
}

/// Draw codes until one is free so `(code, MAC)` stays unique across
/// unexpired entries.
async fn unique_activation_code(cache: &Arc<dyn CacheStore>) -> Result<String, crate::cache::CacheError> {
    loop {
        let code = generate_activation_code();
        if cache.get(CacheKind::ActivationCode, &code).await?.is_none() {
            return Ok(code);
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_uppercase())
}

/// `GET /ota` — liveness plus the advertised WebSocket URL.
pub async fn ota_get(State(state): State<ServerState>) -> Json<Value> {
    let websocket_url = state.ctx.config.server.websocket_url_or_default();
    Json(json!({
        "message": format!("OTA is healthy, websocket url: {websocket_url}"),
        "websocket_url": websocket_url,
    }))
}

/// `POST /ota` — config for registered devices, activation for unknown.
pub async fn ota_post(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(device_data): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let Some(mac) = header_string(&headers, "device-id") else {
        return Err(StatusCode::BAD_REQUEST);
    };
    if header_string(&headers, "client-id").is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let config = &state.ctx.config;
    let offset_minutes = config.session.utc_offset_minutes;

    let mut response = json!({
        "server_time": {
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "timezone_offset": offset_minutes,
        },
        "firmware": {
            "version": device_data
                .pointer("/application/version")
                .and_then(Value::as_str)
                .unwrap_or("1.0.0"),
            "url": "",
        },
    });

    let registered = state.devices.is_registered(&mac).await.map_err(|e| {
        error!(error = %e, "device repository unavailable");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if !registered {
        // Unknown MAC: issue an activation code and stash the descriptor
        // until the user completes binding. Cache failures reject the
        // request; a device must never think it is activating when the
        // state was not stored.
        let code = match unique_activation_code(&state.ctx.cache).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "activation cache unavailable");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        info!(%mac, %code, "issuing activation code");

        let payload = json!({"code": code, "device_data": device_data});
        if let Err(e) = state
            .ctx
            .cache
            .set(CacheKind::Activation, &mac, payload)
            .await
        {
            error!(error = %e, "could not store activation payload");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        if let Err(e) = state
            .ctx
            .cache
            .set(CacheKind::ActivationCode, &code, json!(mac))
            .await
        {
            error!(error = %e, "could not store activation code index");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }

        response["activation"] = json!({
            "message": format!("Activation code: {code}"),
            "code": code,
            "challenge": activation_challenge(&code),
            "timeout_ms": ACTIVATION_TIMEOUT_MS,
        });
        return Ok(Json(response));
    }

    // Registered device: hand out the transport config.
    if !config.mqtt.gateway_endpoint.is_empty() {
        let model = device_data
            .pointer("/device/model")
            .or_else(|| device_data.get("model"))
            .and_then(Value::as_str)
            .unwrap_or("default");
        let group_id = format!("GID_{model}").replace([':', ' '], "_");
        let mac_safe = mac.replace(':', "_");
        let client_id = format!("{group_id}@@@{mac_safe}@@@{mac_safe}");
        let username = BASE64.encode(json!({"ip": "unknown"}).to_string());
        let password = if config.mqtt.signature_key.is_empty() {
            warn!("mqtt signature key missing, empty password");
            String::new()
        } else {
            generate_password_signature(
                &format!("{client_id}|{username}"),
                &config.mqtt.signature_key,
            )
        };

        response["mqtt"] = json!({
            "endpoint": config.mqtt.gateway_endpoint,
            "client_id": client_id,
            "username": username,
            "password": password,
            "publish_topic": format!("server/{mac}/audio"),
        });
    } else {
        let mut token = String::new();
        if config.server.auth_enabled {
            let allowed = &config.server.allowed_devices;
            if !allowed.is_empty() && !allowed.iter().any(|m| m.eq_ignore_ascii_case(&mac)) {
                return Err(StatusCode::UNAUTHORIZED);
            }
            token = auth::issue_device_token(
                &config.server.auth_key,
                &mac,
                config.server.token_ttl_minutes,
            )
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        }
        response["websocket"] = json!({
            "url": config.server.websocket_url_or_default(),
            "token": token,
        });
    }

    // Push subscription config rides along whenever a broker exists.
    if !config.mqtt.endpoint.is_empty() {
        response["mqtt_common"] = json!({
            "endpoint": config.mqtt.endpoint,
            "username": config.mqtt.username,
            "password": config.mqtt.password,
            "subscribe_topic": format!("device/{mac}/#"),
        });
    }

    Ok(Json(response))
}

/// `POST /ota/activate` — the device polls until binding completes.
/// 200 once registered, 202 while the activation entry is alive, 404
/// otherwise.
pub async fn ota_activate(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let Some(mac) = header_string(&headers, "device-id") else {
        return Err(StatusCode::BAD_REQUEST);
    };

    let registered = state
        .devices
        .is_registered(&mac)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if registered {
        return Ok((StatusCode::OK, Json(json!({"status": "activated"}))));
    }

    match state.ctx.cache.get(CacheKind::Activation, &mac).await {
        Ok(Some(_)) => Ok((StatusCode::ACCEPTED, Json(json!({"status": "pending"})))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "activation cache unavailable");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Complete a binding: consume the code, create the repository record,
/// delete both cache entries. Driven by the user-facing flow.
pub async fn confirm_activation(
    cache: &Arc<dyn CacheStore>,
    devices: &Arc<dyn DeviceRepository>,
    code: &str,
) -> Result<String, String> {
    let mac = cache
        .get(CacheKind::ActivationCode, code)
        .await
        .map_err(|e| e.to_string())?
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| "activation code not found or expired".to_string())?;

    devices.register(&mac).await?;
    let _ = cache.delete(CacheKind::Activation, &mac).await;
    let _ = cache.delete(CacheKind::ActivationCode, code).await;
    info!(%mac, "device binding completed");
    Ok(mac)
}
