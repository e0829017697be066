//! Device token issue and validation.
//!
//! The OTA response hands registered devices a signed token; the WebSocket
//! accept path validates it. Claims are minimal: the device MAC as subject
//! plus an expiry.

use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceClaims {
    /// Device MAC address.
    pub sub: String,
    /// Expiry, seconds since epoch.
    pub exp: u64,
}

pub fn issue_device_token(auth_key: &str, mac: &str, ttl_minutes: u64) -> Result<String> {
    let claims = DeviceClaims {
        sub: mac.trim().to_uppercase(),
        exp: (chrono::Utc::now() + chrono::Duration::minutes(ttl_minutes as i64)).timestamp()
            as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(auth_key.as_bytes()),
    )
    .context("could not sign device token")
}

/// Validate a token and return the MAC it was issued to.
pub fn validate_device_token(auth_key: &str, token: &str) -> Result<String> {
    let data = decode::<DeviceClaims>(
        token,
        &DecodingKey::from_secret(auth_key.as_bytes()),
        &Validation::default(),
    )
    .context("invalid device token")?;
    Ok(data.claims.sub)
}
