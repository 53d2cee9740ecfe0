//! Direct ingest endpoint: POST /emit-event.
//!
//! Lets an upstream producer push one event without waiting for the next poll
//! tick. Body: `{ "event": "new_number", "data": {...} }` or a bare event
//! object in any accepted shape. The event is decoded like any inbound
//! payload (category recomputed) and published through the broadcaster.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use runcash_core::config::IngestAuthMode;
use runcash_protocol::decode::decode_ingest;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

// ── Public handler ────────────────────────────────────────────────────────────

/// Returns 200 with the topic on success (`published` is false for a stale
/// strategy annotation), 401 on auth failure, 400 on a malformed body, 404
/// while ingest is disabled.
pub async fn emit_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cfg = &state.config.ingest;

    if !cfg.enabled {
        warn!("emit-event received but ingest is disabled");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "ingest is disabled"})),
        ));
    }

    match cfg.auth {
        IngestAuthMode::HmacSha256 => {
            verify_hmac_sha256(&headers, &body, cfg.secret.as_deref())
                .map_err(|e| auth_error(&e))?;
        }
        IngestAuthMode::BearerToken => {
            verify_bearer_token(&headers, cfg.secret.as_deref()).map_err(|e| auth_error(&e))?;
        }
        IngestAuthMode::None => {}
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "invalid JSON in emit-event body");
        bad_request("invalid JSON body")
    })?;

    let event = decode_ingest(&payload).map_err(|e| {
        warn!(error = %e, "emit-event payload dropped");
        bad_request(&e.to_string())
    })?;

    let topic = event.topic().to_string();
    let published = state.broadcaster.publish_event(&topic, event);
    if published {
        info!(topic = %topic, bytes = body.len(), "ingested event published");
    } else {
        info!(topic = %topic, "ingested event older than current state, not relayed");
    }
    Ok(Json(json!({"ok": true, "topic": topic, "published": published})))
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

/// Verify HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_hmac_sha256(
    headers: &HeaderMap,
    body: &Bytes,
    secret: Option<&str>,
) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured".to_string())?;

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

/// Verify a static bearer token in the `Authorization: Bearer <token>` header.
fn verify_bearer_token(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let expected = secret.ok_or_else(|| "no bearer token configured".to_string())?;

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| "missing bearer token".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

// ── Error helpers ─────────────────────────────────────────────────────────────

fn auth_error(reason: &str) -> (StatusCode, Json<Value>) {
    warn!(reason = %reason, "emit-event authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "reason": reason})),
    )
}

fn bad_request(reason: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "malformed event", "reason": reason})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn hmac_accepts_valid_signature() {
        let body = Bytes::from_static(br#"{"gameName":"A","value":3}"#);
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("k", &body).parse().unwrap());
        assert!(verify_hmac_sha256(&headers, &body, Some("k")).is_ok());
        assert!(verify_hmac_sha256(&headers, &body, Some("other")).is_err());
    }

    #[test]
    fn bearer_requires_exact_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer t0k".parse().unwrap());
        assert!(verify_bearer_token(&headers, Some("t0k")).is_ok());
        assert!(verify_bearer_token(&headers, Some("nope")).is_err());
        assert!(verify_bearer_token(&HeaderMap::new(), Some("t0k")).is_err());
    }
}
