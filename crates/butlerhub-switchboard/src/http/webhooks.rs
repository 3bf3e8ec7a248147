//! Webhook ingress (`POST /webhooks/{source}`) and the raw `ingest.v1`
//! endpoint (`POST /ingest`) — both funnel into [`crate::ingest::ingest_v1`].

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use butlerhub_core::config::WebhookAuthMode;
use butlerhub_protocol::ingest::{IngestControl, IngestEvent, IngestPayload, IngestSender, IngestSource, IngestV1};

use crate::app::AppState;
use crate::ingest;

type HmacSha256 = Hmac<Sha256>;

/// POST /api/switchboard/ingest — the canonical entry point for connectors
/// that already speak `ingest.v1` (Telegram/Gmail pollers, the MCP bridge).
/// Acceptance (202) never waits on triage/classification — those run on a
/// spawned task after the inbox row is durable.
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<IngestV1>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let accepted = {
        let conn = state.conn.lock().expect("connection poisoned");
        ingest::ingest_v1(&conn, envelope)
    };
    match accepted {
        Ok(response) => {
            if !response.duplicate {
                crate::pipeline::spawn_processing(state.clone(), response.request_id);
            }
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::to_value(&response).unwrap_or(json!({}))),
            ))
        }
        Err(e) => {
            warn!(error = %e, "ingest_v1 rejected envelope");
            Err(ingest_error_response(e))
        }
    }
}

/// Validation failures are the connector's fault (400, never retried);
/// storage failures are ours and retryable (500).
fn ingest_error_response(e: crate::error::SwitchboardError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        crate::error::SwitchboardError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    let retryable = status == StatusCode::INTERNAL_SERVER_ERROR;
    (status, Json(json!({"error": e.to_string(), "retryable": retryable})))
}

/// POST /webhooks/:source — accepts a raw provider payload, authenticates it
/// per the source's configured `auth_mode`, normalizes it into `ingest.v1`,
/// and submits it the same way `/ingest` would.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let cfg = &state.config.webhooks;

    if !cfg.enabled {
        warn!(source = %source, "webhook received but ingress is disabled");
        return Err((StatusCode::NOT_FOUND, Json(json!({"error": "webhook ingress is disabled"}))));
    }

    let source_cfg = cfg.find(&source).ok_or_else(|| {
        warn!(source = %source, "unknown webhook source");
        (StatusCode::NOT_FOUND, Json(json!({"error": "unknown webhook source"})))
    })?;

    info!(source = %source, bytes = body.len(), "webhook arrived");

    match source_cfg.auth_mode {
        WebhookAuthMode::HmacSha256 => {
            verify_hmac_sha256(&headers, &body, source_cfg.secret.as_deref()).map_err(auth_error)?;
        }
        WebhookAuthMode::BearerToken => {
            verify_bearer_token(&headers, source_cfg.secret.as_deref()).map_err(auth_error)?;
        }
        WebhookAuthMode::None => {}
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(source = %source, error = %e, "invalid JSON in webhook body");
        (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid JSON body"})))
    })?;

    let envelope = build_envelope(source_cfg, &payload);

    let response = {
        let conn = state.conn.lock().expect("connection poisoned");
        ingest::ingest_v1(&conn, envelope)
    }
    .map_err(|e| {
        warn!(source = %source, error = %e, "ingest_v1 rejected webhook payload");
        ingest_error_response(e)
    })?;

    if !response.duplicate {
        crate::pipeline::spawn_processing(state.clone(), response.request_id);
    }

    info!(source = %source, request_id = %response.request_id, "webhook accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::to_value(&response).unwrap_or(json!({}))),
    ))
}

fn extract_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| payload.get(k)).and_then(Value::as_str)
}

fn build_envelope(source_cfg: &butlerhub_core::config::WebhookSourceConfig, payload: &Value) -> IngestV1 {
    let external_event_id = extract_str(payload, &["id", "event_id", "message_id"])
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let external_thread_id = extract_str(payload, &["thread_id", "chat_id", "conversation_id"]).map(str::to_string);
    let sender_identity = extract_str(payload, &["from", "sender", "user_id"]).unwrap_or("unknown").to_string();
    let normalized_text = extract_str(payload, &["text", "message", "body"]).map(str::to_string).unwrap_or_else(|| payload.to_string());

    IngestV1 {
        schema_version: IngestV1::SCHEMA_VERSION.to_string(),
        source: IngestSource {
            channel: source_cfg.channel.clone(),
            provider: source_cfg.provider.clone(),
            endpoint_identity: source_cfg.endpoint_identity.clone(),
        },
        event: IngestEvent {
            external_event_id,
            external_thread_id,
            observed_at: chrono::Utc::now(),
        },
        sender: IngestSender { identity: sender_identity },
        payload: IngestPayload { raw: payload.clone(), normalized_text },
        control: IngestControl::default(),
    }
}

/// Verify GitHub-style HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_hmac_sha256(headers: &HeaderMap, body: &Bytes, secret: Option<&str>) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured for this source".to_string())?;

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header.strip_prefix("sha256=").ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;
    let expected = hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| "HMAC signature mismatch".to_string())
}

/// Verify a static bearer token in the `Authorization: Bearer <token>` header.
fn verify_bearer_token(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let expected = secret.ok_or_else(|| "no bearer token configured for this source".to_string())?;

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

fn auth_error(reason: String) -> (StatusCode, Json<Value>) {
    warn!(reason = %reason, "webhook authentication failed");
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "authentication failed", "reason": reason})))
}
