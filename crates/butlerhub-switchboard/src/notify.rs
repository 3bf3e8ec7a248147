//! Client-side `deliver()`: the Switchboard wraps a `notify.v1` request
//! inside an outer `route.v1` envelope targeting the messenger butler and
//! dispatches it over HTTP.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use uuid::Uuid;

use butlerhub_core::ButlerConfig;
use butlerhub_protocol::notify::{DeliveryResult, NotifyResponseV1, NotifyV1};
use butlerhub_protocol::route::{RequestContext as RouteRequestContext, RouteInput, RouteResponseV1, RouteStatus, RouteTarget, RouteV1};
use butlerhub_protocol::{ErrorEnvelope, RequestId};

use crate::db;
use crate::error::{Result, SwitchboardError};
use crate::types::{MessageDirection, NotificationStatus};

const MESSENGER_MODULE: &str = "messenger";

fn build_envelope(notify_request: &NotifyV1) -> Result<RouteV1> {
    notify_request
        .validate_shape()
        .map_err(SwitchboardError::Validation)?;

    Ok(RouteV1 {
        schema_version: RouteV1::SCHEMA_VERSION.to_string(),
        request_context: RouteRequestContext {
            request_id: RequestId::new(),
            received_at: chrono::Utc::now(),
            source_channel: "internal".to_string(),
            source_endpoint_identity: "switchboard".to_string(),
            source_sender_identity: "switchboard".to_string(),
            source_thread_identity: None,
        },
        target: RouteTarget { butler: MESSENGER_MODULE.to_string(), tool: "route.execute".to_string() },
        input: RouteInput {
            prompt: notify_request.delivery.message.clone(),
            context: Some(serde_json::json!({ "notify_request": notify_request })),
        },
    })
}

/// Resolves the base URL of a routable peer that advertises the `messenger`
/// module, preferring the registry over a hardcoded name so any butler role
/// running as messenger can receive the call.
fn resolve_messenger_peer(conn: &Connection, config: &ButlerConfig) -> Result<String> {
    let candidates = db::butlers_with_module(conn, MESSENGER_MODULE)?;
    candidates
        .iter()
        .find_map(|name| config.peer_butlers.get(name).cloned())
        .ok_or_else(|| SwitchboardError::NotFound("no eligible messenger peer configured".to_string()))
}

/// Delivers a `notify.v1` request by dispatching it to the messenger butler
/// over HTTP, then logs the outcome and (for reply-intent messages with
/// known thread context) mirrors an outbound `message_inbox` row so the
/// conversation stays threaded. The lock is taken per database touch, never
/// across the HTTP call.
pub async fn deliver(
    conn: &Arc<Mutex<Connection>>,
    config: &ButlerConfig,
    http: &reqwest::Client,
    notify_request: &NotifyV1,
) -> Result<RouteResponseV1> {
    let envelope = build_envelope(notify_request)?;
    let peer_base = {
        let guard = conn.lock().expect("connection poisoned");
        resolve_messenger_peer(&guard, config)?
    };
    let channel = notify_request.delivery.channel.as_str().to_string();
    let recipient = notify_request.delivery.recipient.clone().unwrap_or_default();

    let dispatch_result = http
        .post(format!("{peer_base}/route/execute"))
        .json(&envelope)
        .send()
        .await
        .map_err(|e| SwitchboardError::Validation(format!("messenger dispatch failed: {e}")));

    let response = match dispatch_result {
        Ok(resp) => resp
            .json::<RouteResponseV1>()
            .await
            .map_err(|e| SwitchboardError::Validation(format!("malformed route response: {e}"))),
        Err(e) => Err(e),
    };

    let guard = conn.lock().expect("connection poisoned");
    match response {
        Ok(route_response) if matches!(route_response.status, RouteStatus::Ok) => {
            db::log_notification(
                &guard,
                "switchboard",
                &channel,
                &recipient,
                &notify_request.delivery.message,
                NotificationStatus::Sent,
                None,
                None,
                &serde_json::json!({}),
            )?;
            write_outbound_mirror(&guard, notify_request)?;
            Ok(route_response)
        }
        Ok(route_response) => {
            let error_message = route_response
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "messenger returned a non-ok status".to_string());
            db::log_notification(
                &guard,
                "switchboard",
                &channel,
                &recipient,
                &notify_request.delivery.message,
                NotificationStatus::Failed,
                Some(&error_message),
                None,
                &serde_json::json!({}),
            )?;
            Ok(route_response)
        }
        Err(e) => {
            db::log_notification(
                &guard,
                "switchboard",
                &channel,
                &recipient,
                &notify_request.delivery.message,
                NotificationStatus::Failed,
                Some(&e.to_string()),
                None,
                &serde_json::json!({}),
            )?;
            Err(e)
        }
    }
}

/// Collapses the messenger's `route_response.v1` into the `notify_response.v1`
/// shape the originating butler sees. The messenger's synchronous result
/// carries `delivery_request_id`/`provider_delivery_id` inside `result`.
pub fn to_notify_response(route_response: &RouteResponseV1, channel: &str) -> NotifyResponseV1 {
    match route_response.status {
        RouteStatus::Ok => {
            let result = route_response.result.as_ref();
            let delivery_id = result
                .and_then(|r| r.get("delivery_request_id"))
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_default();
            let provider_delivery_id = result
                .and_then(|r| r.get("provider_delivery_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            NotifyResponseV1::ok(DeliveryResult {
                channel: channel.to_string(),
                delivery_id,
                provider_delivery_id,
            })
        }
        _ => NotifyResponseV1::error(route_response.error.clone().unwrap_or(ErrorEnvelope {
            class: "internal_error".to_string(),
            message: "messenger returned a non-ok status".to_string(),
            retryable: false,
        })),
    }
}

/// Writes the outbound mirror only when the original request context
/// carries a thread id — a reply into a known conversation. Errors here are
/// logged-and-swallowed: the delivery itself already succeeded.
fn write_outbound_mirror(conn: &Connection, notify_request: &NotifyV1) -> Result<()> {
    let Some(context) = &notify_request.request_context else { return Ok(()) };
    let Some(thread_id) = &context.source_thread_identity else { return Ok(()) };

    let request_context = crate::types::RequestContext {
        request_id: context.request_id.as_uuid(),
        received_at: chrono::Utc::now(),
        source_channel: context.source_channel.clone(),
        source_endpoint_identity: context.source_endpoint_identity.clone(),
        source_sender_identity: context.source_sender_identity.clone(),
        source_thread_identity: Some(thread_id.clone()),
        dedupe_key: format!("outbound:{}", Uuid::now_v7()),
        dedupe_strategy: crate::types::DedupeStrategy::ContentHash,
        trace_context: None,
    };

    if let Err(e) = db::find_or_insert_inbox(
        conn,
        db::NewInboxMessage {
            request_context: &request_context,
            raw_payload: &serde_json::json!({ "delivery": notify_request.delivery }),
            normalized_text: &notify_request.delivery.message,
            direction: MessageDirection::Outbound,
            schema_version: NotifyV1::SCHEMA_VERSION,
            lifecycle_state: butlerhub_core::LifecycleState::Completed,
        },
    ) {
        tracing::warn!(error = %e, "failed to write outbound message_inbox mirror");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlerhub_protocol::notify::{DeliveryChannel, DeliveryIntent, DeliveryRequest};

    fn sample() -> NotifyV1 {
        NotifyV1 {
            schema_version: NotifyV1::SCHEMA_VERSION.to_string(),
            origin_butler: "health".to_string(),
            delivery: DeliveryRequest {
                intent: DeliveryIntent::Send,
                channel: DeliveryChannel::Telegram,
                message: "workout logged".to_string(),
                recipient: Some("user-1".to_string()),
                subject: None,
                metadata: None,
            },
            request_context: None,
        }
    }

    #[test]
    fn build_envelope_targets_messenger_route_execute() {
        let envelope = build_envelope(&sample()).unwrap();
        assert_eq!(envelope.target.butler, "messenger");
        assert_eq!(envelope.target.tool, "route.execute");
        assert_eq!(envelope.request_context.source_endpoint_identity, "switchboard");
    }

    #[test]
    fn build_envelope_preserves_original_context_inline() {
        let mut notify_request = sample();
        notify_request.request_context = Some(RouteRequestContext {
            request_id: RequestId::new(),
            received_at: chrono::Utc::now(),
            source_channel: "telegram".to_string(),
            source_endpoint_identity: "tg-bot-1".to_string(),
            source_sender_identity: "user-1".to_string(),
            source_thread_identity: Some("thread-1".to_string()),
        });
        let envelope = build_envelope(&notify_request).unwrap();
        let inline = envelope.input.context.unwrap();
        assert_eq!(inline["notify_request"]["request_context"]["source_thread_identity"], "thread-1");
    }

    #[test]
    fn resolve_messenger_peer_fails_without_registry_or_config() {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let config = ButlerConfig::default();
        assert!(resolve_messenger_peer(&conn, &config).is_err());
    }

    #[test]
    fn ok_route_response_maps_to_notify_ok_with_delivery_ids() {
        let delivery_id = Uuid::now_v7();
        let route_response = RouteResponseV1::ok(serde_json::json!({
            "status": "delivered",
            "delivery_request_id": delivery_id.to_string(),
            "provider_delivery_id": "tg-42",
        }));
        let notify = to_notify_response(&route_response, "telegram");
        let delivery = notify.delivery.unwrap();
        assert_eq!(delivery.delivery_id, delivery_id);
        assert_eq!(delivery.provider_delivery_id.as_deref(), Some("tg-42"));
    }

    #[test]
    fn error_route_response_maps_to_notify_error() {
        let route_response = RouteResponseV1::error(ErrorEnvelope {
            class: "unavailable".to_string(),
            message: "provider down".to_string(),
            retryable: true,
        });
        let notify = to_notify_response(&route_response, "telegram");
        assert!(notify.delivery.is_none());
        assert_eq!(notify.error.unwrap().class, "unavailable");
    }
}
