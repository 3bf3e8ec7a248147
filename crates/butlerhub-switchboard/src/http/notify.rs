use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};

use butlerhub_protocol::notify::{NotifyResponseV1, NotifyV1};
use butlerhub_protocol::ErrorEnvelope;

use crate::app::AppState;
use crate::notify;

/// Header carrying the caller's pre-validated butler identity. Origin
/// enforcement compares it against the envelope's `origin_butler`.
const ORIGIN_HEADER: &str = "x-butler-identity";

fn error_response(class: &str, message: String, retryable: bool) -> Json<NotifyResponseV1> {
    Json(NotifyResponseV1::error(ErrorEnvelope {
        class: class.to_string(),
        message,
        retryable,
    }))
}

/// POST /notify — Switchboard-only. Validates that the caller is who the
/// envelope says it is, relays the request to the messenger butler via
/// `route.execute`, and collapses the result into `notify_response.v1`.
pub async fn notify_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(notify_request): Json<NotifyV1>,
) -> Json<NotifyResponseV1> {
    let caller = headers
        .get(ORIGIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if caller != notify_request.origin_butler {
        return error_response(
            "validation_error",
            format!(
                "origin_butler {:?} does not match caller identity {caller:?}",
                notify_request.origin_butler
            ),
            false,
        );
    }

    let channel = notify_request.delivery.channel.as_str();
    match notify::deliver(&state.conn, &state.config, &state.http, &notify_request).await {
        Ok(route_response) => Json(notify::to_notify_response(&route_response, channel)),
        Err(e) => error_response("internal_error", e.to_string(), false),
    }
}
