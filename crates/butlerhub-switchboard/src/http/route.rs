use std::sync::Arc;

use axum::{extract::State, Json};

use butlerhub_protocol::route::{RouteResponseV1, RouteV1};
use butlerhub_protocol::ErrorEnvelope;

use crate::app::AppState;
use crate::route as route_logic;

fn error_response(class: &str, message: String) -> Json<RouteResponseV1> {
    Json(RouteResponseV1::error(ErrorEnvelope {
        class: class.to_string(),
        message,
        retryable: false,
    }))
}

/// POST /route/execute — every butler role exposes this. Messenger delivers
/// synchronously; every other role queues into `route_inbox` and returns
/// immediately.
pub async fn route_execute_handler(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<RouteV1>,
) -> Json<RouteResponseV1> {
    if let Err(e) = route_logic::authorize(&state.config, &envelope) {
        return error_response("validation_error", e.to_string());
    }

    let result = if let Some(engine) = &state.messenger {
        route_logic::execute_as_messenger(engine, &envelope).await
    } else {
        let conn = state.conn.lock().expect("connection poisoned");
        route_logic::accept(&conn, &envelope)
    };

    match result {
        Ok(response) => Json(response),
        Err(e) => error_response("internal_error", e.to_string()),
    }
}
