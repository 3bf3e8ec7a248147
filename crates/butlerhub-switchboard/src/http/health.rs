use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::db;

const PROTOCOL_VERSION: &str = "route.v1";

/// GET /health — liveness probe: butler role, database connectivity, and
/// (for the Switchboard) a routable-butler count.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let routable_butlers = {
        let conn = state.conn.lock().expect("connection poisoned");
        db::list_routable_butlers(&conn).map(|b| b.len()).unwrap_or(0)
    };

    Json(json!({
        "status": "ok",
        "butler_name": state.config.butler_name,
        "git_sha": env!("BUTLERHUB_GIT_SHA"),
        "protocol": PROTOCOL_VERSION,
        "messenger_active": state.messenger.is_some(),
        "routable_butlers": routable_butlers,
    }))
}
