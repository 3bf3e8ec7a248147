//! `route.execute`: authorization, the synchronous messenger-dispatch path,
//! the asynchronous `route_inbox` hand-off for every other butler role,
//! startup recovery of stuck rows, and the Switchboard-side client that
//! dispatches classified sub-prompts to peer butlers.

use rusqlite::{params, Connection};
use uuid::Uuid;

use butlerhub_core::ButlerConfig;
use butlerhub_protocol::route::{
    RequestContext as RouteRequestContext, RouteInput, RouteResponseV1, RouteStatus, RouteTarget,
    RouteV1,
};
use butlerhub_protocol::{ErrorEnvelope, RequestId};

use crate::error::{Result, SwitchboardError};
use crate::types::ClassificationEntry;

/// Rejects a `route.v1` call whose `source_endpoint_identity` is not in
/// this butler's `trusted_route_callers` (default: Switchboard only).
pub fn authorize(config: &ButlerConfig, envelope: &RouteV1) -> Result<()> {
    envelope
        .validate_shape()
        .map_err(SwitchboardError::Validation)?;

    let identity = &envelope.request_context.source_endpoint_identity;
    if !config.is_trusted_route_caller(identity) {
        return Err(SwitchboardError::Validation(format!(
            "source_endpoint_identity {identity:?} is not a trusted route caller"
        )));
    }
    Ok(())
}

/// The synchronous path: this process is running as the messenger butler
/// and the envelope carries an inline `notify_request` to deliver now. The
/// envelope itself was already authorized (only the Switchboard relays
/// here), so the embedded `origin_butler` is trusted as the delivery caller
/// — `DeliveryEngine::deliver` uses it only for payload self-consistency.
pub async fn execute_as_messenger(
    engine: &butlerhub_messenger::DeliveryEngine,
    envelope: &RouteV1,
) -> Result<RouteResponseV1> {
    let notify_request: butlerhub_messenger::NotifyRequest = envelope
        .input
        .context
        .as_ref()
        .and_then(|c| c.get("notify_request"))
        .cloned()
        .ok_or_else(|| SwitchboardError::Validation("route input.context.notify_request is required".to_string()))?
        .pipe_deserialize()?;

    let caller = notify_request.origin_butler.clone();
    match engine.deliver(&caller, &notify_request).await {
        Ok(outcome) => Ok(RouteResponseV1::ok(serde_json::json!({
            "status": outcome.status.as_str(),
            "delivery_request_id": outcome.delivery_request_id,
            "provider_delivery_id": outcome.provider_delivery_id,
            "duplicate": outcome.duplicate,
        }))),
        Err(e) => Ok(RouteResponseV1::error(ErrorEnvelope {
            class: "internal_error".to_string(),
            message: e.to_string(),
            retryable: false,
        })),
    }
}

trait DeserializeExt {
    fn pipe_deserialize<T: serde::de::DeserializeOwned>(self) -> Result<T>;
}

impl DeserializeExt for serde_json::Value {
    fn pipe_deserialize<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(self).map_err(SwitchboardError::from)
    }
}

/// The asynchronous path for every non-messenger butler role: persist the
/// envelope into `route_inbox` as `accepted` and return immediately. A
/// separate worker (driven from `app.rs`) dequeues and dispatches these via
/// the spawner.
pub fn accept(conn: &Connection, envelope: &RouteV1) -> Result<RouteResponseV1> {
    let id = Uuid::now_v7();
    let envelope_json = serde_json::to_string(envelope)?;
    conn.execute(
        "INSERT INTO route_inbox (id, received_at, route_envelope, lifecycle_state)
         VALUES (?1, ?2, ?3, 'accepted')",
        params![id.to_string(), chrono::Utc::now().to_rfc3339(), envelope_json],
    )?;
    Ok(RouteResponseV1::accepted(id))
}

/// One `route_inbox` row, as needed by the recovery scan and dispatch loop.
#[derive(Debug, Clone)]
pub struct RouteInboxRow {
    pub id: Uuid,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub envelope: RouteV1,
    pub lifecycle_state: String,
}

/// Scans `route_inbox` for rows stuck in `accepted` or `processing` at
/// startup. `processing` rows older than `stuck_after` are presumed
/// orphaned by a crashed worker and are recovered back to `accepted` before
/// being returned for dispatch.
pub fn recover_pending(conn: &Connection, stuck_after: chrono::Duration) -> Result<Vec<RouteInboxRow>> {
    let cutoff = (chrono::Utc::now() - stuck_after).to_rfc3339();
    conn.execute(
        "UPDATE route_inbox SET lifecycle_state = 'accepted'
         WHERE lifecycle_state = 'processing' AND received_at < ?1",
        [cutoff],
    )?;

    let mut stmt = conn.prepare(
        "SELECT id, received_at, route_envelope, lifecycle_state FROM route_inbox
         WHERE lifecycle_state IN ('accepted', 'processing') ORDER BY received_at ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let received_at: String = row.get(1)?;
        let envelope_raw: String = row.get(2)?;
        let lifecycle_state: String = row.get(3)?;
        Ok((id, received_at, envelope_raw, lifecycle_state))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, received_at, envelope_raw, lifecycle_state) = row?;
        out.push(RouteInboxRow {
            id: Uuid::parse_str(&id).map_err(|e| SwitchboardError::Validation(e.to_string()))?,
            received_at: chrono::DateTime::parse_from_rfc3339(&received_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| SwitchboardError::Validation(e.to_string()))?,
            envelope: serde_json::from_str(&envelope_raw)?,
            lifecycle_state,
        });
    }
    Ok(out)
}

pub fn mark_processing(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE route_inbox SET lifecycle_state = 'processing' WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

pub fn mark_processed(conn: &Connection, id: Uuid, session_id: Option<&str>) -> Result<()> {
    conn.execute(
        "UPDATE route_inbox SET lifecycle_state = 'processed', processed_at = ?2, session_id = ?3 WHERE id = ?1",
        params![id.to_string(), chrono::Utc::now().to_rfc3339(), session_id],
    )?;
    Ok(())
}

pub fn mark_errored(conn: &Connection, id: Uuid, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE route_inbox SET lifecycle_state = 'errored', processed_at = ?2, error = ?3 WHERE id = ?1",
        params![id.to_string(), chrono::Utc::now().to_rfc3339(), error],
    )?;
    Ok(())
}

/// What one `route_to_butler` dispatch produced, recorded into the inbox
/// row's `dispatch_outcomes`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchOutcome {
    pub butler: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox_id: Option<Uuid>,
}

/// Switchboard-side dispatch of one classified sub-prompt to its target
/// butler's `route.execute`, identifying this process as the caller so the
/// peer's trusted-caller check passes. The peer's base URL comes from
/// `peer_butlers` config; a butler with no configured peer is a hard error
/// surfaced into the dispatch outcome, not a silent skip.
pub async fn route_to_butler(
    http: &reqwest::Client,
    config: &ButlerConfig,
    entry: &ClassificationEntry,
    context: &crate::types::RequestContext,
) -> Result<DispatchOutcome> {
    let base = config.peer_butlers.get(&entry.butler).ok_or_else(|| {
        SwitchboardError::NotFound(format!("no peer base URL configured for butler {:?}", entry.butler))
    })?;

    let envelope = RouteV1 {
        schema_version: RouteV1::SCHEMA_VERSION.to_string(),
        request_context: RouteRequestContext {
            request_id: RequestId(context.request_id),
            received_at: context.received_at,
            source_channel: context.source_channel.clone(),
            source_endpoint_identity: config.butler_name.clone(),
            source_sender_identity: context.source_sender_identity.clone(),
            source_thread_identity: context.source_thread_identity.clone(),
        },
        target: RouteTarget {
            butler: entry.butler.clone(),
            tool: "route.execute".to_string(),
        },
        input: RouteInput {
            prompt: entry.prompt.clone(),
            context: Some(serde_json::json!({ "segment": entry.segment })),
        },
    };

    let response = http
        .post(format!("{base}/route/execute"))
        .json(&envelope)
        .send()
        .await
        .map_err(|e| SwitchboardError::Validation(format!("route dispatch to {:?} failed: {e}", entry.butler)))?
        .json::<RouteResponseV1>()
        .await
        .map_err(|e| SwitchboardError::Validation(format!("malformed route response from {:?}: {e}", entry.butler)))?;

    match response.status {
        RouteStatus::Ok => Ok(DispatchOutcome {
            butler: entry.butler.clone(),
            status: "ok".to_string(),
            inbox_id: None,
        }),
        RouteStatus::Accepted => Ok(DispatchOutcome {
            butler: entry.butler.clone(),
            status: "accepted".to_string(),
            inbox_id: response.inbox_id,
        }),
        RouteStatus::Error => {
            let message = response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "peer returned an error with no detail".to_string());
            Err(SwitchboardError::Validation(format!(
                "butler {:?} rejected route envelope: {message}",
                entry.butler
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlerhub_protocol::route::{RequestContext, RouteInput, RouteTarget};
    use butlerhub_protocol::RequestId;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE route_inbox (
                id TEXT PRIMARY KEY, received_at TEXT NOT NULL, route_envelope TEXT NOT NULL,
                lifecycle_state TEXT NOT NULL DEFAULT 'accepted', processed_at TEXT, session_id TEXT, error TEXT
            );",
        )
        .unwrap();
        conn
    }

    fn envelope() -> RouteV1 {
        RouteV1 {
            schema_version: "route.v1".to_string(),
            request_context: RequestContext {
                request_id: RequestId::new(),
                received_at: chrono::Utc::now(),
                source_channel: "telegram".to_string(),
                source_endpoint_identity: "switchboard".to_string(),
                source_sender_identity: "user-1".to_string(),
                source_thread_identity: None,
            },
            target: RouteTarget { butler: "health".to_string(), tool: "route.execute".to_string() },
            input: RouteInput { prompt: "log my run".to_string(), context: None },
        }
    }

    #[test]
    fn rejects_untrusted_caller() {
        let config = ButlerConfig::default();
        let mut env = envelope();
        env.request_context.source_endpoint_identity = "random-peer".to_string();
        assert!(authorize(&config, &env).is_err());
    }

    #[test]
    fn accepts_trusted_switchboard_caller() {
        let config = ButlerConfig::default();
        assert!(authorize(&config, &envelope()).is_ok());
    }

    #[test]
    fn accept_persists_and_recovery_scan_returns_it() {
        let conn = conn();
        let response = accept(&conn, &envelope()).unwrap();
        assert!(response.inbox_id.is_some());

        let pending = recover_pending(&conn, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn stuck_processing_rows_recover_back_to_accepted() {
        let conn = conn();
        let response = accept(&conn, &envelope()).unwrap();
        let id = response.inbox_id.unwrap();
        mark_processing(&conn, id).unwrap();
        conn.execute(
            "UPDATE route_inbox SET received_at = ?1 WHERE id = ?2",
            params![(chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339(), id.to_string()],
        )
        .unwrap();

        let pending = recover_pending(&conn, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lifecycle_state, "accepted");
    }
}
