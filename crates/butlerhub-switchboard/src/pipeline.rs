//! Post-accept processing of an inbound message. Runs on its own task so
//! the ingest endpoint can return 202 as soon as the inbox row is durable:
//! thread-affinity + rule triage first, the classifier only when triage
//! passes through, then one `route_to_butler` dispatch per entry, with the
//! inbox row's lifecycle and outcome columns updated along the way.

use std::sync::Arc;

use tracing::{info, warn};

use butlerhub_core::RequestId;

use crate::app::AppState;
use crate::classifier;
use crate::db;
use crate::error::{Result, SwitchboardError};
use crate::route;
use crate::triage;
use crate::types::{ClassificationEntry, InboxMessage, RouteDecisionKind, SegmentMetadata};

pub fn spawn_processing(state: Arc<AppState>, request_id: RequestId) {
    tokio::spawn(async move {
        if let Err(e) = process_inbound(&state, request_id).await {
            warn!(error = %e, request_id = %request_id, "inbound processing failed");
        }
    });
}

async fn process_inbound(state: &Arc<AppState>, request_id: RequestId) -> Result<()> {
    let (message, decision) = {
        let conn = state.conn.lock().expect("connection poisoned");
        let message = db::find_by_request_id(&conn, request_id.as_uuid())?
            .ok_or_else(|| SwitchboardError::NotFound(format!("message_inbox for request {request_id}")))?;
        db::mark_processing(&conn, message.id)?;

        let settings = triage::load_settings(&conn)?;
        let rules = triage::load_rules(&conn);
        let affinity = triage::lookup_thread_affinity(
            &conn,
            message.request_context.source_thread_identity.as_deref(),
            &message.request_context.source_channel,
            &settings,
        );
        let decision = triage::evaluate(
            &affinity,
            &rules,
            &message.request_context.source_channel,
            &message.request_context.source_sender_identity,
            &message.normalized_text,
        );
        (message, decision)
    };

    let entries = resolve_entries(state, &message, &decision, request_id).await?;

    {
        let conn = state.conn.lock().expect("connection poisoned");
        db::mark_decomposed(&conn, message.id, &serde_json::to_value(&entries)?)?;
    }

    let mut outcomes = Vec::with_capacity(entries.len());
    let mut any_error = false;
    for entry in &entries {
        match route::route_to_butler(&state.http, &state.config, entry, &message.request_context).await {
            Ok(outcome) => {
                record_thread_route(state, &message, &entry.butler);
                info!(
                    request_id = %request_id,
                    butler = %entry.butler,
                    status = %outcome.status,
                    "dispatched inbound segment"
                );
                outcomes.push(serde_json::to_value(&outcome)?);
            }
            Err(e) => {
                any_error = true;
                warn!(request_id = %request_id, butler = %entry.butler, error = %e, "dispatch failed");
                outcomes.push(serde_json::json!({
                    "butler": entry.butler,
                    "status": "error",
                    "error": e.to_string(),
                }));
            }
        }
    }

    let final_state = if any_error { "errored" } else { "completed" };
    let conn = state.conn.lock().expect("connection poisoned");
    db::mark_completed(&conn, message.id, &serde_json::Value::Array(outcomes), final_state)?;
    Ok(())
}

/// A triage `route_to` decision skips the classifier entirely; anything
/// else asks it to decompose the message.
async fn resolve_entries(
    state: &Arc<AppState>,
    message: &InboxMessage,
    decision: &crate::types::RuleDecision,
    request_id: RequestId,
) -> Result<Vec<ClassificationEntry>> {
    if decision.decision == RouteDecisionKind::RouteTo {
        if let Some(target) = &decision.target_butler {
            return Ok(vec![ClassificationEntry {
                butler: target.clone(),
                prompt: message.normalized_text.clone(),
                segment: SegmentMetadata {
                    sentence_spans: None,
                    offsets: None,
                    rationale: decision.matched_rule_type.clone(),
                },
            }]);
        }
    }

    let result = classifier::classify_message(
        &state.conn,
        &state.spawner,
        &message.normalized_text,
        request_id,
        message.trace_id.clone(),
    )
    .await?;
    Ok(result.entries)
}

/// Routing history feeds the next thread-affinity lookup; only messages
/// that actually carry a thread identity leave a trail.
fn record_thread_route(state: &Arc<AppState>, message: &InboxMessage, butler: &str) {
    let Some(thread_id) = &message.request_context.source_thread_identity else {
        return;
    };
    let conn = state.conn.lock().expect("connection poisoned");
    if let Err(e) = db::record_route(&conn, &message.request_context.source_channel, thread_id, butler) {
        warn!(error = %e, "failed to record routing history");
    }
}
