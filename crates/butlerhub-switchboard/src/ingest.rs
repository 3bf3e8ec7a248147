//! `ingest_v1`: validates an inbound envelope, derives a dedupe key, and
//! writes (or replays) a `message_inbox` row.

use rusqlite::Connection;
use sha2::{Digest, Sha256};

use butlerhub_protocol::ingest::{IngestResponseV1, IngestStatus, IngestV1};
use butlerhub_protocol::RequestId;

use crate::db::{self, NewInboxMessage};
use crate::error::{Result, SwitchboardError};
use crate::types::{DedupeStrategy, MessageDirection, RequestContext};

/// `(channel, provider)` pairs this deployment accepts. The webhook layer
/// keys off the same channel strings (`telegram`, `email`, `mcp`).
const ALLOWED_SOURCES: &[(&str, &str)] = &[
    ("telegram", "telegram"),
    ("email", "gmail"),
    ("mcp", "mcp"),
];

fn is_allowed_source(channel: &str, provider: &str) -> bool {
    ALLOWED_SOURCES.iter().any(|(c, p)| *c == channel && *p == provider)
}

/// Derives the dedupe key in priority order: explicit idempotency key,
/// then the connector's external event id, then a content hash. Two
/// submissions with the same key collapse to the same `message_inbox`
/// row even if their other fields differ.
fn derive_dedupe_key(envelope: &IngestV1) -> (String, DedupeStrategy) {
    if let Some(key) = envelope.control.idempotency_key.as_deref().filter(|k| !k.trim().is_empty()) {
        return (
            format!("idem:{}:{}:{}", envelope.source.channel, envelope.source.endpoint_identity, key),
            DedupeStrategy::IdempotencyKey,
        );
    }

    if !envelope.event.external_event_id.trim().is_empty() {
        return (
            format!(
                "event:{}:{}:{}",
                envelope.source.channel, envelope.source.endpoint_identity, envelope.event.external_event_id
            ),
            DedupeStrategy::ExternalEventId,
        );
    }

    let mut hasher = Sha256::new();
    hasher.update(envelope.payload.normalized_text.as_bytes());
    hasher.update(b"|");
    hasher.update(envelope.sender.identity.as_bytes());
    hasher.update(b"|");
    hasher.update(envelope.event.observed_at.to_rfc3339().as_bytes());
    (
        format!(
            "hash:{}:{}:{:x}",
            envelope.source.channel,
            envelope.source.endpoint_identity,
            hasher.finalize()
        ),
        DedupeStrategy::ContentHash,
    )
}

pub fn ingest_v1(conn: &Connection, envelope: IngestV1) -> Result<IngestResponseV1> {
    envelope.validate_shape().map_err(SwitchboardError::Validation)?;

    if !is_allowed_source(&envelope.source.channel, &envelope.source.provider) {
        return Err(SwitchboardError::Validation(format!(
            "unsupported (channel, provider) pair: ({:?}, {:?})",
            envelope.source.channel, envelope.source.provider
        )));
    }

    let (dedupe_key, dedupe_strategy) = derive_dedupe_key(&envelope);
    let request_id = RequestId::new();

    let request_context = RequestContext {
        request_id: request_id.as_uuid(),
        received_at: chrono::Utc::now(),
        source_channel: envelope.source.channel.clone(),
        source_endpoint_identity: envelope.source.endpoint_identity.clone(),
        source_sender_identity: envelope.sender.identity.clone(),
        source_thread_identity: envelope.event.external_thread_id.clone(),
        dedupe_key,
        dedupe_strategy,
        trace_context: envelope.control.trace_context.clone(),
    };

    let (row, created) = db::find_or_insert_inbox(
        conn,
        NewInboxMessage {
            request_context: &request_context,
            raw_payload: &envelope.payload.raw,
            normalized_text: &envelope.payload.normalized_text,
            direction: MessageDirection::Inbound,
            schema_version: IngestV1::SCHEMA_VERSION,
            lifecycle_state: butlerhub_core::LifecycleState::Accepted,
        },
    )?;

    Ok(IngestResponseV1 {
        request_id: RequestId(row.request_context.request_id),
        status: IngestStatus::Accepted,
        duplicate: !created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlerhub_protocol::ingest::{IngestControl, IngestEvent, IngestPayload, IngestSender, IngestSource};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        conn
    }

    fn sample(event_id: &str) -> IngestV1 {
        IngestV1 {
            schema_version: "ingest.v1".to_string(),
            source: IngestSource { channel: "telegram".to_string(), provider: "telegram".to_string(), endpoint_identity: "bot-1".to_string() },
            event: IngestEvent { external_event_id: event_id.to_string(), external_thread_id: None, observed_at: chrono::Utc::now() },
            sender: IngestSender { identity: "user-1".to_string() },
            payload: IngestPayload { raw: serde_json::json!({"text": "hi"}), normalized_text: "hi".to_string() },
            control: IngestControl::default(),
        }
    }

    #[test]
    fn rejects_unsupported_channel_provider_pair() {
        let conn = conn();
        let mut envelope = sample("evt-1");
        envelope.source.provider = "whatsapp".to_string();
        assert!(ingest_v1(&conn, envelope).is_err());
    }

    #[test]
    fn duplicate_external_event_id_is_flagged() {
        let conn = conn();
        let first = ingest_v1(&conn, sample("evt-1")).unwrap();
        assert!(!first.duplicate);
        let second = ingest_v1(&conn, sample("evt-1")).unwrap();
        assert!(second.duplicate);
        assert_eq!(first.request_id.to_string(), second.request_id.to_string());
    }

    #[test]
    fn explicit_idempotency_key_takes_priority_over_event_id() {
        let conn = conn();
        let mut envelope = sample("evt-1");
        envelope.control.idempotency_key = Some("manual-key".to_string());
        let first = ingest_v1(&conn, envelope).unwrap();

        let mut second_envelope = sample("evt-2");
        second_envelope.control.idempotency_key = Some("manual-key".to_string());
        let second = ingest_v1(&conn, second_envelope).unwrap();
        assert!(second.duplicate);
        assert_eq!(first.request_id.to_string(), second.request_id.to_string());
    }

    #[test]
    fn empty_event_id_falls_back_to_content_hash_dedupe() {
        let conn = conn();
        let observed_at = chrono::Utc::now();
        let mut first = sample("");
        first.event.observed_at = observed_at;
        let mut second = sample("");
        second.event.observed_at = observed_at;

        let a = ingest_v1(&conn, first).unwrap();
        let b = ingest_v1(&conn, second).unwrap();
        assert!(b.duplicate);
        assert_eq!(a.request_id.to_string(), b.request_id.to_string());
    }

    #[test]
    fn different_endpoint_identity_is_a_different_request() {
        let conn = conn();
        let first = ingest_v1(&conn, sample("evt-1")).unwrap();
        let mut other = sample("evt-1");
        other.source.endpoint_identity = "bot-2".to_string();
        let second = ingest_v1(&conn, other).unwrap();
        assert!(!second.duplicate);
        assert_ne!(first.request_id.to_string(), second.request_id.to_string());
    }
}
