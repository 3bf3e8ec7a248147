use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, SwitchboardError};
use crate::types::{
    DedupeStrategy, InboxMessage, MessageDirection, NotificationLog, NotificationStatus,
    RegisteredButler, RequestContext,
};

/// Migrations for the tables the Switchboard owns on top of the four
/// universal per-butler tables from `butlerhub-storage`. `thread_affinity_settings`
/// and `thread_overrides` are not separate tables — both are small enough to
/// live as JSON blobs under the shared `state` KV table (see `triage.rs`).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS message_inbox (
            id                    TEXT PRIMARY KEY,
            received_at           TEXT NOT NULL,
            request_context       TEXT NOT NULL,
            raw_payload           TEXT NOT NULL,
            normalized_text       TEXT NOT NULL,
            direction             TEXT NOT NULL CHECK (direction IN ('inbound','outbound')),
            lifecycle_state       TEXT NOT NULL DEFAULT 'accepted',
            schema_version        TEXT NOT NULL,
            processing_metadata   TEXT NOT NULL DEFAULT '{}',
            decomposition_output  TEXT,
            dispatch_outcomes     TEXT,
            response_summary      TEXT,
            final_state_at        TEXT,
            trace_id              TEXT,
            session_id            TEXT,
            dedupe_key            TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_message_inbox_received
            ON message_inbox(received_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_message_inbox_dedupe
            ON message_inbox(dedupe_key);

        CREATE TABLE IF NOT EXISTS butler_registry (
            name                 TEXT PRIMARY KEY,
            modules              TEXT NOT NULL DEFAULT '[]',
            eligibility_state    TEXT NOT NULL DEFAULT 'active',
            liveness_ttl_seconds INTEGER NOT NULL DEFAULT 300,
            last_seen_at         TEXT,
            quarantined_at       TEXT,
            quarantine_reason    TEXT
        );

        CREATE TABLE IF NOT EXISTS butler_registry_eligibility_log (
            id              TEXT PRIMARY KEY,
            butler_name     TEXT NOT NULL,
            previous_state  TEXT NOT NULL,
            new_state       TEXT NOT NULL,
            reason          TEXT NOT NULL,
            observed_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_eligibility_log_butler
            ON butler_registry_eligibility_log(butler_name, observed_at);

        CREATE TABLE IF NOT EXISTS routing_history (
            id             TEXT PRIMARY KEY,
            channel        TEXT NOT NULL,
            thread_id      TEXT NOT NULL,
            target_butler  TEXT NOT NULL,
            routed_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_routing_history_thread
            ON routing_history(channel, thread_id, routed_at);

        CREATE TABLE IF NOT EXISTS notifications (
            id             TEXT PRIMARY KEY,
            source_butler  TEXT NOT NULL,
            channel        TEXT NOT NULL,
            recipient      TEXT NOT NULL,
            message        TEXT NOT NULL,
            status         TEXT NOT NULL CHECK (status IN ('sent','failed')),
            error          TEXT,
            trace_id       TEXT,
            metadata       TEXT NOT NULL DEFAULT '{}',
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_source
            ON notifications(source_butler, created_at DESC);",
    )?;
    Ok(())
}

// ── message_inbox ───────────────────────────────────────────────────────

pub struct NewInboxMessage<'a> {
    pub request_context: &'a RequestContext,
    pub raw_payload: &'a serde_json::Value,
    pub normalized_text: &'a str,
    pub direction: MessageDirection,
    pub schema_version: &'a str,
    /// `accepted` for inbound rows entering the pipeline; outbound mirror
    /// rows are born `completed` — nothing ever processes them.
    pub lifecycle_state: butlerhub_core::LifecycleState,
}

/// Returns the existing row when `dedupe_key` already exists (the
/// `ingest_v1` duplicate path), otherwise inserts a fresh row.
pub fn find_or_insert_inbox(conn: &Connection, new: NewInboxMessage<'_>) -> Result<(InboxMessage, bool)> {
    if let Some(existing) = find_by_dedupe_key(conn, &new.request_context.dedupe_key)? {
        return Ok((existing, false));
    }

    let id = Uuid::now_v7();
    let context_json = serde_json::to_string(new.request_context)?;
    let raw_json = serde_json::to_string(new.raw_payload)?;
    conn.execute(
        "INSERT INTO message_inbox (
            id, received_at, request_context, raw_payload, normalized_text,
            direction, lifecycle_state, schema_version, processing_metadata, dedupe_key
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '{}', ?9)",
        params![
            id.to_string(),
            new.request_context.received_at.to_rfc3339(),
            context_json,
            raw_json,
            new.normalized_text,
            new.direction.as_str(),
            new.lifecycle_state.to_string(),
            new.schema_version,
            new.request_context.dedupe_key,
        ],
    )?;

    let inserted = get(conn, id)?;
    Ok((inserted, true))
}

pub fn find_by_dedupe_key(conn: &Connection, dedupe_key: &str) -> Result<Option<InboxMessage>> {
    conn.query_row(
        "SELECT id, received_at, request_context, raw_payload, normalized_text, direction,
                lifecycle_state, schema_version, processing_metadata, decomposition_output,
                dispatch_outcomes, response_summary, final_state_at, trace_id, session_id
         FROM message_inbox WHERE dedupe_key = ?1",
        [dedupe_key],
        row_to_inbox_message,
    )
    .optional()?
    .transpose()
}

/// Looks an inbox row up by the `request_id` minted at ingest. The id lives
/// inside the `request_context` JSON column, so this goes through SQLite's
/// `json_extract` rather than a dedicated column.
pub fn find_by_request_id(conn: &Connection, request_id: Uuid) -> Result<Option<InboxMessage>> {
    conn.query_row(
        "SELECT id, received_at, request_context, raw_payload, normalized_text, direction,
                lifecycle_state, schema_version, processing_metadata, decomposition_output,
                dispatch_outcomes, response_summary, final_state_at, trace_id, session_id
         FROM message_inbox WHERE json_extract(request_context, '$.request_id') = ?1",
        [request_id.to_string()],
        row_to_inbox_message,
    )
    .optional()?
    .transpose()
}

pub fn get(conn: &Connection, id: Uuid) -> Result<InboxMessage> {
    conn.query_row(
        "SELECT id, received_at, request_context, raw_payload, normalized_text, direction,
                lifecycle_state, schema_version, processing_metadata, decomposition_output,
                dispatch_outcomes, response_summary, final_state_at, trace_id, session_id
         FROM message_inbox WHERE id = ?1",
        [id.to_string()],
        row_to_inbox_message,
    )
    .optional()?
    .transpose()?
    .ok_or_else(|| SwitchboardError::NotFound(format!("message_inbox {id}")))
}

pub fn mark_processing(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE message_inbox SET lifecycle_state = 'processing' WHERE id = ?1 AND lifecycle_state = 'accepted'",
        [id.to_string()],
    )?;
    Ok(())
}

pub fn mark_decomposed(conn: &Connection, id: Uuid, decomposition: &serde_json::Value) -> Result<()> {
    conn.execute(
        "UPDATE message_inbox SET decomposition_output = ?2 WHERE id = ?1",
        params![id.to_string(), serde_json::to_string(decomposition)?],
    )?;
    Ok(())
}

pub fn mark_completed(
    conn: &Connection,
    id: Uuid,
    dispatch_outcomes: &serde_json::Value,
    final_state: &str,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE message_inbox SET lifecycle_state = ?2, dispatch_outcomes = ?3, final_state_at = ?4 WHERE id = ?1",
        params![id.to_string(), final_state, serde_json::to_string(dispatch_outcomes)?, now],
    )?;
    Ok(())
}

fn row_to_inbox_message(row: &rusqlite::Row) -> rusqlite::Result<Result<InboxMessage>> {
    Ok((|| -> Result<InboxMessage> {
        let id: String = row.get(0)?;
        let context_raw: String = row.get(2)?;
        let payload_raw: String = row.get(3)?;
        let direction_raw: String = row.get(5)?;
        let lifecycle_raw: String = row.get(6)?;
        let metadata_raw: String = row.get(8)?;
        let decomposition_raw: Option<String> = row.get(9)?;
        let dispatch_raw: Option<String> = row.get(10)?;
        let response_raw: Option<String> = row.get(11)?;
        let final_state_at: Option<String> = row.get(12)?;
        let session_id: Option<String> = row.get(14)?;

        Ok(InboxMessage {
            id: Uuid::parse_str(&id).map_err(|e| SwitchboardError::Validation(e.to_string()))?,
            received_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
            request_context: serde_json::from_str(&context_raw)?,
            raw_payload: serde_json::from_str(&payload_raw)?,
            normalized_text: row.get(4)?,
            direction: direction_raw.parse()?,
            lifecycle_state: lifecycle_raw
                .parse()
                .map_err(|_| SwitchboardError::UnknownVariant(lifecycle_raw.clone()))?,
            schema_version: row.get(7)?,
            processing_metadata: serde_json::from_str(&metadata_raw)?,
            decomposition_output: decomposition_raw.map(|s| serde_json::from_str(&s)).transpose()?,
            dispatch_outcomes: dispatch_raw.map(|s| serde_json::from_str(&s)).transpose()?,
            response_summary: response_raw.map(|s| serde_json::from_str(&s)).transpose()?,
            final_state_at: final_state_at.map(|s| parse_rfc3339(&s)).transpose()?,
            trace_id: row.get(13)?,
            session_id: session_id
                .map(|s| Uuid::parse_str(&s).map_err(|e| SwitchboardError::Validation(e.to_string())))
                .transpose()?,
        })
    })())
}

fn parse_rfc3339(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| SwitchboardError::Validation(format!("bad timestamp {raw:?}: {e}")))
}

// ── butler_registry ─────────────────────────────────────────────────────

pub fn upsert_registration(conn: &Connection, name: &str, modules: &[String], liveness_ttl_seconds: i64) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO butler_registry (name, modules, eligibility_state, liveness_ttl_seconds, last_seen_at)
         VALUES (?1, ?2, 'active', ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            modules = excluded.modules,
            liveness_ttl_seconds = excluded.liveness_ttl_seconds,
            last_seen_at = excluded.last_seen_at,
            eligibility_state = CASE WHEN butler_registry.eligibility_state = 'quarantined'
                THEN butler_registry.eligibility_state ELSE 'active' END",
        params![name, serde_json::to_string(modules)?, liveness_ttl_seconds, now],
    )?;
    Ok(())
}

pub fn list_routable_butlers(conn: &Connection) -> Result<Vec<RegisteredButler>> {
    let mut stmt = conn.prepare(
        "SELECT name, modules, eligibility_state, liveness_ttl_seconds, last_seen_at, quarantined_at, quarantine_reason
         FROM butler_registry WHERE eligibility_state != 'quarantined' ORDER BY name",
    )?;
    let rows = stmt.query_map([], row_to_registered_butler)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn list_all_registered(conn: &Connection) -> Result<Vec<RegisteredButler>> {
    let mut stmt = conn.prepare(
        "SELECT name, modules, eligibility_state, liveness_ttl_seconds, last_seen_at, quarantined_at, quarantine_reason
         FROM butler_registry ORDER BY name",
    )?;
    let rows = stmt.query_map([], row_to_registered_butler)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn butlers_with_module(conn: &Connection, module: &str) -> Result<Vec<String>> {
    Ok(list_routable_butlers(conn)?
        .into_iter()
        .filter(|b| b.modules.iter().any(|m| m == module))
        .map(|b| b.name)
        .collect())
}

pub fn set_eligibility(
    conn: &Connection,
    name: &str,
    state: butlerhub_core::EligibilityState,
    reason: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE butler_registry SET eligibility_state = ?2,
            quarantined_at = CASE WHEN ?2 = 'quarantined' THEN ?3 ELSE quarantined_at END,
            quarantine_reason = CASE WHEN ?2 = 'quarantined' THEN ?4 ELSE quarantine_reason END
         WHERE name = ?1",
        params![name, state.to_string(), now, reason],
    )?;
    Ok(())
}

pub fn log_eligibility_transition(
    conn: &Connection,
    butler_name: &str,
    previous_state: &str,
    new_state: &str,
    reason: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO butler_registry_eligibility_log (id, butler_name, previous_state, new_state, reason, observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::now_v7().to_string(),
            butler_name,
            previous_state,
            new_state,
            reason,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_registered_butler(row: &rusqlite::Row) -> rusqlite::Result<Result<RegisteredButler>> {
    Ok((|| -> Result<RegisteredButler> {
        let modules_raw: String = row.get(1)?;
        let eligibility_raw: String = row.get(2)?;
        let last_seen: Option<String> = row.get(4)?;
        let quarantined_at: Option<String> = row.get(5)?;
        Ok(RegisteredButler {
            name: row.get(0)?,
            modules: serde_json::from_str(&modules_raw)?,
            eligibility_state: eligibility_raw
                .parse()
                .map_err(|_| SwitchboardError::UnknownVariant(eligibility_raw.clone()))?,
            liveness_ttl_seconds: row.get(3)?,
            last_seen_at: last_seen.map(|s| parse_rfc3339(&s)).transpose()?,
            quarantined_at: quarantined_at.map(|s| parse_rfc3339(&s)).transpose()?,
            quarantine_reason: row.get(6)?,
        })
    })())
}

// ── routing_history ─────────────────────────────────────────────────────

pub fn record_route(conn: &Connection, channel: &str, thread_id: &str, target_butler: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO routing_history (id, channel, thread_id, target_butler, routed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::now_v7().to_string(),
            channel,
            thread_id,
            target_butler,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Distinct `(target_butler, most_recent_routed_at)` pairs within
/// `since`, most recent first. The triage lookup decides HIT/CONFLICT/STALE
/// from the shape of this result.
pub fn recent_routes_for_thread(
    conn: &Connection,
    channel: &str,
    thread_id: &str,
    since: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<(String, chrono::DateTime<chrono::Utc>)>> {
    let mut stmt = conn.prepare(
        "SELECT target_butler, MAX(routed_at) FROM routing_history
         WHERE channel = ?1 AND thread_id = ?2 AND routed_at >= ?3
         GROUP BY target_butler ORDER BY MAX(routed_at) DESC",
    )?;
    let rows = stmt.query_map(params![channel, thread_id, since.to_rfc3339()], |row| {
        let butler: String = row.get(0)?;
        let routed_at: String = row.get(1)?;
        Ok((butler, routed_at))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (butler, routed_at) = row?;
        out.push((butler, parse_rfc3339(&routed_at)?));
    }
    Ok(out)
}

pub fn has_any_history_for_thread(conn: &Connection, channel: &str, thread_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM routing_history WHERE channel = ?1 AND thread_id = ?2",
        params![channel, thread_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ── notifications ───────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub fn log_notification(
    conn: &Connection,
    source_butler: &str,
    channel: &str,
    recipient: &str,
    message: &str,
    status: NotificationStatus,
    error: Option<&str>,
    trace_id: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<Uuid> {
    let id = Uuid::now_v7();
    conn.execute(
        "INSERT INTO notifications (id, source_butler, channel, recipient, message, status, error, trace_id, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id.to_string(),
            source_butler,
            channel,
            recipient,
            message,
            status.as_str(),
            error,
            trace_id,
            serde_json::to_string(metadata)?,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn
    }

    fn context(dedupe_key: &str) -> RequestContext {
        RequestContext {
            request_id: Uuid::now_v7(),
            received_at: chrono::Utc::now(),
            source_channel: "telegram".to_string(),
            source_endpoint_identity: "tg-bot-1".to_string(),
            source_sender_identity: "user-1".to_string(),
            source_thread_identity: None,
            dedupe_key: dedupe_key.to_string(),
            dedupe_strategy: DedupeStrategy::ExternalEventId,
            trace_context: None,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = conn();
        init_db(&conn).unwrap();
    }

    #[test]
    fn second_insert_with_same_dedupe_key_returns_existing_row() {
        let conn = conn();
        let ctx = context("event:telegram:tg-bot-1:evt-1");
        let payload = serde_json::json!({"raw": "hi"});
        let (first, created) = find_or_insert_inbox(
            &conn,
            NewInboxMessage {
                request_context: &ctx,
                raw_payload: &payload,
                normalized_text: "hi",
                direction: MessageDirection::Inbound,
                schema_version: "ingest.v1",
                lifecycle_state: butlerhub_core::LifecycleState::Accepted,
            },
        )
        .unwrap();
        assert!(created);

        let ctx2 = context("event:telegram:tg-bot-1:evt-1");
        let (second, created2) = find_or_insert_inbox(
            &conn,
            NewInboxMessage {
                request_context: &ctx2,
                raw_payload: &payload,
                normalized_text: "a different message entirely",
                direction: MessageDirection::Inbound,
                schema_version: "ingest.v1",
                lifecycle_state: butlerhub_core::LifecycleState::Accepted,
            },
        )
        .unwrap();
        assert!(!created2);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn registry_upsert_preserves_quarantine() {
        let conn = conn();
        upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        set_eligibility(&conn, "health", butlerhub_core::EligibilityState::Quarantined, Some("liveness_ttl_2x_expired")).unwrap();
        upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();

        let butlers = list_all_registered(&conn).unwrap();
        let health = butlers.iter().find(|b| b.name == "health").unwrap();
        assert_eq!(health.eligibility_state, butlerhub_core::EligibilityState::Quarantined);
    }

    #[test]
    fn routable_butlers_excludes_quarantined() {
        let conn = conn();
        upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        upsert_registration(&conn, "finance", &["finance".to_string()], 300).unwrap();
        set_eligibility(&conn, "finance", butlerhub_core::EligibilityState::Quarantined, Some("x")).unwrap();

        let routable = list_routable_butlers(&conn).unwrap();
        assert_eq!(routable.len(), 1);
        assert_eq!(routable[0].name, "health");
    }
}
