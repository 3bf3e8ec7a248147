use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{MessengerError, Result};
use crate::types::{DeliveryIntent, DeliveryReceipt, DeliveryRequest, DeliveryStatus, ReceiptType};

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS delivery_requests (
            id                      TEXT PRIMARY KEY NOT NULL,
            idempotency_key         TEXT NOT NULL UNIQUE,
            request_id              TEXT,
            origin_butler           TEXT NOT NULL,
            channel                 TEXT NOT NULL,
            intent                  TEXT NOT NULL,
            target_identity         TEXT NOT NULL,
            message_content         TEXT NOT NULL,
            subject                 TEXT,
            request_envelope        TEXT NOT NULL DEFAULT '{}',
            status                  TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','in_progress','delivered','failed','dead_lettered')),
            terminal_error_class    TEXT,
            terminal_error_message  TEXT,
            terminal_at             TEXT,
            created_at              TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_requests_status ON delivery_requests(status);

        CREATE TABLE IF NOT EXISTS delivery_receipts (
            id                      TEXT PRIMARY KEY NOT NULL,
            delivery_request_id     TEXT NOT NULL REFERENCES delivery_requests(id) ON DELETE CASCADE,
            provider_delivery_id    TEXT,
            receipt_type            TEXT NOT NULL,
            received_at             TEXT NOT NULL,
            metadata                TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_receipts_request
            ON delivery_receipts(delivery_request_id);",
    )?;
    Ok(())
}

/// Inserts a new `pending` `delivery_request` for `idempotency_key`, or — if
/// a row already exists for that key — returns it untouched. The caller
/// inspects `created` to know whether it owns the at-most-one provider call.
pub struct InsertOutcome {
    pub request: DeliveryRequest,
    pub created: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn create_or_get(
    conn: &Connection,
    idempotency_key: &str,
    request_id: Option<Uuid>,
    origin_butler: &str,
    channel: &str,
    intent: DeliveryIntent,
    target_identity: &str,
    message_content: &str,
    subject: Option<&str>,
    request_envelope: &serde_json::Value,
) -> Result<InsertOutcome> {
    let id = Uuid::now_v7();
    let now = Utc::now();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO delivery_requests
         (id, idempotency_key, request_id, origin_butler, channel, intent,
          target_identity, message_content, subject, request_envelope, status, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,'pending',?11)",
        rusqlite::params![
            id.to_string(),
            idempotency_key,
            request_id.map(|r| r.to_string()),
            origin_butler,
            channel,
            intent.to_string(),
            target_identity,
            message_content,
            subject,
            serde_json::to_string(request_envelope)?,
            now.to_rfc3339(),
        ],
    )?;

    let request = get_by_idempotency_key(conn, idempotency_key)?
        .ok_or_else(|| MessengerError::Inconsistent(idempotency_key.to_string()))?;
    Ok(InsertOutcome { request, created: inserted == 1 })
}

const REQUEST_COLUMNS: &str = "id, idempotency_key, request_id, origin_butler, channel, intent, \
     target_identity, message_content, subject, request_envelope, status, \
     terminal_error_class, terminal_error_message, terminal_at, created_at";

pub fn get_by_idempotency_key(conn: &Connection, idempotency_key: &str) -> Result<Option<DeliveryRequest>> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM delivery_requests WHERE idempotency_key = ?1");
    match conn.query_row(&sql, [idempotency_key], row_to_request) {
        Ok(r) => Ok(Some(r?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn get(conn: &Connection, id: Uuid) -> Result<DeliveryRequest> {
    let sql = format!("SELECT {REQUEST_COLUMNS} FROM delivery_requests WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], row_to_request)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => MessengerError::NotFound(id),
            other => MessengerError::Database(other),
        })?
}

/// CAS `pending -> in_progress`, claiming the single provider call for this
/// request. Returns `false` if another worker already claimed it.
pub fn try_claim_in_progress(conn: &Connection, id: Uuid) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE delivery_requests SET status = 'in_progress' WHERE id = ?1 AND status = 'pending'",
        [id.to_string()],
    )?;
    Ok(updated == 1)
}

pub fn mark_delivered(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE delivery_requests SET status = 'delivered', terminal_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: Uuid, terminal: DeliveryStatus, class: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE delivery_requests
         SET status = ?2, terminal_error_class = ?3, terminal_error_message = ?4, terminal_at = ?5
         WHERE id = ?1",
        rusqlite::params![id.to_string(), terminal.as_str(), class, message, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn record_receipt(
    conn: &Connection,
    delivery_request_id: Uuid,
    provider_delivery_id: Option<&str>,
    receipt_type: ReceiptType,
    metadata: &serde_json::Value,
) -> Result<DeliveryReceipt> {
    let receipt = DeliveryReceipt {
        id: Uuid::now_v7(),
        delivery_request_id,
        provider_delivery_id: provider_delivery_id.map(|s| s.to_string()),
        receipt_type,
        received_at: Utc::now(),
        metadata: metadata.clone(),
    };
    conn.execute(
        "INSERT INTO delivery_receipts
         (id, delivery_request_id, provider_delivery_id, receipt_type, received_at, metadata)
         VALUES (?1,?2,?3,?4,?5,?6)",
        rusqlite::params![
            receipt.id.to_string(),
            receipt.delivery_request_id.to_string(),
            receipt.provider_delivery_id,
            receipt.receipt_type.as_str(),
            receipt.received_at.to_rfc3339(),
            serde_json::to_string(&receipt.metadata)?,
        ],
    )?;
    Ok(receipt)
}

/// The provider delivery id bound by the `sent` receipt for a request, if
/// the provider returned one. Duplicate callers replaying a terminal
/// `delivered` result observe this id.
pub fn sent_provider_delivery_id(conn: &Connection, delivery_request_id: Uuid) -> Result<Option<String>> {
    match conn.query_row(
        "SELECT provider_delivery_id FROM delivery_receipts
         WHERE delivery_request_id = ?1 AND receipt_type = 'sent'
         ORDER BY received_at ASC LIMIT 1",
        [delivery_request_id.to_string()],
        |row| row.get::<_, Option<String>>(0),
    ) {
        Ok(id) => Ok(id),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<DeliveryRequest>> {
    let id: String = row.get(0)?;
    let request_id_raw: Option<String> = row.get(2)?;
    let intent_raw: String = row.get(5)?;
    let envelope_raw: String = row.get(9)?;
    let status_raw: String = row.get(10)?;
    let terminal_at_raw: Option<String> = row.get(13)?;
    let created_at_raw: String = row.get(14)?;

    let envelope = match serde_json::from_str(&envelope_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(e.into())),
    };
    let intent = match intent_raw.parse() {
        Ok(v) => v,
        Err(()) => return Ok(Err(MessengerError::UnknownVariant(intent_raw))),
    };
    let status = match status_raw.parse() {
        Ok(v) => v,
        Err(()) => return Ok(Err(MessengerError::UnknownVariant(status_raw))),
    };

    Ok(Ok(DeliveryRequest {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        idempotency_key: row.get(1)?,
        request_id: request_id_raw.and_then(|s| Uuid::parse_str(&s).ok()),
        origin_butler: row.get(3)?,
        channel: row.get(4)?,
        intent,
        target_identity: row.get(6)?,
        message_content: row.get(7)?,
        subject: row.get(8)?,
        request_envelope: envelope,
        status,
        terminal_error_class: row.get(11)?,
        terminal_error_message: row.get(12)?,
        terminal_at: terminal_at_raw.as_deref().map(parse_rfc3339),
        created_at: parse_rfc3339(&created_at_raw),
    }))
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn duplicate_idempotency_key_returns_existing_row() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let first = create_or_get(
            &conn, "key-1", None, "relationship", "telegram", DeliveryIntent::Send,
            "alice", "hi", None, &serde_json::json!({}),
        ).unwrap();
        assert!(first.created);

        let second = create_or_get(
            &conn, "key-1", None, "relationship", "telegram", DeliveryIntent::Send,
            "alice", "hi", None, &serde_json::json!({}),
        ).unwrap();
        assert!(!second.created);
        assert_eq!(first.request.id, second.request.id);
    }

    #[test]
    fn only_one_worker_claims_in_progress() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let outcome = create_or_get(
            &conn, "key-2", None, "relationship", "telegram", DeliveryIntent::Send,
            "alice", "hi", None, &serde_json::json!({}),
        ).unwrap();

        assert!(try_claim_in_progress(&conn, outcome.request.id).unwrap());
        assert!(!try_claim_in_progress(&conn, outcome.request.id).unwrap());
    }
}
