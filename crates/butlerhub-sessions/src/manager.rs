use rusqlite::Connection;
use tracing::instrument;
use uuid::Uuid;

use butlerhub_core::{RequestId, TriggerSource};

use crate::error::{Result, SessionError};
use crate::types::{
    trigger_source_from_column, trigger_source_to_column, NewSession, Session, SessionOutcome,
};

/// Append-only store over a butler's own `sessions` table. Every method
/// operates on an already-migrated connection (see
/// `butlerhub_storage::ButlerDb::open`); this crate does not own the table's
/// schema, only the typed access to it.
pub struct SessionStore;

impl SessionStore {
    /// Insert a new in-flight session row and return its hydrated record.
    #[instrument(skip(conn, new), fields(trigger_source = %new.trigger_source))]
    pub fn start(conn: &Connection, new: NewSession) -> Result<Session> {
        let id = Uuid::now_v7().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let trigger_source_col = trigger_source_to_column(&new.trigger_source);
        let request_id_col = new.request_id.map(|r| r.to_string());

        conn.execute(
            "INSERT INTO sessions
             (id, prompt, trigger_source, tool_calls, request_id, parent_session_id, trace_id, started_at)
             VALUES (?1, ?2, ?3, '[]', ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                new.prompt,
                trigger_source_col,
                request_id_col,
                new.parent_session_id,
                new.trace_id,
                now,
            ],
        )?;

        Self::get(conn, &id)?.ok_or_else(|| SessionError::NotFound { id: id.clone() })
    }

    /// Record the terminal outcome of a session. Only the completion columns
    /// are touched — `prompt`, `trigger_source`, and `started_at` are
    /// immutable once written.
    #[instrument(skip(conn, outcome), fields(id, success = outcome.success))]
    pub fn complete(conn: &Connection, id: &str, outcome: SessionOutcome) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let tool_calls = serde_json::to_string(&outcome.tool_calls)?;
        let rows_changed = conn.execute(
            "UPDATE sessions
             SET model = ?1, success = ?2, error = ?3, result = ?4, tool_calls = ?5,
                 duration_ms = ?6, input_tokens = ?7, output_tokens = ?8, cost = ?9,
                 completed_at = ?10
             WHERE id = ?11",
            rusqlite::params![
                outcome.model,
                outcome.success,
                outcome.error,
                outcome.result,
                tool_calls,
                outcome.duration_ms,
                outcome.input_tokens,
                outcome.output_tokens,
                outcome.cost,
                now,
                id,
            ],
        )?;
        if rows_changed == 0 {
            return Err(SessionError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Fetch a single session by id.
    pub fn get(conn: &Connection, id: &str) -> Result<Option<Session>> {
        match conn.query_row(SELECT_BY_ID, rusqlite::params![id], row_to_session) {
            Ok(s) => s.map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SessionError::Database(e)),
        }
    }

    /// List the most recent sessions, newest first.
    pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Session>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY started_at DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![limit as i64], row_to_session)?;
        collect_rows(rows)
    }

    /// List every session correlated with a given request id, oldest first —
    /// used to reconstruct the fan-out of one ingest event across butlers.
    pub fn list_by_request(conn: &Connection, request_id: &RequestId) -> Result<Vec<Session>> {
        let sql = format!("{SELECT_COLUMNS} WHERE request_id = ?1 ORDER BY started_at ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![request_id.to_string()], row_to_session)?;
        collect_rows(rows)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, prompt, trigger_source, model, success, error, result, \
     tool_calls, duration_ms, trace_id, request_id, input_tokens, output_tokens, cost, \
     parent_session_id, started_at, completed_at FROM sessions";

const SELECT_BY_ID: &str = "SELECT id, prompt, trigger_source, model, success, error, result, \
     tool_calls, duration_ms, trace_id, request_id, input_tokens, output_tokens, cost, \
     parent_session_id, started_at, completed_at FROM sessions WHERE id = ?1";

fn collect_rows(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Result<Session>>>,
) -> Result<Vec<Session>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Session>> {
    let trigger_source_col: String = row.get(2)?;
    let tool_calls_raw: String = row.get(7)?;
    let request_id_col: Option<String> = row.get(10)?;

    let tool_calls = match serde_json::from_str(&tool_calls_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(SessionError::Malformed(e))),
    };
    let request_id = request_id_col.and_then(|s| s.parse::<RequestId>().ok());

    Ok(Ok(Session {
        id: row.get(0)?,
        prompt: row.get(1)?,
        trigger_source: trigger_source_from_column(&trigger_source_col),
        model: row.get(3)?,
        success: row.get(4)?,
        error: row.get(5)?,
        result: row.get(6)?,
        tool_calls,
        duration_ms: row.get(8)?,
        trace_id: row.get(9)?,
        request_id,
        input_tokens: row.get(11)?,
        output_tokens: row.get(12)?,
        cost: row.get(13)?,
        parent_session_id: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE sessions (
                id TEXT PRIMARY KEY, prompt TEXT NOT NULL, trigger_source TEXT NOT NULL,
                model TEXT, success INTEGER, error TEXT, result TEXT,
                tool_calls TEXT NOT NULL DEFAULT '[]', duration_ms INTEGER, trace_id TEXT,
                request_id TEXT, input_tokens INTEGER, output_tokens INTEGER, cost REAL,
                parent_session_id TEXT, started_at TEXT NOT NULL, completed_at TEXT
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn start_then_complete_round_trips() {
        let conn = test_conn();
        let session = SessionStore::start(
            &conn,
            NewSession {
                prompt: "summarize today".to_string(),
                trigger_source: TriggerSource::Tick,
                request_id: None,
                parent_session_id: None,
                trace_id: None,
            },
        )
        .unwrap();
        assert!(session.success.is_none());

        SessionStore::complete(
            &conn,
            &session.id,
            SessionOutcome {
                model: Some("claude".to_string()),
                success: true,
                result: Some("done".to_string()),
                tool_calls: serde_json::json!([{"tool": "search"}]),
                duration_ms: 1200,
                ..Default::default()
            },
        )
        .unwrap();

        let fetched = SessionStore::get(&conn, &session.id).unwrap().unwrap();
        assert_eq!(fetched.success, Some(true));
        assert_eq!(fetched.model.as_deref(), Some("claude"));
        assert!(fetched.completed_at.is_some());
    }

    #[test]
    fn complete_unknown_id_returns_not_found() {
        let conn = test_conn();
        let err = SessionStore::complete(&conn, "missing", SessionOutcome::default()).unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[test]
    fn list_by_request_orders_oldest_first() {
        let conn = test_conn();
        let request_id = RequestId::new();
        for prompt in ["first", "second"] {
            SessionStore::start(
                &conn,
                NewSession {
                    prompt: prompt.to_string(),
                    trigger_source: TriggerSource::Route,
                    request_id: Some(request_id),
                    parent_session_id: None,
                    trace_id: None,
                },
            )
            .unwrap();
        }
        let sessions = SessionStore::list_by_request(&conn, &request_id).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].prompt, "first");
    }
}
