use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{ApprovalError, Result};
use crate::types::{
    ActionStatus, ApprovalEvent, ApprovalEventType, ApprovalRule, PendingAction,
};

/// Creates the three approval tables this crate owns, per the
/// `butlerhub-storage` ownership boundary: core tables (`state`,
/// `scheduled_tasks`, `sessions`, `route_inbox`) are migrated once for every
/// butler by `butlerhub-storage`; module-specific tables are migrated by
/// whichever crate owns that module, against the same connection.
pub fn run_approval_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS pending_actions (
            id                TEXT PRIMARY KEY,
            tool_name         TEXT NOT NULL,
            tool_args         TEXT NOT NULL,
            agent_summary     TEXT NOT NULL,
            session_id        TEXT,
            status            TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','approved','rejected','executed','expired')),
            requested_at      TEXT NOT NULL,
            expires_at        TEXT NOT NULL,
            decided_by        TEXT,
            decided_at        TEXT,
            approval_rule_id  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_pending_actions_status
            ON pending_actions(status, expires_at);

        CREATE TABLE IF NOT EXISTS approval_rules (
            id               TEXT PRIMARY KEY,
            tool_name        TEXT NOT NULL,
            arg_constraints  TEXT NOT NULL DEFAULT '{}',
            description      TEXT,
            created_at       TEXT NOT NULL,
            expires_at       TEXT,
            max_uses         INTEGER,
            use_count        INTEGER NOT NULL DEFAULT 0,
            active           INTEGER NOT NULL DEFAULT 1,
            created_from     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_approval_rules_tool
            ON approval_rules(tool_name, active);

        CREATE TABLE IF NOT EXISTS approval_events (
            id           TEXT PRIMARY KEY,
            action_id    TEXT NOT NULL,
            event_type   TEXT NOT NULL,
            actor        TEXT NOT NULL,
            occurred_at  TEXT NOT NULL,
            reason       TEXT,
            metadata     TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_approval_events_action
            ON approval_events(action_id, occurred_at);

        CREATE TRIGGER IF NOT EXISTS approval_events_no_update
            BEFORE UPDATE ON approval_events
        BEGIN
            SELECT RAISE(ABORT, 'approval_events is append-only');
        END;
        CREATE TRIGGER IF NOT EXISTS approval_events_no_delete
            BEFORE DELETE ON approval_events
        BEGIN
            SELECT RAISE(ABORT, 'approval_events is append-only');
        END;",
    )?;
    Ok(())
}

pub(crate) fn insert_pending_action(conn: &Connection, action: &PendingAction) -> Result<()> {
    conn.execute(
        "INSERT INTO pending_actions
         (id, tool_name, tool_args, agent_summary, session_id, status, requested_at,
          expires_at, decided_by, decided_at, approval_rule_id)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
        rusqlite::params![
            action.id.to_string(),
            action.tool_name,
            serde_json::to_string(&action.tool_args)?,
            action.agent_summary,
            action.session_id,
            action.status.to_string(),
            action.requested_at.to_rfc3339(),
            action.expires_at.to_rfc3339(),
            action.decided_by,
            action.decided_at.map(|d| d.to_rfc3339()),
            action.approval_rule_id.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn get_pending_action(conn: &Connection, id: Uuid) -> Result<PendingAction> {
    conn.query_row(
        "SELECT id, tool_name, tool_args, agent_summary, session_id, status, requested_at, \
         expires_at, decided_by, decided_at, approval_rule_id FROM pending_actions WHERE id = ?1",
        [id.to_string()],
        row_to_action,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => ApprovalError::ActionNotFound { id },
        other => ApprovalError::Database(other),
    })?
}

/// Transition `pending → {approved, rejected}` guarded by a CAS on the
/// current status — a zero-row update means another decider already acted.
pub(crate) fn decide_action(
    conn: &Connection,
    id: Uuid,
    new_status: ActionStatus,
    decided_by: &str,
    now: DateTime<Utc>,
    approval_rule_id: Option<Uuid>,
) -> Result<()> {
    let rows = conn.execute(
        "UPDATE pending_actions SET status = ?1, decided_by = ?2, decided_at = ?3, \
         approval_rule_id = COALESCE(?4, approval_rule_id) \
         WHERE id = ?5 AND status = 'pending'",
        rusqlite::params![
            new_status.to_string(),
            decided_by,
            now.to_rfc3339(),
            approval_rule_id.map(|id| id.to_string()),
            id.to_string(),
        ],
    )?;
    if rows == 0 {
        return Err(ApprovalError::StateConflict { id });
    }
    Ok(())
}

pub(crate) fn mark_executed(conn: &Connection, id: Uuid) -> Result<()> {
    let rows = conn.execute(
        "UPDATE pending_actions SET status = 'executed' WHERE id = ?1 AND status = 'approved'",
        [id.to_string()],
    )?;
    if rows == 0 {
        return Err(ApprovalError::NotDecidable { id });
    }
    Ok(())
}

pub(crate) fn sweep_expired(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let now_str = now.to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id FROM pending_actions WHERE status = 'pending' AND expires_at < ?1",
    )?;
    let ids: Vec<Uuid> = stmt
        .query_map([&now_str], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .filter_map(|s| Uuid::parse_str(&s).ok())
        .collect();

    conn.execute(
        "UPDATE pending_actions SET status = 'expired' WHERE status = 'pending' AND expires_at < ?1",
        [&now_str],
    )?;
    Ok(ids)
}

fn row_to_action(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PendingAction>> {
    Ok(read_action(row))
}

fn read_action(row: &rusqlite::Row<'_>) -> Result<PendingAction> {
    let id: String = row.get(0)?;
    let tool_args_raw: String = row.get(2)?;
    let status_raw: String = row.get(5)?;
    let requested_at_raw: String = row.get(6)?;
    let expires_at_raw: String = row.get(7)?;
    let decided_at_raw: Option<String> = row.get(9)?;
    let approval_rule_id_raw: Option<String> = row.get(10)?;

    Ok(PendingAction {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tool_name: row.get(1)?,
        tool_args: serde_json::from_str(&tool_args_raw)?,
        agent_summary: row.get(3)?,
        session_id: row.get(4)?,
        status: status_raw.parse().unwrap_or(ActionStatus::Pending),
        requested_at: parse_rfc3339(&requested_at_raw),
        expires_at: parse_rfc3339(&expires_at_raw),
        decided_by: row.get(8)?,
        decided_at: decided_at_raw.as_deref().map(parse_rfc3339),
        approval_rule_id: approval_rule_id_raw.and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn active_rules_for_tool(conn: &Connection, tool_name: &str) -> Result<Vec<ApprovalRule>> {
    let mut stmt = conn.prepare(
        "SELECT id, tool_name, arg_constraints, description, created_at, expires_at, max_uses, \
         use_count, active, created_from FROM approval_rules WHERE tool_name = ?1 AND active = 1",
    )?;
    let rows = stmt.query_map([tool_name], row_to_rule)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ApprovalRule>> {
    let id: String = row.get(0)?;
    let arg_constraints_raw: String = row.get(2)?;
    let created_at_raw: String = row.get(4)?;
    let expires_at_raw: Option<String> = row.get(5)?;
    let created_from_raw: Option<String> = row.get(9)?;

    let arg_constraints = match serde_json::from_str(&arg_constraints_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(ApprovalError::Malformed(e))),
    };

    Ok(Ok(ApprovalRule {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tool_name: row.get(1)?,
        arg_constraints,
        description: row.get(3)?,
        created_at: parse_rfc3339(&created_at_raw),
        expires_at: expires_at_raw.as_deref().map(parse_rfc3339),
        max_uses: row.get(6)?,
        use_count: row.get(7)?,
        active: row.get(8)?,
        created_from: created_from_raw.and_then(|s| Uuid::parse_str(&s).ok()),
    }))
}

pub(crate) fn insert_rule(conn: &Connection, rule: &ApprovalRule) -> Result<()> {
    conn.execute(
        "INSERT INTO approval_rules
         (id, tool_name, arg_constraints, description, created_at, expires_at, max_uses,
          use_count, active, created_from)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        rusqlite::params![
            rule.id.to_string(),
            rule.tool_name,
            serde_json::to_string(&rule.arg_constraints)?,
            rule.description,
            rule.created_at.to_rfc3339(),
            rule.expires_at.map(|d| d.to_rfc3339()),
            rule.max_uses,
            rule.use_count,
            rule.active,
            rule.created_from.map(|id| id.to_string()),
        ],
    )?;
    Ok(())
}

pub(crate) fn increment_rule_use_count(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE approval_rules SET use_count = use_count + 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(())
}

pub(crate) fn append_event(
    conn: &Connection,
    action_id: Uuid,
    event_type: ApprovalEventType,
    actor: &str,
    reason: Option<&str>,
    metadata: serde_json::Value,
) -> Result<()> {
    conn.execute(
        "INSERT INTO approval_events (id, action_id, event_type, actor, occurred_at, reason, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            action_id.to_string(),
            event_type.to_string(),
            actor,
            Utc::now().to_rfc3339(),
            reason,
            serde_json::to_string(&metadata)?,
        ],
    )?;
    Ok(())
}

pub fn list_events_for_action(conn: &Connection, action_id: Uuid) -> Result<Vec<ApprovalEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, action_id, event_type, actor, occurred_at, reason, metadata \
         FROM approval_events WHERE action_id = ?1 ORDER BY occurred_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([action_id.to_string()], row_to_event)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ApprovalEvent>> {
    let id: String = row.get(0)?;
    let action_id: String = row.get(1)?;
    let event_type_raw: String = row.get(2)?;
    let occurred_at_raw: String = row.get(4)?;
    let metadata_raw: String = row.get(6)?;

    let event_type = match event_type_raw.as_str() {
        "action_queued" => ApprovalEventType::ActionQueued,
        "action_auto_approved" => ApprovalEventType::ActionAutoApproved,
        "action_approved" => ApprovalEventType::ActionApproved,
        "action_rejected" => ApprovalEventType::ActionRejected,
        "action_expired" => ApprovalEventType::ActionExpired,
        "action_execution_succeeded" => ApprovalEventType::ActionExecutionSucceeded,
        "action_execution_failed" => ApprovalEventType::ActionExecutionFailed,
        "rule_created" => ApprovalEventType::RuleCreated,
        "rule_revoked" => ApprovalEventType::RuleRevoked,
        other => return Ok(Err(ApprovalError::UnknownEventType(other.to_string()))),
    };
    let metadata = match serde_json::from_str(&metadata_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(ApprovalError::Malformed(e))),
    };

    Ok(Ok(ApprovalEvent {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        action_id: Uuid::parse_str(&action_id).unwrap_or_default(),
        event_type,
        actor: row.get(3)?,
        occurred_at: parse_rfc3339(&occurred_at_raw),
        reason: row.get(5)?,
        metadata,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_approval_migrations(&conn).unwrap();
        run_approval_migrations(&conn).unwrap();
    }

    #[test]
    fn approval_events_rejects_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        run_approval_migrations(&conn).unwrap();
        let action_id = Uuid::new_v4();
        append_event(
            &conn,
            action_id,
            ApprovalEventType::ActionQueued,
            "system",
            None,
            serde_json::json!({}),
        )
        .unwrap();

        let update = conn.execute("UPDATE approval_events SET actor = 'tamper'", []);
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM approval_events", []);
        assert!(delete.is_err());

        let events = list_events_for_action(&conn, action_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "system");
    }
}
