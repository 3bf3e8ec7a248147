use rusqlite::Connection;

use crate::error::Result;

/// Tables every butler's own database file carries, regardless of which
/// optional modules it loads: the KV `state` table, the cron-driven
/// `scheduled_tasks` table, the append-only `sessions` audit log, and
/// `route_inbox` for `route.execute` hand-offs. Module-specific tables
/// (approval, entities, messenger, education, …) are migrated separately by
/// the crate that owns them, against the same connection.
pub fn run_butler_migrations(conn: &Connection, butler_name: &str) -> Result<()> {
    create_state_table(conn)?;
    create_scheduled_tasks_table(conn)?;
    create_sessions_table(conn)?;
    create_route_inbox_table(conn)?;
    tracing::debug!(butler = butler_name, "ran core butler migrations");
    Ok(())
}

fn create_state_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            version    INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn create_scheduled_tasks_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id            TEXT PRIMARY KEY,
            name          TEXT NOT NULL UNIQUE,
            cron          TEXT NOT NULL,
            dispatch_mode TEXT NOT NULL CHECK (dispatch_mode IN ('prompt','job')),
            prompt        TEXT,
            job_name      TEXT,
            job_args      TEXT,
            timezone      TEXT NOT NULL DEFAULT 'UTC',
            start_at      TEXT,
            end_at        TEXT,
            until_at      TEXT,
            enabled       INTEGER NOT NULL DEFAULT 1,
            next_run_at   TEXT,
            last_run_at   TEXT,
            last_result   TEXT,
            created_at    TEXT NOT NULL,
            CHECK (dispatch_mode != 'prompt' OR (prompt IS NOT NULL AND job_name IS NULL)),
            CHECK (dispatch_mode != 'job' OR job_name IS NOT NULL),
            CHECK (end_at IS NULL OR start_at IS NULL OR end_at > start_at),
            CHECK (until_at IS NULL OR start_at IS NULL OR until_at >= start_at)
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_enabled
            ON scheduled_tasks(enabled, next_run_at);",
    )?;
    Ok(())
}

fn create_sessions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            prompt            TEXT NOT NULL,
            trigger_source    TEXT NOT NULL,
            model             TEXT,
            success           INTEGER,
            error             TEXT,
            result            TEXT,
            tool_calls        TEXT NOT NULL DEFAULT '[]',
            duration_ms       INTEGER,
            trace_id          TEXT,
            request_id        TEXT,
            input_tokens      INTEGER,
            output_tokens     INTEGER,
            cost              REAL,
            parent_session_id TEXT,
            started_at        TEXT NOT NULL,
            completed_at      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_request
            ON sessions(request_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_started
            ON sessions(started_at DESC);",
    )?;
    Ok(())
}

fn create_route_inbox_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS route_inbox (
            id              TEXT PRIMARY KEY,
            received_at     TEXT NOT NULL,
            route_envelope  TEXT NOT NULL,
            lifecycle_state TEXT NOT NULL DEFAULT 'accepted'
                CHECK (lifecycle_state IN ('accepted','processing','processed','errored')),
            processed_at    TEXT,
            session_id      TEXT,
            error           TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_route_inbox_state
            ON route_inbox(lifecycle_state, received_at);",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_butler_migrations(&conn, "general").unwrap();
        run_butler_migrations(&conn, "general").unwrap();
    }

    #[test]
    fn scheduled_tasks_rejects_prompt_mode_without_prompt() {
        let conn = Connection::open_in_memory().unwrap();
        run_butler_migrations(&conn, "general").unwrap();
        let result = conn.execute(
            "INSERT INTO scheduled_tasks (id, name, cron, dispatch_mode, created_at)
             VALUES ('t1', 'daily', '0 9 * * *', 'prompt', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
