use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::{Result, StorageError};
use crate::migrations;

/// A butler's own SQLite file plus a read-only attachment of `shared.db`.
/// Simulates the Postgres per-schema isolation model: writing anything to
/// `shared` fails at the SQLite layer (the attached handle is opened
/// read-only), and no butler ever opens another butler's file.
pub struct ButlerDb {
    pub conn: Connection,
    pub butler_name: String,
}

impl ButlerDb {
    /// Opens (creating if absent) `{data_dir}/{butler_name}.db`, attaches
    /// `{data_dir}/shared.db` as `shared` (read-only), and runs migrations
    /// for both.
    pub fn open(data_dir: &str, butler_name: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let own_path = butler_db_path(data_dir, butler_name);
        let shared_path = shared_db_path(data_dir);

        // Ensure shared.db exists before attaching read-only — SQLite's
        // mode=ro refuses to create a missing file. Its schema (contacts,
        // entity facts, …) is migrated by whichever butler owns that
        // module when it opens shared.db read-write; see
        // `open_shared_for_write`.
        if !shared_path.exists() {
            Connection::open(&shared_path)?;
        }

        let conn = Connection::open(&own_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;

        let shared_uri = format!("file:{}?mode=ro", shared_path.display());
        conn.execute("ATTACH DATABASE ?1 AS shared", [shared_uri])?;

        migrations::run_butler_migrations(&conn, butler_name)?;

        Ok(Self {
            conn,
            butler_name: butler_name.to_string(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(butler_name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_butler_migrations(&conn, butler_name)?;
        Ok(Self {
            conn,
            butler_name: butler_name.to_string(),
        })
    }

    /// Read a value from the shared KV `state` table by key.
    pub fn state_get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        state_get(&self.conn, key)
    }

    /// Last-writer-wins upsert with a monotonic `version` column.
    pub fn state_set(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        state_set(&self.conn, key, value)
    }

    /// Hands the connection off behind the `Arc<Mutex<_>>` every long-lived
    /// loop (scheduler tick, route_inbox worker, HTTP handlers) shares.
    pub fn into_shared(self) -> std::sync::Arc<std::sync::Mutex<Connection>> {
        std::sync::Arc::new(std::sync::Mutex::new(self.conn))
    }
}

/// Free-function form of [`ButlerDb::state_get`] for callers that hold the
/// connection behind a shared lock rather than a `ButlerDb`.
pub fn state_get(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let mut stmt = conn.prepare("SELECT value FROM state WHERE key = ?1")?;
    let mut rows = stmt.query([key])?;
    if let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}

/// Free-function form of [`ButlerDb::state_set`].
pub fn state_set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO state (key, value, version, updated_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            version = state.version + 1,
            updated_at = excluded.updated_at",
        rusqlite::params![key, raw, now],
    )?;
    Ok(())
}

/// Opens `shared.db` read-write. Only the butler(s) that own a shared-schema
/// module (contacts, entity resolution) should call this at startup to run
/// their migrations; every other butler only ever attaches it read-only via
/// [`ButlerDb::open`].
pub fn open_shared_for_write(data_dir: &str) -> Result<Connection> {
    std::fs::create_dir_all(data_dir)?;
    let conn = Connection::open(shared_db_path(data_dir))?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    Ok(conn)
}

pub fn butler_db_path(data_dir: &str, butler_name: &str) -> PathBuf {
    Path::new(data_dir).join(format!("{butler_name}.db"))
}

pub fn shared_db_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("shared.db")
}

/// Converts a `rusqlite::Error` into the `butlerhub-core` error wrapper at
/// the storage boundary, so callers outside this crate never need rusqlite
/// in their own dependency list just to propagate a database error.
pub fn to_butler_error(err: StorageError) -> butlerhub_core::ButlerError {
    butlerhub_core::ButlerError::Database(butlerhub_core::error::rusqlite_compat::RusqliteError(
        err.to_string(),
    ))
}
