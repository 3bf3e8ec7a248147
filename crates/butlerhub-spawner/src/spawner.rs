use std::sync::{Arc, Mutex};
use std::time::Instant;

use rusqlite::Connection;
use tracing::instrument;

use butlerhub_sessions::{NewSession, Session, SessionOutcome, SessionStore};

use crate::error::Result;
use crate::runtime::{AgentRuntime, TurnRequest};

/// Drives one agent turn end to end: opens a session row, runs the turn
/// under the configured runtime, and closes the row out with the outcome.
/// This is the only place a butler process should call an `AgentRuntime` —
/// every other module asks the spawner to run a turn rather than holding a
/// runtime reference itself.
///
/// Takes the connection as `Arc<Mutex<Connection>>` and only holds the lock
/// around the session-row writes, never across the runtime call, so a slow
/// turn doesn't block every other database user in the process.
pub struct Spawner<R: AgentRuntime> {
    runtime: R,
}

impl<R: AgentRuntime> Spawner<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// Run one turn and persist its full lifecycle as a `sessions` row.
    /// Returns the completed row even when the turn failed — failure is
    /// recorded, not propagated as an error, unless the runtime itself
    /// could not be invoked at all.
    #[instrument(skip(self, conn, request), fields(trigger_source = %request.trigger_source))]
    pub async fn spawn(&self, conn: &Arc<Mutex<Connection>>, request: TurnRequest) -> Result<Session> {
        let started = Instant::now();
        let session = {
            let guard = conn.lock().expect("session connection poisoned");
            SessionStore::start(
                &guard,
                NewSession {
                    prompt: request.prompt.clone(),
                    trigger_source: request.trigger_source.clone(),
                    request_id: request.request_id,
                    parent_session_id: request.parent_session_id.clone(),
                    trace_id: request.trace_id.clone(),
                },
            )?
        };

        let outcome = self.runtime.run_turn(&request).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let session_outcome = match outcome {
            Ok(turn) => SessionOutcome {
                model: turn.model,
                success: turn.success,
                error: turn.error,
                result: turn.result,
                tool_calls: serde_json::to_value(&turn.tool_calls).unwrap_or_default(),
                duration_ms,
                input_tokens: turn.input_tokens,
                output_tokens: turn.output_tokens,
                cost: turn.cost,
            },
            Err(e) => SessionOutcome {
                success: false,
                error: Some(e.to_string()),
                duration_ms,
                ..Default::default()
            },
        };

        let guard = conn.lock().expect("session connection poisoned");
        SessionStore::complete(&guard, &session.id, session_outcome)?;
        SessionStore::get(&guard, &session.id)?
            .ok_or_else(|| butlerhub_sessions::SessionError::NotFound { id: session.id }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::StubRuntime;
    use butlerhub_core::TriggerSource;

    fn test_conn() -> Arc<Mutex<Connection>> {
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
        Arc::new(Mutex::new(conn))
    }

    #[tokio::test]
    async fn spawn_records_a_completed_session() {
        let conn = test_conn();
        let spawner = Spawner::new(StubRuntime);
        let session = spawner
            .spawn(
                &conn,
                TurnRequest {
                    prompt: "check inbox".to_string(),
                    trigger_source: TriggerSource::Tick,
                    request_id: None,
                    parent_session_id: None,
                    trace_id: None,
                    context: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(session.success, Some(true));
        assert!(session.completed_at.is_some());
        assert_eq!(session.result.as_deref(), Some("stub: check inbox"));
    }
}
