use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::schedule::compute_next_run_at;
use crate::types::{DispatchMode, DispatchOutcome, NewScheduledTask, ScheduledTask, TaskDispatcher};

/// Typed CRUD over the `scheduled_tasks` table. Table creation is owned by
/// `butlerhub-storage`'s core migrations; this crate only reads and writes
/// rows against a connection it's handed.
pub struct ScheduledTaskStore;

impl ScheduledTaskStore {
    #[instrument(skip(conn, new), fields(name = %new.name))]
    pub fn create(conn: &Connection, new: NewScheduledTask) -> Result<ScheduledTask> {
        let now = Utc::now();
        let anchor = new.start_at.map(|s| s.max(now)).unwrap_or(now);
        let next_run_at = compute_next_run_at(&new.cron, &new.timezone, anchor - Duration::seconds(1))?;
        let id = Uuid::new_v4().to_string();
        let job_args_col = new
            .job_args
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO scheduled_tasks
             (id, name, cron, dispatch_mode, prompt, job_name, job_args, timezone,
              start_at, end_at, until_at, enabled, next_run_at, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,1,?12,?13)",
            rusqlite::params![
                id,
                new.name,
                new.cron,
                new.dispatch_mode.to_string(),
                new.prompt,
                new.job_name,
                job_args_col,
                new.timezone,
                new.start_at.map(|d| d.to_rfc3339()),
                new.end_at.map(|d| d.to_rfc3339()),
                new.until_at.map(|d| d.to_rfc3339()),
                next_run_at.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        info!(task_id = %id, name = %new.name, "scheduled task created");
        Self::get(conn, &id)?.ok_or(SchedulerError::TaskNotFound { id })
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<ScheduledTask>> {
        match conn.query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), [id], row_to_task) {
            Ok(t) => Ok(Some(t?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        let n = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Tasks due at `now`: enabled, `next_run_at` has arrived, and within any
    /// configured `start_at`/`end_at` window.
    fn list_due(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let now_str = now.to_rfc3339();
        let sql = format!(
            "{SELECT_COLUMNS} WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             AND (start_at IS NULL OR start_at <= ?1) AND (end_at IS NULL OR end_at >= ?1) \
             ORDER BY next_run_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&now_str], row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn record_tick_result(
        conn: &Connection,
        task: &ScheduledTask,
        now: DateTime<Utc>,
        outcome: &DispatchOutcome,
    ) -> Result<()> {
        let candidate_next = compute_next_run_at(&task.cron, &task.timezone, now).ok();
        let (next_run_at, enabled) = match (candidate_next, task.until_at) {
            (Some(next), Some(until)) if next > until => (None, false),
            (Some(next), _) => (Some(next), true),
            (None, _) => (None, false),
        };

        conn.execute(
            "UPDATE scheduled_tasks
             SET last_run_at = ?1, last_result = ?2, next_run_at = ?3, enabled = ?4
             WHERE id = ?5",
            rusqlite::params![
                now.to_rfc3339(),
                outcome.summary,
                next_run_at.map(|d: DateTime<Utc>| d.to_rfc3339()),
                enabled,
                task.id,
            ],
        )?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT id, name, cron, dispatch_mode, prompt, job_name, job_args, \
     timezone, start_at, end_at, until_at, enabled, next_run_at, last_run_at, last_result, \
     created_at FROM scheduled_tasks";

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<ScheduledTask>> {
    let dispatch_mode_col: String = row.get(3)?;
    let job_args_col: Option<String> = row.get(6)?;
    let created_at_col: String = row.get(15)?;

    let dispatch_mode = match dispatch_mode_col.parse() {
        Ok(m) => m,
        Err(e) => return Ok(Err(SchedulerError::InvalidDispatchMode(e))),
    };
    let job_args = match job_args_col {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => return Ok(Err(SchedulerError::Malformed(e))),
        },
        None => None,
    };
    let created_at = DateTime::parse_from_rfc3339(&created_at_col)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Ok(ScheduledTask {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        dispatch_mode,
        prompt: row.get(4)?,
        job_name: row.get(5)?,
        job_args,
        timezone: row.get(7)?,
        start_at: parse_ts(row.get(8)?),
        end_at: parse_ts(row.get(9)?),
        until_at: parse_ts(row.get(10)?),
        enabled: row.get(11)?,
        next_run_at: parse_ts(row.get(12)?),
        last_run_at: parse_ts(row.get(13)?),
        last_result: row.get(14)?,
        created_at,
    }))
}

/// Per-butler tick loop. Polls `scheduled_tasks` every `tick_interval` and
/// asks the injected [`TaskDispatcher`] to carry out each due task.
pub struct SchedulerEngine<D: TaskDispatcher> {
    dispatcher: D,
    tick_interval: std::time::Duration,
}

impl<D: TaskDispatcher> SchedulerEngine<D> {
    pub fn new(dispatcher: D, tick_interval_seconds: i64) -> Result<Self> {
        if tick_interval_seconds <= 0 {
            return Err(SchedulerError::InvalidCron {
                expr: String::new(),
                reason: format!("tick_interval_seconds must be positive, got {tick_interval_seconds}"),
            });
        }
        Ok(Self {
            dispatcher,
            tick_interval: std::time::Duration::from_secs(tick_interval_seconds as u64),
        })
    }

    /// Evaluate and dispatch every due task once. Returns the number of
    /// tasks processed.
    #[instrument(skip(self, conn))]
    pub async fn tick(&self, conn: &Arc<Mutex<Connection>>) -> usize {
        let now = Utc::now();
        let due = {
            let guard = conn.lock().expect("scheduler connection poisoned");
            match ScheduledTaskStore::list_due(&guard, now) {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!("failed to list due scheduled tasks: {e}");
                    return 0;
                }
            }
        };

        let mut processed = 0;
        for task in due {
            let outcome = match task.dispatch_mode {
                DispatchMode::Prompt => self.dispatcher.dispatch_prompt(&task).await,
                DispatchMode::Job => self.dispatcher.dispatch_job(&task).await,
            };
            let guard = conn.lock().expect("scheduler connection poisoned");
            if let Err(e) = ScheduledTaskStore::record_tick_result(&guard, &task, now, &outcome) {
                error!(task_id = %task.id, "failed to record tick result: {e}");
            }
            processed += 1;
        }
        processed
    }

    /// Run the tick loop until `shutdown` broadcasts `true`. `butler_name` is
    /// hashed into an initial stagger delay so a cluster of butlers ticking
    /// on the same cron wall-clock doesn't thunder on every provider/db call
    /// at once.
    pub async fn run(
        &self,
        conn: Arc<Mutex<Connection>>,
        butler_name: &str,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let stagger = stagger_delay(butler_name, self.tick_interval);
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }

        info!(butler = butler_name, "scheduler engine started");
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let processed = self.tick(&conn).await;
                    if processed > 0 {
                        info!(butler = butler_name, processed, "scheduler tick");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        warn!(butler = butler_name, "scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Stable, deterministic delay in `[0, tick_interval)` derived from the
/// butler's name so simultaneous cluster ticks distribute load instead of
/// all firing on the same wall-clock second.
fn stagger_delay(butler_name: &str, tick_interval: std::time::Duration) -> std::time::Duration {
    let hash = butler_name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let period_ms = tick_interval.as_millis().max(1) as u64;
    std::time::Duration::from_millis(hash % period_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DispatchMode;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE scheduled_tasks (
                id TEXT PRIMARY KEY, name TEXT NOT NULL UNIQUE, cron TEXT NOT NULL,
                dispatch_mode TEXT NOT NULL, prompt TEXT, job_name TEXT, job_args TEXT,
                timezone TEXT NOT NULL DEFAULT 'UTC', start_at TEXT, end_at TEXT, until_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1, next_run_at TEXT, last_run_at TEXT,
                last_result TEXT, created_at TEXT NOT NULL
            );",
        )
        .unwrap();
        conn
    }

    struct RecordingDispatcher;

    #[async_trait::async_trait]
    impl TaskDispatcher for RecordingDispatcher {
        async fn dispatch_prompt(&self, _task: &ScheduledTask) -> DispatchOutcome {
            DispatchOutcome::ok("ran prompt")
        }
        async fn dispatch_job(&self, _task: &ScheduledTask) -> DispatchOutcome {
            DispatchOutcome::ok("ran job")
        }
    }

    #[test]
    fn create_computes_next_run_at() {
        let conn = test_conn();
        let task = ScheduledTaskStore::create(
            &conn,
            NewScheduledTask {
                name: "daily-digest".to_string(),
                cron: "0 9 * * *".to_string(),
                dispatch_mode: DispatchMode::Prompt,
                prompt: Some("summarize today".to_string()),
                job_name: None,
                job_args: None,
                timezone: "UTC".to_string(),
                start_at: None,
                end_at: None,
                until_at: None,
            },
        )
        .unwrap();
        assert!(task.next_run_at.is_some());
        assert!(task.enabled);
    }

    #[tokio::test]
    async fn tick_dispatches_due_tasks_and_records_result() {
        let conn = Arc::new(Mutex::new(test_conn()));
        {
            let guard = conn.lock().unwrap();
            ScheduledTaskStore::create(
                &guard,
                NewScheduledTask {
                    name: "frequent".to_string(),
                    cron: "* * * * *".to_string(),
                    dispatch_mode: DispatchMode::Prompt,
                    prompt: Some("tick".to_string()),
                    job_name: None,
                    job_args: None,
                    timezone: "UTC".to_string(),
                    start_at: None,
                    end_at: None,
                    until_at: None,
                },
            )
            .unwrap();
            // Force immediate eligibility regardless of wall-clock second.
            guard
                .execute("UPDATE scheduled_tasks SET next_run_at = ?1", [Utc::now().to_rfc3339()])
                .unwrap();
        }

        let engine = SchedulerEngine::new(RecordingDispatcher, 60).unwrap();
        let processed = engine.tick(&conn).await;
        assert_eq!(processed, 1);

        let guard = conn.lock().unwrap();
        let last_result: String = guard
            .query_row("SELECT last_result FROM scheduled_tasks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(last_result, "ran prompt");
    }

    #[test]
    fn rejects_non_positive_tick_interval() {
        assert!(SchedulerEngine::new(RecordingDispatcher, 0).is_err());
    }
}
