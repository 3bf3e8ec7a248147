use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

mod app;
mod classifier;
mod db;
mod eligibility;
mod error;
mod http;
mod ingest;
mod notify;
mod pipeline;
mod route;
mod triage;
mod types;

use butlerhub_core::config::ELIGIBILITY_SWEEP_CRON;
use butlerhub_core::{ButlerConfig, TriggerSource};
use butlerhub_scheduler::{DispatchOutcome, ScheduledTask, SchedulerEngine, TaskDispatcher};
use butlerhub_spawner::TurnRequest;
use butlerhub_storage::ButlerDb;

/// How long a `route_inbox` row may sit in `processing` before a crashed
/// worker is presumed to have dropped it.
fn stuck_processing_threshold() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "butlerhub_switchboard=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("BUTLERHUB_CONFIG").ok();
    let config = ButlerConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        ButlerConfig::default()
    });

    let bind = config.http.bind.clone();
    let port = config.http.port;

    let db = ButlerDb::open(&config.database.data_dir, &config.butler_name)?;
    let tick_interval = Duration::from_secs(config.scheduler.tick_interval_seconds);
    let state = Arc::new(app::AppState::new(config, db)?);

    recover_and_dispatch(&state).await;
    spawn_route_inbox_worker(state.clone(), tick_interval);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_scheduler_loop(state.clone(), shutdown_rx)?;
    spawn_approval_expiry_sweep(state.clone(), tick_interval);
    if state.is_switchboard() {
        spawn_eligibility_sweep(state.clone());
    }

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(butler_name = %state.config.butler_name, %addr, "butlerhub-switchboard listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Carries out due `scheduled_tasks` for this daemon: `prompt` tasks become
/// agent turns via the spawner; `job` tasks have no in-process handler
/// registry in the generic daemon and fail with a recorded reason.
struct DaemonDispatcher {
    state: Arc<app::AppState>,
}

#[async_trait::async_trait]
impl TaskDispatcher for DaemonDispatcher {
    async fn dispatch_prompt(&self, task: &ScheduledTask) -> DispatchOutcome {
        let Some(prompt) = &task.prompt else {
            return DispatchOutcome::failed("prompt task carries no prompt");
        };
        let request = TurnRequest {
            prompt: prompt.clone(),
            trigger_source: TriggerSource::Schedule(task.name.clone()),
            request_id: None,
            parent_session_id: None,
            trace_id: None,
            context: None,
        };
        match self.state.spawner.spawn(&self.state.conn, request).await {
            Ok(session) if session.success == Some(true) => {
                DispatchOutcome::ok(format!("session {}", session.id))
            }
            Ok(session) => DispatchOutcome::failed(
                session.error.unwrap_or_else(|| "session failed".to_string()),
            ),
            Err(e) => DispatchOutcome::failed(e.to_string()),
        }
    }

    async fn dispatch_job(&self, task: &ScheduledTask) -> DispatchOutcome {
        DispatchOutcome::failed(format!(
            "no job handler registered for {:?}",
            task.job_name.as_deref().unwrap_or("<unnamed>")
        ))
    }
}

fn spawn_scheduler_loop(
    state: Arc<app::AppState>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let engine = SchedulerEngine::new(
        DaemonDispatcher { state: state.clone() },
        state.config.scheduler.tick_interval_seconds as i64,
    )?;
    let conn = state.conn.clone();
    let butler_name = state.config.butler_name.clone();
    tokio::spawn(async move {
        engine.run(conn, &butler_name, shutdown).await;
    });
    Ok(())
}

/// Expires `pending_actions` past their deadline on the same cadence as the
/// scheduler tick. Only runs when this butler carries an approval config;
/// the approval tables are migrated on the same condition in `AppState::new`.
fn spawn_approval_expiry_sweep(state: Arc<app::AppState>, tick_interval: Duration) {
    let Some(approval) = &state.config.approval else {
        return;
    };
    if !approval.enabled {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let swept = {
                let conn = state.conn.lock().expect("connection poisoned");
                butlerhub_approval::engine::sweep_expired(&conn, chrono::Utc::now())
            };
            match swept {
                Ok(0) => {}
                Ok(count) => info!(count, "expired pending approval actions"),
                Err(e) => warn!(error = %e, "approval expiry sweep failed"),
            }
        }
    });
}

/// Recovers rows stuck in `processing` from a crashed prior run, then
/// dispatches every pending `route_inbox` row once at startup.
async fn recover_and_dispatch(state: &Arc<app::AppState>) {
    let scan = {
        let conn = state.conn.lock().expect("connection poisoned");
        route::recover_pending(&conn, stuck_processing_threshold())
    };
    match scan {
        Ok(rows) => {
            if !rows.is_empty() {
                info!(count = rows.len(), "recovered pending route_inbox rows at startup");
            }
            for row in rows {
                dispatch_inbox_row(state, row).await;
            }
        }
        Err(e) => warn!(error = %e, "route_inbox recovery scan failed"),
    }
}

/// Periodically dequeues `route_inbox` rows accepted since the last tick.
/// Any butler role that isn't `messenger` lands requests here (see
/// `route::accept`), so this loop is the generic dispatch path for all of
/// them — it turns the envelope's prompt into an agent turn via the
/// spawner.
fn spawn_route_inbox_worker(state: Arc<app::AppState>, tick_interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let scan = {
                let conn = state.conn.lock().expect("connection poisoned");
                route::recover_pending(&conn, stuck_processing_threshold())
            };
            match scan {
                Ok(rows) => {
                    for row in rows {
                        dispatch_inbox_row(&state, row).await;
                    }
                }
                Err(e) => warn!(error = %e, "route_inbox dispatch scan failed"),
            }
        }
    });
}

async fn dispatch_inbox_row(state: &Arc<app::AppState>, row: route::RouteInboxRow) {
    {
        let conn = state.conn.lock().expect("connection poisoned");
        if let Err(e) = route::mark_processing(&conn, row.id) {
            warn!(error = %e, inbox_id = %row.id, "failed to mark route_inbox row processing");
            return;
        }
    }

    let request = TurnRequest {
        prompt: row.envelope.input.prompt.clone(),
        trigger_source: TriggerSource::Route,
        request_id: Some(row.envelope.request_context.request_id),
        parent_session_id: None,
        trace_id: None,
        context: row.envelope.input.context.clone(),
    };

    let spawned = state.spawner.spawn(&state.conn, request).await;
    let conn = state.conn.lock().expect("connection poisoned");
    match spawned {
        Ok(session) => {
            if let Err(e) = route::mark_processed(&conn, row.id, Some(&session.id)) {
                warn!(error = %e, inbox_id = %row.id, "failed to mark route_inbox row processed");
            }
        }
        Err(e) => {
            if let Err(mark_err) = route::mark_errored(&conn, row.id, &e.to_string()) {
                warn!(error = %mark_err, inbox_id = %row.id, "failed to mark route_inbox row errored");
            }
        }
    }
}

/// Switchboard-only background loop driving the eligibility sweep on
/// [`ELIGIBILITY_SWEEP_CRON`].
fn spawn_eligibility_sweep(state: Arc<app::AppState>) {
    tokio::spawn(async move {
        loop {
            let now = chrono::Utc::now();
            let next = match butlerhub_scheduler::schedule::compute_next_run_at(ELIGIBILITY_SWEEP_CRON, "UTC", now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(error = %e, "invalid eligibility sweep cron expression");
                    return;
                }
            };

            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            tokio::time::sleep(wait).await;

            let sweep_result = {
                let conn = state.conn.lock().expect("connection poisoned");
                eligibility::sweep(&conn)
            };
            match sweep_result {
                Ok(outcome) => {
                    if !outcome.staled.is_empty() || !outcome.quarantined.is_empty() {
                        info!(
                            staled = ?outcome.staled,
                            quarantined = ?outcome.quarantined,
                            "eligibility sweep transitioned butlers"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "eligibility sweep failed"),
            }
        }
    });
}
