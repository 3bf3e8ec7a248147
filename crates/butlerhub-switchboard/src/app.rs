use std::sync::{Arc, Mutex};

use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;

use butlerhub_core::ButlerConfig;
use butlerhub_messenger::{ChannelManager, DeliveryEngine, EmailChannel, TelegramChannel};
use butlerhub_spawner::{Spawner, StubRuntime};
use butlerhub_storage::ButlerDb;

const MESSENGER_ROLE: &str = "messenger";
pub const SWITCHBOARD_ROLE: &str = "switchboard";

/// Central shared state for whichever butler role this process is running
/// as. Every role exposes `route.execute`; the Switchboard role additionally
/// mounts the ingest endpoint and `/webhooks/{source}`. The `messenger`
/// role carries a live [`DeliveryEngine`] so `route.execute` delivers
/// synchronously instead of queuing into `route_inbox`.
///
/// The connection sits behind an `Arc<Mutex<_>>` shared by the HTTP
/// handlers and the background loops; the lock is never held across an
/// `.await`.
pub struct AppState {
    pub config: ButlerConfig,
    pub conn: Arc<Mutex<Connection>>,
    pub http: reqwest::Client,
    pub spawner: Spawner<StubRuntime>,
    pub messenger: Option<DeliveryEngine>,
}

impl AppState {
    pub fn new(config: ButlerConfig, db: ButlerDb) -> anyhow::Result<Self> {
        crate::db::init_db(&db.conn)?;
        if config.approval.as_ref().is_some_and(|a| a.enabled) {
            butlerhub_approval::run_approval_migrations(&db.conn)?;
        }

        let messenger = if config.butler_name == MESSENGER_ROLE {
            Some(build_messenger_engine(&config)?)
        } else {
            None
        };

        Ok(Self {
            http: reqwest::Client::new(),
            spawner: Spawner::new(StubRuntime),
            conn: db.into_shared(),
            config,
            messenger,
        })
    }

    pub fn is_switchboard(&self) -> bool {
        self.config.butler_name == SWITCHBOARD_ROLE
    }
}

/// `DeliveryEngine` owns its connection outright rather than sharing
/// `ButlerDb`, so the messenger role opens a second handle onto the same
/// SQLite file (safe under WAL, already enabled by `ButlerDb::open`).
fn build_messenger_engine(config: &ButlerConfig) -> anyhow::Result<DeliveryEngine> {
    let path = butlerhub_storage::butler_db_path(&config.database.data_dir, &config.butler_name);
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    butlerhub_messenger::db::init_db(&conn)?;

    let mut channels = ChannelManager::new();
    if let Some(telegram) = &config.channels.telegram {
        channels.register(Box::new(TelegramChannel::new(
            telegram.api_base.clone(),
            telegram.bot_token.clone(),
        )));
    }
    if let Some(email) = &config.channels.email {
        channels.register(Box::new(EmailChannel::new(
            email.api_base.clone(),
            email.api_key.clone(),
            email.from_address.clone(),
        )));
    }

    Ok(DeliveryEngine::new(conn, channels))
}

/// Assembles the Axum router for this butler role. Every role mounts
/// `/health` and `/route/execute`; only the Switchboard also mounts
/// `/ingest` and `/webhooks/{source}`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/route/execute",
            post(crate::http::route::route_execute_handler),
        );

    if state.is_switchboard() {
        router = router
            .route(
                "/api/switchboard/ingest",
                post(crate::http::webhooks::ingest_handler),
            )
            .route(
                "/webhooks/{source}",
                post(crate::http::webhooks::webhook_handler),
            )
            .route("/notify", post(crate::http::notify::notify_handler));
    }

    router
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
