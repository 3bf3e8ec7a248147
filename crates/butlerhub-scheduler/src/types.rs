use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a due task is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Spawn a session with the stored prompt.
    Prompt,
    /// Invoke an in-process handler registered by a module under `job_name`.
    Job,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DispatchMode::Prompt => "prompt",
            DispatchMode::Job => "job",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(Self::Prompt),
            "job" => Ok(Self::Job),
            other => Err(format!("unknown dispatch_mode: {other}")),
        }
    }
}

/// A row of the `scheduled_tasks` table (schema owned by `butlerhub-storage`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub cron: String,
    pub dispatch_mode: DispatchMode,
    pub prompt: Option<String>,
    pub job_name: Option<String>,
    pub job_args: Option<serde_json::Value>,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub until_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parameters to create a new scheduled task. `next_run_at` is computed from
/// `cron`/`timezone` at insert time rather than supplied by the caller.
#[derive(Debug, Clone)]
pub struct NewScheduledTask {
    pub name: String,
    pub cron: String,
    pub dispatch_mode: DispatchMode,
    pub prompt: Option<String>,
    pub job_name: Option<String>,
    pub job_args: Option<serde_json::Value>,
    pub timezone: String,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub until_at: Option<DateTime<Utc>>,
}

/// What dispatching a due task produced, recorded into `last_result`.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub summary: String,
}

impl DispatchOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
        }
    }
}

/// Injected by whatever hosts the scheduler loop (the butler's main binary)
/// so this crate never needs to know about `AgentRuntime`s or job-handler
/// registries directly — it only asks for a due task to be carried out and
/// records what came back.
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch_prompt(&self, task: &ScheduledTask) -> DispatchOutcome;
    async fn dispatch_job(&self, task: &ScheduledTask) -> DispatchOutcome;
}
