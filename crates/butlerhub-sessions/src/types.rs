use serde::{Deserialize, Serialize};

use butlerhub_core::{RequestId, TriggerSource};

/// One row of the append-only `sessions` audit log: a single LLM turn run
/// under a spawned agent runtime. The table itself is created by
/// `butlerhub-storage`'s core migrations; this crate only ever inserts and
/// reads rows, never updates `prompt`/`trigger_source`/`started_at` after
/// creation, and never deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// UUIDv7 primary key — time-sortable.
    pub id: String,
    pub prompt: String,
    pub trigger_source: TriggerSource,
    pub model: Option<String>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub result: Option<String>,
    /// JSON array of tool calls made during the turn.
    pub tool_calls: serde_json::Value,
    pub duration_ms: Option<i64>,
    pub trace_id: Option<String>,
    pub request_id: Option<RequestId>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: Option<f64>,
    pub parent_session_id: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Parameters to open a new session row. `started_at` is stamped by the
/// store at insert time.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub prompt: String,
    pub trigger_source: TriggerSource,
    pub request_id: Option<RequestId>,
    pub parent_session_id: Option<String>,
    pub trace_id: Option<String>,
}

/// Terminal outcome recorded when a spawned turn finishes, win or lose.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub model: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<String>,
    pub tool_calls: serde_json::Value,
    pub duration_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost: Option<f64>,
}

pub(crate) fn trigger_source_to_column(t: &TriggerSource) -> String {
    t.to_string()
}

pub(crate) fn trigger_source_from_column(s: &str) -> TriggerSource {
    if let Some(name) = s.strip_prefix("schedule:") {
        TriggerSource::Schedule(name.to_string())
    } else {
        match s {
            "trigger" => TriggerSource::Trigger,
            "tick" => TriggerSource::Tick,
            "external" => TriggerSource::External,
            "route" => TriggerSource::Route,
            other => TriggerSource::Schedule(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_source_round_trips_schedule_variant() {
        let original = TriggerSource::Schedule("daily-digest".to_string());
        let column = trigger_source_to_column(&original);
        assert_eq!(column, "schedule:daily-digest");
        assert_eq!(trigger_source_from_column(&column), original);
    }

    #[test]
    fn trigger_source_round_trips_plain_variants() {
        for variant in [
            TriggerSource::Trigger,
            TriggerSource::Tick,
            TriggerSource::External,
            TriggerSource::Route,
        ] {
            let column = trigger_source_to_column(&variant);
            assert_eq!(trigger_source_from_column(&column), variant);
        }
    }
}
