use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a `message_inbox` row — inbound from a connector, or an
/// outbound delivery mirrored back for thread continuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

impl std::str::FromStr for MessageDirection {
    type Err = crate::error::SwitchboardError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(MessageDirection::Inbound),
            "outbound" => Ok(MessageDirection::Outbound),
            other => Err(crate::error::SwitchboardError::UnknownVariant(other.to_string())),
        }
    }
}

/// One row of `message_inbox`. `lifecycle_state` reuses
/// [`butlerhub_core::LifecycleState`] since the invariant
/// (`accepted -> processing -> {completed, errored}`) is identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub request_context: RequestContext,
    pub raw_payload: serde_json::Value,
    pub normalized_text: String,
    pub direction: MessageDirection,
    pub lifecycle_state: butlerhub_core::LifecycleState,
    pub schema_version: String,
    pub processing_metadata: serde_json::Value,
    pub decomposition_output: Option<serde_json::Value>,
    pub dispatch_outcomes: Option<serde_json::Value>,
    pub response_summary: Option<serde_json::Value>,
    pub final_state_at: Option<chrono::DateTime<chrono::Utc>>,
    pub trace_id: Option<String>,
    pub session_id: Option<Uuid>,
}

/// The canonical, immutable `request_context` assigned at ingest and
/// propagated through every downstream session, route envelope, and
/// delivery for end-to-end correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub source_channel: String,
    pub source_endpoint_identity: String,
    pub source_sender_identity: String,
    #[serde(default)]
    pub source_thread_identity: Option<String>,
    pub dedupe_key: String,
    pub dedupe_strategy: DedupeStrategy,
    #[serde(default)]
    pub trace_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeStrategy {
    IdempotencyKey,
    ExternalEventId,
    ContentHash,
}

impl DedupeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupeStrategy::IdempotencyKey => "idempotency_key",
            DedupeStrategy::ExternalEventId => "external_event_id",
            DedupeStrategy::ContentHash => "content_hash",
        }
    }
}

impl std::str::FromStr for DedupeStrategy {
    type Err = crate::error::SwitchboardError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idempotency_key" => Ok(DedupeStrategy::IdempotencyKey),
            "external_event_id" => Ok(DedupeStrategy::ExternalEventId),
            "content_hash" => Ok(DedupeStrategy::ContentHash),
            other => Err(crate::error::SwitchboardError::UnknownVariant(other.to_string())),
        }
    }
}

/// Outcome of the thread-affinity lookup table. `HIT` and `FORCE_OVERRIDE`
/// are the only outcomes that short-circuit rule evaluation into a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityOutcome {
    Hit,
    ForceOverride,
    MissNoThreadId,
    MissNoHistory,
    MissStale,
    MissConflict,
    MissDisabledGlobal,
    MissDisabledThread,
    MissError,
}

impl AffinityOutcome {
    pub fn produces_route(&self) -> bool {
        matches!(self, AffinityOutcome::Hit | AffinityOutcome::ForceOverride)
    }

    pub fn telemetry_reason(&self) -> &'static str {
        match self {
            AffinityOutcome::Hit => "hit",
            AffinityOutcome::ForceOverride => "force_override",
            AffinityOutcome::MissNoThreadId => "no_thread_id",
            AffinityOutcome::MissNoHistory => "no_history",
            AffinityOutcome::MissStale => "stale",
            AffinityOutcome::MissConflict => "conflict",
            AffinityOutcome::MissDisabledGlobal => "disabled",
            AffinityOutcome::MissDisabledThread => "disabled",
            AffinityOutcome::MissError => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AffinityResult {
    pub outcome: AffinityOutcome,
    pub target_butler: Option<String>,
}

impl AffinityResult {
    pub fn miss(outcome: AffinityOutcome) -> Self {
        Self { outcome, target_butler: None }
    }
}

/// KV-stored settings behind the thread-affinity lookup, refreshed per call
/// unless the caller supplies its own (used in tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadAffinitySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: i64,
    #[serde(default)]
    pub thread_overrides: std::collections::HashMap<String, String>,
}

fn default_ttl_days() -> i64 {
    butlerhub_core::config::DEFAULT_THREAD_AFFINITY_TTL_DAYS
}

impl Default for ThreadAffinitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_days: default_ttl_days(),
            thread_overrides: std::collections::HashMap::new(),
        }
    }
}

/// Rule-evaluation decision, produced either by thread-affinity
/// short-circuit or by the priority-ordered rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDecision {
    pub decision: RouteDecisionKind,
    #[serde(default)]
    pub target_butler: Option<String>,
    #[serde(default)]
    pub matched_rule_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecisionKind {
    RouteTo,
    PassThrough,
}

/// One classifier output entry — a sub-prompt tagged with its target butler
/// and the segment metadata explaining the decomposition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassificationEntry {
    pub butler: String,
    pub prompt: String,
    pub segment: SegmentMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SegmentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_spans: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<SegmentOffsets>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl SegmentMetadata {
    pub fn is_empty(&self) -> bool {
        self.sentence_spans.is_none() && self.offsets.is_none() && self.rationale.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentOffsets {
    pub start: i64,
    pub end: i64,
}

/// Eligibility state of a registered butler, reusing
/// [`butlerhub_core::EligibilityState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredButler {
    pub name: String,
    pub modules: Vec<String>,
    pub eligibility_state: butlerhub_core::EligibilityState,
    pub liveness_ttl_seconds: i64,
    pub last_seen_at: Option<chrono::DateTime<chrono::Utc>>,
    pub quarantined_at: Option<chrono::DateTime<chrono::Utc>>,
    pub quarantine_reason: Option<String>,
}

impl RegisteredButler {
    pub fn is_routable(&self) -> bool {
        !matches!(self.eligibility_state, butlerhub_core::EligibilityState::Quarantined)
    }
}

/// Outcome of one eligibility-sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub quarantined: Vec<String>,
    pub staled: Vec<String>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationLog {
    pub id: Uuid,
    pub source_butler: String,
    pub channel: String,
    pub recipient: String,
    pub message: String,
    pub status: NotificationStatus,
    pub error: Option<String>,
    pub trace_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }
}
