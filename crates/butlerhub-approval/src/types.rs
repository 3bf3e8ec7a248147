use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a gated tool invocation awaiting or past a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::Executed => "executed",
            ActionStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "executed" => Ok(Self::Executed),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// A row of `pending_actions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: Uuid,
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub agent_summary: String,
    pub session_id: Option<String>,
    pub status: ActionStatus,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub decided_by: Option<String>,
    pub decided_at: Option<chrono::DateTime<chrono::Utc>>,
    pub approval_rule_id: Option<Uuid>,
}

/// A row of `approval_rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: Uuid,
    pub tool_name: String,
    pub arg_constraints: serde_json::Value,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub max_uses: Option<i64>,
    pub use_count: i64,
    pub active: bool,
    pub created_from: Option<Uuid>,
}

impl ApprovalRule {
    /// A rule is "bounded" if it carries either an expiry or a use cap —
    /// bounded rules rank before unbounded ones in precedence.
    pub fn is_bounded(&self) -> bool {
        self.expires_at.is_some() || self.max_uses.is_some()
    }

    /// Number of non-null keys in `arg_constraints` — used as the
    /// specificity measure for precedence ordering.
    pub fn specificity(&self) -> usize {
        self.arg_constraints
            .as_object()
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn matches(&self, tool_args: &serde_json::Value) -> bool {
        let Some(constraints) = self.arg_constraints.as_object() else {
            return true;
        };
        constraints
            .iter()
            .all(|(k, v)| tool_args.get(k).map(|actual| actual == v).unwrap_or(false))
    }

    pub fn is_usable(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.use_count >= max_uses {
                return false;
            }
        }
        true
    }
}

/// Every event type appended to `approval_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalEventType {
    ActionQueued,
    ActionAutoApproved,
    ActionApproved,
    ActionRejected,
    ActionExpired,
    ActionExecutionSucceeded,
    ActionExecutionFailed,
    RuleCreated,
    RuleRevoked,
}

impl std::fmt::Display for ApprovalEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalEventType::ActionQueued => "action_queued",
            ApprovalEventType::ActionAutoApproved => "action_auto_approved",
            ApprovalEventType::ActionApproved => "action_approved",
            ApprovalEventType::ActionRejected => "action_rejected",
            ApprovalEventType::ActionExpired => "action_expired",
            ApprovalEventType::ActionExecutionSucceeded => "action_execution_succeeded",
            ApprovalEventType::ActionExecutionFailed => "action_execution_failed",
            ApprovalEventType::RuleCreated => "rule_created",
            ApprovalEventType::RuleRevoked => "rule_revoked",
        };
        write!(f, "{s}")
    }
}

/// A row of append-only `approval_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub id: Uuid,
    pub action_id: Uuid,
    pub event_type: ApprovalEventType,
    pub actor: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// `(channel_type, channel_value)` extracted from gated tool arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIdentity {
    pub channel_type: String,
    pub channel_value: String,
}

/// What the contacts module resolved a channel identity (or direct UUID) to.
#[derive(Debug, Clone)]
pub struct ResolvedContact {
    pub entity_id: Uuid,
    pub name: String,
    pub roles: Vec<String>,
}

impl ResolvedContact {
    pub fn is_owner(&self) -> bool {
        self.roles.iter().any(|r| r == "owner")
    }
}

/// Injected by the host process so this crate never depends on
/// `butlerhub-contacts` directly — only on the narrow lookup it needs.
pub trait ContactResolver: Send + Sync {
    fn resolve_by_id(&self, contact_id: Uuid) -> Option<ResolvedContact>;
    fn resolve_by_channel(&self, identity: &ChannelIdentity) -> Option<ResolvedContact>;
}

/// Per-tool gate configuration, supplied by the butler that registers the
/// tool as gated.
#[derive(Debug, Clone)]
pub struct GatedToolConfig {
    pub tool_name: String,
    pub risk_tier: String,
    pub expiry_hours: i64,
}

/// The deterministic precedence description surfaced in the pending
/// response so a caller can explain why a particular rule would (or did)
/// match: arg specificity, then bounded-before-unbounded scope, then
/// recency, then a lexical id tie-break.
pub const RULE_PRECEDENCE: &str = "arg_specificity,bounded_scope,recency,id";

/// What the gate decided for one intercepted tool call.
#[derive(Debug, Clone)]
pub enum GateDecision {
    /// Resolved contact is an owner, or a standing rule matched — already
    /// executed upstream by the caller after this decision.
    AutoApproved { action: PendingAction },
    /// No fast-path applied; the action is queued and a human must decide.
    PendingApproval {
        action_id: Uuid,
        risk_tier: String,
        rule_precedence: &'static str,
    },
}
