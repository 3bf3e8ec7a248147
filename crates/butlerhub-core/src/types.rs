use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical request identifier minted once at ingest and propagated through
/// every downstream session, route envelope, and delivery. UUIDv7 so that
/// lexical and chronological order coincide, which keeps `message_inbox`
/// indexable by insertion order without a separate sequence column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque, non-time-ordered identifier for rows that don't need
/// `request_id`'s insertion-order property (pending actions, delivery
/// requests, mind map nodes, …). Kept as a plain `Uuid` so it's obvious at a
/// glance which IDs carry ordering semantics and which don't.
pub fn new_opaque_id() -> Uuid {
    Uuid::new_v4()
}

/// Stable lowercase name of a butler (`"health"`, `"switchboard"`, …). Used as
/// the schema/database-file key, the MCP tool-surface namespace, and the
/// trusted-caller identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ButlerName(pub String);

impl ButlerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn switchboard() -> Self {
        Self("switchboard".to_string())
    }

    pub fn general() -> Self {
        Self("general".to_string())
    }
}

impl fmt::Display for ButlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ButlerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ButlerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reason a session was spawned, carried on every `sessions` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// `schedule:<name>` — fired by a `scheduled_tasks` row.
    Schedule(String),
    /// A human/approval-gate driven invocation.
    Trigger,
    /// A scheduler tick that found no work but still ran.
    Tick,
    /// An inbound ingest-pipeline dispatch.
    External,
    /// A `route.execute` hand-off from another butler.
    Route,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Schedule(name) => write!(f, "schedule:{name}"),
            TriggerSource::Trigger => write!(f, "trigger"),
            TriggerSource::Tick => write!(f, "tick"),
            TriggerSource::External => write!(f, "external"),
            TriggerSource::Route => write!(f, "route"),
        }
    }
}

/// Lifecycle state shared by `message_inbox` and `route_inbox` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Accepted,
    Processing,
    Processed,
    Completed,
    Errored,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Accepted => "accepted",
            LifecycleState::Processing => "processing",
            LifecycleState::Processed => "processed",
            LifecycleState::Completed => "completed",
            LifecycleState::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "completed" => Ok(Self::Completed),
            "errored" => Ok(Self::Errored),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

/// A butler's liveness classification, used by the Switchboard's eligibility
/// sweep to decide routability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityState {
    Active,
    Stale,
    Quarantined,
}

impl fmt::Display for EligibilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EligibilityState::Active => "active",
            EligibilityState::Stale => "stale",
            EligibilityState::Quarantined => "quarantined",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EligibilityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "stale" => Ok(Self::Stale),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("unknown eligibility state: {other}")),
        }
    }
}
