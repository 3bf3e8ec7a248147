use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RequestId;

/// `route.v1` — the envelope every butler's `route.execute` tool accepts,
/// whether it originates from the Switchboard's classifier or from another
/// butler's `route_to_butler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteV1 {
    pub schema_version: String,
    pub request_context: RequestContext,
    pub target: RouteTarget,
    pub input: RouteInput,
}

/// Immutable metadata minted once at ingest and carried through every
/// downstream session, route envelope, and delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub received_at: DateTime<Utc>,
    pub source_channel: String,
    pub source_endpoint_identity: String,
    pub source_sender_identity: String,
    #[serde(default)]
    pub source_thread_identity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub butler: String,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInput {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl RouteV1 {
    pub const SCHEMA_VERSION: &'static str = "route.v1";

    pub fn validate_shape(&self) -> Result<(), String> {
        if self.schema_version != Self::SCHEMA_VERSION {
            return Err(format!(
                "expected schema_version {:?}, got {:?}",
                Self::SCHEMA_VERSION,
                self.schema_version
            ));
        }
        // request_id must be the time-ordered v7 form minted at ingest — a
        // v4 here means some caller invented its own correlation id.
        if self.request_context.request_id.as_uuid().get_version_num() != 7 {
            return Err("request_context.request_id must be a UUIDv7".to_string());
        }
        if self.target.butler.trim().is_empty() {
            return Err("target.butler must be non-empty".to_string());
        }
        if self.target.tool.trim().is_empty() {
            return Err("target.tool must be non-empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Ok,
    Accepted,
    Error,
}

/// Response to a `route.v1` dispatch. `Accepted` means the tool enqueued the
/// envelope into `route_inbox` and will process it asynchronously;
/// `inbox_id` identifies the row for recovery/inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponseV1 {
    pub schema_version: String,
    pub status: RouteStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub inbox_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub error: Option<crate::ErrorEnvelope>,
}

impl RouteResponseV1 {
    pub const SCHEMA_VERSION: &'static str = "route_response.v1";

    pub fn accepted(inbox_id: uuid::Uuid) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            status: RouteStatus::Accepted,
            result: None,
            inbox_id: Some(inbox_id),
            error: None,
        }
    }

    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            status: RouteStatus::Ok,
            result: Some(result),
            inbox_id: None,
            error: None,
        }
    }

    pub fn error(error: crate::ErrorEnvelope) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            status: RouteStatus::Error,
            result: None,
            inbox_id: None,
            error: Some(error),
        }
    }
}
