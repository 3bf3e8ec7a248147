use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `ingest.v1` — the canonical shape connectors (Telegram/Gmail pollers, the
/// webhook receiver, …) submit to `POST /api/switchboard/ingest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestV1 {
    pub schema_version: String,
    pub source: IngestSource,
    pub event: IngestEvent,
    pub sender: IngestSender,
    pub payload: IngestPayload,
    #[serde(default)]
    pub control: IngestControl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSource {
    pub channel: String,
    pub provider: String,
    pub endpoint_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub external_event_id: String,
    #[serde(default)]
    pub external_thread_id: Option<String>,
    /// RFC3339 timestamp; must carry a timezone offset.
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSender {
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub raw: serde_json::Value,
    pub normalized_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestControl {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub policy_tier: Option<String>,
    #[serde(default)]
    pub trace_context: Option<serde_json::Value>,
}

impl IngestV1 {
    pub const SCHEMA_VERSION: &'static str = "ingest.v1";

    /// Shape validation only — dedupe-key derivation and `(channel, provider)`
    /// allow-listing happen in the ingest pipeline, which has config access.
    pub fn validate_shape(&self) -> Result<(), String> {
        if self.schema_version != Self::SCHEMA_VERSION {
            return Err(format!(
                "expected schema_version {:?}, got {:?}",
                Self::SCHEMA_VERSION,
                self.schema_version
            ));
        }
        if self.source.endpoint_identity.trim().is_empty() {
            return Err("source.endpoint_identity must be non-empty".to_string());
        }
        if self.sender.identity.trim().is_empty() {
            return Err("sender.identity must be non-empty".to_string());
        }
        // An empty external_event_id is legal: dedupe falls through to the
        // content-hash strategy for connectors with no native event ids.
        Ok(())
    }
}

/// Response to `POST /api/switchboard/ingest`, HTTP 202 on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponseV1 {
    pub request_id: crate::RequestId,
    pub status: IngestStatus,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Accepted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IngestV1 {
        IngestV1 {
            schema_version: "ingest.v1".to_string(),
            source: IngestSource {
                channel: "telegram".to_string(),
                provider: "telegram".to_string(),
                endpoint_identity: "test_bot".to_string(),
            },
            event: IngestEvent {
                external_event_id: "888001".to_string(),
                external_thread_id: None,
                observed_at: Utc::now(),
            },
            sender: IngestSender {
                identity: "user-1".to_string(),
            },
            payload: IngestPayload {
                raw: serde_json::json!({}),
                normalized_text: "hello".to_string(),
            },
            control: IngestControl::default(),
        }
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let mut envelope = sample();
        envelope.schema_version = "ingest.v2".to_string();
        assert!(envelope.validate_shape().is_err());
    }

    #[test]
    fn rejects_empty_endpoint_identity() {
        let mut envelope = sample();
        envelope.source.endpoint_identity = "  ".to_string();
        assert!(envelope.validate_shape().is_err());
    }

    #[test]
    fn accepts_well_formed_envelope() {
        assert!(sample().validate_shape().is_ok());
    }
}
