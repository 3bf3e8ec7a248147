use serde::{Deserialize, Serialize};

use crate::route::RequestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryIntent {
    Send,
    Reply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Telegram,
    Email,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Telegram => "telegram",
            DeliveryChannel::Email => "email",
        }
    }
}

/// `notify.v1` — an origin butler's request to deliver a message through a
/// provider channel. Always routed through the Switchboard, which wraps it
/// in a `route.v1` envelope targeting a butler carrying the `messenger`
/// module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyV1 {
    pub schema_version: String,
    pub origin_butler: String,
    pub delivery: DeliveryRequest,
    #[serde(default)]
    pub request_context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub intent: DeliveryIntent,
    pub channel: DeliveryChannel,
    pub message: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NotifyV1 {
    pub const SCHEMA_VERSION: &'static str = "notify.v1";

    pub fn validate_shape(&self) -> Result<(), String> {
        if self.schema_version != Self::SCHEMA_VERSION {
            return Err(format!(
                "expected schema_version {:?}, got {:?}",
                Self::SCHEMA_VERSION,
                self.schema_version
            ));
        }
        if self.origin_butler.trim().is_empty() {
            return Err("origin_butler must be non-empty".to_string());
        }
        if self.delivery.message.trim().is_empty() {
            return Err("delivery.message must be non-empty".to_string());
        }
        if self.delivery.intent == DeliveryIntent::Send && self.delivery.recipient.is_none() {
            return Err("delivery.recipient is required for intent=send".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponseV1 {
    pub schema_version: String,
    pub status: NotifyStatus,
    #[serde(default)]
    pub delivery: Option<DeliveryResult>,
    #[serde(default)]
    pub error: Option<crate::ErrorEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub channel: String,
    pub delivery_id: uuid::Uuid,
    #[serde(default)]
    pub provider_delivery_id: Option<String>,
}

impl NotifyResponseV1 {
    pub const SCHEMA_VERSION: &'static str = "notify_response.v1";

    pub fn ok(delivery: DeliveryResult) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            status: NotifyStatus::Ok,
            delivery: Some(delivery),
            error: None,
        }
    }

    pub fn error(error: crate::ErrorEnvelope) -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            status: NotifyStatus::Error,
            delivery: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_without_recipient_is_rejected() {
        let envelope = NotifyV1 {
            schema_version: "notify.v1".to_string(),
            origin_butler: "health".to_string(),
            delivery: DeliveryRequest {
                intent: DeliveryIntent::Send,
                channel: DeliveryChannel::Telegram,
                message: "done".to_string(),
                recipient: None,
                subject: None,
                metadata: None,
            },
            request_context: None,
        };
        assert!(envelope.validate_shape().is_err());
    }

    #[test]
    fn reply_without_recipient_is_allowed() {
        let envelope = NotifyV1 {
            schema_version: "notify.v1".to_string(),
            origin_butler: "health".to_string(),
            delivery: DeliveryRequest {
                intent: DeliveryIntent::Reply,
                channel: DeliveryChannel::Telegram,
                message: "done".to_string(),
                recipient: None,
                subject: None,
                metadata: None,
            },
            request_context: None,
        };
        assert!(envelope.validate_shape().is_ok());
    }
}
