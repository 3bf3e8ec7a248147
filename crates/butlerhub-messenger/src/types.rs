use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Formatting hint for outbound message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    #[default]
    PlainText,
    Markdown,
    Html,
}

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}

/// The `delivery.intent` of a `notify.v1` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryIntent {
    Send,
    Reply,
}

impl std::fmt::Display for DeliveryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryIntent::Send => write!(f, "send"),
            DeliveryIntent::Reply => write!(f, "reply"),
        }
    }
}

impl std::str::FromStr for DeliveryIntent {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(DeliveryIntent::Send),
            "reply" => Ok(DeliveryIntent::Reply),
            _ => Err(()),
        }
    }
}

/// Inline context carried from the originating ingest, used to target a
/// `reply` and to thread the outbound `message_inbox` row back on the
/// originating Switchboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Option<Uuid>,
    pub source_sender_identity: Option<String>,
    pub source_thread_identity: Option<String>,
}

/// The inner `notify_request` carried inside a `route.v1` envelope targeting
/// `messenger.route.execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    pub origin_butler: String,
    pub intent: DeliveryIntent,
    pub channel: String,
    pub message: String,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub request_context: RequestContext,
}

/// `delivery_requests.status`, monotonic: `pending -> in_progress ->
/// {delivered, failed, dead_lettered}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InProgress,
    Delivered,
    Failed,
    DeadLettered,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed | DeliveryStatus::DeadLettered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "in_progress" => Ok(DeliveryStatus::InProgress),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "dead_lettered" => Ok(DeliveryStatus::DeadLettered),
            _ => Err(()),
        }
    }
}

/// A row of `delivery_requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub id: Uuid,
    pub idempotency_key: String,
    pub request_id: Option<Uuid>,
    pub origin_butler: String,
    pub channel: String,
    pub intent: DeliveryIntent,
    pub target_identity: String,
    pub message_content: String,
    pub subject: Option<String>,
    pub request_envelope: serde_json::Value,
    pub status: DeliveryStatus,
    pub terminal_error_class: Option<String>,
    pub terminal_error_message: Option<String>,
    pub terminal_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `delivery_receipts.receipt_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    Sent,
    Delivered,
    Read,
    WebhookConfirmation,
}

impl ReceiptType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReceiptType::Sent => "sent",
            ReceiptType::Delivered => "delivered",
            ReceiptType::Read => "read",
            ReceiptType::WebhookConfirmation => "webhook_confirmation",
        }
    }
}

/// A row of `delivery_receipts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub id: Uuid,
    pub delivery_request_id: Uuid,
    pub provider_delivery_id: Option<String>,
    pub receipt_type: ReceiptType,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
}

/// `{class, message, retryable}` — the failure surface a provider adapter
/// returns on send failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderError {
    pub class: String,
    pub message: String,
    pub retryable: bool,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Outcome of a `deliver()` call, including whether it replayed an existing
/// terminal or in-flight `delivery_request` rather than invoking a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub delivery_request_id: Uuid,
    pub status: DeliveryStatus,
    pub provider_delivery_id: Option<String>,
    pub duplicate: bool,
    pub terminal_error_class: Option<String>,
    pub terminal_error_message: Option<String>,
}
