use std::sync::Mutex;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::db;
use crate::error::{MessengerError, Result};
use crate::idempotency;
use crate::manager::ChannelManager;
use crate::types::{DeliveryOutcome, DeliveryStatus, MessageFormat, NotifyRequest, ReceiptType};

/// Drives `deliver()` — idempotency-key derivation, `delivery_request`
/// create-or-replay, and the single provider call for a claimed request.
pub struct DeliveryEngine {
    db: Mutex<Connection>,
    channels: ChannelManager,
}

impl DeliveryEngine {
    pub fn new(conn: Connection, channels: ChannelManager) -> Self {
        Self { db: Mutex::new(conn), channels }
    }

    /// Validates `notify_request.origin_butler` against the authenticated
    /// caller, derives the idempotency key, and either replays an existing
    /// `delivery_request` or creates one and invokes the channel-specific
    /// provider adapter.
    pub async fn deliver(&self, caller: &str, req: &NotifyRequest) -> Result<DeliveryOutcome> {
        if req.origin_butler != caller {
            return Err(MessengerError::OriginMismatch {
                expected: req.origin_butler.clone(),
                actual: caller.to_string(),
            });
        }

        let key = idempotency::derive_key(req);
        let target = resolve_target(req);
        let envelope = serde_json::to_value(req).unwrap_or(serde_json::json!({}));

        let outcome = {
            let conn = self.db.lock().unwrap();
            db::create_or_get(
                &conn,
                &key,
                req.request_context.request_id,
                &req.origin_butler,
                &req.channel,
                req.intent,
                &target,
                &req.message,
                req.subject.as_deref(),
                &envelope,
            )?
        };

        if !outcome.created {
            let conn = self.db.lock().unwrap();
            return replay(&conn, &outcome.request);
        }

        self.advance(outcome.request.id).await
    }

    /// Claims the `pending -> in_progress` transition and runs the provider
    /// call for a freshly created `delivery_request`. A caller observing
    /// `false` from the claim lost the race to another worker and should
    /// treat the request as in-flight, not retry the provider.
    async fn advance(&self, request_id: uuid::Uuid) -> Result<DeliveryOutcome> {
        let claimed = {
            let conn = self.db.lock().unwrap();
            db::try_claim_in_progress(&conn, request_id)?
        };
        if !claimed {
            let conn = self.db.lock().unwrap();
            let request = db::get(&conn, request_id)?;
            return replay(&conn, &request);
        }

        let request = {
            let conn = self.db.lock().unwrap();
            db::get(&conn, request_id)?
        };

        let channel = match self.channels.require(&request.channel) {
            Ok(channel) => channel,
            Err(_) => {
                let conn = self.db.lock().unwrap();
                db::mark_failed(&conn, request_id, DeliveryStatus::DeadLettered, "unknown_channel", &request.channel)?;
                return Ok(DeliveryOutcome {
                    delivery_request_id: request_id,
                    status: DeliveryStatus::DeadLettered,
                    provider_delivery_id: None,
                    duplicate: false,
                    terminal_error_class: Some("unknown_channel".to_string()),
                    terminal_error_message: Some(request.channel.clone()),
                });
            }
        };

        match channel.send(&request.target_identity, &request.message_content, MessageFormat::PlainText).await {
            Ok(provider_delivery_id) => {
                let conn = self.db.lock().unwrap();
                db::record_receipt(&conn, request_id, provider_delivery_id.as_deref(), ReceiptType::Sent, &serde_json::json!({}))?;
                db::mark_delivered(&conn, request_id)?;
                info!(request_id = %request_id, channel = %request.channel, "delivery succeeded");
                Ok(DeliveryOutcome {
                    delivery_request_id: request_id,
                    status: DeliveryStatus::Delivered,
                    provider_delivery_id,
                    duplicate: false,
                    terminal_error_class: None,
                    terminal_error_message: None,
                })
            }
            Err(provider_err) => {
                let terminal = if provider_err.retryable { DeliveryStatus::Failed } else { DeliveryStatus::DeadLettered };
                let conn = self.db.lock().unwrap();
                db::mark_failed(&conn, request_id, terminal, &provider_err.class, &provider_err.message)?;
                warn!(request_id = %request_id, channel = %request.channel, error = %provider_err, "delivery failed");
                Ok(DeliveryOutcome {
                    delivery_request_id: request_id,
                    status: terminal,
                    provider_delivery_id: None,
                    duplicate: false,
                    terminal_error_class: Some(provider_err.class),
                    terminal_error_message: Some(provider_err.message),
                })
            }
        }
    }
}

fn resolve_target(req: &NotifyRequest) -> String {
    match req.intent {
        crate::types::DeliveryIntent::Send => req.recipient.clone().unwrap_or_default(),
        crate::types::DeliveryIntent::Reply => req
            .request_context
            .source_sender_identity
            .clone()
            .unwrap_or_default(),
    }
}

/// Terminal results are replayed verbatim, including the provider delivery
/// id bound by the `sent` receipt; in-flight requests replay their current
/// status so the duplicate caller knows not to issue a second provider call.
fn replay(conn: &Connection, request: &crate::types::DeliveryRequest) -> Result<DeliveryOutcome> {
    let provider_delivery_id = if request.status == DeliveryStatus::Delivered {
        db::sent_provider_delivery_id(conn, request.id)?
    } else {
        None
    };
    Ok(DeliveryOutcome {
        delivery_request_id: request.id,
        status: request.status,
        provider_delivery_id,
        duplicate: true,
        terminal_error_class: request.terminal_error_class.clone(),
        terminal_error_message: request.terminal_error_message.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::channel::Channel;
    use crate::error::ChannelError;
    use crate::types::{ChannelStatus, ProviderError, RequestContext};

    struct CountingChannel {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Channel for CountingChannel {
        fn name(&self) -> &str { "telegram" }
        async fn connect(&mut self) -> std::result::Result<(), ChannelError> { Ok(()) }
        async fn disconnect(&mut self) -> std::result::Result<(), ChannelError> { Ok(()) }
        async fn send(&self, _target: &str, _content: &str, _format: MessageFormat) -> std::result::Result<Option<String>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError { class: "rate_limited".into(), message: "429".into(), retryable: true })
            } else {
                Ok(Some("provider-msg-1".into()))
            }
        }
        fn status(&self) -> ChannelStatus { ChannelStatus::Connected }
    }

    fn engine(fail: bool, calls: Arc<AtomicUsize>) -> DeliveryEngine {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        let mut channels = ChannelManager::new();
        channels.register(Box::new(CountingChannel { calls, fail }));
        DeliveryEngine::new(conn, channels)
    }

    fn request() -> NotifyRequest {
        NotifyRequest {
            origin_butler: "relationship".into(),
            intent: crate::types::DeliveryIntent::Send,
            channel: "telegram".into(),
            message: "hi".into(),
            recipient: Some("alice".into()),
            subject: None,
            metadata: serde_json::json!({}),
            request_context: RequestContext::default(),
        }
    }

    #[tokio::test]
    async fn first_call_invokes_provider_and_delivers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eng = engine(false, calls.clone());
        let outcome = eng.deliver("relationship", &request()).await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Delivered);
        assert!(!outcome.duplicate);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_call_replays_terminal_result_without_reinvoking_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eng = engine(false, calls.clone());
        let first = eng.deliver("relationship", &request()).await.unwrap();
        let second = eng.deliver("relationship", &request()).await.unwrap();

        assert_eq!(first.delivery_request_id, second.delivery_request_id);
        assert!(second.duplicate);
        assert_eq!(second.status, DeliveryStatus::Delivered);
        assert_eq!(second.provider_delivery_id.as_deref(), Some("provider-msg-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn origin_mismatch_is_rejected_before_touching_storage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eng = engine(false, calls.clone());
        let err = eng.deliver("some-other-butler", &request()).await.unwrap_err();
        assert!(matches!(err, MessengerError::OriginMismatch { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retryable_provider_failure_marks_failed_not_dead_lettered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let eng = engine(true, calls.clone());
        let outcome = eng.deliver("relationship", &request()).await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.terminal_error_class.as_deref(), Some("rate_limited"));
    }
}
