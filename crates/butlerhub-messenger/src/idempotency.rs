use sha2::{Digest, Sha256};

use crate::types::{DeliveryIntent, NotifyRequest};

/// `normalized_target`: for `send`, the lowercased trimmed recipient; for
/// `reply`, the sender from the embedded `request_context`, qualified by
/// thread whenever the ingest context carried one — a present thread id
/// IS the channel's thread capability, there is no separate allowlist.
fn normalized_target(req: &NotifyRequest) -> String {
    match req.intent {
        DeliveryIntent::Send => req
            .recipient
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
        DeliveryIntent::Reply => {
            let sender = req
                .request_context
                .source_sender_identity
                .as_deref()
                .unwrap_or_default();
            let target = match &req.request_context.source_thread_identity {
                Some(thread) => format!("{sender}:{thread}"),
                None => sender.to_string(),
            };
            target.trim().to_lowercase()
        }
    }
}

/// `content_hash`: SHA-256 over the trimmed message, prefixed by
/// `"{subject}|"` only when a subject is present.
fn content_hash(req: &NotifyRequest) -> String {
    let message = req.message.trim();
    let content = match req.subject.as_deref().map(str::trim) {
        Some(subject) if !subject.is_empty() => format!("{subject}|{message}"),
        _ => message.to_string(),
    };
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Deterministic idempotency key: labeled components
/// `request_id:{..}` (only when present), then `origin:{..}`, `intent:{..}`,
/// `channel:{..}`, `target:{..}`, `content:{..}`, colon-joined. Origin,
/// intent, and channel are trimmed and lowercased before joining.
pub fn derive_key(req: &NotifyRequest) -> String {
    let mut parts = Vec::new();
    if let Some(request_id) = req.request_context.request_id {
        parts.push(format!("request_id:{request_id}"));
    }
    parts.push(format!("origin:{}", req.origin_butler.trim().to_lowercase()));
    parts.push(format!("intent:{}", req.intent));
    parts.push(format!("channel:{}", req.channel.trim().to_lowercase()));
    parts.push(format!("target:{}", normalized_target(req)));
    parts.push(format!("content:{}", content_hash(req)));
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestContext;

    fn base_request() -> NotifyRequest {
        NotifyRequest {
            origin_butler: "relationship".into(),
            intent: DeliveryIntent::Send,
            channel: "telegram".into(),
            message: "hello".into(),
            recipient: Some("  Alice@Example.com  ".into()),
            subject: None,
            metadata: serde_json::json!({}),
            request_context: RequestContext::default(),
        }
    }

    #[test]
    fn key_is_deterministic_for_identical_requests() {
        assert_eq!(derive_key(&base_request()), derive_key(&base_request()));
    }

    #[test]
    fn recipient_is_normalized_case_and_whitespace_insensitively() {
        let mut a = base_request();
        let mut b = base_request();
        a.recipient = Some("alice@example.com".into());
        b.recipient = Some("  ALICE@EXAMPLE.COM  ".into());
        assert_eq!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn different_messages_produce_different_keys() {
        let mut a = base_request();
        let mut b = base_request();
        a.message = "hello".into();
        b.message = "goodbye".into();
        assert_ne!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn reply_includes_thread_whenever_context_carries_one() {
        let mut req = base_request();
        req.channel = "email".into();
        req.intent = DeliveryIntent::Reply;
        req.recipient = None;
        req.request_context.source_sender_identity = Some("user-1".into());
        req.request_context.source_thread_identity = Some("thread-9".into());
        let key = derive_key(&req);
        assert!(key.contains("channel:email:target:user-1:thread-9"));
    }

    #[test]
    fn reply_without_thread_targets_sender_only() {
        let mut req = base_request();
        req.intent = DeliveryIntent::Reply;
        req.recipient = None;
        req.request_context.source_sender_identity = Some("user-1".into());
        req.request_context.source_thread_identity = None;
        let key = derive_key(&req);
        assert!(key.contains("target:user-1:content:"));
        assert!(!key.contains("thread"));
    }
}
