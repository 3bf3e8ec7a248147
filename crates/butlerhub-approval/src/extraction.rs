use crate::types::ChannelIdentity;

/// Extract a `(channel_type, channel_value)` identity from gated tool
/// arguments using the fixed extraction table: `contact_id` (handled
/// separately as a direct UUID lookup by the caller), `channel`+`recipient`,
/// `chat_id` → telegram, `to` → email. Returns `None` when no known key is
/// present, which the gate treats as non-owner.
pub fn extract_channel_identity(tool_args: &serde_json::Value) -> Option<ChannelIdentity> {
    if let (Some(channel), Some(recipient)) = (
        tool_args.get("channel").and_then(|v| v.as_str()),
        tool_args.get("recipient").and_then(|v| v.as_str()),
    ) {
        return Some(ChannelIdentity {
            channel_type: channel.to_string(),
            channel_value: recipient.to_string(),
        });
    }

    if let Some(chat_id) = tool_args.get("chat_id").and_then(|v| v.as_str()) {
        return Some(ChannelIdentity {
            channel_type: "telegram".to_string(),
            channel_value: chat_id.to_string(),
        });
    }

    if let Some(to) = tool_args.get("to").and_then(|v| v.as_str()) {
        return Some(ChannelIdentity {
            channel_type: "email".to_string(),
            channel_value: to.to_string(),
        });
    }

    None
}

/// Extract a direct `contact_id` UUID when the tool call names one
/// explicitly, bypassing channel-identity resolution entirely.
pub fn extract_contact_id(tool_args: &serde_json::Value) -> Option<uuid::Uuid> {
    tool_args
        .get("contact_id")
        .and_then(|v| v.as_str())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
}

/// Keys that identify WHO a gated tool call reaches. Standing rules created
/// from an approved action pin exactly these, so the rule covers "the same
/// recipient again" rather than "this tool against anyone".
const IDENTITY_KEYS: &[&str] = &["contact_id", "channel", "recipient", "chat_id", "to"];

/// Suggest `arg_constraints` for a standing rule created from an approved
/// action: every identity-bearing key present in the action's arguments,
/// with its value. An action with no identity keys yields an empty
/// constraint object (the rule then matches any call of the tool — the
/// approver opted into that by creating a rule from an untargeted action).
pub fn suggest_constraints(tool_args: &serde_json::Value) -> serde_json::Value {
    let mut constraints = serde_json::Map::new();
    if let Some(obj) = tool_args.as_object() {
        for key in IDENTITY_KEYS {
            if let Some(value) = obj.get(*key) {
                constraints.insert((*key).to_string(), value.clone());
            }
        }
    }
    serde_json::Value::Object(constraints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_channel_and_recipient_pair() {
        let args = json!({"channel": "telegram", "recipient": "12345", "to": "a@b.com"});
        let identity = extract_channel_identity(&args).unwrap();
        assert_eq!(identity.channel_type, "telegram");
        assert_eq!(identity.channel_value, "12345");
    }

    #[test]
    fn chat_id_maps_to_telegram() {
        let args = json!({"chat_id": "999"});
        let identity = extract_channel_identity(&args).unwrap();
        assert_eq!(identity.channel_type, "telegram");
    }

    #[test]
    fn to_maps_to_email() {
        let args = json!({"to": "person@example.com"});
        let identity = extract_channel_identity(&args).unwrap();
        assert_eq!(identity.channel_type, "email");
        assert_eq!(identity.channel_value, "person@example.com");
    }

    #[test]
    fn unknown_shape_returns_none() {
        assert!(extract_channel_identity(&json!({"foo": "bar"})).is_none());
    }

    #[test]
    fn extracts_contact_id_when_present() {
        let id = uuid::Uuid::new_v4();
        let args = json!({"contact_id": id.to_string()});
        assert_eq!(extract_contact_id(&args), Some(id));
    }

    #[test]
    fn suggested_constraints_pin_identity_keys_only() {
        let args = json!({"to": "team@example.com", "subject": "weekly report", "body": "..."});
        let constraints = suggest_constraints(&args);
        assert_eq!(constraints, json!({"to": "team@example.com"}));
    }

    #[test]
    fn untargeted_action_suggests_empty_constraints() {
        assert_eq!(suggest_constraints(&json!({"note": "x"})), json!({}));
    }
}
