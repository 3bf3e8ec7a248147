use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;

use crate::channel::{Channel, ChannelError};
use crate::types::{ChannelStatus, MessageFormat, ProviderError};

/// Provider timeout named in the scheduling-model's suspension-point
/// guidance for outbound HTTP calls.
const PROVIDER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Telegram Bot API adapter. Sends via `sendMessage`; `target` is the chat
/// id as a decimal string.
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    status: RwLock<ChannelStatus>,
}

impl TelegramChannel {
    pub fn new(api_base: String, bot_token: String) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(PROVIDER_TIMEOUT).build().expect("reqwest client"),
            api_base,
            bot_token,
            status: RwLock::new(ChannelStatus::Disconnected),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
    result: Option<TelegramResult>,
}

#[derive(Deserialize)]
struct TelegramResult {
    message_id: i64,
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ChannelError::AuthFailed(format!("getMe returned {}", resp.status())));
        }
        *self.status.write().unwrap() = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        *self.status.write().unwrap() = ChannelStatus::Disconnected;
        Ok(())
    }

    async fn send(&self, target: &str, content: &str, format: MessageFormat) -> Result<Option<String>, ProviderError> {
        let parse_mode = match format {
            MessageFormat::Markdown => Some("MarkdownV2"),
            MessageFormat::Html => Some("HTML"),
            MessageFormat::PlainText => None,
        };

        let mut body = serde_json::json!({ "chat_id": target, "text": content });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::Value::String(mode.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError { class: "transport".into(), message: e.to_string(), retryable: true })?;

        let status = resp.status();
        let parsed: TelegramResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError { class: "malformed_response".into(), message: e.to_string(), retryable: false })?;

        if !parsed.ok {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(ProviderError {
                class: if retryable { "rate_limited".into() } else { "rejected".into() },
                message: parsed.description.unwrap_or_else(|| format!("telegram returned {status}")),
                retryable,
            });
        }

        Ok(parsed.result.map(|r| r.message_id.to_string()))
    }

    fn status(&self) -> ChannelStatus {
        self.status.read().unwrap().clone()
    }
}

/// SMTP-relay email adapter. Expects a provider that exposes a simple HTTP
/// send API (SendGrid-style); `target` is the recipient address.
pub struct EmailChannel {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    from_address: String,
    status: RwLock<ChannelStatus>,
}

impl EmailChannel {
    pub fn new(api_base: String, api_key: String, from_address: String) -> Self {
        Self {
            client: reqwest::Client::builder().timeout(PROVIDER_TIMEOUT).build().expect("reqwest client"),
            api_base,
            api_key,
            from_address,
            status: RwLock::new(ChannelStatus::Disconnected),
        }
    }
}

#[derive(Deserialize)]
struct EmailSendResponse {
    id: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn connect(&mut self) -> Result<(), ChannelError> {
        if self.api_key.is_empty() {
            return Err(ChannelError::ConfigError("missing email provider API key".into()));
        }
        *self.status.write().unwrap() = ChannelStatus::Connected;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ChannelError> {
        *self.status.write().unwrap() = ChannelStatus::Disconnected;
        Ok(())
    }

    async fn send(&self, target: &str, content: &str, _format: MessageFormat) -> Result<Option<String>, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/v3/mail/send", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": target,
                "text": content,
            }))
            .send()
            .await
            .map_err(|e| ProviderError { class: "transport".into(), message: e.to_string(), retryable: true })?;

        let status = resp.status();
        let parsed: EmailSendResponse = resp
            .json()
            .await
            .unwrap_or(EmailSendResponse { id: None, error: Some(format!("non-JSON response, status {status}")) });

        if let Some(err) = parsed.error {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err(ProviderError { class: if retryable { "rate_limited".into() } else { "rejected".into() }, message: err, retryable });
        }

        Ok(parsed.id)
    }

    fn status(&self) -> ChannelStatus {
        self.status.read().unwrap().clone()
    }
}
