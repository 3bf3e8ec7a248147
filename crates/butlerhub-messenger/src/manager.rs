use std::collections::HashMap;

use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::{channel::Channel, error::MessengerError, types::ChannelStatus};

/// First retry delay when a provider adapter fails to come up (seconds).
const BACKOFF_BASE_SECS: u64 = 5;
/// Retry delay ceiling (seconds).
const BACKOFF_MAX_SECS: u64 = 120;
/// Connection attempts per adapter before it's left degraded. The daemon
/// still serves with a degraded adapter — deliveries on that channel
/// dead-letter until a restart brings it back.
const MAX_ATTEMPTS: u32 = 5;

/// Holds the provider adapters a messenger butler delivers through, keyed
/// by channel name (`"telegram"`, `"email"`). The delivery engine resolves
/// a `delivery_request.channel` to an adapter here per send.
pub struct ChannelManager {
    adapters: HashMap<String, Box<dyn Channel + Send + Sync>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register a provider adapter under its [`Channel::name`]. Registering
    /// a second adapter with the same name replaces the first.
    pub fn register(&mut self, adapter: Box<dyn Channel + Send + Sync>) {
        let name = adapter.name().to_string();
        info!(channel = %name, "registering provider adapter");
        self.adapters.insert(name, adapter);
    }

    /// Bring every registered adapter up, retrying each with exponential
    /// backoff. Returns the names of adapters that failed all attempts and
    /// were left degraded — startup proceeds either way.
    pub async fn connect_all(&mut self) -> Vec<String> {
        let mut degraded = Vec::new();
        for (name, adapter) in self.adapters.iter_mut() {
            let mut delay_secs = BACKOFF_BASE_SECS + stagger_secs(name);
            let mut connected = false;
            for attempt in 1..=MAX_ATTEMPTS {
                match adapter.connect().await {
                    Ok(()) => {
                        info!(channel = %name, attempt, "provider adapter connected");
                        connected = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            channel = %name,
                            attempt,
                            max = MAX_ATTEMPTS,
                            error = %e,
                            retry_after_secs = delay_secs,
                            "provider adapter connect failed"
                        );
                        if attempt < MAX_ATTEMPTS {
                            sleep(Duration::from_secs(delay_secs)).await;
                            delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
                        }
                    }
                }
            }
            if !connected {
                degraded.push(name.clone());
            }
        }
        degraded
    }

    /// Close every adapter. Failures are logged and skipped so one stuck
    /// provider can't hold shutdown hostage.
    pub async fn disconnect_all(&mut self) {
        for (name, adapter) in self.adapters.iter_mut() {
            if let Err(e) = adapter.disconnect().await {
                warn!(channel = %name, error = %e, "error while disconnecting provider adapter");
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&(dyn Channel + Send + Sync)> {
        self.adapters.get(name).map(|b| b.as_ref())
    }

    /// Like [`get`](Self::get), but maps a missing adapter to the error the
    /// delivery engine records as the terminal failure class.
    pub fn require(&self, name: &str) -> Result<&(dyn Channel + Send + Sync), MessengerError> {
        self.get(name)
            .ok_or_else(|| MessengerError::UnknownChannel(name.to_string()))
    }

    /// Current status per adapter, sorted by channel name so health output
    /// is stable.
    pub fn statuses(&self) -> Vec<(String, ChannelStatus)> {
        let mut result: Vec<(String, ChannelStatus)> = self
            .adapters
            .iter()
            .map(|(name, adapter)| (name.clone(), adapter.status()))
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Small deterministic per-channel offset so a fleet of messenger processes
/// restarting together doesn't hit every provider on the same second.
fn stagger_secs(channel_name: &str) -> u64 {
    channel_name
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
        % 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::types::{MessageFormat, ProviderError};
    use async_trait::async_trait;

    struct FlakyAdapter {
        name: &'static str,
        fail_connects: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Channel for FlakyAdapter {
        fn name(&self) -> &str {
            self.name
        }
        async fn connect(&mut self) -> Result<(), ChannelError> {
            let remaining = self.fail_connects.load(std::sync::atomic::Ordering::SeqCst);
            if remaining > 0 {
                self.fail_connects.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Err(ChannelError::ConnectionFailed("transient".into()))
            } else {
                Ok(())
            }
        }
        async fn disconnect(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn send(
            &self,
            _target: &str,
            _content: &str,
            _format: MessageFormat,
        ) -> Result<Option<String>, ProviderError> {
            Ok(None)
        }
        fn status(&self) -> ChannelStatus {
            ChannelStatus::Connected
        }
    }

    #[test]
    fn require_maps_missing_adapter_to_unknown_channel() {
        let manager = ChannelManager::new();
        let err = match manager.require("telegram") {
            Err(e) => e,
            Ok(_) => panic!("expected UnknownChannel error"),
        };
        assert!(matches!(err, MessengerError::UnknownChannel(name) if name == "telegram"));
    }

    #[tokio::test]
    async fn registered_adapter_is_resolvable_by_name() {
        let mut manager = ChannelManager::new();
        manager.register(Box::new(FlakyAdapter {
            name: "telegram",
            fail_connects: std::sync::atomic::AtomicU32::new(0),
        }));
        assert!(manager.get("telegram").is_some());
        assert!(manager.get("email").is_none());
        assert_eq!(manager.statuses().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_all_retries_then_reports_degraded() {
        let mut manager = ChannelManager::new();
        manager.register(Box::new(FlakyAdapter {
            name: "telegram",
            fail_connects: std::sync::atomic::AtomicU32::new(u32::MAX),
        }));
        let degraded = manager.connect_all().await;
        assert_eq!(degraded, vec!["telegram".to_string()]);
    }
}
