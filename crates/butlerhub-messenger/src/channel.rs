use async_trait::async_trait;

use crate::types::{ChannelStatus, MessageFormat, ProviderError};

/// Common interface implemented by every provider adapter (Telegram, email, …).
///
/// Implementations must be `Send + Sync` so they can be stored in a
/// [`ChannelManager`](crate::manager::ChannelManager) and driven from
/// multiple Tokio tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    ///
    /// The name is used as the key inside `ChannelManager` and must be
    /// unique across all registered adapters.
    fn name(&self) -> &str;

    /// Establish the connection to the external service.
    async fn connect(&mut self) -> Result<(), ChannelError>;

    /// Gracefully close the connection.
    async fn disconnect(&mut self) -> Result<(), ChannelError>;

    /// Deliver a single message to `target`, returning the provider's
    /// delivery id if one is assigned.
    ///
    /// `&self` (shared reference) so a connected adapter can send
    /// concurrently without a mutable borrow.
    async fn send(&self, target: &str, content: &str, format: MessageFormat) -> Result<Option<String>, ProviderError>;

    /// Return the current runtime status without blocking.
    fn status(&self) -> ChannelStatus;
}

pub use crate::error::ChannelError;
