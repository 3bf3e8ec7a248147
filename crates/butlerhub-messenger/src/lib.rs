pub mod channel;
pub mod db;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod manager;
pub mod providers;
pub mod types;

pub use channel::Channel;
pub use engine::DeliveryEngine;
pub use error::{ChannelError, MessengerError, Result};
pub use manager::ChannelManager;
pub use providers::{EmailChannel, TelegramChannel};
pub use types::{
    ChannelStatus, DeliveryIntent, DeliveryOutcome, DeliveryReceipt, DeliveryRequest,
    DeliveryStatus, MessageFormat, NotifyRequest, ProviderError, ReceiptType, RequestContext,
};
