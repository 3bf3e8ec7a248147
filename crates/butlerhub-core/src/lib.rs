pub mod config;
pub mod error;
pub mod types;

pub use config::ButlerConfig;
pub use error::{ButlerError, ErrorClass, ErrorEnvelope, Result};
pub use types::{
    new_opaque_id, ButlerName, EligibilityState, LifecycleState, RequestId, TriggerSource,
};
