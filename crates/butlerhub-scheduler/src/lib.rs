//! Per-butler cron scheduler over the `scheduled_tasks` table.
//!
//! # Overview
//!
//! `scheduled_tasks` rows are persisted and migrated by `butlerhub-storage`;
//! this crate owns typed access ([`engine::ScheduledTaskStore`]) and the tick
//! loop ([`engine::SchedulerEngine`]) that evaluates due tasks and hands them
//! to an injected [`types::TaskDispatcher`].
//!
//! | `dispatch_mode` | Behaviour                                         |
//! |-----------------|----------------------------------------------------|
//! | `prompt`        | Spawn a session with the stored prompt             |
//! | `job`           | Invoke an in-process handler registered by a module |

pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{ScheduledTaskStore, SchedulerEngine};
pub use error::{Result, SchedulerError};
pub use types::{DispatchMode, DispatchOutcome, NewScheduledTask, ScheduledTask, TaskDispatcher};
