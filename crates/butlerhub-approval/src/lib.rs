//! Approval gate: intercepts calls to tools a butler has marked as gated,
//! resolves the caller, and decides whether the call runs immediately (an
//! owner or a standing rule), or waits in `pending_actions` for a human.
//!
//! | concept          | meaning                                               |
//! |------------------|--------------------------------------------------------|
//! | `PendingAction`  | one row of `pending_actions`, the gate's queue         |
//! | `ApprovalRule`   | a standing auto-approval rule for a tool + arg shape   |
//! | `ApprovalEvent`  | append-only audit trail in `approval_events`           |
//! | `ContactResolver`| injected lookup from channel identity to a contact     |

pub mod db;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod types;

pub use db::{list_events_for_action, run_approval_migrations};
pub use engine::ApprovalGate;
pub use error::{ApprovalError, Result};
pub use extraction::{extract_channel_identity, extract_contact_id, suggest_constraints};
pub use types::{
    ActionStatus, ApprovalEvent, ApprovalEventType, ApprovalRule, ChannelIdentity,
    ContactResolver, GateDecision, GatedToolConfig, PendingAction, ResolvedContact,
    RULE_PRECEDENCE,
};
