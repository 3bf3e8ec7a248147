use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rusqlite::Connection;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::{ApprovalError, Result};
use crate::extraction::{extract_channel_identity, extract_contact_id};
use crate::types::{
    ActionStatus, ApprovalEventType, ApprovalRule, ContactResolver, GateDecision,
    GatedToolConfig, PendingAction, ResolvedContact, RULE_PRECEDENCE,
};

/// Intercepts calls to gated tools and decides whether they run immediately,
/// run because a standing rule covers them, or wait on a human decision.
///
/// One gate instance is shared across a butler process (cheaply cloneable
/// via `Arc<dyn ContactResolver>` inside); all state lives in SQLite, not in
/// the struct itself, so the gate has no interior mutability to manage.
pub struct ApprovalGate {
    resolver: Arc<dyn ContactResolver>,
    gated_tools: HashMap<String, GatedToolConfig>,
}

impl ApprovalGate {
    pub fn new(resolver: Arc<dyn ContactResolver>, gated_tools: Vec<GatedToolConfig>) -> Self {
        let gated_tools = gated_tools
            .into_iter()
            .map(|c| (c.tool_name.clone(), c))
            .collect();
        Self { resolver, gated_tools }
    }

    fn config_for(&self, tool_name: &str) -> Option<&GatedToolConfig> {
        self.gated_tools.get(tool_name)
    }

    /// Resolve the caller behind a gated tool call, per the fixed extraction
    /// table: a direct `contact_id` wins over a channel identity; an
    /// unresolvable identity is treated as a non-owner, never an error.
    fn resolve_caller(&self, tool_args: &serde_json::Value) -> Option<ResolvedContact> {
        if let Some(contact_id) = extract_contact_id(tool_args) {
            if let Some(contact) = self.resolver.resolve_by_id(contact_id) {
                return Some(contact);
            }
        }
        let identity = extract_channel_identity(tool_args)?;
        self.resolver.resolve_by_channel(&identity)
    }

    /// Pick the standing rule that would auto-approve this call, if any,
    /// using the documented precedence: most specific `arg_constraints`
    /// first, bounded scope before unbounded, newer `created_at` before
    /// older, lexical `id` as the final tie-break.
    fn select_matching_rule<'a>(rules: &'a [ApprovalRule], tool_args: &serde_json::Value) -> Option<&'a ApprovalRule> {
        let now = Utc::now();
        rules
            .iter()
            .filter(|r| r.is_usable(now) && r.matches(tool_args))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then_with(|| a.is_bounded().cmp(&b.is_bounded()))
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    /// Run the interception algorithm: extract and resolve the caller, try
    /// the owner fast-path, then a standing-rule match, then fall back to
    /// queuing the action for a human decision.
    pub fn intercept(
        &self,
        conn: &Connection,
        tool_name: &str,
        tool_args: serde_json::Value,
        agent_summary: &str,
        session_id: Option<String>,
    ) -> Result<GateDecision> {
        let config = self
            .config_for(tool_name)
            .cloned()
            .unwrap_or_else(|| GatedToolConfig {
                tool_name: tool_name.to_string(),
                risk_tier: "standard".to_string(),
                expiry_hours: 24,
            });

        let now = Utc::now();
        let caller = self.resolve_caller(&tool_args);

        if caller.as_ref().map(|c| c.is_owner()).unwrap_or(false) {
            let action = PendingAction {
                id: Uuid::new_v4(),
                tool_name: tool_name.to_string(),
                tool_args,
                agent_summary: agent_summary.to_string(),
                session_id,
                status: ActionStatus::Approved,
                requested_at: now,
                expires_at: now + Duration::hours(config.expiry_hours),
                decided_by: Some("role:owner".to_string()),
                decided_at: Some(now),
                approval_rule_id: None,
            };
            db::insert_pending_action(conn, &action)?;
            db::append_event(conn, action.id, ApprovalEventType::ActionQueued, "system", None, serde_json::json!({}))?;
            db::append_event(
                conn,
                action.id,
                ApprovalEventType::ActionAutoApproved,
                "role:owner",
                None,
                serde_json::json!({}),
            )?;
            info!(tool = tool_name, action_id = %action.id, "auto-approved: owner fast-path");
            return Ok(GateDecision::AutoApproved { action });
        }

        let active_rules = db::active_rules_for_tool(conn, tool_name)?;
        if let Some(rule) = Self::select_matching_rule(&active_rules, &tool_args) {
            let rule_id = rule.id;
            let action = PendingAction {
                id: Uuid::new_v4(),
                tool_name: tool_name.to_string(),
                tool_args,
                agent_summary: agent_summary.to_string(),
                session_id,
                status: ActionStatus::Approved,
                requested_at: now,
                expires_at: now + Duration::hours(config.expiry_hours),
                decided_by: Some(format!("rule:{rule_id}")),
                decided_at: Some(now),
                approval_rule_id: Some(rule_id),
            };
            db::insert_pending_action(conn, &action)?;
            db::increment_rule_use_count(conn, rule_id)?;
            db::append_event(conn, action.id, ApprovalEventType::ActionQueued, "system", None, serde_json::json!({}))?;
            db::append_event(
                conn,
                action.id,
                ApprovalEventType::ActionAutoApproved,
                &format!("rule:{rule_id}"),
                None,
                serde_json::json!({ "approval_rule_id": rule_id }),
            )?;
            info!(tool = tool_name, action_id = %action.id, rule_id = %rule_id, "auto-approved: standing rule");
            return Ok(GateDecision::AutoApproved { action });
        }

        let action_id = Uuid::new_v4();
        let action = PendingAction {
            id: action_id,
            tool_name: tool_name.to_string(),
            tool_args,
            agent_summary: agent_summary.to_string(),
            session_id,
            status: ActionStatus::Pending,
            requested_at: now,
            expires_at: now + Duration::hours(config.expiry_hours),
            decided_by: None,
            decided_at: None,
            approval_rule_id: None,
        };
        db::insert_pending_action(conn, &action)?;
        db::append_event(conn, action_id, ApprovalEventType::ActionQueued, "system", None, serde_json::json!({}))?;
        info!(tool = tool_name, action_id = %action_id, "queued for human decision");

        Ok(GateDecision::PendingApproval {
            action_id,
            risk_tier: config.risk_tier,
            rule_precedence: RULE_PRECEDENCE,
        })
    }

    /// Transition `pending → approved`. Guarded by a CAS on `status` so a
    /// second decider reviewing a stale view gets `StateConflict` rather
    /// than silently overwriting the first decision.
    pub fn approve_action(
        &self,
        conn: &Connection,
        action_id: Uuid,
        decided_by: &str,
        create_rule: bool,
    ) -> Result<PendingAction> {
        let now = Utc::now();
        db::decide_action(conn, action_id, ActionStatus::Approved, decided_by, now, None)?;
        db::append_event(
            conn,
            action_id,
            ApprovalEventType::ActionApproved,
            decided_by,
            None,
            serde_json::json!({}),
        )?;

        if create_rule {
            let action = db::get_pending_action(conn, action_id)?;
            let rule = ApprovalRule {
                id: Uuid::new_v4(),
                tool_name: action.tool_name.clone(),
                arg_constraints: crate::extraction::suggest_constraints(&action.tool_args),
                description: Some(format!("created from approval of action {action_id}")),
                created_at: now,
                expires_at: None,
                max_uses: None,
                use_count: 0,
                active: true,
                created_from: Some(action_id),
            };
            db::insert_rule(conn, &rule)?;
            db::append_event(
                conn,
                action_id,
                ApprovalEventType::RuleCreated,
                decided_by,
                None,
                serde_json::json!({ "rule_id": rule.id }),
            )?;
        }

        db::get_pending_action(conn, action_id)
    }

    /// Transition `pending → rejected`, same CAS guard as `approve_action`.
    pub fn reject_action(&self, conn: &Connection, action_id: Uuid, decided_by: &str) -> Result<PendingAction> {
        let now = Utc::now();
        db::decide_action(conn, action_id, ActionStatus::Rejected, decided_by, now, None)?;
        db::append_event(
            conn,
            action_id,
            ApprovalEventType::ActionRejected,
            decided_by,
            None,
            serde_json::json!({}),
        )?;
        db::get_pending_action(conn, action_id)
    }

    /// Record the outcome of actually running an approved tool call and
    /// transition `approved → executed`. Execution failures still mark the
    /// action executed — the event records whether the call itself
    /// succeeded, not whether a human needs to intervene again.
    pub fn record_execution_result(
        &self,
        conn: &Connection,
        action_id: Uuid,
        success: bool,
        error: Option<&str>,
    ) -> Result<()> {
        db::mark_executed(conn, action_id)?;
        let event_type = if success {
            ApprovalEventType::ActionExecutionSucceeded
        } else {
            ApprovalEventType::ActionExecutionFailed
        };
        db::append_event(conn, action_id, event_type, "system", error, serde_json::json!({}))?;
        Ok(())
    }

    /// Bulk-transition `pending` rows past `expires_at` to `expired`,
    /// emitting one `action_expired` event per row. Intended to run on a
    /// periodic sweep alongside the scheduler tick.
    pub fn sweep_expired(&self, conn: &Connection, now: chrono::DateTime<Utc>) -> Result<usize> {
        sweep_expired(conn, now)
    }
}

/// Free-function form of the expiry sweep, for daemons that run the sweep
/// loop without constructing a full gate (no resolver needed to expire).
pub fn sweep_expired(conn: &Connection, now: chrono::DateTime<Utc>) -> Result<usize> {
    let expired_ids = db::sweep_expired(conn, now)?;
    for id in &expired_ids {
        db::append_event(conn, *id, ApprovalEventType::ActionExpired, "system", None, serde_json::json!({}))?;
    }
    if !expired_ids.is_empty() {
        warn!(count = expired_ids.len(), "expired pending actions past their deadline");
    }
    Ok(expired_ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeResolver {
        owner_id: Uuid,
    }

    impl ContactResolver for FakeResolver {
        fn resolve_by_id(&self, contact_id: Uuid) -> Option<ResolvedContact> {
            if contact_id == self.owner_id {
                Some(ResolvedContact { entity_id: contact_id, name: "Owner".into(), roles: vec!["owner".into()] })
            } else {
                None
            }
        }

        fn resolve_by_channel(&self, identity: &crate::types::ChannelIdentity) -> Option<ResolvedContact> {
            if identity.channel_value == "owner-chat" {
                Some(ResolvedContact { entity_id: self.owner_id, name: "Owner".into(), roles: vec!["owner".into()] })
            } else {
                None
            }
        }
    }

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::run_approval_migrations(&conn).unwrap();
        conn
    }

    fn gate(owner_id: Uuid) -> ApprovalGate {
        ApprovalGate::new(Arc::new(FakeResolver { owner_id }), vec![])
    }

    #[test]
    fn owner_fast_path_auto_approves() {
        let conn = test_conn();
        let owner_id = Uuid::new_v4();
        let gate = gate(owner_id);

        let decision = gate
            .intercept(&conn, "send_message", json!({"contact_id": owner_id.to_string()}), "summary", None)
            .unwrap();

        let action = match decision {
            GateDecision::AutoApproved { action } => action,
            other => panic!("expected auto-approval, got {other:?}"),
        };
        assert_eq!(action.status, ActionStatus::Approved);
        assert_eq!(action.decided_by.as_deref(), Some("role:owner"));

        gate.record_execution_result(&conn, action.id, true, None).unwrap();

        let events = db::list_events_for_action(&conn, action.id).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                ApprovalEventType::ActionQueued,
                ApprovalEventType::ActionAutoApproved,
                ApprovalEventType::ActionExecutionSucceeded,
            ]
        );
        assert_eq!(events[1].actor, "role:owner");

        let executed = db::get_pending_action(&conn, action.id).unwrap();
        assert_eq!(executed.status, ActionStatus::Executed);
    }

    #[test]
    fn unresolvable_caller_is_queued_pending() {
        let conn = test_conn();
        let gate = gate(Uuid::new_v4());

        let decision = gate
            .intercept(&conn, "send_message", json!({"chat_id": "nobody"}), "summary", None)
            .unwrap();

        match decision {
            GateDecision::PendingApproval { risk_tier, .. } => assert_eq!(risk_tier, "standard"),
            other => panic!("expected pending approval, got {other:?}"),
        }
    }

    #[test]
    fn standing_rule_matches_and_auto_approves() {
        let conn = test_conn();
        let gate = gate(Uuid::new_v4());
        let rule = ApprovalRule {
            id: Uuid::new_v4(),
            tool_name: "send_message".into(),
            arg_constraints: json!({"to": "team@example.com"}),
            description: None,
            created_at: Utc::now(),
            expires_at: None,
            max_uses: None,
            use_count: 0,
            active: true,
            created_from: None,
        };
        db::insert_rule(&conn, &rule).unwrap();

        let decision = gate
            .intercept(&conn, "send_message", json!({"to": "team@example.com"}), "summary", None)
            .unwrap();

        match decision {
            GateDecision::AutoApproved { action } => assert_eq!(action.approval_rule_id, Some(rule.id)),
            other => panic!("expected rule auto-approval, got {other:?}"),
        }
    }

    #[test]
    fn approving_with_create_rule_pins_recipient_constraints() {
        let conn = test_conn();
        let gate = gate(Uuid::new_v4());
        let decision = gate
            .intercept(&conn, "send_message", json!({"to": "team@example.com", "body": "hi"}), "summary", None)
            .unwrap();
        let GateDecision::PendingApproval { action_id, .. } = decision else {
            panic!("expected pending approval");
        };

        gate.approve_action(&conn, action_id, "human:alice", true).unwrap();

        let rules = db::active_rules_for_tool(&conn, "send_message").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].arg_constraints, json!({"to": "team@example.com"}));
        assert_eq!(rules[0].created_from, Some(action_id));

        // The same recipient now auto-approves; a different one still queues.
        let same = gate
            .intercept(&conn, "send_message", json!({"to": "team@example.com", "body": "again"}), "summary", None)
            .unwrap();
        assert!(matches!(same, GateDecision::AutoApproved { .. }));

        let other = gate
            .intercept(&conn, "send_message", json!({"to": "stranger@example.com"}), "summary", None)
            .unwrap();
        assert!(matches!(other, GateDecision::PendingApproval { .. }));
    }

    #[test]
    fn second_decider_gets_state_conflict() {
        let conn = test_conn();
        let gate = gate(Uuid::new_v4());
        let decision = gate
            .intercept(&conn, "send_message", json!({"chat_id": "nobody"}), "summary", None)
            .unwrap();
        let GateDecision::PendingApproval { action_id, .. } = decision else {
            panic!("expected pending approval");
        };

        gate.approve_action(&conn, action_id, "human:alice", false).unwrap();
        let err = gate.reject_action(&conn, action_id, "human:bob").unwrap_err();
        assert!(matches!(err, ApprovalError::StateConflict { .. }));
    }

    #[test]
    fn sweep_expired_transitions_past_deadline_rows() {
        let conn = test_conn();
        let gate = gate(Uuid::new_v4());
        let decision = gate
            .intercept(&conn, "send_message", json!({"chat_id": "nobody"}), "summary", None)
            .unwrap();
        let GateDecision::PendingApproval { action_id, .. } = decision else {
            panic!("expected pending approval");
        };

        let far_future = Utc::now() + Duration::days(2);
        let count = gate.sweep_expired(&conn, far_future).unwrap();
        assert_eq!(count, 1);

        let action = db::get_pending_action(&conn, action_id).unwrap();
        assert_eq!(action.status, ActionStatus::Expired);
    }
}
