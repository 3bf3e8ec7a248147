//! Thread-affinity lookup and priority-ordered rule evaluation — the fast
//! routing path that runs before the classifier gets involved.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db;
use crate::error::Result;
use crate::types::{AffinityOutcome, AffinityResult, RouteDecisionKind, RuleDecision, ThreadAffinitySettings};

const THREAD_AFFINITY_SETTINGS_KEY: &str = "thread_affinity::settings";
const TRIAGE_RULES_KEY: &str = "triage::rules";

/// Only channels with a native thread concept participate in affinity
/// lookup — primarily email. Telegram/webhook/mcp channels have no
/// persistent thread id and always miss with `MISS_NO_THREAD_ID`.
fn channel_has_thread_concept(channel: &str) -> bool {
    channel == "email"
}

pub fn load_settings(conn: &Connection) -> Result<ThreadAffinitySettings> {
    Ok(butlerhub_storage::state_get(conn, THREAD_AFFINITY_SETTINGS_KEY)
        .map_err(|e| crate::error::SwitchboardError::Validation(e.to_string()))?
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}

pub fn save_settings(conn: &Connection, settings: &ThreadAffinitySettings) -> Result<()> {
    butlerhub_storage::state_set(conn, THREAD_AFFINITY_SETTINGS_KEY, &serde_json::to_value(settings)?)
        .map_err(|e| crate::error::SwitchboardError::Validation(e.to_string()))
}

/// Serialized form of one triage rule, stored as a JSON array under the
/// `triage::rules` KV key in priority order. Exactly one matcher field
/// should be set; a spec with none (or an empty matcher value) is dropped
/// at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRuleSpec {
    pub rule_type: String,
    pub target_butler: String,
    #[serde(default)]
    pub sender_domain: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

impl TriageRuleSpec {
    fn into_rule(self) -> Option<TriageRule> {
        let matcher = if let Some(domain) = self.sender_domain.filter(|v| !v.trim().is_empty()) {
            RuleMatcher::SenderDomain(domain)
        } else if let Some(channel) = self.channel.filter(|v| !v.trim().is_empty()) {
            RuleMatcher::Channel(channel)
        } else if let Some(keyword) = self.keyword.filter(|v| !v.trim().is_empty()) {
            RuleMatcher::Keyword(keyword)
        } else {
            return None;
        };
        Some(TriageRule {
            rule_type: self.rule_type,
            target_butler: self.target_butler,
            matcher,
        })
    }
}

/// Loads the priority-ordered rule set from KV state. A missing key or an
/// unparseable value is an empty rule set, never an error — triage rules
/// are an optimization on top of the classifier, not a gate.
pub fn load_rules(conn: &Connection) -> Vec<TriageRule> {
    butlerhub_storage::state_get(conn, TRIAGE_RULES_KEY)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value::<Vec<TriageRuleSpec>>(v).ok())
        .unwrap_or_default()
        .into_iter()
        .filter_map(TriageRuleSpec::into_rule)
        .collect()
}

/// Checks a per-thread override (`disabled` or `force:<butler>`) before
/// touching `routing_history`. `force:` with an empty butler name, or any
/// value that isn't `disabled`/`force:<name>`, is treated as malformed and
/// ignored rather than applied.
fn check_override(thread_id: &str, settings: &ThreadAffinitySettings) -> Option<AffinityResult> {
    let raw = settings.thread_overrides.get(thread_id.trim())?;
    if raw == "disabled" {
        return Some(AffinityResult::miss(AffinityOutcome::MissDisabledThread));
    }
    if let Some(target) = raw.strip_prefix("force:") {
        let target = target.trim();
        if !target.is_empty() {
            return Some(AffinityResult {
                outcome: AffinityOutcome::ForceOverride,
                target_butler: Some(target.to_string()),
            });
        }
    }
    None
}

/// Runs the 9-outcome thread-affinity lookup table. Fails open
/// (`MISS_ERROR`) on any database error so a triage failure never blocks
/// routing — it only forgoes the affinity shortcut.
pub fn lookup_thread_affinity(
    conn: &Connection,
    thread_id: Option<&str>,
    channel: &str,
    settings: &ThreadAffinitySettings,
) -> AffinityResult {
    if !settings.enabled {
        return AffinityResult::miss(AffinityOutcome::MissDisabledGlobal);
    }

    let thread_id = match thread_id.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return AffinityResult::miss(AffinityOutcome::MissNoThreadId),
    };

    if !channel_has_thread_concept(channel) {
        return AffinityResult::miss(AffinityOutcome::MissNoThreadId);
    }

    if let Some(result) = check_override(thread_id, settings) {
        return result;
    }

    let since = chrono::Utc::now() - chrono::Duration::days(settings.ttl_days.max(0));
    let recent = match db::recent_routes_for_thread(conn, channel, thread_id, since) {
        Ok(rows) => rows,
        Err(_) => return AffinityResult::miss(AffinityOutcome::MissError),
    };

    match recent.len() {
        0 => {
            let had_any_history = db::has_any_history_for_thread(conn, channel, thread_id).unwrap_or(false);
            if had_any_history {
                AffinityResult::miss(AffinityOutcome::MissStale)
            } else {
                AffinityResult::miss(AffinityOutcome::MissNoHistory)
            }
        }
        1 => AffinityResult {
            outcome: AffinityOutcome::Hit,
            target_butler: Some(recent[0].0.clone()),
        },
        _ => AffinityResult::miss(AffinityOutcome::MissConflict),
    }
}

/// A single priority-ordered triage rule matched on sender-domain, channel,
/// or a keyword substring. `target_butler` is the routing decision when the
/// rule matches.
#[derive(Debug, Clone)]
pub struct TriageRule {
    pub rule_type: String,
    pub target_butler: String,
    pub matcher: RuleMatcher,
}

#[derive(Debug, Clone)]
pub enum RuleMatcher {
    SenderDomain(String),
    Channel(String),
    Keyword(String),
}

impl TriageRule {
    fn matches(&self, channel: &str, sender_identity: &str, normalized_text: &str) -> bool {
        match &self.matcher {
            RuleMatcher::SenderDomain(domain) => sender_identity
                .rsplit_once('@')
                .map(|(_, d)| d.eq_ignore_ascii_case(domain))
                .unwrap_or(false),
            RuleMatcher::Channel(c) => c.eq_ignore_ascii_case(channel),
            RuleMatcher::Keyword(kw) => normalized_text.to_lowercase().contains(&kw.to_lowercase()),
        }
    }
}

/// Evaluates thread-affinity first (short-circuiting on `HIT`/`FORCE_OVERRIDE`),
/// then the priority-ordered rule set, defaulting to `pass_through` when
/// nothing matches — the classifier decides routing from there.
pub fn evaluate(
    affinity: &AffinityResult,
    rules: &[TriageRule],
    channel: &str,
    sender_identity: &str,
    normalized_text: &str,
) -> RuleDecision {
    if affinity.outcome.produces_route() {
        return RuleDecision {
            decision: RouteDecisionKind::RouteTo,
            target_butler: affinity.target_butler.clone(),
            matched_rule_type: Some("thread_affinity".to_string()),
        };
    }

    for rule in rules {
        if rule.matches(channel, sender_identity, normalized_text) {
            return RuleDecision {
                decision: RouteDecisionKind::RouteTo,
                target_butler: Some(rule.target_butler.clone()),
                matched_rule_type: Some(rule.rule_type.clone()),
            };
        }
    }

    RuleDecision {
        decision: RouteDecisionKind::PassThrough,
        target_butler: None,
        matched_rule_type: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        conn
    }

    #[test]
    fn non_email_channel_misses_no_thread_id_even_with_history() {
        let conn = conn();
        db::record_route(&conn, "telegram", "thread-1", "finance").unwrap();
        let result = lookup_thread_affinity(&conn, Some("thread-1"), "telegram", &ThreadAffinitySettings::default());
        assert_eq!(result.outcome, AffinityOutcome::MissNoThreadId);
    }

    #[test]
    fn globally_disabled_misses_before_touching_history() {
        let conn = conn();
        let settings = ThreadAffinitySettings { enabled: false, ..Default::default() };
        let result = lookup_thread_affinity(&conn, Some("thread-1"), "email", &settings);
        assert_eq!(result.outcome, AffinityOutcome::MissDisabledGlobal);
    }

    #[test]
    fn single_butler_in_window_is_a_hit() {
        let conn = conn();
        db::record_route(&conn, "email", "<thread-1@mail>", "finance").unwrap();
        let result = lookup_thread_affinity(&conn, Some("<thread-1@mail>"), "email", &ThreadAffinitySettings::default());
        assert_eq!(result.outcome, AffinityOutcome::Hit);
        assert_eq!(result.target_butler.as_deref(), Some("finance"));
    }

    #[test]
    fn two_distinct_butlers_in_window_conflict() {
        let conn = conn();
        db::record_route(&conn, "email", "<thread-1@mail>", "finance").unwrap();
        db::record_route(&conn, "email", "<thread-1@mail>", "health").unwrap();
        let result = lookup_thread_affinity(&conn, Some("<thread-1@mail>"), "email", &ThreadAffinitySettings::default());
        assert_eq!(result.outcome, AffinityOutcome::MissConflict);
    }

    #[test]
    fn force_override_short_circuits_without_querying_history() {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("<thread-1@mail>".to_string(), "force:finance".to_string());
        let settings = ThreadAffinitySettings { thread_overrides: overrides, ..Default::default() };
        let conn = conn();
        let result = lookup_thread_affinity(&conn, Some("<thread-1@mail>"), "email", &settings);
        assert_eq!(result.outcome, AffinityOutcome::ForceOverride);
        assert_eq!(result.target_butler.as_deref(), Some("finance"));
    }

    #[test]
    fn malformed_force_override_is_ignored() {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("<thread-1@mail>".to_string(), "force:".to_string());
        let settings = ThreadAffinitySettings { thread_overrides: overrides, ..Default::default() };
        let conn = conn();
        let result = lookup_thread_affinity(&conn, Some("<thread-1@mail>"), "email", &settings);
        assert_eq!(result.outcome, AffinityOutcome::MissNoHistory);
    }

    #[test]
    fn disabled_thread_override_misses() {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("<thread-1@mail>".to_string(), "disabled".to_string());
        let settings = ThreadAffinitySettings { thread_overrides: overrides, ..Default::default() };
        let conn = conn();
        let result = lookup_thread_affinity(&conn, Some("<thread-1@mail>"), "email", &settings);
        assert_eq!(result.outcome, AffinityOutcome::MissDisabledThread);
    }

    #[test]
    fn affinity_hit_short_circuits_rule_evaluation() {
        let affinity = AffinityResult { outcome: AffinityOutcome::Hit, target_butler: Some("finance".to_string()) };
        let rules = vec![TriageRule {
            rule_type: "keyword".to_string(),
            target_butler: "health".to_string(),
            matcher: RuleMatcher::Keyword("diet".to_string()),
        }];
        let decision = evaluate(&affinity, &rules, "email", "a@b.com", "talking about diet");
        assert_eq!(decision.target_butler.as_deref(), Some("finance"));
        assert_eq!(decision.matched_rule_type.as_deref(), Some("thread_affinity"));
    }

    #[test]
    fn keyword_rule_matches_when_no_affinity() {
        let affinity = AffinityResult::miss(AffinityOutcome::MissNoHistory);
        let rules = vec![TriageRule {
            rule_type: "keyword".to_string(),
            target_butler: "health".to_string(),
            matcher: RuleMatcher::Keyword("diet".to_string()),
        }];
        let decision = evaluate(&affinity, &rules, "email", "a@b.com", "talking about diet plans");
        assert_eq!(decision.decision, RouteDecisionKind::RouteTo);
        assert_eq!(decision.target_butler.as_deref(), Some("health"));
    }

    #[test]
    fn no_match_passes_through() {
        let affinity = AffinityResult::miss(AffinityOutcome::MissNoHistory);
        let decision = evaluate(&affinity, &[], "email", "a@b.com", "hello there");
        assert_eq!(decision.decision, RouteDecisionKind::PassThrough);
    }

    #[test]
    fn rules_load_from_kv_state_dropping_matcherless_specs() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE state (key TEXT PRIMARY KEY, value TEXT NOT NULL,
             version INTEGER NOT NULL DEFAULT 1, updated_at TEXT NOT NULL);",
        )
        .unwrap();
        butlerhub_storage::state_set(
            &conn,
            "triage::rules",
            &serde_json::json!([
                {"rule_type": "sender_domain", "target_butler": "finance", "sender_domain": "bank.com"},
                {"rule_type": "keyword", "target_butler": "health", "keyword": "diet"},
                {"rule_type": "broken", "target_butler": "general"}
            ]),
        )
        .unwrap();

        let rules = load_rules(&conn);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].target_butler, "finance");
        assert_eq!(rules[1].target_butler, "health");
    }

    #[test]
    fn missing_rules_key_is_an_empty_rule_set() {
        let conn = conn();
        conn.execute_batch(
            "CREATE TABLE state (key TEXT PRIMARY KEY, value TEXT NOT NULL,
             version INTEGER NOT NULL DEFAULT 1, updated_at TEXT NOT NULL);",
        )
        .unwrap();
        assert!(load_rules(&conn).is_empty());
    }
}
