//! Eligibility sweep (Switchboard-only, cron `ELIGIBILITY_SWEEP_CRON`):
//! stales and quarantines butlers that have stopped heartbeating.

use rusqlite::Connection;

use butlerhub_core::EligibilityState;

use crate::db;
use crate::error::Result;
use crate::types::SweepOutcome;

const STALE_REASON: &str = "liveness_ttl_expired";
const QUARANTINE_REASON: &str = "liveness_ttl_2x_expired";

/// Runs one sweep pass over every registered butler. NULL `last_seen_at` or
/// an already-`quarantined` butler is skipped and counted. Every actual
/// transition is logged to `butler_registry_eligibility_log` after the
/// registry row itself is updated.
pub fn sweep(conn: &Connection) -> Result<SweepOutcome> {
    let mut outcome = SweepOutcome::default();
    let now = chrono::Utc::now();

    for butler in db::list_all_registered(conn)? {
        if matches!(butler.eligibility_state, EligibilityState::Quarantined) {
            outcome.skipped += 1;
            continue;
        }

        let Some(last_seen_at) = butler.last_seen_at else {
            outcome.skipped += 1;
            continue;
        };

        let elapsed = (now - last_seen_at).num_seconds();
        let ttl = butler.liveness_ttl_seconds;

        if elapsed > ttl * 2 {
            let previous = butler.eligibility_state.to_string();
            db::set_eligibility(conn, &butler.name, EligibilityState::Quarantined, Some(QUARANTINE_REASON))?;
            db::log_eligibility_transition(conn, &butler.name, &previous, "quarantined", QUARANTINE_REASON)?;
            outcome.quarantined.push(butler.name);
        } else if elapsed > ttl && matches!(butler.eligibility_state, EligibilityState::Active) {
            let previous = butler.eligibility_state.to_string();
            db::set_eligibility(conn, &butler.name, EligibilityState::Stale, Some(STALE_REASON))?;
            db::log_eligibility_transition(conn, &butler.name, &previous, "stale", STALE_REASON)?;
            outcome.staled.push(butler.name);
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        conn
    }

    fn backdate(conn: &Connection, name: &str, seconds_ago: i64) {
        conn.execute(
            "UPDATE butler_registry SET last_seen_at = ?2 WHERE name = ?1",
            rusqlite::params![name, (chrono::Utc::now() - chrono::Duration::seconds(seconds_ago)).to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn fresh_heartbeat_stays_active() {
        let conn = conn();
        db::upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        let outcome = sweep(&conn).unwrap();
        assert!(outcome.quarantined.is_empty());
        assert!(outcome.staled.is_empty());
    }

    #[test]
    fn elapsed_past_ttl_transitions_to_stale() {
        let conn = conn();
        db::upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        backdate(&conn, "health", 400);
        let outcome = sweep(&conn).unwrap();
        assert_eq!(outcome.staled, vec!["health".to_string()]);
    }

    #[test]
    fn elapsed_past_double_ttl_transitions_to_quarantined() {
        let conn = conn();
        db::upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        backdate(&conn, "health", 700);
        let outcome = sweep(&conn).unwrap();
        assert_eq!(outcome.quarantined, vec!["health".to_string()]);
    }

    #[test]
    fn already_quarantined_is_skipped_not_retransitioned() {
        let conn = conn();
        db::upsert_registration(&conn, "health", &["health".to_string()], 300).unwrap();
        db::set_eligibility(&conn, "health", EligibilityState::Quarantined, Some("manual")).unwrap();
        backdate(&conn, "health", 10000);
        let outcome = sweep(&conn).unwrap();
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.quarantined.is_empty());
    }

    #[test]
    fn null_last_seen_is_skipped() {
        let conn = conn();
        conn.execute(
            "INSERT INTO butler_registry (name, modules, eligibility_state, liveness_ttl_seconds) VALUES ('finance', '[]', 'active', 300)",
            [],
        )
        .unwrap();
        let outcome = sweep(&conn).unwrap();
        assert_eq!(outcome.skipped, 1);
    }
}
