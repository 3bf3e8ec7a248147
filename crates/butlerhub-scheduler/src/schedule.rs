use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};

/// Compute the next UTC fire time strictly after `from` for a stored cron
/// expression. Accepts either the standard 5-field `m h dom mon dow` form or
/// the `cron` crate's native 6-field `sec m h dom mon dow` form — the 5-field
/// case is normalized by prepending a `0` seconds field.
///
/// `timezone` is carried on every `scheduled_tasks` row, but only `"UTC"`
/// is evaluated in its own clock; any other value is accepted and logged,
/// then evaluated as UTC (see DESIGN.md).
pub fn compute_next_run_at(
    cron_expr: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    if timezone != "UTC" {
        tracing::warn!(timezone, "non-UTC scheduler timezone evaluated as UTC");
    }

    let normalized = normalize_cron_expr(cron_expr);
    let schedule = CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: cron_expr.to_string(),
        reason: e.to_string(),
    })?;

    schedule
        .after(&from)
        .next()
        .ok_or_else(|| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            reason: "schedule produces no future occurrence".to_string(),
        })
}

fn normalize_cron_expr(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_is_normalized() {
        let from = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let next = compute_next_run_at("0 9 * * *", "UTC", from).unwrap();
        assert_eq!(next.hour_minute(), (9, 0));
    }

    #[test]
    fn one_shot_expression_fires_on_exact_date() {
        let from = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let next = compute_next_run_at("30 14 5 8 *", "UTC", from).unwrap();
        assert_eq!(next.date_naive(), chrono::NaiveDate::from_ymd_opt(2026, 8, 5).unwrap());
        assert_eq!(next.hour_minute(), (14, 30));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(compute_next_run_at("not a cron", "UTC", Utc::now()).is_err());
    }

    trait HourMinute {
        fn hour_minute(&self) -> (u32, u32);
    }

    impl HourMinute for DateTime<Utc> {
        fn hour_minute(&self) -> (u32, u32) {
            use chrono::Timelike;
            (self.hour(), self.minute())
        }
    }
}
