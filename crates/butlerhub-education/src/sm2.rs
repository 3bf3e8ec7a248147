use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub const EASE_FACTOR_MIN: f64 = 1.3;
pub const INITIAL_EASE_FACTOR: f64 = 2.5;
/// Mind maps at or above this many pending per-node review schedules get a
/// single per-map batch schedule instead of one schedule per node.
pub const BATCH_CAP: usize = 20;
pub const REVIEW_SCHEDULE_PREFIX: &str = "review-";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sm2Outcome {
    pub new_ease_factor: f64,
    pub new_repetitions: u32,
    pub interval_days: f64,
}

/// SM-2 update: interval progression `0.25, 0.5, 1.0, 6.0` days for
/// repetitions 0..3, then `last_interval * new_ease_factor` thereafter.
/// `quality < 3` resets repetitions to 0 and the interval to 0.25 days; the
/// ease factor still moves on a failure.
pub fn sm2_update(
    ease_factor: f64,
    repetitions: u32,
    quality: u8,
    last_interval: Option<f64>,
) -> Sm2Outcome {
    let q = quality.min(5) as f64;
    let ef_delta = 0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02);
    let new_ef = (ease_factor + ef_delta).max(EASE_FACTOR_MIN);

    if quality >= 3 {
        let new_reps = repetitions + 1;
        let interval = match repetitions {
            0 => 0.25,
            1 => 0.5,
            2 => 1.0,
            3 => 6.0,
            _ => last_interval.unwrap_or(6.0) * new_ef,
        };
        Sm2Outcome {
            new_ease_factor: new_ef,
            new_repetitions: new_reps,
            interval_days: interval,
        }
    } else {
        Sm2Outcome {
            new_ease_factor: new_ef,
            new_repetitions: 0,
            interval_days: 0.25,
        }
    }
}

/// Spaced-repetition-specific mastery regression: only `reviewing`/`mastered`
/// nodes move, and only on a failed recall. Distinct from the richer quiz
/// state machine in [`crate::mastery::determine_new_status`].
pub fn determine_sr_status(current_status: &str, quality: u8) -> Option<&'static str> {
    match (current_status, quality) {
        ("reviewing", q) if q < 3 => Some("learning"),
        ("mastered", q) if q < 3 => Some("reviewing"),
        _ => None,
    }
}

pub fn next_review_at(now: DateTime<Utc>, interval_days: f64) -> DateTime<Utc> {
    now + ChronoDuration::milliseconds((interval_days * 86_400_000.0) as i64)
}

/// One-shot cron expression that fires exactly once, at `dt`, with the
/// weekday field wildcarded.
pub fn datetime_to_cron(dt: DateTime<Utc>) -> String {
    use chrono::{Datelike, Timelike};
    format!("{} {} {} {} *", dt.minute(), dt.hour(), dt.day(), dt.month())
}

pub fn node_schedule_name(node_id: &str, repetitions: u32) -> String {
    format!("{REVIEW_SCHEDULE_PREFIX}{node_id}-rep{repetitions}")
}

pub fn batch_schedule_name(mind_map_id: &str) -> String {
    format!("{REVIEW_SCHEDULE_PREFIX}{mind_map_id}-batch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_recall_grows_ease_factor() {
        let out = sm2_update(2.5, 0, 5, None);
        assert!(out.new_ease_factor > 2.5);
        assert_eq!(out.new_repetitions, 1);
        assert_eq!(out.interval_days, 0.25);
    }

    #[test]
    fn fixed_interval_ladder_for_first_four_reps() {
        let mut ef = INITIAL_EASE_FACTOR;
        let mut reps = 0u32;
        let expected = [0.25, 0.5, 1.0, 6.0];
        for &want in &expected {
            let out = sm2_update(ef, reps, 4, Some(1.0));
            assert_eq!(out.interval_days, want);
            ef = out.new_ease_factor;
            reps = out.new_repetitions;
        }
    }

    #[test]
    fn fifth_rep_scales_by_last_interval_and_ease_factor() {
        let out = sm2_update(2.0, 4, 4, Some(6.0));
        assert_eq!(out.interval_days, 6.0 * out.new_ease_factor);
    }

    #[test]
    fn failed_recall_resets_repetitions_but_still_moves_ease_factor() {
        let out = sm2_update(2.5, 3, 1, Some(6.0));
        assert_eq!(out.new_repetitions, 0);
        assert_eq!(out.interval_days, 0.25);
        assert!(out.new_ease_factor < 2.5);
    }

    #[test]
    fn ease_factor_never_drops_below_floor() {
        let out = sm2_update(1.3, 2, 0, None);
        assert_eq!(out.new_ease_factor, EASE_FACTOR_MIN);
    }

    #[test]
    fn sr_status_regresses_only_on_failure() {
        assert_eq!(determine_sr_status("reviewing", 2), Some("learning"));
        assert_eq!(determine_sr_status("mastered", 1), Some("reviewing"));
        assert_eq!(determine_sr_status("reviewing", 4), None);
        assert_eq!(determine_sr_status("learning", 1), None);
    }
}
