use serde::{Deserialize, Serialize};

/// Exponential recency weights for up to 5 responses, oldest → newest.
const WEIGHTS_5: [f64; 5] = [1.0, 2.0, 4.0, 8.0, 16.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Diagnostic,
    Teach,
    Review,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Diagnostic => "diagnostic",
            ResponseType::Teach => "teach",
            ResponseType::Review => "review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryStatus {
    Unseen,
    Diagnosed,
    Learning,
    Reviewing,
    Mastered,
}

impl MasteryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasteryStatus::Unseen => "unseen",
            MasteryStatus::Diagnosed => "diagnosed",
            MasteryStatus::Learning => "learning",
            MasteryStatus::Reviewing => "reviewing",
            MasteryStatus::Mastered => "mastered",
        }
    }
}

impl std::str::FromStr for MasteryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unseen" => Ok(Self::Unseen),
            "diagnosed" => Ok(Self::Diagnosed),
            "learning" => Ok(Self::Learning),
            "reviewing" => Ok(Self::Reviewing),
            "mastered" => Ok(Self::Mastered),
            other => Err(format!("unknown mastery_status: {other}")),
        }
    }
}

impl std::str::FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "diagnostic" => Ok(Self::Diagnostic),
            "teach" => Ok(Self::Teach),
            "review" => Ok(Self::Review),
            other => Err(format!("unknown response_type: {other}")),
        }
    }
}

/// Recency-weighted mastery score from up to 5 quality scores, oldest→newest.
/// Older entries beyond the last 5 are discarded; fewer than 5 entries use
/// the newest-biased suffix of [`WEIGHTS_5`], renormalized.
pub fn compute_mastery_score(qualities: &[u8]) -> f64 {
    if qualities.is_empty() {
        return 0.0;
    }
    let recent = &qualities[qualities.len().saturating_sub(5)..];
    let n = recent.len();
    let weights = &WEIGHTS_5[WEIGHTS_5.len() - n..];
    let total_weight: f64 = weights.iter().sum();
    let weighted_sum: f64 = recent
        .iter()
        .zip(weights.iter())
        .map(|(&q, &w)| q as f64 * w)
        .sum();
    (weighted_sum / (total_weight * 5.0)).clamp(0.0, 1.0)
}

/// Mastery state machine. `mastered` is terminal here — never demoted by a
/// quiz response. Returns `None` when no transition applies.
pub fn determine_new_status(
    current_status: MasteryStatus,
    response_type: ResponseType,
    quality: u8,
    mastery_score: f64,
    last_3_review_qualities: &[u8],
) -> Option<MasteryStatus> {
    use MasteryStatus::*;
    use ResponseType::*;

    match current_status {
        Mastered => None,
        Unseen => match response_type {
            Diagnostic => Some(Diagnosed),
            Teach => Some(Learning),
            Review => None,
        },
        Diagnosed => {
            if response_type == Teach {
                Some(Learning)
            } else if quality < 3 {
                Some(Learning)
            } else {
                None
            }
        }
        Learning => {
            if quality >= 3 {
                Some(Reviewing)
            } else {
                None
            }
        }
        Reviewing => {
            if quality < 3 {
                Some(Learning)
            } else if mastery_score >= 0.85
                && last_3_review_qualities.len() >= 3
                && last_3_review_qualities.iter().all(|&q| q >= 4)
            {
                Some(Mastered)
            } else {
                None
            }
        }
    }
}

/// Result of applying a quiz response's mastery-math to a node: what the
/// storage layer should persist, computed without touching a database.
#[derive(Debug, Clone, PartialEq)]
pub struct MasteryUpdate {
    pub new_score: f64,
    pub new_status: Option<MasteryStatus>,
}

/// Pure counterpart of `mastery_record_response`'s scoring step: given the
/// node's quality history (oldest→newest, already capped to 5) and its last
/// 3 review-type qualities (any order, used only for the `>= 4` check), plus
/// the response just recorded, compute the score and status transition.
pub fn apply_quiz_response(
    current_status: MasteryStatus,
    response_type: ResponseType,
    quality: u8,
    quality_history_oldest_first: &[u8],
    last_3_review_qualities: &[u8],
) -> MasteryUpdate {
    let new_score = compute_mastery_score(quality_history_oldest_first);
    let new_status = determine_new_status(
        current_status,
        response_type,
        quality,
        new_score,
        last_3_review_qualities,
    )
    .filter(|&s| s != current_status);
    MasteryUpdate {
        new_score,
        new_status,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrugglingNode {
    pub node_id: String,
    pub reason: StruggleReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StruggleReason {
    ConsecutiveLowQuality,
    DecliningScore,
    Both,
}

impl StruggleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StruggleReason::ConsecutiveLowQuality => "consecutive_low_quality",
            StruggleReason::DecliningScore => "declining_score",
            StruggleReason::Both => "consecutive_low_quality,declining_score",
        }
    }
}

/// Struggle detection for a single node's 3 most recent quality scores
/// (newest first). Nodes with fewer than 3 responses, or already
/// `mastered`, are the caller's responsibility to filter out beforehand.
pub fn detect_struggle(recent_newest_first: &[u8]) -> Option<StruggleReason> {
    if recent_newest_first.len() < 3 {
        return None;
    }
    let consecutive_low = recent_newest_first[..3].iter().all(|&q| q <= 2);

    let score_1 = compute_mastery_score(&[recent_newest_first[0]]);
    let score_2 = compute_mastery_score(&[recent_newest_first[1], recent_newest_first[0]]);
    let score_3 = compute_mastery_score(&[
        recent_newest_first[2],
        recent_newest_first[1],
        recent_newest_first[0],
    ]);
    let declining = score_3 > score_2 && score_2 > score_1;

    match (consecutive_low, declining) {
        (true, true) => Some(StruggleReason::Both),
        (true, false) => Some(StruggleReason::ConsecutiveLowQuality),
        (false, true) => Some(StruggleReason::DecliningScore),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_is_zero_with_no_history() {
        assert_eq!(compute_mastery_score(&[]), 0.0);
    }

    #[test]
    fn score_uses_only_last_five_newest_biased() {
        let all_fives = compute_mastery_score(&[5, 5, 5, 5, 5]);
        assert!((all_fives - 1.0).abs() < 1e-9);

        let single_three = compute_mastery_score(&[3]);
        assert!((single_three - 0.6).abs() < 1e-9);
    }

    #[test]
    fn unseen_diagnostic_moves_to_diagnosed() {
        assert_eq!(
            determine_new_status(MasteryStatus::Unseen, ResponseType::Diagnostic, 5, 1.0, &[]),
            Some(MasteryStatus::Diagnosed)
        );
    }

    #[test]
    fn mastered_never_demoted() {
        assert_eq!(
            determine_new_status(MasteryStatus::Mastered, ResponseType::Review, 0, 0.0, &[0, 0, 0]),
            None
        );
    }

    #[test]
    fn reviewing_graduates_only_with_high_score_and_three_strong_reviews() {
        assert_eq!(
            determine_new_status(
                MasteryStatus::Reviewing,
                ResponseType::Review,
                5,
                0.9,
                &[4, 4, 4]
            ),
            Some(MasteryStatus::Mastered)
        );
        assert_eq!(
            determine_new_status(
                MasteryStatus::Reviewing,
                ResponseType::Review,
                5,
                0.9,
                &[4, 4, 3]
            ),
            None
        );
    }

    #[test]
    fn reviewing_regresses_on_low_quality() {
        assert_eq!(
            determine_new_status(MasteryStatus::Reviewing, ResponseType::Review, 1, 0.5, &[]),
            Some(MasteryStatus::Learning)
        );
    }

    #[test]
    fn struggle_detects_consecutive_low_quality() {
        assert_eq!(
            detect_struggle(&[1, 2, 0]),
            Some(StruggleReason::ConsecutiveLowQuality)
        );
    }

    #[test]
    fn struggle_detects_declining_score_plateau_then_crash() {
        // oldest→newest [3, 3, 0] means newest-first [0, 3, 3]
        assert_eq!(
            detect_struggle(&[0, 3, 3]),
            Some(StruggleReason::DecliningScore)
        );
    }

    #[test]
    fn no_struggle_with_fewer_than_three_responses() {
        assert_eq!(detect_struggle(&[1, 2]), None);
    }

    #[test]
    fn no_struggle_when_stable() {
        assert_eq!(detect_struggle(&[4, 4, 4]), None);
    }
}
