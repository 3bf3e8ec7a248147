use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mastery::{MasteryStatus, ResponseType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MindMapStatus {
    Active,
    Completed,
    Abandoned,
}

impl MindMapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MindMapStatus::Active => "active",
            MindMapStatus::Completed => "completed",
            MindMapStatus::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for MindMapStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(format!("unknown mind_map status: {other}")),
        }
    }
}

/// A row of `mind_maps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindMap {
    pub id: Uuid,
    pub status: MindMapStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `mind_map_nodes`. Distinct from [`crate::curriculum::CurriculumNode`],
/// which is the pure shape the topological-sort math operates on — this
/// carries the spaced-repetition and storage-assigned fields the pure layer
/// never touches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindMapNode {
    pub id: Uuid,
    pub mind_map_id: Uuid,
    pub label: String,
    pub depth: u32,
    pub effort_minutes: Option<u32>,
    pub mastery_status: MasteryStatus,
    pub mastery_score: f64,
    pub ease_factor: f64,
    pub repetitions: u32,
    pub next_review_at: Option<DateTime<Utc>>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub sequence: Option<u32>,
    pub metadata: serde_json::Value,
}

impl MindMapNode {
    /// Last known SM-2 interval in days, recovered from the gap between the
    /// two timestamps the spaced-repetition engine maintains. `None` before
    /// the node's first review.
    pub fn last_interval_days(&self) -> Option<f64> {
        let next = self.next_review_at?;
        let last = self.last_reviewed_at?;
        Some((next - last).num_milliseconds() as f64 / 86_400_000.0)
    }
}

/// What's needed to create a node at curriculum-generation time; server
/// assigns id and the spaced-repetition/mastery defaults.
#[derive(Debug, Clone)]
pub struct NewMindMapNode {
    pub label: String,
    pub depth: u32,
    pub effort_minutes: Option<u32>,
    pub metadata: serde_json::Value,
}

/// An edge in `mind_map_edges`. Only `prerequisite` edges participate in the
/// DAG/topological-sort invariant; other edge types are stored but ignored
/// by the curriculum math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MindMapEdge {
    pub mind_map_id: Uuid,
    pub parent_node_id: Uuid,
    pub child_node_id: Uuid,
    pub edge_type: String,
}

pub const PREREQUISITE_EDGE_TYPE: &str = "prerequisite";

/// A row of `quiz_responses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizResponse {
    pub id: Uuid,
    pub node_id: Uuid,
    pub mind_map_id: Uuid,
    pub question_text: String,
    pub user_answer: String,
    pub quality: u8,
    pub response_type: ResponseType,
    pub responded_at: DateTime<Utc>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewQuizResponse {
    pub node_id: Uuid,
    pub mind_map_id: Uuid,
    pub question_text: String,
    pub user_answer: String,
    pub quality: u8,
    pub response_type: ResponseType,
    pub session_id: Option<String>,
}
