//! Transactional wrappers over [`crate::db`] that apply the pure math in
//! [`crate::sm2`], [`crate::mastery`], and [`crate::curriculum`] to stored
//! mind maps — the operations a butler's tool layer calls directly.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use butlerhub_scheduler::{DispatchMode, NewScheduledTask, ScheduledTaskStore};

use crate::curriculum::{
    apply_diagnostic_seeding, check_dag_acyclicity, frontier_nodes, topological_sort_with_tiebreak,
    validate_constraints, CurriculumError, CurriculumNode, PrerequisiteEdge,
};
use crate::db;
use crate::error::Result;
use crate::mastery::{self, MasteryStatus, MasteryUpdate};
use crate::sm2::{self, Sm2Outcome};
use crate::types::{
    MindMap, MindMapNode, MindMapStatus, NewMindMapNode, NewQuizResponse, QuizResponse,
    PREREQUISITE_EDGE_TYPE,
};

/// Input to [`curriculum_generate`]: node specs keyed by label (edges refer
/// to nodes by label since ids don't exist until insertion) plus optional
/// diagnostic seeding.
pub struct CurriculumSpec {
    pub metadata: serde_json::Value,
    pub nodes: Vec<NewMindMapNode>,
    /// `(parent_label, child_label)` prerequisite edges.
    pub prerequisite_edges: Vec<(String, String)>,
    pub diagnostic_results: Option<HashMap<String, u8>>,
}

fn to_curriculum_node(node: &MindMapNode) -> CurriculumNode {
    CurriculumNode {
        id: node.id.to_string(),
        depth: node.depth,
        effort_minutes: node.effort_minutes,
        mastery_status: node.mastery_status.as_str().to_string(),
        label: node.label.clone(),
    }
}

fn to_prerequisite_edges(edges: &[crate::types::MindMapEdge]) -> Vec<PrerequisiteEdge> {
    edges
        .iter()
        .filter(|e| e.edge_type == PREREQUISITE_EDGE_TYPE)
        .map(|e| PrerequisiteEdge {
            parent_node_id: e.parent_node_id.to_string(),
            child_node_id: e.child_node_id.to_string(),
        })
        .collect()
}

/// Creates a mind map, its nodes and prerequisite edges, validates the
/// structural limits and DAG invariant, topologically sorts with the
/// documented tie-break, and persists 1-based `sequence`. Optional
/// `diagnostic_results` seed matching-labeled nodes as `diagnosed` before
/// the sort runs, so the seeded `mastery_rank` term affects ordering.
pub fn curriculum_generate(conn: &mut Connection, spec: CurriculumSpec) -> Result<(MindMap, Vec<MindMapNode>)> {
    let map = db::create_mind_map(conn, spec.metadata)?;

    let mut label_to_id: HashMap<String, Uuid> = HashMap::new();
    for new_node in spec.nodes {
        let label = new_node.label.clone();
        let node = db::insert_node(conn, map.id, new_node)?;
        label_to_id.insert(label, node.id);
    }

    for (parent_label, child_label) in &spec.prerequisite_edges {
        let parent_id = *label_to_id
            .get(parent_label)
            .ok_or_else(|| CurriculumError::UnknownLabel(parent_label.clone()))?;
        let child_id = *label_to_id
            .get(child_label)
            .ok_or_else(|| CurriculumError::UnknownLabel(child_label.clone()))?;
        db::insert_edge(conn, map.id, parent_id, child_id, PREREQUISITE_EDGE_TYPE)?;
    }

    let mut nodes = db::list_nodes(conn, map.id)?;
    let edges = db::list_edges(conn, map.id)?;

    if let Some(diagnostic_results) = &spec.diagnostic_results {
        let mut curriculum_nodes: Vec<CurriculumNode> = nodes.iter().map(to_curriculum_node).collect();
        let seeded = apply_diagnostic_seeding(&mut curriculum_nodes, diagnostic_results);
        for (node_id, score) in seeded {
            let id = Uuid::parse_str(&node_id).unwrap_or_default();
            db::update_node_mastery(conn, id, MasteryStatus::Diagnosed, score)?;
        }
        nodes = db::list_nodes(conn, map.id)?;
    }

    let curriculum_nodes: Vec<CurriculumNode> = nodes.iter().map(to_curriculum_node).collect();
    let prerequisite_edges = to_prerequisite_edges(&edges);

    validate_constraints(&curriculum_nodes)?;
    check_dag_acyclicity(&curriculum_nodes, &prerequisite_edges)?;
    let ordered_ids = topological_sort_with_tiebreak(&curriculum_nodes, &prerequisite_edges)?;

    let ordered_uuids: Vec<Uuid> = ordered_ids
        .iter()
        .map(|id| Uuid::parse_str(id).unwrap_or_default())
        .collect();
    db::write_sequence(conn, &ordered_uuids)?;

    let nodes = db::list_nodes(conn, map.id)?;
    Ok((map, nodes))
}

/// Re-runs the topological sort without mutating the DAG, then marks every
/// `mastered` node skippable in its metadata.
pub fn curriculum_replan(conn: &mut Connection, mind_map_id: Uuid) -> Result<Vec<Uuid>> {
    let nodes = db::list_nodes(conn, mind_map_id)?;
    let edges = db::list_edges(conn, mind_map_id)?;

    let curriculum_nodes: Vec<CurriculumNode> = nodes.iter().map(to_curriculum_node).collect();
    let prerequisite_edges = to_prerequisite_edges(&edges);

    check_dag_acyclicity(&curriculum_nodes, &prerequisite_edges)?;
    let ordered_ids = topological_sort_with_tiebreak(&curriculum_nodes, &prerequisite_edges)?;
    let ordered_uuids: Vec<Uuid> = ordered_ids
        .iter()
        .map(|id| Uuid::parse_str(id).unwrap_or_default())
        .collect();
    db::write_sequence(conn, &ordered_uuids)?;

    for node in &nodes {
        if node.mastery_status == MasteryStatus::Mastered {
            let mut metadata = node.metadata.clone();
            metadata["skippable"] = serde_json::Value::Bool(true);
            db::set_node_metadata(conn, node.id, &metadata)?;
        }
    }

    Ok(ordered_uuids)
}

/// The frontier node with the lowest `sequence`, or `None` if the map is
/// completed/abandoned or no node currently has all prerequisites mastered.
pub fn curriculum_next_node(conn: &Connection, mind_map_id: Uuid) -> Result<Option<MindMapNode>> {
    let map = db::get_mind_map(conn, mind_map_id)?;
    if map.status != MindMapStatus::Active {
        return Ok(None);
    }

    let nodes = db::list_nodes(conn, mind_map_id)?;
    let edges = db::list_edges(conn, mind_map_id)?;
    let curriculum_nodes: Vec<CurriculumNode> = nodes.iter().map(to_curriculum_node).collect();
    let prerequisite_edges = to_prerequisite_edges(&edges);

    let sequence: HashMap<String, u32> = nodes
        .iter()
        .filter_map(|n| n.sequence.map(|s| (n.id.to_string(), s)))
        .collect();

    let frontier = frontier_nodes(&curriculum_nodes, &prerequisite_edges, &sequence);
    let Some(first) = frontier.first() else {
        return Ok(None);
    };
    let id = Uuid::parse_str(&first.id).unwrap_or_default();
    Ok(nodes.into_iter().find(|n| n.id == id))
}

/// Records a quiz response, updates the node's recency-weighted mastery
/// score and state machine, and completes the map if every node is now
/// `mastered`. No-op on the map's `completed`/`abandoned` status: a map
/// that's already terminal doesn't reopen just because a late response
/// comes in for one of its (already mastered) nodes.
pub fn record_quiz_response(conn: &mut Connection, new: NewQuizResponse) -> Result<(QuizResponse, MasteryUpdate)> {
    let node_id = new.node_id;
    let mind_map_id = new.mind_map_id;
    let tx = conn.transaction()?;

    let node = db::get_node(&tx, node_id)?;
    let response = db::insert_quiz_response(&tx, new)?;

    let quality_history = db::quality_history_oldest_first(&tx, node_id, 5)?;
    let last_3_review = db::last_review_qualities(&tx, node_id, 3)?;

    let update = mastery::apply_quiz_response(
        node.mastery_status,
        response.response_type,
        response.quality,
        &quality_history,
        &last_3_review,
    );

    let new_status = update.new_status.unwrap_or(node.mastery_status);
    db::update_node_mastery(&tx, node_id, new_status, update.new_score)?;

    if update.new_status == Some(MasteryStatus::Mastered) {
        let map = db::get_mind_map(&tx, mind_map_id)?;
        if map.status == MindMapStatus::Active {
            let nodes = db::list_nodes(&tx, mind_map_id)?;
            if nodes.iter().all(|n| n.mastery_status == MasteryStatus::Mastered) {
                db::set_mind_map_status(&tx, mind_map_id, MindMapStatus::Completed)?;
            }
        }
    }

    tx.commit()?;
    Ok((response, update))
}

/// SM-2 spaced-repetition review of a single node: recomputes the ease
/// factor/interval, applies the (narrower) spaced-repetition mastery delta,
/// and re-derives the node's schedule — one-shot per node ordinarily, or a
/// single per-map batch schedule once the map has ≥ [`sm2::BATCH_CAP`]
/// pending review schedules.
pub fn spaced_repetition_review(conn: &mut Connection, node_id: Uuid, quality: u8) -> Result<Sm2Outcome> {
    let tx = conn.transaction()?;
    let node = db::get_node(&tx, node_id)?;
    let outcome = sm2::sm2_update(
        node.ease_factor,
        node.repetitions,
        quality,
        node.last_interval_days(),
    );

    let now = Utc::now();
    let next_review_at = sm2::next_review_at(now, outcome.interval_days);
    let sr_status = sm2::determine_sr_status(node.mastery_status.as_str(), quality)
        .and_then(|s| s.parse::<MasteryStatus>().ok());

    db::update_node_review_schedule(
        &tx,
        node_id,
        outcome.new_ease_factor,
        outcome.new_repetitions,
        next_review_at,
        now,
        sr_status,
    )?;

    db::delete_schedules_like(&tx, &format!("{}{node_id}-rep%", sm2::REVIEW_SCHEDULE_PREFIX))?;

    let map_nodes = db::list_nodes(&tx, node.mind_map_id)?;
    let node_ids: Vec<Uuid> = map_nodes.iter().map(|n| n.id).collect();
    let pending = db::count_pending_node_schedules(&tx, &node_ids)?;
    let batch_name = sm2::batch_schedule_name(&node.mind_map_id.to_string());

    if pending >= sm2::BATCH_CAP {
        if !db::schedule_exists(&tx, &batch_name)? {
            let job_args = serde_json::json!({"mind_map_id": node.mind_map_id});
            create_review_schedule(&tx, &batch_name, next_review_at, job_args)?;
        }
    } else {
        db::delete_schedule_by_name(&tx, &batch_name)?;
        let name = sm2::node_schedule_name(&node_id.to_string(), outcome.new_repetitions);
        let job_args = serde_json::json!({"node_id": node_id});
        create_review_schedule(&tx, &name, next_review_at, job_args)?;
    }

    tx.commit()?;
    Ok(outcome)
}

fn create_review_schedule(
    conn: &Connection,
    name: &str,
    next_review_at: chrono::DateTime<Utc>,
    job_args: serde_json::Value,
) -> Result<()> {
    ScheduledTaskStore::create(
        conn,
        NewScheduledTask {
            name: name.to_string(),
            cron: sm2::datetime_to_cron(next_review_at),
            dispatch_mode: DispatchMode::Job,
            prompt: None,
            job_name: Some("spaced_repetition_review".to_string()),
            job_args: Some(job_args),
            timezone: "UTC".to_string(),
            start_at: None,
            end_at: None,
            until_at: Some(next_review_at + ChronoDuration::hours(24)),
        },
    )?;
    Ok(())
}

/// Removes every review schedule for a node (per-node and, if the map has
/// since fallen back to one, the map's batch schedule) once the node
/// reaches a terminal state. Present in the pre-distillation sources but
/// dropped from the distilled spec; kept here since spaced-repetition
/// schedules otherwise accumulate forever for mastered/abandoned content.
pub fn spaced_repetition_schedule_cleanup(conn: &Connection, mind_map_id: Uuid, node_id: Uuid) -> Result<()> {
    db::delete_schedules_like(conn, &format!("{}{node_id}-rep%", sm2::REVIEW_SCHEDULE_PREFIX))?;

    let map_nodes = db::list_nodes(conn, mind_map_id)?;
    let all_terminal = map_nodes
        .iter()
        .all(|n| matches!(n.mastery_status, MasteryStatus::Mastered));
    if all_terminal {
        let batch_name = sm2::batch_schedule_name(&mind_map_id.to_string());
        db::delete_schedule_by_name(conn, &batch_name)?;
    }
    Ok(())
}

/// Non-mastered nodes with ≥ 3 responses whose recent quality history
/// signals a struggle (consecutive low scores, a declining trend, or both).
pub fn detect_struggling_nodes(conn: &Connection, mind_map_id: Uuid) -> Result<Vec<crate::mastery::StrugglingNode>> {
    let nodes = db::list_nodes(conn, mind_map_id)?;
    let mut struggling = Vec::new();
    for node in nodes {
        if node.mastery_status == MasteryStatus::Mastered {
            continue;
        }
        let recent_newest_first = db::last_qualities_any_type(conn, node.id, 3)?;
        if let Some(reason) = mastery::detect_struggle(&recent_newest_first) {
            struggling.push(crate::mastery::StrugglingNode {
                node_id: node.id.to_string(),
                reason,
            });
        }
    }
    Ok(struggling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewMindMapNode;

    fn node_spec(label: &str) -> NewMindMapNode {
        NewMindMapNode {
            label: label.to_string(),
            depth: 0,
            effort_minutes: None,
            metadata: serde_json::json!({}),
        }
    }

    fn conn_with_schedules() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE scheduled_tasks (
                id TEXT PRIMARY KEY, name TEXT NOT NULL UNIQUE, cron TEXT NOT NULL,
                dispatch_mode TEXT NOT NULL, prompt TEXT, job_name TEXT, job_args TEXT,
                timezone TEXT NOT NULL DEFAULT 'UTC', start_at TEXT, end_at TEXT, until_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1, next_run_at TEXT, last_run_at TEXT,
                last_result TEXT, created_at TEXT NOT NULL
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn curriculum_generate_sequences_by_dependency() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();

        let (_, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("variables"), node_spec("expressions")],
                prerequisite_edges: vec![("variables".to_string(), "expressions".to_string())],
                diagnostic_results: None,
            },
        )
        .unwrap();

        let variables = nodes.iter().find(|n| n.label == "variables").unwrap();
        let expressions = nodes.iter().find(|n| n.label == "expressions").unwrap();
        assert!(variables.sequence < expressions.sequence);
    }

    #[test]
    fn record_quiz_response_completes_map_when_all_mastered() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();

        let (map, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("only")],
                prerequisite_edges: vec![],
                diagnostic_results: None,
            },
        )
        .unwrap();
        let node = &nodes[0];

        // Drive the node from unseen to mastered: teach -> learning, then
        // three strong reviews to clear the mastery-score + streak bar.
        record_quiz_response(
            &mut conn,
            NewQuizResponse {
                node_id: node.id,
                mind_map_id: map.id,
                question_text: "q".into(),
                user_answer: "a".into(),
                quality: 5,
                response_type: crate::mastery::ResponseType::Teach,
                session_id: None,
            },
        )
        .unwrap();

        for _ in 0..3 {
            record_quiz_response(
                &mut conn,
                NewQuizResponse {
                    node_id: node.id,
                    mind_map_id: map.id,
                    question_text: "q".into(),
                    user_answer: "a".into(),
                    quality: 5,
                    response_type: crate::mastery::ResponseType::Review,
                    session_id: None,
                },
            )
            .unwrap();
        }

        let map_after = db::get_mind_map(&conn, map.id).unwrap();
        assert_eq!(map_after.status, MindMapStatus::Completed);
    }

    #[test]
    fn next_node_follows_sequence_and_skips_blocked_children() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();

        let (map, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("basics"), node_spec("advanced")],
                prerequisite_edges: vec![("basics".to_string(), "advanced".to_string())],
                diagnostic_results: None,
            },
        )
        .unwrap();

        let next = curriculum_next_node(&conn, map.id).unwrap().unwrap();
        assert_eq!(next.label, "basics");

        // Mastering the prerequisite unblocks its child.
        let basics = nodes.iter().find(|n| n.label == "basics").unwrap();
        db::update_node_mastery(&conn, basics.id, MasteryStatus::Mastered, 1.0).unwrap();
        let next = curriculum_next_node(&conn, map.id).unwrap().unwrap();
        assert_eq!(next.label, "advanced");
    }

    #[test]
    fn replan_marks_mastered_nodes_skippable_without_touching_edges() {
        let mut conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();

        let (map, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("done"), node_spec("todo")],
                prerequisite_edges: vec![],
                diagnostic_results: None,
            },
        )
        .unwrap();
        let done = nodes.iter().find(|n| n.label == "done").unwrap();
        db::update_node_mastery(&conn, done.id, MasteryStatus::Mastered, 1.0).unwrap();

        let order = curriculum_replan(&mut conn, map.id).unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(db::list_edges(&conn, map.id).unwrap().len(), 0);

        let reloaded = db::get_node(&conn, done.id).unwrap();
        assert_eq!(reloaded.metadata["skippable"], serde_json::Value::Bool(true));
    }

    #[test]
    fn spaced_repetition_review_advances_node_and_creates_one_shot_schedule() {
        let mut conn = conn_with_schedules();
        let (_, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("derivatives")],
                prerequisite_edges: vec![],
                diagnostic_results: None,
            },
        )
        .unwrap();
        let node_id = nodes[0].id;

        let outcome = spaced_repetition_review(&mut conn, node_id, 5).unwrap();
        assert_eq!(outcome.new_repetitions, 1);
        assert_eq!(outcome.interval_days, 0.25);

        let updated = db::get_node(&conn, node_id).unwrap();
        assert_eq!(updated.repetitions, 1);
        assert!(updated.next_review_at.is_some());
        assert!(updated.last_reviewed_at.is_some());

        let name = sm2::node_schedule_name(&node_id.to_string(), 1);
        assert!(db::schedule_exists(&conn, &name).unwrap());
    }

    #[test]
    fn failed_review_regresses_reviewing_node_to_learning() {
        let mut conn = conn_with_schedules();
        let (map, nodes) = curriculum_generate(
            &mut conn,
            CurriculumSpec {
                metadata: serde_json::json!({}),
                nodes: vec![node_spec("integrals")],
                prerequisite_edges: vec![],
                diagnostic_results: None,
            },
        )
        .unwrap();
        let node_id = nodes[0].id;
        db::update_node_mastery(&conn, node_id, MasteryStatus::Reviewing, 0.7).unwrap();

        spaced_repetition_review(&mut conn, node_id, 1).unwrap();

        let updated = db::get_node(&conn, node_id).unwrap();
        assert_eq!(updated.mastery_status, MasteryStatus::Learning);
        assert_eq!(updated.repetitions, 0);

        spaced_repetition_schedule_cleanup(&conn, map.id, node_id).unwrap();
        let name = sm2::node_schedule_name(&node_id.to_string(), 0);
        assert!(!db::schedule_exists(&conn, &name).unwrap());
    }
}
