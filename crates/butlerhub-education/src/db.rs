use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{EducationError, Result};
use crate::mastery::{MasteryStatus, ResponseType};
use crate::types::{
    MindMap, MindMapEdge, MindMapNode, MindMapStatus, NewMindMapNode, NewQuizResponse,
    QuizResponse,
};

/// Creates the four tables this crate owns, per the `butlerhub-storage`
/// ownership boundary: core tables are migrated once for every butler;
/// module-specific tables are migrated by whichever crate owns the module,
/// against the same connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS mind_maps (
            id          TEXT PRIMARY KEY NOT NULL,
            status      TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active','completed','abandoned')),
            metadata    TEXT NOT NULL DEFAULT '{}',
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mind_map_nodes (
            id               TEXT PRIMARY KEY NOT NULL,
            mind_map_id      TEXT NOT NULL REFERENCES mind_maps(id) ON DELETE CASCADE,
            label            TEXT NOT NULL,
            depth            INTEGER NOT NULL DEFAULT 0,
            effort_minutes   INTEGER,
            mastery_status   TEXT NOT NULL DEFAULT 'unseen'
                CHECK (mastery_status IN ('unseen','diagnosed','learning','reviewing','mastered')),
            mastery_score    REAL NOT NULL DEFAULT 0.0,
            ease_factor      REAL NOT NULL DEFAULT 2.5,
            repetitions      INTEGER NOT NULL DEFAULT 0,
            next_review_at   TEXT,
            last_reviewed_at TEXT,
            sequence         INTEGER,
            metadata         TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_mind_map_nodes_map
            ON mind_map_nodes(mind_map_id, sequence);

        CREATE TABLE IF NOT EXISTS mind_map_edges (
            mind_map_id     TEXT NOT NULL REFERENCES mind_maps(id) ON DELETE CASCADE,
            parent_node_id  TEXT NOT NULL REFERENCES mind_map_nodes(id) ON DELETE CASCADE,
            child_node_id   TEXT NOT NULL REFERENCES mind_map_nodes(id) ON DELETE CASCADE,
            edge_type       TEXT NOT NULL DEFAULT 'prerequisite',
            PRIMARY KEY (parent_node_id, child_node_id, edge_type)
        );
        CREATE INDEX IF NOT EXISTS idx_mind_map_edges_map
            ON mind_map_edges(mind_map_id);

        CREATE TABLE IF NOT EXISTS quiz_responses (
            id             TEXT PRIMARY KEY NOT NULL,
            node_id        TEXT NOT NULL REFERENCES mind_map_nodes(id) ON DELETE CASCADE,
            mind_map_id    TEXT NOT NULL REFERENCES mind_maps(id) ON DELETE CASCADE,
            question_text  TEXT NOT NULL,
            user_answer    TEXT NOT NULL,
            quality        INTEGER NOT NULL,
            response_type  TEXT NOT NULL CHECK (response_type IN ('diagnostic','teach','review')),
            responded_at   TEXT NOT NULL,
            session_id     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_quiz_responses_node
            ON quiz_responses(node_id, responded_at);",
    )?;
    Ok(())
}

pub fn create_mind_map(conn: &Connection, metadata: serde_json::Value) -> Result<MindMap> {
    let now = Utc::now();
    let map = MindMap {
        id: Uuid::now_v7(),
        status: MindMapStatus::Active,
        metadata,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO mind_maps (id, status, metadata, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5)",
        rusqlite::params![
            map.id.to_string(),
            map.status.as_str(),
            serde_json::to_string(&map.metadata)?,
            map.created_at.to_rfc3339(),
            map.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(map)
}

pub fn get_mind_map(conn: &Connection, id: Uuid) -> Result<MindMap> {
    conn.query_row(
        "SELECT id, status, metadata, created_at, updated_at FROM mind_maps WHERE id = ?1",
        [id.to_string()],
        row_to_mind_map,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => EducationError::MindMapNotFound(id),
        other => EducationError::Database(other),
    })?
}

pub fn set_mind_map_status(conn: &Connection, id: Uuid, status: MindMapStatus) -> Result<()> {
    let rows = conn.execute(
        "UPDATE mind_maps SET status = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![id.to_string(), status.as_str(), Utc::now().to_rfc3339()],
    )?;
    if rows == 0 {
        return Err(EducationError::MindMapNotFound(id));
    }
    Ok(())
}

pub fn insert_node(conn: &Connection, mind_map_id: Uuid, new: NewMindMapNode) -> Result<MindMapNode> {
    let node = MindMapNode {
        id: Uuid::now_v7(),
        mind_map_id,
        label: new.label,
        depth: new.depth,
        effort_minutes: new.effort_minutes,
        mastery_status: MasteryStatus::Unseen,
        mastery_score: 0.0,
        ease_factor: crate::sm2::INITIAL_EASE_FACTOR,
        repetitions: 0,
        next_review_at: None,
        last_reviewed_at: None,
        sequence: None,
        metadata: new.metadata,
    };
    conn.execute(
        "INSERT INTO mind_map_nodes
         (id, mind_map_id, label, depth, effort_minutes, mastery_status, mastery_score,
          ease_factor, repetitions, next_review_at, last_reviewed_at, sequence, metadata)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,NULL,NULL,?10)",
        rusqlite::params![
            node.id.to_string(),
            node.mind_map_id.to_string(),
            node.label,
            node.depth,
            node.effort_minutes,
            node.mastery_status.as_str(),
            node.mastery_score,
            node.ease_factor,
            node.repetitions,
            serde_json::to_string(&node.metadata)?,
        ],
    )?;
    Ok(node)
}

pub fn insert_edge(
    conn: &Connection,
    mind_map_id: Uuid,
    parent_node_id: Uuid,
    child_node_id: Uuid,
    edge_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO mind_map_edges (mind_map_id, parent_node_id, child_node_id, edge_type)
         VALUES (?1,?2,?3,?4)",
        rusqlite::params![
            mind_map_id.to_string(),
            parent_node_id.to_string(),
            child_node_id.to_string(),
            edge_type,
        ],
    )?;
    Ok(())
}

pub fn get_node(conn: &Connection, id: Uuid) -> Result<MindMapNode> {
    conn.query_row(&format!("{NODE_SELECT} WHERE id = ?1"), [id.to_string()], row_to_node)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EducationError::NodeNotFound(id),
            other => EducationError::Database(other),
        })?
}

pub fn list_nodes(conn: &Connection, mind_map_id: Uuid) -> Result<Vec<MindMapNode>> {
    let mut stmt = conn.prepare(&format!("{NODE_SELECT} WHERE mind_map_id = ?1"))?;
    let rows = stmt
        .query_map([mind_map_id.to_string()], row_to_node)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().collect()
}

pub fn list_edges(conn: &Connection, mind_map_id: Uuid) -> Result<Vec<MindMapEdge>> {
    let mut stmt = conn.prepare(
        "SELECT mind_map_id, parent_node_id, child_node_id, edge_type
         FROM mind_map_edges WHERE mind_map_id = ?1",
    )?;
    let rows = stmt
        .query_map([mind_map_id.to_string()], row_to_edge)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Batched 1-based `sequence` write, one statement per node inside a single
/// transaction so a replan never leaves a half-renumbered map visible.
pub fn write_sequence(conn: &mut Connection, ordered_node_ids: &[Uuid]) -> Result<()> {
    let tx = conn.transaction()?;
    for (idx, id) in ordered_node_ids.iter().enumerate() {
        tx.execute(
            "UPDATE mind_map_nodes SET sequence = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), (idx as u32) + 1],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn set_node_metadata(conn: &Connection, id: Uuid, metadata: &serde_json::Value) -> Result<()> {
    conn.execute(
        "UPDATE mind_map_nodes SET metadata = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), serde_json::to_string(metadata)?],
    )?;
    Ok(())
}

pub fn update_node_mastery(
    conn: &Connection,
    id: Uuid,
    status: MasteryStatus,
    score: f64,
) -> Result<()> {
    conn.execute(
        "UPDATE mind_map_nodes SET mastery_status = ?2, mastery_score = ?3 WHERE id = ?1",
        rusqlite::params![id.to_string(), status.as_str(), score],
    )?;
    Ok(())
}

pub fn update_node_review_schedule(
    conn: &Connection,
    id: Uuid,
    ease_factor: f64,
    repetitions: u32,
    next_review_at: DateTime<Utc>,
    last_reviewed_at: DateTime<Utc>,
    status: Option<MasteryStatus>,
) -> Result<()> {
    if let Some(status) = status {
        conn.execute(
            "UPDATE mind_map_nodes
             SET ease_factor = ?2, repetitions = ?3, next_review_at = ?4,
                 last_reviewed_at = ?5, mastery_status = ?6
             WHERE id = ?1",
            rusqlite::params![
                id.to_string(),
                ease_factor,
                repetitions,
                next_review_at.to_rfc3339(),
                last_reviewed_at.to_rfc3339(),
                status.as_str(),
            ],
        )?;
    } else {
        conn.execute(
            "UPDATE mind_map_nodes
             SET ease_factor = ?2, repetitions = ?3, next_review_at = ?4, last_reviewed_at = ?5
             WHERE id = ?1",
            rusqlite::params![
                id.to_string(),
                ease_factor,
                repetitions,
                next_review_at.to_rfc3339(),
                last_reviewed_at.to_rfc3339(),
            ],
        )?;
    }
    Ok(())
}

pub fn insert_quiz_response(conn: &Connection, new: NewQuizResponse) -> Result<QuizResponse> {
    let response = QuizResponse {
        id: Uuid::now_v7(),
        node_id: new.node_id,
        mind_map_id: new.mind_map_id,
        question_text: new.question_text,
        user_answer: new.user_answer,
        quality: new.quality,
        response_type: new.response_type,
        responded_at: Utc::now(),
        session_id: new.session_id,
    };
    conn.execute(
        "INSERT INTO quiz_responses
         (id, node_id, mind_map_id, question_text, user_answer, quality, response_type,
          responded_at, session_id)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        rusqlite::params![
            response.id.to_string(),
            response.node_id.to_string(),
            response.mind_map_id.to_string(),
            response.question_text,
            response.user_answer,
            response.quality,
            response.response_type.as_str(),
            response.responded_at.to_rfc3339(),
            response.session_id,
        ],
    )?;
    Ok(response)
}

/// Quality scores for a node, oldest → newest, across all response types —
/// the history the recency-weighted mastery score is computed from.
pub fn quality_history_oldest_first(conn: &Connection, node_id: Uuid, limit: u32) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare(
        "SELECT quality FROM quiz_responses WHERE node_id = ?1
         ORDER BY responded_at DESC LIMIT ?2",
    )?;
    let mut newest_first: Vec<u8> = stmt
        .query_map(rusqlite::params![node_id.to_string(), limit], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    newest_first.reverse();
    Ok(newest_first)
}

/// A node's most recent qualities across every response type, newest first
/// — the window struggle detection looks at.
pub fn last_qualities_any_type(conn: &Connection, node_id: Uuid, limit: u32) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare(
        "SELECT quality FROM quiz_responses WHERE node_id = ?1
         ORDER BY responded_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![node_id.to_string(), limit], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The last 3 `review`-type qualities for a node, any order (only the
/// `>= 4` count matters to the caller).
pub fn last_review_qualities(conn: &Connection, node_id: Uuid, limit: u32) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare(
        "SELECT quality FROM quiz_responses
         WHERE node_id = ?1 AND response_type = 'review'
         ORDER BY responded_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![node_id.to_string(), limit], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Schedule bookkeeping lives against `scheduled_tasks`, owned by
/// `butlerhub-storage`'s core migrations; `ScheduledTaskStore` has no
/// delete-by-name or prefix-count helpers since ordinary tasks are addressed
/// by id, so this crate talks to the table directly for its two
/// name-pattern-addressed operations.
pub fn count_pending_node_schedules(conn: &Connection, node_ids: &[Uuid]) -> Result<usize> {
    if node_ids.is_empty() {
        return Ok(0);
    }
    let clauses: Vec<&str> = node_ids.iter().map(|_| "name LIKE ?").collect();
    let sql = format!(
        "SELECT COUNT(*) FROM scheduled_tasks WHERE enabled = 1 AND ({})",
        clauses.join(" OR ")
    );
    let patterns: Vec<String> = node_ids
        .iter()
        .map(|id| format!("{}{id}-rep%", crate::sm2::REVIEW_SCHEDULE_PREFIX))
        .collect();
    let count: i64 = conn.query_row(&sql, rusqlite::params_from_iter(patterns.iter()), |row| row.get(0))?;
    Ok(count as usize)
}

pub fn schedule_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM scheduled_tasks WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn delete_schedule_by_name(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("DELETE FROM scheduled_tasks WHERE name = ?1", [name])?;
    Ok(())
}

pub fn delete_schedules_like(conn: &Connection, pattern: &str) -> Result<()> {
    conn.execute("DELETE FROM scheduled_tasks WHERE name LIKE ?1", [pattern])?;
    Ok(())
}

const NODE_SELECT: &str = "SELECT id, mind_map_id, label, depth, effort_minutes, mastery_status, \
     mastery_score, ease_factor, repetitions, next_review_at, last_reviewed_at, sequence, metadata \
     FROM mind_map_nodes";

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MindMapNode>> {
    let id: String = row.get(0)?;
    let mind_map_id: String = row.get(1)?;
    let mastery_status_raw: String = row.get(5)?;
    let next_review_raw: Option<String> = row.get(9)?;
    let last_reviewed_raw: Option<String> = row.get(10)?;
    let metadata_raw: String = row.get(12)?;

    let metadata = match serde_json::from_str(&metadata_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(EducationError::Malformed(e))),
    };
    let mastery_status = match mastery_status_raw.parse() {
        Ok(s) => s,
        Err(_) => return Ok(Err(EducationError::NodeNotFound(Uuid::nil()))),
    };

    Ok(Ok(MindMapNode {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        mind_map_id: Uuid::parse_str(&mind_map_id).unwrap_or_default(),
        label: row.get(2)?,
        depth: row.get(3)?,
        effort_minutes: row.get(4)?,
        mastery_status,
        mastery_score: row.get(6)?,
        ease_factor: row.get(7)?,
        repetitions: row.get(8)?,
        next_review_at: next_review_raw.as_deref().map(parse_rfc3339),
        last_reviewed_at: last_reviewed_raw.as_deref().map(parse_rfc3339),
        sequence: row.get(11)?,
        metadata,
    }))
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<MindMapEdge> {
    let mind_map_id: String = row.get(0)?;
    let parent_node_id: String = row.get(1)?;
    let child_node_id: String = row.get(2)?;
    Ok(MindMapEdge {
        mind_map_id: Uuid::parse_str(&mind_map_id).unwrap_or_default(),
        parent_node_id: Uuid::parse_str(&parent_node_id).unwrap_or_default(),
        child_node_id: Uuid::parse_str(&child_node_id).unwrap_or_default(),
        edge_type: row.get(3)?,
    })
}

fn row_to_mind_map(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MindMap>> {
    let id: String = row.get(0)?;
    let status_raw: String = row.get(1)?;
    let metadata_raw: String = row.get(2)?;
    let created_at_raw: String = row.get(3)?;
    let updated_at_raw: String = row.get(4)?;

    let metadata = match serde_json::from_str(&metadata_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(EducationError::Malformed(e))),
    };
    let status = status_raw.parse().unwrap_or(MindMapStatus::Active);

    Ok(Ok(MindMap {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        status,
        metadata,
        created_at: parse_rfc3339(&created_at_raw),
        updated_at: parse_rfc3339(&updated_at_raw),
    }))
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn create_map_and_node_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();

        let map = create_mind_map(&conn, serde_json::json!({"topic": "algebra"})).unwrap();
        let node = insert_node(
            &conn,
            map.id,
            NewMindMapNode {
                label: "variables".into(),
                depth: 0,
                effort_minutes: Some(10),
                metadata: serde_json::json!({}),
            },
        )
        .unwrap();

        let fetched = get_node(&conn, node.id).unwrap();
        assert_eq!(fetched.label, "variables");
        assert_eq!(fetched.mastery_status, MasteryStatus::Unseen);
        assert_eq!(fetched.ease_factor, crate::sm2::INITIAL_EASE_FACTOR);
    }

    #[test]
    fn quality_history_is_oldest_first_and_capped() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let map = create_mind_map(&conn, serde_json::json!({})).unwrap();
        let node = insert_node(
            &conn,
            map.id,
            NewMindMapNode {
                label: "n".into(),
                depth: 0,
                effort_minutes: None,
                metadata: serde_json::json!({}),
            },
        )
        .unwrap();

        for q in [1u8, 2, 3, 4, 5, 0] {
            insert_quiz_response(
                &conn,
                NewQuizResponse {
                    node_id: node.id,
                    mind_map_id: map.id,
                    question_text: "q".into(),
                    user_answer: "a".into(),
                    quality: q,
                    response_type: ResponseType::Review,
                    session_id: None,
                },
            )
            .unwrap();
        }

        let history = quality_history_oldest_first(&conn, node.id, 5).unwrap();
        assert_eq!(history, vec![2, 3, 4, 5, 0]);
    }
}
