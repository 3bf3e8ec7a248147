use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{EntityError, Result};
use crate::types::{Entity, Fact, NewEntity, NewFact};

/// Creates the two tables this crate owns, in a butler's own database: one
/// entity per tenant-scoped thing, and the facts attached to it.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entities (
            id              TEXT PRIMARY KEY NOT NULL,
            tenant_id       TEXT NOT NULL,
            canonical_name  TEXT NOT NULL,
            entity_type     TEXT,
            aliases         TEXT NOT NULL DEFAULT '[]',
            tombstoned_at   TEXT,
            merged_into     TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entities_tenant_name
            ON entities(tenant_id, canonical_name);

        CREATE TABLE IF NOT EXISTS facts (
            id          TEXT PRIMARY KEY NOT NULL,
            entity_id   TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            predicate   TEXT NOT NULL,
            content     TEXT NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_entity ON facts(entity_id, active);",
    )?;
    Ok(())
}

pub fn create_entity(conn: &Connection, new: NewEntity) -> Result<Entity> {
    let now = Utc::now();
    let entity = Entity {
        id: Uuid::now_v7(),
        tenant_id: new.tenant_id,
        canonical_name: new.canonical_name,
        entity_type: new.entity_type,
        aliases: new.aliases,
        tombstoned_at: None,
        merged_into: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO entities
         (id, tenant_id, canonical_name, entity_type, aliases,
          tombstoned_at, merged_into, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        rusqlite::params![
            entity.id.to_string(),
            entity.tenant_id,
            entity.canonical_name,
            entity.entity_type,
            serde_json::to_string(&entity.aliases)?,
            entity.tombstoned_at.map(|d| d.to_rfc3339()),
            entity.merged_into.map(|id| id.to_string()),
            entity.created_at.to_rfc3339(),
            entity.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(entity)
}

const ENTITY_COLUMNS: &str = "id, tenant_id, canonical_name, entity_type, aliases, \
     tombstoned_at, merged_into, created_at, updated_at";

pub fn get_entity(conn: &Connection, id: Uuid) -> Result<Entity> {
    let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], row_to_entity)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EntityError::NotFound(id),
            other => EntityError::Database(other),
        })?
}

fn type_filter_clause(entity_type: Option<&str>) -> &'static str {
    if entity_type.is_some() {
        " AND entity_type = ?3"
    } else {
        ""
    }
}

/// Candidates for the exact-name tier: case-insensitive `canonical_name`
/// match, excluding tombstoned rows.
pub fn find_by_exact_name(conn: &Connection, tenant_id: &str, name: &str, entity_type: Option<&str>) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities \
         WHERE tenant_id = ?1 AND LOWER(canonical_name) = LOWER(?2) AND tombstoned_at IS NULL{}",
        type_filter_clause(entity_type),
    );
    query_entities(conn, &sql, tenant_id, name, entity_type)
}

/// Candidates for the alias tier: any alias in the JSON `aliases` array
/// matches case-insensitively.
pub fn find_by_alias(conn: &Connection, tenant_id: &str, name: &str, entity_type: Option<&str>) -> Result<Vec<Entity>> {
    let type_clause = if entity_type.is_some() { " AND e.entity_type = ?3" } else { "" };
    let sql = format!(
        "SELECT e.id, e.tenant_id, e.canonical_name, e.entity_type, e.aliases, \
         e.tombstoned_at, e.merged_into, e.created_at, e.updated_at \
         FROM entities e, json_each(e.aliases) a \
         WHERE e.tenant_id = ?1 AND LOWER(a.value) = LOWER(?2) AND e.tombstoned_at IS NULL{type_clause}",
    );
    query_entities(conn, &sql, tenant_id, name, entity_type)
}

/// Candidates for the prefix/substring tier.
pub fn find_by_substring(conn: &Connection, tenant_id: &str, name: &str, entity_type: Option<&str>) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities \
         WHERE tenant_id = ?1 AND LOWER(canonical_name) LIKE '%' || LOWER(?2) || '%' AND tombstoned_at IS NULL{}",
        type_filter_clause(entity_type),
    );
    query_entities(conn, &sql, tenant_id, name, entity_type)
}

/// All live (non-tombstoned) entities for a tenant, for the fuzzy tier to
/// score in-process — SQLite has no trigram-similarity builtin.
pub fn list_active_for_tenant(conn: &Connection, tenant_id: &str, entity_type: Option<&str>) -> Result<Vec<Entity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE tenant_id = ?1 AND tombstoned_at IS NULL{}",
        type_filter_clause(entity_type),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<rusqlite::Result<Result<Entity>>> = if let Some(t) = entity_type {
        stmt.query_map(rusqlite::params![tenant_id, t], row_to_entity)?.collect()
    } else {
        stmt.query_map(rusqlite::params![tenant_id], row_to_entity)?.collect()
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn query_entities(conn: &Connection, sql: &str, tenant_id: &str, name: &str, entity_type: Option<&str>) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<rusqlite::Result<Result<Entity>>> = if let Some(t) = entity_type {
        stmt.query_map(rusqlite::params![tenant_id, name, t], row_to_entity)?.collect()
    } else {
        stmt.query_map(rusqlite::params![tenant_id, name], row_to_entity)?.collect()
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

pub fn list_active_facts(conn: &Connection, entity_id: Uuid, limit: usize) -> Result<Vec<Fact>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_id, predicate, content, active, created_at \
         FROM facts WHERE entity_id = ?1 AND active = 1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![entity_id.to_string(), limit as i64], row_to_fact)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn add_fact(conn: &Connection, entity_id: Uuid, new: NewFact) -> Result<Fact> {
    let fact = Fact {
        id: Uuid::now_v7(),
        entity_id,
        predicate: new.predicate,
        content: new.content,
        active: true,
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO facts (id, entity_id, predicate, content, active, created_at)
         VALUES (?1,?2,?3,?4,?5,?6)",
        rusqlite::params![
            fact.id.to_string(),
            fact.entity_id.to_string(),
            fact.predicate,
            fact.content,
            fact.active as i32,
            fact.created_at.to_rfc3339(),
        ],
    )?;
    Ok(fact)
}

/// Re-points all facts from `source` to `target`, appends `source`'s
/// canonical name and aliases onto `target`'s alias list, and tombstones
/// `source` pointing at `target`.
pub fn merge_entities(conn: &Connection, source: &Entity, target: &Entity) -> Result<()> {
    if source.id == target.id {
        return Err(EntityError::SelfMerge(source.id));
    }

    conn.execute(
        "UPDATE facts SET entity_id = ?2 WHERE entity_id = ?1",
        rusqlite::params![source.id.to_string(), target.id.to_string()],
    )?;

    let mut merged_aliases = target.aliases.clone();
    merged_aliases.push(source.canonical_name.clone());
    merged_aliases.extend(source.aliases.iter().cloned());
    merged_aliases.sort();
    merged_aliases.dedup();

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE entities SET aliases = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![target.id.to_string(), serde_json::to_string(&merged_aliases)?, now],
    )?;
    conn.execute(
        "UPDATE entities SET tombstoned_at = ?2, merged_into = ?3, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![source.id.to_string(), now, target.id.to_string()],
    )?;
    Ok(())
}

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Entity>> {
    let id: String = row.get(0)?;
    let aliases_raw: String = row.get(4)?;
    let tombstoned_at_raw: Option<String> = row.get(5)?;
    let merged_into_raw: Option<String> = row.get(6)?;
    let created_at_raw: String = row.get(7)?;
    let updated_at_raw: String = row.get(8)?;

    let aliases = match serde_json::from_str(&aliases_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(EntityError::Malformed(e))),
    };

    Ok(Ok(Entity {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        tenant_id: row.get(1)?,
        canonical_name: row.get(2)?,
        entity_type: row.get(3)?,
        aliases,
        tombstoned_at: tombstoned_at_raw.as_deref().map(parse_rfc3339),
        merged_into: merged_into_raw.and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: parse_rfc3339(&created_at_raw),
        updated_at: parse_rfc3339(&updated_at_raw),
    }))
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let id: String = row.get(0)?;
    let entity_id: String = row.get(1)?;
    let created_at_raw: String = row.get(5)?;
    Ok(Fact {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        entity_id: Uuid::parse_str(&entity_id).unwrap_or_default(),
        predicate: row.get(2)?,
        content: row.get(3)?,
        active: row.get::<_, i32>(4)? != 0,
        created_at: parse_rfc3339(&created_at_raw),
    })
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
    fn merge_repoints_facts_and_tombstones_source() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let source = create_entity(&conn, NewEntity {
            tenant_id: "t1".into(), canonical_name: "Bob".into(), entity_type: None,
            aliases: vec!["Bobby".into()],
        }).unwrap();
        let target = create_entity(&conn, NewEntity {
            tenant_id: "t1".into(), canonical_name: "Robert".into(), entity_type: None,
            aliases: vec![],
        }).unwrap();
        add_fact(&conn, source.id, NewFact { predicate: "likes".into(), content: "coffee".into() }).unwrap();

        merge_entities(&conn, &source, &target).unwrap();

        let facts = list_active_facts(&conn, target.id, 10).unwrap();
        assert_eq!(facts.len(), 1);

        let reloaded_source = get_entity(&conn, source.id).unwrap();
        assert!(reloaded_source.is_tombstoned());
        assert_eq!(reloaded_source.merged_into, Some(target.id));

        let reloaded_target = get_entity(&conn, target.id).unwrap();
        assert!(reloaded_target.aliases.contains(&"Bob".to_string()));
        assert!(reloaded_target.aliases.contains(&"Bobby".to_string()));
    }

    #[test]
    fn exact_alias_and_substring_tiers_find_expected_rows() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        create_entity(&conn, NewEntity {
            tenant_id: "t1".into(), canonical_name: "Alice Smith".into(), entity_type: Some("person".into()),
            aliases: vec!["Ally".into()],
        }).unwrap();

        assert_eq!(find_by_exact_name(&conn, "t1", "alice smith", None).unwrap().len(), 1);
        assert_eq!(find_by_alias(&conn, "t1", "ALLY", None).unwrap().len(), 1);
        assert_eq!(find_by_substring(&conn, "t1", "lice", None).unwrap().len(), 1);
        assert_eq!(find_by_exact_name(&conn, "t1", "alice smith", Some("project")).unwrap().len(), 0);
    }
}
