use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{ContactError, Result};
use crate::types::{Contact, ContactChannel, NewContact};

/// Creates the tables this crate owns in `shared.db`: `contacts` (one row
/// per person the fleet knows about) and `contact_channels` (the external
/// identities that resolve to a contact).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS contacts (
            id          TEXT PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            details     TEXT NOT NULL DEFAULT '{}',
            roles       TEXT NOT NULL DEFAULT '[]',
            entity_id   TEXT,
            archived_at TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(name);

        CREATE TABLE IF NOT EXISTS contact_channels (
            id             TEXT PRIMARY KEY NOT NULL,
            contact_id     TEXT NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
            channel_type   TEXT NOT NULL,
            channel_value  TEXT NOT NULL,
            label          TEXT,
            is_primary     INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL,
            UNIQUE(channel_type, channel_value)
        );
        CREATE INDEX IF NOT EXISTS idx_contact_channels_lookup
            ON contact_channels(channel_type, channel_value);
        CREATE INDEX IF NOT EXISTS idx_contact_channels_contact
            ON contact_channels(contact_id);",
    )?;
    Ok(())
}

const CONTACT_SELECT_SQL: &str =
    "SELECT id, name, details, roles, entity_id, archived_at, created_at, updated_at
     FROM contacts WHERE id = ?1";

pub fn create_contact(conn: &Connection, new: NewContact) -> Result<Contact> {
    let now = Utc::now();
    let contact = Contact {
        id: Uuid::now_v7(),
        name: new.name,
        details: new.details,
        roles: new.roles,
        entity_id: new.entity_id,
        archived_at: None,
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO contacts (id, name, details, roles, entity_id, archived_at, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
        rusqlite::params![
            contact.id.to_string(),
            contact.name,
            serde_json::to_string(&contact.details)?,
            serde_json::to_string(&contact.roles)?,
            contact.entity_id.map(|id| id.to_string()),
            contact.archived_at.map(|d| d.to_rfc3339()),
            contact.created_at.to_rfc3339(),
            contact.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(contact)
}

pub fn get_contact(conn: &Connection, id: Uuid) -> Result<Contact> {
    conn.query_row(CONTACT_SELECT_SQL, [id.to_string()], row_to_contact)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => ContactError::NotFound(id),
            other => ContactError::Database(other),
        })?
}

pub fn find_contact_by_channel(
    conn: &Connection,
    channel_type: &str,
    channel_value: &str,
) -> Result<Option<Contact>> {
    let sql = "SELECT c.id, c.name, c.details, c.roles, c.entity_id, c.archived_at, \
               c.created_at, c.updated_at \
               FROM contacts c JOIN contact_channels ch ON ch.contact_id = c.id \
               WHERE ch.channel_type = ?1 AND ch.channel_value = ?2";
    match conn.query_row(sql, [channel_type, channel_value], row_to_contact) {
        Ok(result) => Ok(Some(result?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(ContactError::Database(e)),
    }
}

pub fn set_roles(conn: &Connection, id: Uuid, roles: &[String]) -> Result<()> {
    let rows = conn.execute(
        "UPDATE contacts SET roles = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![id.to_string(), serde_json::to_string(roles)?, Utc::now().to_rfc3339()],
    )?;
    if rows == 0 {
        return Err(ContactError::NotFound(id));
    }
    Ok(())
}

pub fn archive_contact(conn: &Connection, id: Uuid) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE contacts SET archived_at = ?2, updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), now],
    )?;
    if rows == 0 {
        return Err(ContactError::NotFound(id));
    }
    Ok(())
}

pub fn add_channel(
    conn: &Connection,
    contact_id: Uuid,
    channel_type: &str,
    channel_value: &str,
    label: Option<&str>,
    is_primary: bool,
) -> Result<ContactChannel> {
    if is_primary {
        conn.execute(
            "UPDATE contact_channels SET is_primary = 0 WHERE contact_id = ?1 AND channel_type = ?2",
            rusqlite::params![contact_id.to_string(), channel_type],
        )?;
    }
    let channel = ContactChannel {
        id: Uuid::now_v7(),
        contact_id,
        channel_type: channel_type.to_string(),
        channel_value: channel_value.to_string(),
        label: label.map(str::to_string),
        is_primary,
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO contact_channels (id, contact_id, channel_type, channel_value, label, is_primary, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7)",
        rusqlite::params![
            channel.id.to_string(),
            channel.contact_id.to_string(),
            channel.channel_type,
            channel.channel_value,
            channel.label,
            channel.is_primary as i32,
            channel.created_at.to_rfc3339(),
        ],
    )?;
    Ok(channel)
}

pub fn list_channels(conn: &Connection, contact_id: Uuid) -> Result<Vec<ContactChannel>> {
    let mut stmt = conn.prepare(
        "SELECT id, contact_id, channel_type, channel_value, label, is_primary, created_at
         FROM contact_channels WHERE contact_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([contact_id.to_string()], row_to_channel)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContactChannel> {
    let id: String = row.get(0)?;
    let contact_id: String = row.get(1)?;
    let created_at_raw: String = row.get(6)?;
    Ok(ContactChannel {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        contact_id: Uuid::parse_str(&contact_id).unwrap_or_default(),
        channel_type: row.get(2)?,
        channel_value: row.get(3)?,
        label: row.get(4)?,
        is_primary: row.get::<_, i32>(5)? != 0,
        created_at: parse_rfc3339(&created_at_raw),
    })
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Contact>> {
    let id: String = row.get(0)?;
    let details_raw: String = row.get(2)?;
    let roles_raw: String = row.get(3)?;
    let entity_id_raw: Option<String> = row.get(4)?;
    let archived_at_raw: Option<String> = row.get(5)?;
    let created_at_raw: String = row.get(6)?;
    let updated_at_raw: String = row.get(7)?;

    let details = match serde_json::from_str(&details_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(ContactError::Malformed(e))),
    };
    let roles = match serde_json::from_str(&roles_raw) {
        Ok(v) => v,
        Err(e) => return Ok(Err(ContactError::Malformed(e))),
    };

    Ok(Ok(Contact {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        name: row.get(1)?,
        details,
        roles,
        entity_id: entity_id_raw.and_then(|s| Uuid::parse_str(&s).ok()),
        archived_at: archived_at_raw.as_deref().map(parse_rfc3339),
        created_at: parse_rfc3339(&created_at_raw),
        updated_at: parse_rfc3339(&updated_at_raw),
    }))
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
