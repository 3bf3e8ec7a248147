use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row of the shared `contacts` table — the canonical person record every
/// butler's approval gate and messenger adapter resolve against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub name: String,
    /// Free-form profile data (notes, birthday, preferences, …).
    pub details: serde_json::Value,
    /// Role strings such as `"owner"`, `"admin"`, `"member"` — the approval
    /// gate's owner fast-path checks for `"owner"` specifically.
    pub roles: Vec<String>,
    /// Link to the entity-resolver's tenant-scoped entity graph, when this
    /// contact also appears there.
    pub entity_id: Option<Uuid>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_owner(&self) -> bool {
        self.has_role("owner")
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}

/// A row of `contact_channels` — one external identity (email address,
/// Telegram chat id, …) bound to a contact. `(channel_type, channel_value)`
/// is unique; a contact may have several, one marked primary per type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactChannel {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub channel_type: String,
    pub channel_value: String,
    pub label: Option<String>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// What's needed to create a contact; server assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub name: String,
    pub details: serde_json::Value,
    pub roles: Vec<String>,
    pub entity_id: Option<Uuid>,
}
