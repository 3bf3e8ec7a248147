use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use butlerhub_approval::{ChannelIdentity, ContactResolver, ResolvedContact};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::db;
use crate::types::Contact;

/// Maximum number of `(channel_type, channel_value)` → contact id pairs kept
/// in the in-process cache. Simple eviction: when full, drop the oldest half.
const CACHE_MAX: usize = 256;

impl From<Contact> for ResolvedContact {
    fn from(c: Contact) -> Self {
        ResolvedContact {
            entity_id: c.entity_id.unwrap_or(c.id),
            name: c.name,
            roles: c.roles,
        }
    }
}

/// Resolves channel identities and direct contact ids to a
/// `ResolvedContact`, implementing `butlerhub_approval::ContactResolver` so
/// the approval gate never depends on this crate directly — only on the
/// trait it satisfies.
///
/// Hot path: the approval gate calls `resolve_by_channel` on every gated
/// tool invocation, so known `(channel_type, channel_value)` pairs are
/// cached in memory to avoid a DB round-trip per call.
pub struct ContactDirectory {
    db: Arc<Mutex<Connection>>,
    cache: Mutex<HashMap<(String, String), Uuid>>,
    cache_order: Mutex<Vec<(String, String)>>,
}

impl ContactDirectory {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(Vec::new()),
        }
    }

    fn cache_lookup(&self, key: &(String, String)) -> Option<Uuid> {
        self.cache.lock().unwrap().get(key).copied()
    }

    fn cache_insert(&self, key: (String, String), contact_id: Uuid) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();

        if cache.contains_key(&key) {
            cache.insert(key, contact_id);
            return;
        }

        if cache.len() >= CACHE_MAX {
            let evict_count = CACHE_MAX / 2;
            let to_remove: Vec<_> = order.drain(..evict_count).collect();
            for k in to_remove {
                cache.remove(&k);
            }
        }

        order.push(key.clone());
        cache.insert(key, contact_id);
    }

    /// Drop all cached lookups for a contact — call after a role change so
    /// the next approval-gate call sees it.
    pub fn invalidate_contact(&self, contact_id: Uuid) {
        let mut cache = self.cache.lock().unwrap();
        let mut order = self.cache_order.lock().unwrap();
        order.retain(|k| {
            if cache.get(k) == Some(&contact_id) {
                cache.remove(k);
                false
            } else {
                true
            }
        });
    }
}

impl ContactResolver for ContactDirectory {
    fn resolve_by_id(&self, contact_id: Uuid) -> Option<ResolvedContact> {
        let conn = self.db.lock().unwrap();
        db::get_contact(&conn, contact_id).ok().map(ResolvedContact::from)
    }

    fn resolve_by_channel(&self, identity: &ChannelIdentity) -> Option<ResolvedContact> {
        let key = (identity.channel_type.clone(), identity.channel_value.clone());

        if let Some(contact_id) = self.cache_lookup(&key) {
            debug!(channel_type = %identity.channel_type, "contact cache hit");
            let conn = self.db.lock().unwrap();
            if let Ok(contact) = db::get_contact(&conn, contact_id) {
                return Some(ResolvedContact::from(contact));
            }
        }

        let conn = self.db.lock().unwrap();
        let contact = db::find_contact_by_channel(&conn, &identity.channel_type, &identity.channel_value)
            .ok()
            .flatten()?;
        self.cache_insert(key, contact.id);
        Some(ResolvedContact::from(contact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewContact;

    fn test_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        db::init_db(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[test]
    fn resolves_by_channel_and_caches() {
        let db = test_db();
        let contact = {
            let conn = db.lock().unwrap();
            let contact = db::create_contact(
                &conn,
                NewContact {
                    name: "Owner".into(),
                    details: serde_json::json!({}),
                    roles: vec!["owner".into()],
                    entity_id: None,
                },
            )
            .unwrap();
            db::add_channel(&conn, contact.id, "telegram", "999", None, true).unwrap();
            contact
        };

        let directory = ContactDirectory::new(db);
        let identity = ChannelIdentity { channel_type: "telegram".into(), channel_value: "999".into() };

        let resolved = directory.resolve_by_channel(&identity).unwrap();
        assert_eq!(resolved.roles, vec!["owner".to_string()]);
        assert!(resolved.is_owner());

        // Second call should hit the cache path and return the same contact.
        let resolved_again = directory.resolve_by_channel(&identity).unwrap();
        assert_eq!(resolved_again.entity_id, contact.entity_id.unwrap_or(contact.id));
    }

    #[test]
    fn unknown_channel_resolves_to_none() {
        let directory = ContactDirectory::new(test_db());
        let identity = ChannelIdentity { channel_type: "email".into(), channel_value: "nobody@example.com".into() };
        assert!(directory.resolve_by_channel(&identity).is_none());
    }
}
