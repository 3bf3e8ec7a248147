use crate::types::Contact;

/// Contact-management actions gated by role. Distinct from the approval
/// gate's tool-call interception — this governs who may edit the contact
/// directory itself (merge duplicates, change roles, archive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactAction {
    EditRoles,
    Archive,
    ViewDetails,
}

#[derive(Debug, Clone)]
pub enum PermissionCheck {
    Allowed,
    Denied { reason: String },
}

pub struct PermissionChecker;

impl PermissionChecker {
    /// Evaluate whether `actor` may perform `action` against `target`.
    ///
    /// Owners may do anything, including edit their own roles. Anyone else
    /// may only view details; role edits and archival require `"owner"` or
    /// `"admin"`.
    pub fn check(actor: &Contact, action: &ContactAction, _target: &Contact) -> PermissionCheck {
        if actor.is_owner() {
            return PermissionCheck::Allowed;
        }

        match action {
            ContactAction::ViewDetails => PermissionCheck::Allowed,
            ContactAction::EditRoles | ContactAction::Archive => {
                if actor.has_role("admin") {
                    PermissionCheck::Allowed
                } else {
                    PermissionCheck::Denied {
                        reason: "owner or admin role required".to_string(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn contact(roles: Vec<&str>) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            name: "Test".into(),
            details: serde_json::json!({}),
            roles: roles.into_iter().map(str::to_string).collect(),
            entity_id: None,
            archived_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn owner_may_edit_roles() {
        let owner = contact(vec!["owner"]);
        let target = contact(vec!["member"]);
        assert!(matches!(
            PermissionChecker::check(&owner, &ContactAction::EditRoles, &target),
            PermissionCheck::Allowed
        ));
    }

    #[test]
    fn member_cannot_archive() {
        let member = contact(vec!["member"]);
        let target = contact(vec!["member"]);
        assert!(matches!(
            PermissionChecker::check(&member, &ContactAction::Archive, &target),
            PermissionCheck::Denied { .. }
        ));
    }
}
