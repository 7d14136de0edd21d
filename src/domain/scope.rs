//! Effective-school resolution.
//!
//! Every request resolves the caller's scope once. Superadmins see every school;
//! everyone else is pinned to a single effective school, or to nothing at all
//! when no school can be found for them. An empty scope is not an error: lists
//! come back empty and writes are refused.

use crate::db::DbAssignment;
use crate::domain::roles::{Role, RoleSet};
use crate::error::ApiError;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "schoolId", rename_all = "camelCase")]
pub enum Scope {
    All,
    School(Uuid),
    Nothing,
}

/// A caller's scope together with the roles that hold inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub scope: Scope,
    pub roles: RoleSet,
    /// Assignment the roles come from. `None` when the user row supplies them.
    pub assignment_id: Option<Uuid>,
}

/// First active assignment wins, then the primary school on the user row.
///
/// Assignment roles only apply at the assignment's school, so a user who is an
/// admin in one school and a teacher in another is exactly one of those at a
/// time. Parenthood is not tied to a school and carries over.
pub fn resolve(roles: &RoleSet, primary_school: Option<Uuid>, assignments: &[DbAssignment]) -> Access {
    if roles.contains(Role::Superadmin) {
        return Access {
            scope: Scope::All,
            roles: roles.clone(),
            assignment_id: None,
        };
    }

    let effective = assignments
        .iter()
        .filter(|a| a.is_active)
        .min_by_key(|a| a.created_at);

    match effective {
        Some(assignment) => {
            let mut school_roles: RoleSet = RoleSet::from_strings(&assignment.roles)
                .iter()
                .copied()
                .filter(|r| *r != Role::Superadmin)
                .collect();
            if roles.contains(Role::Parent) {
                school_roles.add(Role::Parent);
            }
            Access {
                scope: Scope::School(assignment.school_id),
                roles: school_roles,
                assignment_id: Some(assignment.id),
            }
        }
        None => Access {
            scope: primary_school.map_or(Scope::Nothing, Scope::School),
            roles: roles.clone(),
            assignment_id: None,
        },
    }
}

impl Scope {
    /// `None` means the caller can see nothing and the query should be skipped.
    /// `Some(None)` is unrestricted, `Some(Some(id))` restricts to one school.
    pub fn filter(&self) -> Option<Option<Uuid>> {
        match self {
            Scope::All => Some(None),
            Scope::School(id) => Some(Some(*id)),
            Scope::Nothing => None,
        }
    }

    pub fn school_id(&self) -> Option<Uuid> {
        match self {
            Scope::School(id) => Some(*id),
            _ => None,
        }
    }

    pub fn permits(&self, school_id: Uuid) -> bool {
        match self {
            Scope::All => true,
            Scope::School(id) => *id == school_id,
            Scope::Nothing => false,
        }
    }

    /// School a new or updated row should land in.
    pub fn target_school(&self, requested: Option<Uuid>) -> Result<Uuid, ApiError> {
        match (self, requested) {
            (Scope::All, Some(id)) => Ok(id),
            (Scope::All, None) => Err(ApiError::field("schoolId", "schoolId is required")),
            (Scope::School(own), None) => Ok(*own),
            (Scope::School(own), Some(id)) if *own == id => Ok(id),
            (Scope::School(_), Some(_)) => Err(ApiError::Forbidden),
            (Scope::Nothing, _) => Err(ApiError::Forbidden),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn assignment(school_id: Uuid, active: bool, age_days: i64) -> DbAssignment {
        DbAssignment {
            id: Uuid::new_v4(),
            user_id: "google:1".to_string(),
            school_id,
            roles: vec!["teacher".to_string()],
            academic_year: "2024/2025".to_string(),
            is_active: active,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_superadmin_is_unrestricted() {
        let roles: RoleSet = [Role::Superadmin, Role::Teacher].into_iter().collect();
        let access = resolve(&roles, Some(Uuid::new_v4()), &[assignment(Uuid::new_v4(), true, 1)]);
        assert_eq!(access.roles, roles);
        let scope = access.scope;
        assert_eq!(scope, Scope::All);
        assert_eq!(scope.filter(), Some(None));
    }

    #[test]
    fn test_oldest_active_assignment_wins() {
        let roles: RoleSet = [Role::Admin].into_iter().collect();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        let inactive = Uuid::new_v4();
        let scope = resolve(
            &roles,
            None,
            &[
                assignment(newer, true, 1),
                assignment(inactive, false, 30),
                assignment(older, true, 10),
            ],
        )
        .scope;
        assert_eq!(scope, Scope::School(older));
    }

    #[test]
    fn test_falls_back_to_primary_school() {
        let roles: RoleSet = [Role::Teacher].into_iter().collect();
        let primary = Uuid::new_v4();
        let access = resolve(&roles, Some(primary), &[assignment(Uuid::new_v4(), false, 3)]);
        assert_eq!(access.scope, Scope::School(primary));
        assert_eq!(access.roles, roles);
        assert_eq!(access.assignment_id, None);
    }

    #[test]
    fn test_no_school_means_nothing() {
        let roles: RoleSet = [Role::Parent].into_iter().collect();
        let scope = resolve(&roles, None, &[]).scope;
        assert_eq!(scope, Scope::Nothing);
        assert_eq!(scope.filter(), None);
        assert!(!scope.permits(Uuid::new_v4()));
    }

    #[test]
    fn test_assignment_roles_stay_in_their_school() {
        // Teacher at B since last year, later made admin at A.
        let primary = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut at_primary = assignment(primary, true, 300);
        at_primary.roles = vec!["teacher".to_string()];
        let mut at_other = assignment(other, true, 2);
        at_other.roles = vec!["admin".to_string()];

        let global: RoleSet = [Role::Teacher].into_iter().collect();
        let access = resolve(&global, Some(primary), &[at_other, at_primary.clone()]);
        assert_eq!(access.scope, Scope::School(primary));
        assert_eq!(access.roles, global);
        assert_eq!(access.assignment_id, Some(at_primary.id));
        assert!(!access.roles.contains(Role::Admin));
    }

    #[test]
    fn test_assignment_roles_replace_global_staff_roles() {
        let school = Uuid::new_v4();
        let mut at_school = assignment(school, true, 5);
        at_school.roles = vec!["teacher".to_string(), "superadmin".to_string()];

        let global: RoleSet = [Role::Admin, Role::Parent].into_iter().collect();
        let access = resolve(&global, None, &[at_school]);
        assert_eq!(access.scope, Scope::School(school));
        assert_eq!(access.roles.to_strings(), vec!["teacher", "parent"]);
    }

    #[test]
    fn test_target_school_rules() {
        let own = Uuid::new_v4();
        let other = Uuid::new_v4();

        let scoped = Scope::School(own);
        assert_eq!(scoped.target_school(None).unwrap(), own);
        assert_eq!(scoped.target_school(Some(own)).unwrap(), own);
        assert!(matches!(scoped.target_school(Some(other)), Err(ApiError::Forbidden)));

        assert_eq!(Scope::All.target_school(Some(other)).unwrap(), other);
        assert!(matches!(Scope::All.target_school(None), Err(ApiError::Validation(_))));
        assert!(matches!(Scope::Nothing.target_school(Some(own)), Err(ApiError::Forbidden)));
    }

    #[test]
    fn test_scope_serializes_for_clients() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Scope::School(id)).unwrap();
        assert_eq!(json["kind"], "school");
        assert_eq!(json["schoolId"], id.to_string());
        assert_eq!(serde_json::to_value(Scope::All).unwrap()["kind"], "all");
    }
}
