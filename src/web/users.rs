use crate::db::{self, DbAssignment, DbUser};
use crate::domain::policy::Action;
use crate::domain::roles::{Role, RoleError, RoleSet};
use crate::domain::scope::{self, Access, Scope};
use crate::domain::validate::Checks;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use crate::web::session::Actor;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RolePayload {
    pub role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePayload {
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPayload {
    pub school_id: Option<Uuid>,
    pub roles: Vec<String>,
    pub academic_year: String,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/users", get(list_users))
        .route("/users/:id/roles", post(add_role))
        .route("/users/:id/roles/:role", delete(remove_role))
        .route("/users/:id/active", patch(set_active))
        .route("/users/:id/assignments", get(list_assignments).post(create_assignment))
        .route("/assignments/:id", delete(delete_assignment))
        .route("/teachers", get(list_teachers))
        .with_state(state)
}

fn parse_role(raw: &str) -> ApiResult<Role> {
    Role::try_from(raw).map_err(|e| ApiError::field("role", &e.to_string()))
}

/// Only superadmins may hand out or take away the superadmin role.
fn check_role_grant(actor: &Actor, role: Role) -> ApiResult<()> {
    if role == Role::Superadmin && !actor.has(Role::Superadmin) {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// A user together with the scope and roles that apply to them right now.
struct Managed {
    user: DbUser,
    assignments: Vec<DbAssignment>,
    access: Access,
}

/// Role changes as clients see them: the stored user plus the roles in effect.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedUserView {
    #[serde(flatten)]
    pub user: DbUser,
    pub effective_roles: RoleSet,
    pub assignment_id: Option<Uuid>,
}

impl From<Managed> for ManagedUserView {
    fn from(managed: Managed) -> Self {
        Self {
            user: managed.user,
            effective_roles: managed.access.roles,
            assignment_id: managed.access.assignment_id,
        }
    }
}

async fn load_managed(state: &SharedState, user_id: &str) -> ApiResult<Managed> {
    let user = db::find_user_by_id(&state.pool, user_id)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    let assignments = db::list_assignments_for_user(&state.pool, &user.id).await?;
    let access = scope::resolve(&user.role_set(), user.school_id, &assignments);
    Ok(Managed {
        user,
        assignments,
        access,
    })
}

/// Superadmins manage everyone. Admins manage users whose effective school is
/// their own; anyone else is reported as missing and superadmin accounts are
/// off limits.
fn may_manage(actor_scope: &Scope, target_roles: &RoleSet, target_scope: &Scope) -> ApiResult<()> {
    if *actor_scope == Scope::All {
        return Ok(());
    }
    if target_roles.contains(Role::Superadmin) {
        return Err(ApiError::Forbidden);
    }
    match actor_scope.school_id() {
        Some(own) if *target_scope == Scope::School(own) => Ok(()),
        _ => Err(ApiError::NotFound("User")),
    }
}

/// Assigning follows [`may_manage`], except that admins may also bring in
/// users who belong to no school yet.
fn may_assign(actor_scope: &Scope, target_roles: &RoleSet, target_scope: &Scope) -> ApiResult<()> {
    if *target_scope == Scope::Nothing && actor_scope.school_id().is_some() {
        return Ok(());
    }
    may_manage(actor_scope, target_roles, target_scope)
}

async fn managed_user(state: &SharedState, actor: &Actor, user_id: &str) -> ApiResult<Managed> {
    let managed = load_managed(state, user_id).await?;
    may_manage(&actor.scope, &managed.user.role_set(), &managed.access.scope)?;
    Ok(managed)
}

/// Staff roles live on the assignment that scopes the user, when there is one.
/// Superadmin and parent are never school-bound and stay on the user row.
fn role_assignment(role: Role, access: &Access) -> Option<Uuid> {
    match role {
        Role::Admin | Role::Teacher => access.assignment_id,
        Role::Superadmin | Role::Parent => None,
    }
}

/// Applies `edit` to whichever role list backs `role` for this user.
async fn edit_roles<F>(state: &SharedState, managed: &Managed, role: Role, edit: F) -> ApiResult<bool>
where
    F: FnOnce(&mut RoleSet) -> ApiResult<bool>,
{
    match role_assignment(role, &managed.access) {
        Some(assignment_id) => {
            let assignment = managed
                .assignments
                .iter()
                .find(|a| a.id == assignment_id)
                .ok_or(ApiError::NotFound("Assignment"))?;
            let mut roles = RoleSet::from_strings(&assignment.roles);
            if !edit(&mut roles)? {
                return Ok(false);
            }
            db::set_assignment_roles(&state.pool, assignment_id, &roles)
                .await?
                .ok_or(ApiError::NotFound("Assignment"))?;
        }
        None => {
            let mut roles = managed.user.role_set();
            if !edit(&mut roles)? {
                return Ok(false);
            }
            db::set_user_roles(&state.pool, &managed.user.id, &roles)
                .await?
                .ok_or(ApiError::NotFound("User"))?;
        }
    }
    Ok(true)
}

async fn list_users(actor: Actor, State(state): State<SharedState>) -> ApiResult<Json<Vec<DbUser>>> {
    actor.require(Action::ViewUsers)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let users = db::list_users(&state.pool, filter).await?;
    Ok(Json(users))
}

async fn list_teachers(actor: Actor, State(state): State<SharedState>) -> ApiResult<Json<Vec<DbUser>>> {
    actor.require(Action::ViewClasses)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let teachers = db::list_teachers(&state.pool, filter).await?;
    Ok(Json(teachers))
}

async fn add_role(
    actor: Actor,
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(payload): Json<RolePayload>,
) -> ApiResult<Json<ManagedUserView>> {
    actor.require(Action::ManageUsers)?;
    let role = parse_role(&payload.role)?;
    check_role_grant(&actor, role)?;

    let managed = managed_user(&state, &actor, &user_id).await?;
    if !edit_roles(&state, &managed, role, |roles| Ok(roles.add(role))).await? {
        return Ok(Json(managed.into()));
    }

    tracing::info!("Role {} granted to {} by {}", role, managed.user.id, actor.id());
    let managed = load_managed(&state, &managed.user.id).await?;
    Ok(Json(managed.into()))
}

async fn remove_role(
    actor: Actor,
    State(state): State<SharedState>,
    Path((user_id, role)): Path<(String, String)>,
) -> ApiResult<Json<ManagedUserView>> {
    actor.require(Action::ManageUsers)?;
    let role = parse_role(&role)?;
    check_role_grant(&actor, role)?;

    let managed = managed_user(&state, &actor, &user_id).await?;
    let removed = edit_roles(&state, &managed, role, |roles| {
        roles
            .remove(role)
            .map_err(|e: RoleError| ApiError::BadRequest(e.to_string()))
    })
    .await?;
    if !removed {
        return Ok(Json(managed.into()));
    }

    tracing::info!("Role {} removed from {} by {}", role, managed.user.id, actor.id());
    let managed = load_managed(&state, &managed.user.id).await?;
    Ok(Json(managed.into()))
}

async fn set_active(
    actor: Actor,
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(payload): Json<ActivePayload>,
) -> ApiResult<Json<DbUser>> {
    actor.require(Action::ManageUsers)?;
    if user_id == actor.id() && !payload.is_active {
        return Err(ApiError::BadRequest("you cannot deactivate your own account".to_string()));
    }

    let managed = managed_user(&state, &actor, &user_id).await?;
    let user = db::set_user_active(&state.pool, &managed.user.id, payload.is_active)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    Ok(Json(user))
}

async fn list_assignments(
    actor: Actor,
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<DbAssignment>>> {
    actor.require(Action::ManageUsers)?;
    let managed = managed_user(&state, &actor, &user_id).await?;
    let assignments = managed
        .assignments
        .into_iter()
        .filter(|a| actor.scope.permits(a.school_id))
        .collect();
    Ok(Json(assignments))
}

/// Validated assignment roles. Superadmin is global and never school-scoped.
fn assignment_roles(raw: &[String]) -> ApiResult<RoleSet> {
    let mut roles = RoleSet::new();
    for value in raw {
        let role = parse_role(value)?;
        if role == Role::Superadmin {
            return Err(ApiError::field("roles", "superadmin cannot be assigned per school"));
        }
        roles.add(role);
    }
    if roles.is_empty() {
        return Err(ApiError::field("roles", "at least one role is required"));
    }
    Ok(roles)
}

/// Assignment roles apply only at the assignment's school. A user without a
/// primary school gets this one as primary.
async fn create_assignment(
    actor: Actor,
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(payload): Json<AssignmentPayload>,
) -> ApiResult<(StatusCode, Json<DbAssignment>)> {
    actor.require(Action::ManageUsers)?;

    let mut checks = Checks::new();
    let academic_year = checks.academic_year("academicYear", &payload.academic_year);
    checks.finish()?;
    let roles = assignment_roles(&payload.roles)?;
    let school_id = actor.scope.target_school(payload.school_id)?;

    let managed = load_managed(&state, &user_id).await?;
    may_assign(&actor.scope, &managed.user.role_set(), &managed.access.scope)?;
    if db::find_school(&state.pool, school_id).await?.is_none() {
        return Err(ApiError::NotFound("School"));
    }

    let user = managed.user;
    let assignment =
        db::upsert_assignment(&state.pool, &user.id, school_id, &roles, &academic_year).await?;
    if user.school_id.is_none() {
        db::set_primary_school(&state.pool, &user.id, Some(school_id)).await?;
    }

    tracing::info!(
        "User {} assigned to school {} ({}) by {}",
        user.id,
        school_id,
        academic_year,
        actor.id()
    );
    Ok((StatusCode::CREATED, Json(assignment)))
}

async fn delete_assignment(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    actor.require(Action::ManageUsers)?;
    let assignment = db::find_assignment(&state.pool, id)
        .await?
        .filter(|a| actor.scope.permits(a.school_id))
        .ok_or(ApiError::NotFound("Assignment"))?;

    db::delete_assignment(&state.pool, assignment.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_roles_validation() {
        let roles = assignment_roles(&["teacher".to_string(), "Teacher".to_string()]).unwrap();
        assert_eq!(roles.to_strings(), vec!["teacher"]);

        assert!(matches!(assignment_roles(&[]), Err(ApiError::Validation(_))));
        assert!(matches!(
            assignment_roles(&["superadmin".to_string()]),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            assignment_roles(&["principal".to_string()]),
            Err(ApiError::Validation(_))
        ));
    }

    fn roles(list: &[Role]) -> RoleSet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_admin_manages_only_own_school() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let admin = Scope::School(own);
        let teacher = roles(&[Role::Teacher]);

        assert!(may_manage(&admin, &teacher, &Scope::School(own)).is_ok());
        assert!(matches!(
            may_manage(&admin, &teacher, &Scope::School(other)),
            Err(ApiError::NotFound("User"))
        ));
        assert!(matches!(
            may_manage(&admin, &teacher, &Scope::Nothing),
            Err(ApiError::NotFound("User"))
        ));
        assert!(matches!(
            may_manage(&admin, &roles(&[Role::Superadmin]), &Scope::All),
            Err(ApiError::Forbidden)
        ));
        assert!(may_manage(&Scope::All, &roles(&[Role::Superadmin]), &Scope::All).is_ok());
    }

    #[test]
    fn test_admin_cannot_assign_users_of_other_schools() {
        let (own, other) = (Uuid::new_v4(), Uuid::new_v4());
        let admin = Scope::School(own);
        let teacher = roles(&[Role::Teacher]);

        // A teacher settled at another school stays out of reach.
        assert!(matches!(
            may_assign(&admin, &teacher, &Scope::School(other)),
            Err(ApiError::NotFound("User"))
        ));
        assert!(may_assign(&admin, &teacher, &Scope::School(own)).is_ok());
        assert!(may_assign(&admin, &roles(&[Role::Parent]), &Scope::Nothing).is_ok());
        assert!(matches!(
            may_assign(&Scope::Nothing, &teacher, &Scope::Nothing),
            Err(ApiError::NotFound("User"))
        ));
        assert!(may_assign(&Scope::All, &teacher, &Scope::School(other)).is_ok());
    }

    #[test]
    fn test_staff_roles_edit_the_scoping_assignment() {
        let assignment_id = Uuid::new_v4();
        let via_assignment = Access {
            scope: Scope::School(Uuid::new_v4()),
            roles: roles(&[Role::Teacher]),
            assignment_id: Some(assignment_id),
        };
        assert_eq!(role_assignment(Role::Admin, &via_assignment), Some(assignment_id));
        assert_eq!(role_assignment(Role::Teacher, &via_assignment), Some(assignment_id));
        assert_eq!(role_assignment(Role::Parent, &via_assignment), None);
        assert_eq!(role_assignment(Role::Superadmin, &via_assignment), None);

        let via_row = Access {
            assignment_id: None,
            ..via_assignment
        };
        assert_eq!(role_assignment(Role::Admin, &via_row), None);
    }

    #[test]
    fn test_parse_role_reports_field() {
        let Err(ApiError::Validation(errors)) = parse_role("dean") else {
            panic!("expected validation error");
        };
        assert_eq!(errors[0].field, "role");
    }
}
