use crate::db::{self, DbSchool, SchoolFields};
use crate::domain::policy::Action;
use crate::domain::validate::Checks;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use crate::web::session::Actor;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use uuid::Uuid;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/schools", get(list_schools).post(create_school))
        .route("/schools/:id", patch(update_school).delete(deactivate_school))
        .with_state(state)
}

fn check_fields(fields: &SchoolFields, creating: bool) -> ApiResult<SchoolFields> {
    let mut checks = Checks::new();
    let name = match (&fields.name, creating) {
        (Some(name), _) => Some(checks.name("name", name)),
        (None, true) => {
            checks.fail("name", "name is required");
            None
        }
        (None, false) => None,
    };
    let email = checks.optional_email("email", fields.email.as_deref());
    let principal_name = checks.optional_name("principalName", fields.principal_name.as_deref());
    checks.finish()?;

    Ok(SchoolFields {
        name,
        email,
        principal_name,
        ..fields.clone()
    })
}

async fn list_schools(actor: Actor, State(state): State<SharedState>) -> ApiResult<Json<Vec<DbSchool>>> {
    actor.require(Action::ViewSchools)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let schools = db::list_schools(&state.pool, filter).await?;
    Ok(Json(schools))
}

async fn create_school(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<SchoolFields>,
) -> ApiResult<(StatusCode, Json<DbSchool>)> {
    actor.require(Action::ManageSchools)?;
    let fields = check_fields(&payload, true)?;
    let name = fields.name.clone().unwrap_or_default();

    let school = db::create_school(&state.pool, &name, &fields).await?;
    tracing::info!("School {} created by {}", school.id, actor.id());
    Ok((StatusCode::CREATED, Json(school)))
}

async fn update_school(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SchoolFields>,
) -> ApiResult<Json<DbSchool>> {
    actor.require(Action::ManageSchools)?;
    let fields = check_fields(&payload, false)?;

    let school = db::update_school(&state.pool, id, &fields)
        .await?
        .ok_or(ApiError::NotFound("School"))?;
    Ok(Json(school))
}

/// Schools are never hard-deleted; their classes and students stay readable.
async fn deactivate_school(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DbSchool>> {
    actor.require(Action::ManageSchools)?;
    let school = db::deactivate_school(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("School"))?;
    tracing::info!("School {} deactivated by {}", school.id, actor.id());
    Ok(Json(school))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_requires_name() {
        let err = check_fields(&SchoolFields::default(), true).unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref e) if e[0].field == "name"));
    }

    #[test]
    fn test_patch_without_name_is_fine() {
        let fields = SchoolFields {
            phone: Some("021-555".to_string()),
            ..SchoolFields::default()
        };
        let cleaned = check_fields(&fields, false).unwrap();
        assert_eq!(cleaned.name, None);
        assert_eq!(cleaned.phone.as_deref(), Some("021-555"));
    }

    #[test]
    fn test_fields_are_normalized() {
        let fields = SchoolFields {
            name: Some("  TK Pelita ".to_string()),
            email: Some("Office@Pelita.sch.id".to_string()),
            ..SchoolFields::default()
        };
        let cleaned = check_fields(&fields, true).unwrap();
        assert_eq!(cleaned.name.as_deref(), Some("TK Pelita"));
        assert_eq!(cleaned.email.as_deref(), Some("office@pelita.sch.id"));
    }
}
