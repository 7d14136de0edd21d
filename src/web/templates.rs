use crate::db::{self, DbReportTemplate, TemplateFields};
use crate::domain::policy::Action;
use crate::domain::scope::Scope;
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

pub const LAYOUTS: &[&str] = &["classic", "modern", "compact"];
pub const MAX_PERIODS: usize = 12;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/report-templates", get(list_templates).post(create_template))
        .route(
            "/report-templates/:id",
            patch(update_template).delete(delete_template),
        )
        .with_state(state)
}

fn check_fields(fields: &TemplateFields, creating: bool) -> ApiResult<TemplateFields> {
    let mut checks = Checks::new();
    let name = match (&fields.name, creating) {
        (Some(name), _) => Some(checks.name("name", name)),
        (None, true) => {
            checks.fail("name", "name is required");
            None
        }
        (None, false) => None,
    };

    let layout = fields.layout.as_deref().map(|l| l.trim().to_lowercase());
    if let Some(layout) = layout.as_deref() {
        if !LAYOUTS.contains(&layout) {
            checks.fail("layout", format!("layout must be one of {}", LAYOUTS.join(", ")));
        }
    }

    let grading_periods = fields.grading_periods.as_ref().map(|periods| {
        let cleaned: Vec<String> = periods
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if cleaned.is_empty() {
            checks.fail("gradingPeriods", "at least one grading period is required");
        } else if cleaned.len() > MAX_PERIODS {
            checks.fail("gradingPeriods", format!("at most {MAX_PERIODS} grading periods"));
        }
        cleaned
    });
    if creating && grading_periods.is_none() {
        checks.fail("gradingPeriods", "at least one grading period is required");
    }
    checks.finish()?;

    Ok(TemplateFields {
        name,
        layout,
        grading_periods,
        ..fields.clone()
    })
}

/// Superadmins may keep templates global; everyone else writes to their school.
fn template_school(scope: &Scope, requested: Option<Uuid>) -> ApiResult<Option<Uuid>> {
    match scope {
        Scope::All => Ok(requested),
        other => other.target_school(requested).map(Some),
    }
}

/// Templates the caller may change. Global templates are visible to everyone
/// but only superadmins edit them.
async fn editable_template(state: &SharedState, actor: &Actor, id: Uuid) -> ApiResult<DbReportTemplate> {
    let template = db::find_report_template(&state.pool, id)
        .await?
        .ok_or(ApiError::NotFound("Report template"))?;

    match (template.school_id, actor.scope) {
        (_, Scope::All) => Ok(template),
        (None, _) => Err(ApiError::Forbidden),
        (Some(school_id), scope) if scope.permits(school_id) => Ok(template),
        (Some(_), _) => Err(ApiError::NotFound("Report template")),
    }
}

async fn list_templates(
    actor: Actor,
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<DbReportTemplate>>> {
    actor.require(Action::ViewReports)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let templates = db::list_report_templates(&state.pool, filter).await?;
    Ok(Json(templates))
}

async fn create_template(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<TemplateFields>,
) -> ApiResult<(StatusCode, Json<DbReportTemplate>)> {
    actor.require(Action::ManageReportTemplates)?;
    let fields = check_fields(&payload, true)?;
    let school_id = template_school(&actor.scope, fields.school_id)?;
    if let Some(id) = school_id {
        if db::find_school(&state.pool, id).await?.is_none() {
            return Err(ApiError::NotFound("School"));
        }
    }

    let name = fields.name.clone().unwrap_or_default();
    let template = db::create_report_template(&state.pool, school_id, &name, &fields).await?;
    tracing::info!("Report template {} created by {}", template.id, actor.id());
    Ok((StatusCode::CREATED, Json(template)))
}

async fn update_template(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TemplateFields>,
) -> ApiResult<Json<DbReportTemplate>> {
    actor.require(Action::ManageReportTemplates)?;
    let template = editable_template(&state, &actor, id).await?;
    let fields = check_fields(&payload, false)?;
    if fields.school_id.is_some() && fields.school_id != template.school_id {
        return Err(ApiError::BadRequest(
            "a template cannot move to another school".to_string(),
        ));
    }

    let template = db::update_report_template(&state.pool, template.id, &fields)
        .await?
        .ok_or(ApiError::NotFound("Report template"))?;
    Ok(Json(template))
}

async fn delete_template(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    actor.require(Action::ManageReportTemplates)?;
    let template = editable_template(&state, &actor, id).await?;
    db::delete_report_template(&state.pool, template.id).await?;
    tracing::info!("Report template {} deleted by {}", template.id, actor.id());
    Ok(StatusCode::NO_CONTENT)
}
