use crate::db::{self, ClassFields, DbClass, DbGroup, GroupFields};
use crate::domain::policy::Action;
use crate::domain::validate::Checks;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use crate::web::session::Actor;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

pub const DEFAULT_CLASS_CAPACITY: i32 = 30;
pub const DEFAULT_GROUP_SIZE: i32 = 15;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupQuery {
    pub class_id: Option<Uuid>,
    /// Only groups taught by the caller.
    #[serde(default)]
    pub mine: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherPayload {
    pub teacher_id: Option<String>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/classes", get(list_classes).post(create_class))
        .route("/classes/:id", patch(update_class).delete(delete_class))
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/:id", patch(update_group).delete(delete_group))
        .route("/groups/:id/teacher", put(set_teacher))
        .with_state(state)
}

/// Rows outside the caller's scope are reported as missing.
pub(crate) async fn class_in_scope(state: &SharedState, actor: &Actor, id: Uuid) -> ApiResult<DbClass> {
    db::find_class(&state.pool, id)
        .await?
        .filter(|c| actor.scope.permits(c.school_id))
        .ok_or(ApiError::NotFound("Class"))
}

pub(crate) async fn group_in_scope(state: &SharedState, actor: &Actor, id: Uuid) -> ApiResult<DbGroup> {
    db::find_group(&state.pool, id)
        .await?
        .filter(|g| actor.scope.permits(g.school_id))
        .ok_or(ApiError::NotFound("Group"))
}

/// A group teacher must be an active teacher attached to the group's school.
async fn check_teacher(state: &SharedState, school_id: Uuid, teacher_id: &str) -> ApiResult<()> {
    if db::find_user_by_id(&state.pool, teacher_id).await?.is_none() {
        return Err(ApiError::field("teacherId", "teacher not found"));
    }
    if !db::teaches_in_school(&state.pool, teacher_id, school_id).await? {
        return Err(ApiError::field("teacherId", "teacher does not teach at this school"));
    }
    Ok(())
}

fn check_class_fields(fields: &ClassFields, creating: bool) -> ApiResult<ClassFields> {
    let mut checks = Checks::new();
    let name = match (&fields.name, creating) {
        (Some(name), _) => Some(checks.name("name", name)),
        (None, true) => {
            checks.fail("name", "name is required");
            None
        }
        (None, false) => None,
    };
    let academic_year = match (&fields.academic_year, creating) {
        (Some(year), _) => Some(checks.academic_year("academicYear", year)),
        (None, true) => {
            checks.fail("academicYear", "academicYear is required");
            None
        }
        (None, false) => None,
    };
    let capacity = fields.capacity.map(|c| checks.positive("capacity", c));
    checks.finish()?;

    Ok(ClassFields {
        name,
        academic_year,
        capacity,
        ..fields.clone()
    })
}

fn check_group_fields(fields: &GroupFields, creating: bool) -> ApiResult<GroupFields> {
    let mut checks = Checks::new();
    let name = match (&fields.name, creating) {
        (Some(name), _) => Some(checks.name("name", name)),
        (None, true) => {
            checks.fail("name", "name is required");
            None
        }
        (None, false) => None,
    };
    if creating && fields.class_id.is_none() {
        checks.fail("classId", "classId is required");
    }
    let max_students = fields.max_students.map(|m| checks.positive("maxStudents", m));
    let teacher_id = fields
        .teacher_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    checks.finish()?;

    Ok(GroupFields {
        name,
        max_students,
        teacher_id,
        ..fields.clone()
    })
}

/// Groups carry their students along, so they never leave their school.
fn check_move(group: &DbGroup, target: &DbClass) -> ApiResult<()> {
    if target.school_id != group.school_id {
        return Err(ApiError::BadRequest(
            "a group cannot move to another school".to_string(),
        ));
    }
    Ok(())
}

// ---------- Classes ----------

async fn list_classes(actor: Actor, State(state): State<SharedState>) -> ApiResult<Json<Vec<DbClass>>> {
    actor.require(Action::ViewClasses)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let classes = db::list_classes(&state.pool, filter).await?;
    Ok(Json(classes))
}

async fn create_class(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<ClassFields>,
) -> ApiResult<(StatusCode, Json<DbClass>)> {
    actor.require(Action::ManageClasses)?;
    let fields = check_class_fields(&payload, true)?;
    let school_id = actor.scope.target_school(fields.school_id)?;
    if db::find_school(&state.pool, school_id).await?.is_none() {
        return Err(ApiError::NotFound("School"));
    }

    let class = db::create_class(
        &state.pool,
        school_id,
        fields.name.as_deref().unwrap_or_default(),
        fields.academic_year.as_deref().unwrap_or_default(),
        fields.capacity.unwrap_or(DEFAULT_CLASS_CAPACITY),
    )
    .await?;
    tracing::info!("Class {} created in school {} by {}", class.id, school_id, actor.id());
    Ok((StatusCode::CREATED, Json(class)))
}

async fn update_class(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ClassFields>,
) -> ApiResult<Json<DbClass>> {
    actor.require(Action::ManageClasses)?;
    let class = class_in_scope(&state, &actor, id).await?;
    let mut fields = check_class_fields(&payload, false)?;

    // Groups and students carry the class's school, so classes stay put.
    if let Some(school_id) = fields.school_id.take() {
        if school_id != class.school_id {
            return Err(ApiError::BadRequest(
                "a class cannot move to another school".to_string(),
            ));
        }
    }

    if let Some(capacity) = fields.capacity {
        let enrolled = db::count_students_in_class(&state.pool, class.id).await?;
        if i64::from(capacity) < enrolled {
            return Err(ApiError::Conflict(format!(
                "class already has {enrolled} students"
            )));
        }
    }

    let class = db::update_class(&state.pool, class.id, &fields)
        .await?
        .ok_or(ApiError::NotFound("Class"))?;
    Ok(Json(class))
}

async fn delete_class(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    actor.require(Action::ManageClasses)?;
    let class = class_in_scope(&state, &actor, id).await?;
    db::delete_class(&state.pool, class.id).await?;
    tracing::info!("Class {} deleted by {}", class.id, actor.id());
    Ok(StatusCode::NO_CONTENT)
}

// ---------- Groups ----------

async fn list_groups(
    actor: Actor,
    State(state): State<SharedState>,
    Query(query): Query<GroupQuery>,
) -> ApiResult<Json<Vec<DbGroup>>> {
    actor.require(Action::ViewClasses)?;
    let Some(filter) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };
    let teacher = query.mine.then(|| actor.id());
    let groups = db::list_groups(&state.pool, filter, query.class_id, teacher).await?;
    Ok(Json(groups))
}

async fn create_group(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<GroupFields>,
) -> ApiResult<(StatusCode, Json<DbGroup>)> {
    actor.require(Action::ManageClasses)?;
    let fields = check_group_fields(&payload, true)?;
    let class_id = fields.class_id.ok_or_else(|| ApiError::field("classId", "classId is required"))?;
    let class = class_in_scope(&state, &actor, class_id).await?;

    if let Some(teacher_id) = fields.teacher_id.as_deref() {
        check_teacher(&state, class.school_id, teacher_id).await?;
    }

    let group = db::create_group(
        &state.pool,
        &class,
        fields.name.as_deref().unwrap_or_default(),
        fields.teacher_id.as_deref(),
        fields.max_students.unwrap_or(DEFAULT_GROUP_SIZE),
    )
    .await?;
    tracing::info!("Group {} created in class {} by {}", group.id, class.id, actor.id());
    Ok((StatusCode::CREATED, Json(group)))
}

async fn update_group(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<GroupFields>,
) -> ApiResult<Json<DbGroup>> {
    actor.require(Action::ManageClasses)?;
    let group = group_in_scope(&state, &actor, id).await?;
    let fields = check_group_fields(&payload, false)?;

    let new_class = match fields.class_id {
        Some(class_id) if class_id != group.class_id => {
            let class = class_in_scope(&state, &actor, class_id).await?;
            check_move(&group, &class)?;
            Some(class)
        }
        _ => None,
    };

    if let Some(teacher_id) = fields.teacher_id.as_deref() {
        check_teacher(&state, group.school_id, teacher_id).await?;
    }

    if let Some(max) = fields.max_students {
        let enrolled = db::count_students_in_group(&state.pool, group.id).await?;
        if i64::from(max) < enrolled {
            return Err(ApiError::Conflict(format!(
                "group already has {enrolled} students"
            )));
        }
    }

    if let Some(class) = new_class.as_ref() {
        db::move_group(&state.pool, group.id, class)
            .await?
            .ok_or(ApiError::NotFound("Group"))?;
        tracing::info!(
            "Group {} moved from class {} to {} by {}",
            group.id,
            group.class_id,
            class.id,
            actor.id()
        );
    }

    let group = db::update_group(&state.pool, group.id, &fields)
        .await?
        .ok_or(ApiError::NotFound("Group"))?;
    Ok(Json(group))
}

async fn delete_group(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    actor.require(Action::ManageClasses)?;
    let group = group_in_scope(&state, &actor, id).await?;
    db::delete_group(&state.pool, group.id).await?;
    tracing::info!("Group {} deleted by {}", group.id, actor.id());
    Ok(StatusCode::NO_CONTENT)
}

/// Assigns or clears (`teacherId: null`) the group teacher.
async fn set_teacher(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TeacherPayload>,
) -> ApiResult<Json<DbGroup>> {
    actor.require(Action::AssignTeacher)?;
    let group = group_in_scope(&state, &actor, id).await?;

    let teacher_id = payload
        .teacher_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(teacher_id) = teacher_id {
        check_teacher(&state, group.school_id, teacher_id).await?;
    }

    let group = db::set_group_teacher(&state.pool, group.id, teacher_id)
        .await?
        .ok_or(ApiError::NotFound("Group"))?;
    tracing::info!(
        "Group {} teacher set to {:?} by {}",
        group.id,
        group.teacher_id,
        actor.id()
    );
    Ok(Json(group))
}
