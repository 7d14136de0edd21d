use crate::crypto::PiiCipher;
use crate::db::{self, DbStudent, NewStudent, Seat, StudentChanges, StudentFilter};
use crate::domain::bulk;
use crate::domain::grades::{self, GradeBook};
use crate::domain::policy::Action;
use crate::domain::roles::Role;
use crate::domain::validate::Checks;
use crate::error::{ApiError, ApiResult};
use crate::state::SharedState;
use crate::web::classes::{class_in_scope, group_in_scope};
use crate::web::session::Actor;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Most rows a single paste may create.
pub const MAX_BULK_ROWS: usize = 200;

/// Student as clients see it: PII opened, final grades derived.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentView {
    pub id: Uuid,
    pub full_name: String,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub school_id: Uuid,
    pub parent_id: Option<String>,
    pub academic_year: String,
    pub parent_contact: Option<String>,
    pub address: Option<String>,
    pub grades: GradeBook,
    pub final_grades: BTreeMap<String, i16>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StudentView {
    pub fn open(row: DbStudent, cipher: &PiiCipher) -> Self {
        let grades = row.grades.0;
        let final_grades = grades
            .iter()
            .filter_map(|(aspect, list)| grades::final_grade(list).map(|g| (aspect.clone(), g)))
            .collect();

        Self {
            id: row.id,
            full_name: row.full_name,
            class_id: row.class_id,
            group_id: row.group_id,
            school_id: row.school_id,
            parent_id: row.parent_id,
            academic_year: row.academic_year,
            parent_contact: cipher.open_opt(row.enc_parent_contact.as_deref()),
            address: cipher.open_opt(row.enc_address.as_deref()),
            grades,
            final_grades,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentQuery {
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    /// Only students in groups the caller teaches.
    #[serde(default)]
    pub mine: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPayload {
    pub full_name: Option<String>,
    pub school_id: Option<Uuid>,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub parent_id: Option<String>,
    pub academic_year: Option<String>,
    pub parent_contact: Option<String>,
    pub address: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPayload {
    pub text: String,
    pub school_id: Option<Uuid>,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub academic_year: Option<String>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/students", get(list_students).post(create_student))
        .route("/students/bulk", post(create_students_bulk))
        .route(
            "/students/:id",
            get(get_student).patch(update_student).delete(delete_student),
        )
        .with_state(state)
}

/// Loads a student the caller may see. Parent-only callers see their own
/// children; everything else outside scope is reported as missing.
pub(crate) async fn student_visible(state: &SharedState, actor: &Actor, id: Uuid) -> ApiResult<DbStudent> {
    let student = db::find_student(&state.pool, id)
        .await?
        .filter(|s| actor.scope.permits(s.school_id))
        .ok_or(ApiError::NotFound("Student"))?;

    if actor.parent_only() && student.parent_id.as_deref() != Some(actor.id()) {
        return Err(ApiError::NotFound("Student"));
    }
    Ok(student)
}

/// Where new or moved students land, resolved from the most specific of
/// group, class and school.
#[derive(Debug, Clone, PartialEq)]
struct Placement {
    school_id: Uuid,
    class_id: Option<Uuid>,
    group_id: Option<Uuid>,
    class_capacity: Option<i64>,
    group_capacity: Option<(Uuid, i64)>,
    academic_year: Option<String>,
}

async fn place(
    state: &SharedState,
    actor: &Actor,
    school_id: Option<Uuid>,
    class_id: Option<Uuid>,
    group_id: Option<Uuid>,
) -> ApiResult<Placement> {
    let group = match group_id {
        Some(id) => Some(group_in_scope(state, actor, id).await?),
        None => None,
    };

    let class_id = match (&group, class_id) {
        (Some(g), Some(c)) if g.class_id != c => {
            return Err(ApiError::field("groupId", "group does not belong to the class"));
        }
        (Some(g), _) => Some(g.class_id),
        (None, c) => c,
    };

    let class = match class_id {
        Some(id) => Some(class_in_scope(state, actor, id).await?),
        None => None,
    };

    let school_id = match &class {
        Some(c) => {
            if school_id.is_some_and(|s| s != c.school_id) {
                return Err(ApiError::field("schoolId", "class belongs to another school"));
            }
            c.school_id
        }
        None => actor.scope.target_school(school_id)?,
    };

    Ok(Placement {
        school_id,
        class_id,
        group_id: group.as_ref().map(|g| g.id),
        class_capacity: class.as_ref().map(|c| i64::from(c.capacity)),
        group_capacity: group.as_ref().map(|g| (g.id, i64::from(g.max_students))),
        academic_year: class.map(|c| c.academic_year),
    })
}

async fn check_class_room(state: &SharedState, placement: &Placement, adding: usize) -> ApiResult<()> {
    let (Some(class_id), Some(capacity)) = (placement.class_id, placement.class_capacity) else {
        return Ok(());
    };
    let current = db::count_students_in_class(&state.pool, class_id).await?;
    if !db::has_room(current, adding as i64, capacity) {
        return Err(db::WriteError::ClassFull { current, max: capacity }.into());
    }
    Ok(())
}

/// Seat after a move. An explicit group settles both columns. A class alone
/// keeps the current group only when the class does not change, since a
/// group never spans classes.
fn next_seat(current: Seat, placement: &Placement) -> Seat {
    match placement.group_id {
        Some(group_id) => Seat {
            class_id: placement.class_id,
            group_id: Some(group_id),
        },
        None if placement.class_id == current.class_id => current,
        None => Seat {
            class_id: placement.class_id,
            group_id: None,
        },
    }
}

async fn check_parent(state: &SharedState, parent_id: &str) -> ApiResult<String> {
    db::find_user_by_id(&state.pool, parent_id)
        .await?
        .filter(|u| u.role_set().contains(Role::Parent))
        .map(|u| u.id)
        .ok_or_else(|| ApiError::field("parentId", "parent not found"))
}

fn resolve_year(checks: &mut Checks, requested: Option<&str>, placement: &Placement) -> String {
    match (requested, placement.academic_year.as_deref()) {
        (Some(year), _) => checks.academic_year("academicYear", year),
        (None, Some(year)) => year.to_string(),
        (None, None) => {
            checks.fail("academicYear", "academicYear is required");
            String::new()
        }
    }
}

fn seal(cipher: &PiiCipher, value: Option<&str>) -> ApiResult<Option<String>> {
    let value = value.map(str::trim).filter(|v| !v.is_empty());
    cipher
        .seal_opt(value)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e)))
}

async fn list_students(
    actor: Actor,
    State(state): State<SharedState>,
    Query(query): Query<StudentQuery>,
) -> ApiResult<Json<Vec<StudentView>>> {
    actor.require(Action::ViewStudents)?;
    let Some(school_id) = actor.scope.filter() else {
        return Ok(Json(Vec::new()));
    };

    let filter = StudentFilter {
        school_id,
        class_id: query.class_id,
        group_id: query.group_id,
        parent_id: actor.parent_only().then(|| actor.id().to_string()),
        teacher_id: query.mine.then(|| actor.id().to_string()),
    };
    let rows = db::list_students(&state.pool, &filter).await?;
    let students = rows
        .into_iter()
        .map(|row| StudentView::open(row, &state.cipher))
        .collect();
    Ok(Json(students))
}

async fn get_student(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StudentView>> {
    actor.require(Action::ViewStudents)?;
    let student = student_visible(&state, &actor, id).await?;
    Ok(Json(StudentView::open(student, &state.cipher)))
}

async fn create_student(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<StudentPayload>,
) -> ApiResult<(StatusCode, Json<StudentView>)> {
    actor.require(Action::ManageStudents)?;

    let mut checks = Checks::new();
    let full_name = checks.name("fullName", payload.full_name.as_deref().unwrap_or_default());
    checks.finish()?;

    let placement = place(&state, &actor, payload.school_id, payload.class_id, payload.group_id).await?;
    let mut checks = Checks::new();
    let academic_year = resolve_year(&mut checks, payload.academic_year.as_deref(), &placement);
    checks.finish()?;

    let parent_id = match payload.parent_id.as_deref().filter(|p| !p.is_empty()) {
        Some(id) => Some(check_parent(&state, id).await?),
        None => None,
    };

    check_class_room(&state, &placement, 1).await?;

    let student = NewStudent {
        full_name,
        class_id: placement.class_id,
        group_id: placement.group_id,
        school_id: placement.school_id,
        parent_id,
        academic_year,
        enc_parent_contact: seal(&state.cipher, payload.parent_contact.as_deref())?,
        enc_address: seal(&state.cipher, payload.address.as_deref())?,
    };

    let mut created = db::insert_students_bulk(&state.pool, &[student], placement.group_capacity).await?;
    let row = created
        .pop()
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("insert returned no row")))?;
    tracing::info!("Student {} created by {}", row.id, actor.id());
    Ok((StatusCode::CREATED, Json(StudentView::open(row, &state.cipher))))
}

/// Creates every pasted row in one transaction.
async fn create_students_bulk(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<BulkPayload>,
) -> ApiResult<(StatusCode, Json<Vec<StudentView>>)> {
    actor.require(Action::ManageStudents)?;

    let rows = bulk::parse_students(&payload.text);
    let mut checks = Checks::new();
    if rows.is_empty() {
        checks.fail("text", "no student names found");
    } else if rows.len() > MAX_BULK_ROWS {
        checks.fail("text", format!("at most {MAX_BULK_ROWS} students per upload"));
    }
    for (idx, row) in rows.iter().enumerate() {
        checks.name(&format!("rows[{idx}].fullName"), &row.full_name);
    }
    checks.finish()?;

    let placement = place(&state, &actor, payload.school_id, payload.class_id, payload.group_id).await?;
    let mut checks = Checks::new();
    let academic_year = resolve_year(&mut checks, payload.academic_year.as_deref(), &placement);
    checks.finish()?;

    check_class_room(&state, &placement, rows.len()).await?;

    let students = rows
        .into_iter()
        .map(|row| {
            Ok(NewStudent {
                full_name: row.full_name,
                class_id: placement.class_id,
                group_id: placement.group_id,
                school_id: placement.school_id,
                parent_id: None,
                academic_year: academic_year.clone(),
                enc_parent_contact: seal(&state.cipher, row.parent_contact.as_deref())?,
                enc_address: seal(&state.cipher, row.address.as_deref())?,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let created = db::insert_students_bulk(&state.pool, &students, placement.group_capacity).await?;
    tracing::info!(
        "{} students created in school {} by {}",
        created.len(),
        placement.school_id,
        actor.id()
    );

    let views = created
        .into_iter()
        .map(|row| StudentView::open(row, &state.cipher))
        .collect();
    Ok((StatusCode::CREATED, Json(views)))
}

async fn update_student(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StudentPayload>,
) -> ApiResult<Json<StudentView>> {
    actor.require(Action::ManageStudents)?;
    let student = student_visible(&state, &actor, id).await?;

    let mut checks = Checks::new();
    let full_name = checks.optional_name("fullName", payload.full_name.as_deref());
    let academic_year = payload
        .academic_year
        .as_deref()
        .map(|y| checks.academic_year("academicYear", y));
    checks.finish()?;

    if payload.school_id.is_some_and(|s| s != student.school_id) {
        return Err(ApiError::BadRequest(
            "a student cannot move to another school".to_string(),
        ));
    }

    let mut changes = StudentChanges {
        full_name,
        academic_year,
        is_active: payload.is_active,
        enc_parent_contact: seal(&state.cipher, payload.parent_contact.as_deref())?,
        enc_address: seal(&state.cipher, payload.address.as_deref())?,
        ..StudentChanges::default()
    };

    if payload.class_id.is_some() || payload.group_id.is_some() {
        let placement = place(
            &state,
            &actor,
            Some(student.school_id),
            payload.class_id,
            payload.group_id,
        )
        .await?;

        let current = Seat {
            class_id: student.class_id,
            group_id: student.group_id,
        };
        let seat = next_seat(current, &placement);

        if seat.class_id.is_some() && seat.class_id != current.class_id {
            check_class_room(&state, &placement, 1).await?;
        }
        if let Some((group_id, max)) = placement.group_capacity {
            if seat.group_id != current.group_id {
                let current = db::count_students_in_group(&state.pool, group_id).await?;
                if !db::has_room(current, 1, max) {
                    return Err(db::WriteError::GroupFull { current, max }.into());
                }
            }
        }

        if seat != current {
            changes.seat = Some(seat);
        }
    }

    if let Some(parent_id) = payload.parent_id.as_deref().filter(|p| !p.is_empty()) {
        changes.parent_id = Some(check_parent(&state, parent_id).await?);
    }

    let row = db::update_student(&state.pool, student.id, &changes)
        .await?
        .ok_or(ApiError::NotFound("Student"))?;
    Ok(Json(StudentView::open(row, &state.cipher)))
}

async fn delete_student(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    actor.require(Action::ManageStudents)?;
    let student = student_visible(&state, &actor, id).await?;
    db::delete_student(&state.pool, student.id).await?;
    tracing::info!("Student {} deleted by {}", student.id, actor.id());
    Ok(StatusCode::NO_CONTENT)
}
