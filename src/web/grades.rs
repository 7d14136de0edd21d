use crate::db::{self, DbReportTemplate, GradeWrite};
use crate::domain::grades::{self, RadarChart};
use crate::domain::policy::Action;
use crate::error::{ApiError, ApiResult, FieldError};
use crate::state::SharedState;
use crate::web::session::Actor;
use crate::web::students::{student_visible, StudentView};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Most writes accepted in one batch.
pub const MAX_BATCH: usize = 500;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectInfo {
    pub name: &'static str,
    pub category: &'static str,
    pub skill: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectCatalogue {
    pub aspects: Vec<AspectInfo>,
    pub min_grade: i16,
    pub max_grade: i16,
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradePayload {
    pub aspect: String,
    pub grades: Vec<i16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub student_id: Uuid,
    pub aspect: String,
    pub grades: Vec<i16>,
}

#[derive(Debug, Deserialize)]
pub struct BatchPayload {
    pub updates: Vec<BatchEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportQuery {
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: StudentView,
    pub school_name: Option<String>,
    pub class_name: Option<String>,
    pub group_name: Option<String>,
    pub teacher_name: Option<String>,
    pub template: Option<DbReportTemplate>,
    pub radar: RadarChart,
    pub generated_at: DateTime<Utc>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/aspects", get(list_aspects))
        .route("/students/:id/grades", put(set_grades))
        .route("/grades/batch", post(set_grades_batch))
        .route("/students/:id/report", get(student_report))
        .with_state(state)
}

pub fn catalogue() -> AspectCatalogue {
    let aspects = grades::ASPECTS
        .iter()
        .map(|&name| {
            let (category, skill) = grades::split_aspect(name);
            AspectInfo {
                name,
                category,
                skill,
            }
        })
        .collect();

    AspectCatalogue {
        aspects,
        min_grade: grades::MIN_GRADE,
        max_grade: grades::MAX_GRADE,
        max_entries: grades::MAX_ENTRIES,
    }
}

async fn list_aspects() -> Json<AspectCatalogue> {
    Json(catalogue())
}

/// Validates every entry, prefixing field names with the entry index.
fn check_batch(entries: &[BatchEntry]) -> ApiResult<()> {
    if entries.is_empty() {
        return Err(ApiError::field("updates", "at least one update is required"));
    }
    if entries.len() > MAX_BATCH {
        return Err(ApiError::field(
            "updates",
            &format!("at most {MAX_BATCH} updates per batch"),
        ));
    }

    let mut errors = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        if let Err(entry_errors) = grades::validate(&entry.aspect, &entry.grades) {
            errors.extend(entry_errors.into_iter().map(|e| {
                FieldError::new(format!("updates[{idx}].{}", e.field), e.message)
            }));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}

/// Replaces one aspect's grade list.
async fn set_grades(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<GradePayload>,
) -> ApiResult<Json<StudentView>> {
    actor.require(Action::UpdateGrades)?;
    grades::validate(&payload.aspect, &payload.grades).map_err(ApiError::Validation)?;
    let student = student_visible(&state, &actor, id).await?;

    let row = db::set_aspect_grades(&state.pool, student.id, &payload.aspect, &payload.grades)
        .await?
        .ok_or(ApiError::NotFound("Student"))?;
    tracing::info!(
        "Grades for {} on '{}' set by {}",
        row.id,
        payload.aspect,
        actor.id()
    );
    Ok(Json(StudentView::open(row, &state.cipher)))
}

/// Applies all updates or none.
async fn set_grades_batch(
    actor: Actor,
    State(state): State<SharedState>,
    Json(payload): Json<BatchPayload>,
) -> ApiResult<Json<Vec<StudentView>>> {
    actor.require(Action::UpdateGrades)?;
    check_batch(&payload.updates)?;

    let ids: HashSet<Uuid> = payload.updates.iter().map(|u| u.student_id).collect();
    for id in &ids {
        student_visible(&state, &actor, *id).await?;
    }

    let writes: Vec<GradeWrite> = payload
        .updates
        .into_iter()
        .map(|u| GradeWrite {
            student_id: u.student_id,
            aspect: u.aspect,
            grades: u.grades,
        })
        .collect();

    let rows = db::set_aspect_grades_batch(&state.pool, &writes).await?;
    tracing::info!(
        "Batch of {} grade updates across {} students applied by {}",
        writes.len(),
        rows.len(),
        actor.id()
    );

    let views = rows
        .into_iter()
        .map(|row| StudentView::open(row, &state.cipher))
        .collect();
    Ok(Json(views))
}

/// The school's own template wins over global ones.
fn pick_template(templates: Vec<DbReportTemplate>, school_id: Uuid) -> Option<DbReportTemplate> {
    let own = templates.iter().position(|t| t.school_id == Some(school_id));
    let mut templates = templates;
    match own {
        Some(idx) => Some(templates.swap_remove(idx)),
        None => templates.into_iter().next(),
    }
}

async fn student_report(
    actor: Actor,
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Json<StudentReport>> {
    actor.require(Action::ViewReports)?;
    let student = student_visible(&state, &actor, id).await?;

    let school = db::find_school(&state.pool, student.school_id).await?;
    let class = match student.class_id {
        Some(class_id) => db::find_class(&state.pool, class_id).await?,
        None => None,
    };
    let group = match student.group_id {
        Some(group_id) => db::find_group(&state.pool, group_id).await?,
        None => None,
    };
    let teacher = match group.as_ref().and_then(|g| g.teacher_id.as_deref()) {
        Some(teacher_id) => db::find_user_by_id(&state.pool, teacher_id).await?,
        None => None,
    };

    let template = match query.template_id {
        Some(template_id) => Some(
            db::find_report_template(&state.pool, template_id)
                .await?
                .filter(|t| t.school_id.map_or(true, |s| s == student.school_id))
                .ok_or(ApiError::NotFound("Report template"))?,
        ),
        None => {
            let templates = db::list_report_templates(&state.pool, Some(student.school_id)).await?;
            pick_template(templates, student.school_id)
        }
    };

    let view = StudentView::open(student, &state.cipher);
    let radar = grades::radar(&view.grades);

    Ok(Json(StudentReport {
        school_name: school.map(|s| s.name),
        class_name: class.map(|c| c.name),
        group_name: group.map(|g| g.name),
        teacher_name: teacher.map(|t| t.display_name()),
        template,
        radar,
        generated_at: Utc::now(),
        student: view,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json as DbJson;

    fn entry(aspect: &str, grades: Vec<i16>) -> BatchEntry {
        BatchEntry {
            student_id: Uuid::new_v4(),
            aspect: aspect.to_string(),
            grades,
        }
    }

    #[test]
    fn test_catalogue_splits_names() {
        let catalogue = catalogue();
        assert_eq!(catalogue.aspects.len(), grades::ASPECTS.len());
        let counting = catalogue
            .aspects
            .iter()
            .find(|a| a.name == "Mathematics - Counting Skills")
            .unwrap();
        assert_eq!(counting.category, "Mathematics");
        assert_eq!(counting.skill, "Counting Skills");
        assert_eq!(catalogue.max_entries, 7);
    }

    #[test]
    fn test_batch_errors_carry_entry_index() {
        let entries = vec![
            entry("Language - Vocabulary", vec![4]),
            entry("Language - Vocabulary", vec![4, 9]),
        ];
        let Err(ApiError::Validation(errors)) = check_batch(&entries) else {
            panic!("expected validation error");
        };
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "updates[1].grades[1]");
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(matches!(check_batch(&[]), Err(ApiError::Validation(_))));
        assert!(check_batch(&[entry("Arts - Creative Expression", vec![6])]).is_ok());
    }

    fn template(school_id: Option<Uuid>, name: &str) -> DbReportTemplate {
        DbReportTemplate {
            id: Uuid::new_v4(),
            school_id,
            name: name.to_string(),
            layout: "classic".to_string(),
            show_photo: true,
            show_radar_chart: true,
            show_narration: true,
            show_discipline: false,
            show_growth: true,
            show_signature: true,
            grading_periods: DbJson(vec!["Semester 1".to_string()]),
            header_text: None,
            footer_text: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_school_template_preferred() {
        let school = Uuid::new_v4();
        let picked = pick_template(
            vec![template(None, "Standard"), template(Some(school), "Ours")],
            school,
        )
        .unwrap();
        assert_eq!(picked.name, "Ours");

        let fallback = pick_template(vec![template(None, "Standard")], school).unwrap();
        assert_eq!(fallback.name, "Standard");
        assert!(pick_template(Vec::new(), school).is_none());
    }
}
