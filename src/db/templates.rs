use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbReportTemplate {
    pub id: Uuid,
    pub school_id: Option<Uuid>,
    pub name: String,
    pub layout: String,
    pub show_photo: bool,
    pub show_radar_chart: bool,
    pub show_narration: bool,
    pub show_discipline: bool,
    pub show_growth: bool,
    pub show_signature: bool,
    pub grading_periods: Json<Vec<String>>,
    pub header_text: Option<String>,
    pub footer_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateFields {
    pub school_id: Option<Uuid>,
    pub name: Option<String>,
    pub layout: Option<String>,
    pub show_photo: Option<bool>,
    pub show_radar_chart: Option<bool>,
    pub show_narration: Option<bool>,
    pub show_discipline: Option<bool>,
    pub show_growth: Option<bool>,
    pub show_signature: Option<bool>,
    pub grading_periods: Option<Vec<String>>,
    pub header_text: Option<String>,
    pub footer_text: Option<String>,
}

const TEMPLATE_COLUMNS: &str = r#"
    id,
    school_id,
    name,
    layout,
    show_photo,
    show_radar_chart,
    show_narration,
    show_discipline,
    show_growth,
    show_signature,
    grading_periods,
    header_text,
    footer_text,
    created_at
"#;

/// Global templates plus the ones owned by `school` (all templates when `None`).
pub async fn list_report_templates(pool: &PgPool, school: Option<Uuid>) -> Result<Vec<DbReportTemplate>> {
    let sql = format!(
        r#"
        SELECT {TEMPLATE_COLUMNS}
        FROM report_templates
        WHERE $1::uuid IS NULL OR school_id IS NULL OR school_id = $1
        ORDER BY school_id NULLS FIRST, name
        "#
    );
    let rows = sqlx::query_as::<_, DbReportTemplate>(&sql)
        .bind(school)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn find_report_template(pool: &PgPool, id: Uuid) -> Result<Option<DbReportTemplate>> {
    let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM report_templates WHERE id = $1");
    let row = sqlx::query_as::<_, DbReportTemplate>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn count_report_templates(pool: &PgPool) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM report_templates")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Omitted toggles take the column defaults.
pub async fn create_report_template(
    pool: &PgPool,
    school_id: Option<Uuid>,
    name: &str,
    fields: &TemplateFields,
) -> Result<DbReportTemplate> {
    let sql = format!(
        r#"
        INSERT INTO report_templates (
            id, school_id, name, layout,
            show_photo, show_radar_chart, show_narration,
            show_discipline, show_growth, show_signature,
            grading_periods, header_text, footer_text
        )
        VALUES (
            $1, $2, $3, COALESCE($4, 'classic'),
            COALESCE($5, true), COALESCE($6, true), COALESCE($7, true),
            COALESCE($8, false), COALESCE($9, true), COALESCE($10, true),
            COALESCE($11, '[]'::jsonb), $12, $13
        )
        RETURNING {TEMPLATE_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbReportTemplate>(&sql)
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(name)
        .bind(&fields.layout)
        .bind(fields.show_photo)
        .bind(fields.show_radar_chart)
        .bind(fields.show_narration)
        .bind(fields.show_discipline)
        .bind(fields.show_growth)
        .bind(fields.show_signature)
        .bind(fields.grading_periods.as_ref().map(Json))
        .bind(&fields.header_text)
        .bind(&fields.footer_text)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn update_report_template(
    pool: &PgPool,
    id: Uuid,
    fields: &TemplateFields,
) -> Result<Option<DbReportTemplate>> {
    let sql = format!(
        r#"
        UPDATE report_templates
        SET name = COALESCE($2, name),
            layout = COALESCE($3, layout),
            show_photo = COALESCE($4, show_photo),
            show_radar_chart = COALESCE($5, show_radar_chart),
            show_narration = COALESCE($6, show_narration),
            show_discipline = COALESCE($7, show_discipline),
            show_growth = COALESCE($8, show_growth),
            show_signature = COALESCE($9, show_signature),
            grading_periods = COALESCE($10, grading_periods),
            header_text = COALESCE($11, header_text),
            footer_text = COALESCE($12, footer_text)
        WHERE id = $1
        RETURNING {TEMPLATE_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbReportTemplate>(&sql)
        .bind(id)
        .bind(&fields.name)
        .bind(&fields.layout)
        .bind(fields.show_photo)
        .bind(fields.show_radar_chart)
        .bind(fields.show_narration)
        .bind(fields.show_discipline)
        .bind(fields.show_growth)
        .bind(fields.show_signature)
        .bind(fields.grading_periods.as_ref().map(Json))
        .bind(&fields.header_text)
        .bind(&fields.footer_text)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn delete_report_template(pool: &PgPool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM report_templates WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
