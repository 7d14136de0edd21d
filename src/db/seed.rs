use crate::db::{self, TemplateFields};
use anyhow::Result;
use sqlx::PgPool;

const DEFAULT_TEMPLATE_NAME: &str = "Standard Progress Report";

pub async fn seed_all(pool: &PgPool) -> Result<()> {
    seed_report_templates(pool).await?;
    Ok(())
}

fn default_template() -> TemplateFields {
    TemplateFields {
        layout: Some("classic".to_string()),
        show_photo: Some(true),
        show_radar_chart: Some(true),
        show_narration: Some(true),
        show_discipline: Some(false),
        show_growth: Some(true),
        show_signature: Some(true),
        grading_periods: Some(vec!["Semester 1".to_string(), "Semester 2".to_string()]),
        header_text: Some("Student Progress Report".to_string()),
        footer_text: Some("Prepared by the class teacher".to_string()),
        ..TemplateFields::default()
    }
}

async fn seed_report_templates(pool: &PgPool) -> Result<()> {
    if db::count_report_templates(pool).await? > 0 {
        return Ok(());
    }
    db::create_report_template(pool, None, DEFAULT_TEMPLATE_NAME, &default_template()).await?;
    tracing::info!("Seeded default report template");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_is_complete() {
        let t = default_template();
        assert_eq!(t.layout.as_deref(), Some("classic"));
        assert_eq!(t.grading_periods.as_ref().map(Vec::len), Some(2));
        assert!(t.school_id.is_none());
    }
}
