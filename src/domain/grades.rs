use crate::error::FieldError;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

pub const MIN_GRADE: i16 = 1;
pub const MAX_GRADE: i16 = 6;
pub const MAX_ENTRIES: usize = 7;

/// Assessment aspects in display order, named `"<Category> - <Skill>"`.
pub const ASPECTS: &[&str] = &[
    "Religious & Moral Values - Prayer Habits",
    "Religious & Moral Values - Kindness",
    "Social-Emotional - Cooperation",
    "Social-Emotional - Independence",
    "Language - Listening Comprehension",
    "Language - Vocabulary",
    "Language - Early Literacy",
    "Mathematics - Counting Skills",
    "Mathematics - Shapes and Patterns",
    "Physical-Motor - Fine Motor Skills",
    "Physical-Motor - Gross Motor Skills",
    "Arts - Creative Expression",
];

static ASPECT_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| ASPECTS.iter().copied().collect());

/// Aspect name -> ordered grade history.
pub type GradeBook = BTreeMap<String, Vec<i16>>;

pub fn is_known_aspect(aspect: &str) -> bool {
    ASPECT_SET.contains(aspect)
}

pub fn split_aspect(aspect: &str) -> (&str, &str) {
    match aspect.split_once(" - ") {
        Some((category, skill)) => (category.trim(), skill.trim()),
        None => (aspect, aspect),
    }
}

pub fn final_grade(grades: &[i16]) -> Option<i16> {
    grades.last().copied()
}

/// Checks one aspect replacement. Any well-formed list is accepted; there is
/// no ordering or monotonicity requirement between entries.
pub fn validate(aspect: &str, grades: &[i16]) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if !is_known_aspect(aspect) {
        errors.push(FieldError::new("aspect", format!("unknown aspect `{aspect}`")));
    }

    if grades.is_empty() || grades.len() > MAX_ENTRIES {
        errors.push(FieldError::new(
            "grades",
            format!("expected between 1 and {MAX_ENTRIES} grades, got {}", grades.len()),
        ));
    }

    for (idx, grade) in grades.iter().enumerate() {
        if !(MIN_GRADE..=MAX_GRADE).contains(grade) {
            errors.push(FieldError::new(
                format!("grades[{idx}]"),
                format!("grade must be between {MIN_GRADE} and {MAX_GRADE}, got {grade}"),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RadarPoint {
    pub aspect: String,
    pub category: String,
    pub skill: String,
    pub final_grade: Option<i16>,
    pub history: Vec<i16>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub category: String,
    pub aspects: Vec<String>,
    pub graded: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RadarChart {
    pub points: Vec<RadarPoint>,
    pub categories: Vec<CategorySummary>,
    pub max_grade: i16,
}

/// One axis per catalogue aspect, in catalogue order. Aspects stored on the
/// student that are no longer in the catalogue are left out.
pub fn radar(book: &GradeBook) -> RadarChart {
    let mut points = Vec::with_capacity(ASPECTS.len());
    let mut categories: Vec<CategorySummary> = Vec::new();

    for aspect in ASPECTS {
        let (category, skill) = split_aspect(aspect);
        let history = book.get(*aspect).cloned().unwrap_or_default();
        let final_value = final_grade(&history);

        match categories.iter_mut().find(|c| c.category == category) {
            Some(summary) => {
                summary.aspects.push(aspect.to_string());
                if final_value.is_some() {
                    summary.graded += 1;
                }
            }
            None => categories.push(CategorySummary {
                category: category.to_string(),
                aspects: vec![aspect.to_string()],
                graded: usize::from(final_value.is_some()),
            }),
        }

        points.push(RadarPoint {
            aspect: aspect.to_string(),
            category: category.to_string(),
            skill: skill.to_string(),
            final_grade: final_value,
            history,
        });
    }

    RadarChart {
        points,
        categories,
        max_grade: MAX_GRADE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTING: &str = "Mathematics - Counting Skills";

    #[test]
    fn test_accepts_well_formed_lists() {
        assert!(validate(COUNTING, &[3]).is_ok());
        assert!(validate(COUNTING, &[6, 1, 6, 1, 6, 1, 6]).is_ok());
    }

    #[test]
    fn test_rejects_length_out_of_range() {
        let errors = validate(COUNTING, &[]).unwrap_err();
        assert_eq!(errors[0].field, "grades");

        let errors = validate(COUNTING, &[1, 2, 3, 4, 5, 6, 1, 2]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "grades");
    }

    #[test]
    fn test_rejects_values_out_of_range() {
        let errors = validate(COUNTING, &[0, 3, 7]).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["grades[0]", "grades[2]"]);
    }

    #[test]
    fn test_rejects_unknown_aspect() {
        let errors = validate("Mathematics - Calculus", &[4]).unwrap_err();
        assert_eq!(errors[0].field, "aspect");
    }

    #[test]
    fn test_final_grade_is_last_entry() {
        assert_eq!(final_grade(&[2, 5, 3]), Some(3));
        assert_eq!(final_grade(&[]), None);
    }

    #[test]
    fn test_split_aspect() {
        assert_eq!(split_aspect(COUNTING), ("Mathematics", "Counting Skills"));
        assert_eq!(split_aspect("Plain"), ("Plain", "Plain"));
    }

    #[test]
    fn test_radar_uses_final_grades_in_catalogue_order() {
        let mut book = GradeBook::new();
        book.insert(COUNTING.to_string(), vec![2, 4]);
        book.insert("Language - Vocabulary".to_string(), vec![5]);
        book.insert("Retired - Aspect".to_string(), vec![1]);

        let chart = radar(&book);
        assert_eq!(chart.points.len(), ASPECTS.len());
        assert_eq!(chart.points[0].aspect, ASPECTS[0]);

        let counting = chart.points.iter().find(|p| p.aspect == COUNTING).unwrap();
        assert_eq!(counting.final_grade, Some(4));
        assert_eq!(counting.history, vec![2, 4]);
        assert_eq!(counting.category, "Mathematics");

        let maths = chart.categories.iter().find(|c| c.category == "Mathematics").unwrap();
        assert_eq!(maths.aspects.len(), 2);
        assert_eq!(maths.graded, 1);
        assert!(chart.points.iter().all(|p| p.aspect != "Retired - Aspect"));
    }
}
