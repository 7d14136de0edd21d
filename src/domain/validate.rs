//! Field checks shared by the write endpoints. Each returns the trimmed value
//! or pushes a `FieldError`.

use crate::error::{ApiError, FieldError};

pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Default)]
pub struct Checks {
    errors: Vec<FieldError>,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    /// Required, non-blank, bounded text.
    pub fn name(&mut self, field: &str, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            self.fail(field, format!("{field} is required"));
        } else if trimmed.chars().count() > MAX_NAME_LEN {
            self.fail(field, format!("{field} must be at most {MAX_NAME_LEN} characters"));
        }
        trimmed.to_string()
    }

    pub fn optional_name(&mut self, field: &str, value: Option<&str>) -> Option<String> {
        value.map(|v| self.name(field, v))
    }

    pub fn academic_year(&mut self, field: &str, value: &str) -> String {
        let trimmed = value.trim();
        if !is_academic_year(trimmed) {
            self.fail(field, "academic year must look like 2024/2025");
        }
        trimmed.to_string()
    }

    pub fn positive(&mut self, field: &str, value: i32) -> i32 {
        if value <= 0 {
            self.fail(field, format!("{field} must be greater than zero"));
        }
        value
    }

    pub fn optional_email(&mut self, field: &str, value: Option<&str>) -> Option<String> {
        let value = value.map(|v| v.trim().to_lowercase()).filter(|v| !v.is_empty())?;
        if !value.contains('@') || value.starts_with('@') || value.ends_with('@') {
            self.fail(field, "invalid email address");
        }
        Some(value)
    }

    pub fn finish(self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(self.errors))
        }
    }
}

/// `YYYY/YYYY` or `YYYY-YYYY` with consecutive years.
pub fn is_academic_year(value: &str) -> bool {
    let Some((start, end)) = value.split_once(['/', '-']) else {
        return false;
    };
    let four_digits = |part: &str| part.len() == 4 && part.bytes().all(|b| b.is_ascii_digit());
    if !four_digits(start) || !four_digits(end) {
        return false;
    }
    match (start.parse::<u16>(), end.parse::<u16>()) {
        (Ok(s), Ok(e)) => e == s + 1,
        _ => false,
    }
}
