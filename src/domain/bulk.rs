use serde::{Deserialize, Serialize};

/// One row of a pasted student list: `name[, parent contact[, address]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStudentRow {
    pub full_name: String,
    pub parent_contact: Option<String>,
    pub address: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Splits a pasted block into rows. Lines without a name are skipped. The
/// address keeps any further commas, so `"A, 1, 2 Elm St, Apt 3"` has address
/// `"2 Elm St, Apt 3"`.
pub fn parse_students(text: &str) -> Vec<BulkStudentRow> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ',');
            let full_name = parts.next().map(str::trim).unwrap_or_default();
            if full_name.is_empty() {
                return None;
            }
            Some(BulkStudentRow {
                full_name: full_name.to_string(),
                parent_contact: non_empty(parts.next()),
                address: non_empty(parts.next()),
            })
        })
        .collect()
}
