//! Classes, student groups and students.

use crate::domain::grades::GradeBook;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbClass {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub academic_year: String,
    pub capacity: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassFields {
    pub school_id: Option<Uuid>,
    pub name: Option<String>,
    pub academic_year: Option<String>,
    pub capacity: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbGroup {
    pub id: Uuid,
    pub class_id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub teacher_id: Option<String>,
    pub max_students: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFields {
    pub class_id: Option<Uuid>,
    pub name: Option<String>,
    pub teacher_id: Option<String>,
    pub max_students: Option<i32>,
    pub is_active: Option<bool>,
}

/// Student row as stored; contact and address are sealed.
#[derive(Debug, Clone, FromRow)]
pub struct DbStudent {
    pub id: Uuid,
    pub full_name: String,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub school_id: Uuid,
    pub parent_id: Option<String>,
    pub academic_year: String,
    pub enc_parent_contact: Option<String>,
    pub enc_address: Option<String>,
    pub grades: Json<GradeBook>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub full_name: String,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub school_id: Uuid,
    pub parent_id: Option<String>,
    pub academic_year: String,
    pub enc_parent_contact: Option<String>,
    pub enc_address: Option<String>,
}

/// Where a student sits. Both columns are written together, so a `None`
/// group here clears the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seat {
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
}

/// Column updates for a student. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct StudentChanges {
    pub full_name: Option<String>,
    pub seat: Option<Seat>,
    pub parent_id: Option<String>,
    pub academic_year: Option<String>,
    pub enc_parent_contact: Option<String>,
    pub enc_address: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub school_id: Option<Uuid>,
    pub class_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub parent_id: Option<String>,
    pub teacher_id: Option<String>,
}

const CLASS_COLUMNS: &str = "id, school_id, name, academic_year, capacity, is_active, created_at";
const GROUP_COLUMNS: &str =
    "id, class_id, school_id, name, teacher_id, max_students, is_active, created_at";
const STUDENT_COLUMNS: &str = r#"
    id,
    full_name,
    class_id,
    group_id,
    school_id,
    parent_id,
    academic_year,
    enc_parent_contact,
    enc_address,
    grades,
    is_active,
    created_at,
    updated_at
"#;

// ---------- Classes ----------

pub async fn list_classes(pool: &PgPool, school: Option<Uuid>) -> Result<Vec<DbClass>> {
    let sql = format!(
        "SELECT {CLASS_COLUMNS} FROM classes WHERE ($1::uuid IS NULL OR school_id = $1) ORDER BY academic_year DESC, name"
    );
    let rows = sqlx::query_as::<_, DbClass>(&sql)
        .bind(school)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn find_class(pool: &PgPool, id: Uuid) -> Result<Option<DbClass>> {
    let sql = format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = $1");
    let row = sqlx::query_as::<_, DbClass>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn create_class(
    pool: &PgPool,
    school_id: Uuid,
    name: &str,
    academic_year: &str,
    capacity: i32,
) -> Result<DbClass> {
    let sql = format!(
        r#"
        INSERT INTO classes (id, school_id, name, academic_year, capacity)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING {CLASS_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbClass>(&sql)
        .bind(Uuid::new_v4())
        .bind(school_id)
        .bind(name)
        .bind(academic_year)
        .bind(capacity)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn update_class(pool: &PgPool, id: Uuid, fields: &ClassFields) -> Result<Option<DbClass>> {
    let sql = format!(
        r#"
        UPDATE classes
        SET school_id = COALESCE($2, school_id),
            name = COALESCE($3, name),
            academic_year = COALESCE($4, academic_year),
            capacity = COALESCE($5, capacity),
            is_active = COALESCE($6, is_active)
        WHERE id = $1
        RETURNING {CLASS_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbClass>(&sql)
        .bind(id)
        .bind(fields.school_id)
        .bind(&fields.name)
        .bind(&fields.academic_year)
        .bind(fields.capacity)
        .bind(fields.is_active)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Groups go with the class; students stay but lose their class and group.
pub async fn delete_class(pool: &PgPool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM classes WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_students_in_class<'e, E: PgExecutor<'e>>(exec: E, class_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM students WHERE class_id = $1 AND is_active = true",
    )
    .bind(class_id)
    .fetch_one(exec)
    .await?;
    Ok(count)
}

// ---------- Groups ----------

pub async fn list_groups(
    pool: &PgPool,
    school: Option<Uuid>,
    class_id: Option<Uuid>,
    teacher_id: Option<&str>,
) -> Result<Vec<DbGroup>> {
    let sql = format!(
        r#"
        SELECT {GROUP_COLUMNS}
        FROM student_groups
        WHERE ($1::uuid IS NULL OR school_id = $1)
          AND ($2::uuid IS NULL OR class_id = $2)
          AND ($3::text IS NULL OR teacher_id = $3)
        ORDER BY name
        "#
    );
    let rows = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(school)
        .bind(class_id)
        .bind(teacher_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn find_group(pool: &PgPool, id: Uuid) -> Result<Option<DbGroup>> {
    let sql = format!("SELECT {GROUP_COLUMNS} FROM student_groups WHERE id = $1");
    let row = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// The group inherits its school from the class.
pub async fn create_group(
    pool: &PgPool,
    class: &DbClass,
    name: &str,
    teacher_id: Option<&str>,
    max_students: i32,
) -> Result<DbGroup> {
    let sql = format!(
        r#"
        INSERT INTO student_groups (id, class_id, school_id, name, teacher_id, max_students)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {GROUP_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(Uuid::new_v4())
        .bind(class.id)
        .bind(class.school_id)
        .bind(name)
        .bind(teacher_id)
        .bind(max_students)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// Class moves go through [`move_group`]; `fields.class_id` is ignored here.
pub async fn update_group(pool: &PgPool, id: Uuid, fields: &GroupFields) -> Result<Option<DbGroup>> {
    let sql = format!(
        r#"
        UPDATE student_groups
        SET name = COALESCE($2, name),
            teacher_id = COALESCE($3, teacher_id),
            max_students = COALESCE($4, max_students),
            is_active = COALESCE($5, is_active)
        WHERE id = $1
        RETURNING {GROUP_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(id)
        .bind(&fields.name)
        .bind(&fields.teacher_id)
        .bind(fields.max_students)
        .bind(fields.is_active)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Moves a group and its students into another class of the same school.
/// The target class is locked while its headcount is checked, so two moves
/// cannot both squeeze into the last seats.
pub async fn move_group(pool: &PgPool, group_id: Uuid, class: &DbClass) -> Result<Option<DbGroup>, WriteError> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT id FROM classes WHERE id = $1 FOR UPDATE")
        .bind(class.id)
        .execute(&mut *tx)
        .await?;
    let current = count_students_in_class(&mut *tx, class.id).await?;
    let moving = count_students_in_group(&mut *tx, group_id).await?;
    let max = i64::from(class.capacity);
    if !has_room(current, moving, max) {
        return Err(WriteError::ClassFull { current, max });
    }

    let sql = format!(
        "UPDATE student_groups SET class_id = $2, school_id = $3 WHERE id = $1 RETURNING {GROUP_COLUMNS}"
    );
    let Some(group) = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(group_id)
        .bind(class.id)
        .bind(class.school_id)
        .fetch_optional(&mut *tx)
        .await?
    else {
        return Ok(None);
    };

    sqlx::query("UPDATE students SET class_id = $2, updated_at = now() WHERE group_id = $1")
        .bind(group_id)
        .bind(class.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(group))
}

/// `None` clears the teacher.
pub async fn set_group_teacher(pool: &PgPool, id: Uuid, teacher_id: Option<&str>) -> Result<Option<DbGroup>> {
    let sql = format!(
        "UPDATE student_groups SET teacher_id = $2 WHERE id = $1 RETURNING {GROUP_COLUMNS}"
    );
    let row = sqlx::query_as::<_, DbGroup>(&sql)
        .bind(id)
        .bind(teacher_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn delete_group(pool: &PgPool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM student_groups WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_students_in_group<'e, E: PgExecutor<'e>>(exec: E, group_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM students WHERE group_id = $1 AND is_active = true",
    )
    .bind(group_id)
    .fetch_one(exec)
    .await?;
    Ok(count)
}

// ---------- Students ----------

pub async fn list_students(pool: &PgPool, filter: &StudentFilter) -> Result<Vec<DbStudent>> {
    let sql = format!(
        r#"
        SELECT {STUDENT_COLUMNS}
        FROM students s
        WHERE ($1::uuid IS NULL OR s.school_id = $1)
          AND ($2::uuid IS NULL OR s.class_id = $2)
          AND ($3::uuid IS NULL OR s.group_id = $3)
          AND ($4::text IS NULL OR s.parent_id = $4)
          AND ($5::text IS NULL OR EXISTS (
                SELECT 1 FROM student_groups g
                WHERE g.id = s.group_id AND g.teacher_id = $5
          ))
        ORDER BY s.full_name
        "#
    );
    let rows = sqlx::query_as::<_, DbStudent>(&sql)
        .bind(filter.school_id)
        .bind(filter.class_id)
        .bind(filter.group_id)
        .bind(&filter.parent_id)
        .bind(&filter.teacher_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn find_student<'e, E: PgExecutor<'e>>(exec: E, id: Uuid) -> Result<Option<DbStudent>> {
    let sql = format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = $1");
    let row = sqlx::query_as::<_, DbStudent>(&sql)
        .bind(id)
        .fetch_optional(exec)
        .await?;
    Ok(row)
}

pub async fn insert_student<'e, E: PgExecutor<'e>>(exec: E, student: &NewStudent) -> Result<DbStudent> {
    let sql = format!(
        r#"
        INSERT INTO students (
            id, full_name, class_id, group_id, school_id, parent_id,
            academic_year, enc_parent_contact, enc_address
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbStudent>(&sql)
        .bind(Uuid::new_v4())
        .bind(&student.full_name)
        .bind(student.class_id)
        .bind(student.group_id)
        .bind(student.school_id)
        .bind(&student.parent_id)
        .bind(&student.academic_year)
        .bind(&student.enc_parent_contact)
        .bind(&student.enc_address)
        .fetch_one(exec)
        .await?;
    Ok(row)
}

/// All rows land or none do. `group_capacity` is checked inside the same
/// transaction so concurrent bulk inserts cannot overfill a group.
pub async fn insert_students_bulk(
    pool: &PgPool,
    students: &[NewStudent],
    group_capacity: Option<(Uuid, i64)>,
) -> Result<Vec<DbStudent>, WriteError> {
    let mut tx = pool.begin().await?;

    if let Some((group_id, max)) = group_capacity {
        sqlx::query("SELECT id FROM student_groups WHERE id = $1 FOR UPDATE")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        let current = count_students_in_group(&mut *tx, group_id).await?;
        if !has_room(current, students.len() as i64, max) {
            return Err(WriteError::GroupFull { current, max });
        }
    }

    let mut created = Vec::with_capacity(students.len());
    for student in students {
        created.push(insert_student(&mut *tx, student).await?);
    }

    tx.commit().await?;
    Ok(created)
}

/// Whether `adding` more students fit next to `current` under `max`.
pub fn has_room(current: i64, adding: i64, max: i64) -> bool {
    current + adding <= max
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("group is full ({current}/{max})")]
    GroupFull { current: i64, max: i64 },
    #[error("class is full ({current}/{max})")]
    ClassFull { current: i64, max: i64 },
    #[error("student {0} not found")]
    MissingStudent(Uuid),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        WriteError::Db(err.into())
    }
}

pub async fn update_student(pool: &PgPool, id: Uuid, changes: &StudentChanges) -> Result<Option<DbStudent>> {
    let sql = format!(
        r#"
        UPDATE students
        SET full_name = COALESCE($2, full_name),
            class_id = CASE WHEN $10 THEN $3 ELSE class_id END,
            group_id = CASE WHEN $10 THEN $4 ELSE group_id END,
            parent_id = COALESCE($5, parent_id),
            academic_year = COALESCE($6, academic_year),
            enc_parent_contact = COALESCE($7, enc_parent_contact),
            enc_address = COALESCE($8, enc_address),
            is_active = COALESCE($9, is_active),
            updated_at = now()
        WHERE id = $1
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbStudent>(&sql)
        .bind(id)
        .bind(&changes.full_name)
        .bind(changes.seat.and_then(|seat| seat.class_id))
        .bind(changes.seat.and_then(|seat| seat.group_id))
        .bind(&changes.parent_id)
        .bind(&changes.academic_year)
        .bind(&changes.enc_parent_contact)
        .bind(&changes.enc_address)
        .bind(changes.is_active)
        .bind(changes.seat.is_some())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn delete_student(pool: &PgPool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM students WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Replaces one aspect's list in place; other aspects are untouched.
pub async fn set_aspect_grades<'e, E: PgExecutor<'e>>(
    exec: E,
    student_id: Uuid,
    aspect: &str,
    grades: &[i16],
) -> Result<Option<DbStudent>> {
    let sql = format!(
        r#"
        UPDATE students
        SET grades = jsonb_set(grades, ARRAY[$2::text], $3::jsonb, true),
            updated_at = now()
        WHERE id = $1
        RETURNING {STUDENT_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbStudent>(&sql)
        .bind(student_id)
        .bind(aspect)
        .bind(Json(grades))
        .fetch_optional(exec)
        .await?;
    Ok(row)
}

#[derive(Debug, Clone)]
pub struct GradeWrite {
    pub student_id: Uuid,
    pub aspect: String,
    pub grades: Vec<i16>,
}

/// Applies every write in one transaction. A missing student aborts the batch
/// and is reported by id.
pub async fn set_aspect_grades_batch(pool: &PgPool, writes: &[GradeWrite]) -> Result<Vec<DbStudent>, WriteError> {
    let mut tx = pool.begin().await?;
    let mut updated: Vec<DbStudent> = Vec::with_capacity(writes.len());

    for write in writes {
        match set_aspect_grades(&mut *tx, write.student_id, &write.aspect, &write.grades).await? {
            Some(row) => {
                updated.retain(|s| s.id != row.id);
                updated.push(row);
            }
            None => {
                tx.rollback().await?;
                return Err(WriteError::MissingStudent(write.student_id));
            }
        }
    }

    tx.commit().await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_room_counts_incoming() {
        assert!(has_room(13, 2, 15));
        assert!(!has_room(14, 2, 15));
        assert!(has_room(0, 0, 1));
        // A move into a class already over capacity is refused even when empty-handed.
        assert!(!has_room(31, 0, 30));
    }

    #[test]
    fn test_full_errors_report_counts() {
        assert_eq!(WriteError::ClassFull { current: 28, max: 30 }.to_string(), "class is full (28/30)");
        assert_eq!(WriteError::GroupFull { current: 15, max: 15 }.to_string(), "group is full (15/15)");
    }
}
