pub mod roster;
pub mod seed;
pub mod templates;

pub use roster::*;
pub use templates::*;

use crate::domain::roles::RoleSet;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbUser {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub roles: Vec<String>,
    pub is_active: bool,
    pub school_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbUser {
    pub fn role_set(&self) -> RoleSet {
        RoleSet::from_strings(&self.roles)
    }

    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if full.trim().is_empty() {
            self.email.clone().unwrap_or_else(|| self.id.clone())
        } else {
            full
        }
    }
}

/// Profile fields reported by a login provider.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbAssignment {
    pub id: Uuid,
    pub user_id: String,
    pub school_id: Uuid,
    pub roles: Vec<String>,
    pub academic_year: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DbSchool {
    pub id: Uuid,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub principal_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolFields {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub principal_name: Option<String>,
    pub is_active: Option<bool>,
}

const USER_COLUMNS: &str = r#"
    id,
    email,
    first_name,
    last_name,
    profile_image_url,
    roles,
    is_active,
    school_id,
    created_at,
    updated_at
"#;

// A user belongs to a school through its primary school or any assignment.
const USER_IN_SCHOOL: &str = r#"
    (u.school_id = $1 OR EXISTS (
        SELECT 1 FROM user_school_assignments a
        WHERE a.user_id = u.id AND a.school_id = $1 AND a.is_active = true
    ))
"#;

// A NULL $1 matches any school.
const TEACHES_IN_SCHOOL: &str = r#"
    (('teacher' = ANY(u.roles) AND ($1::uuid IS NULL OR u.school_id = $1))
    OR EXISTS (
        SELECT 1 FROM user_school_assignments a
        WHERE a.user_id = u.id AND a.is_active = true
          AND ($1::uuid IS NULL OR a.school_id = $1)
          AND 'teacher' = ANY(a.roles)
    ))
"#;

// ---------- Users ----------

pub async fn find_user_by_id(pool: &PgPool, id: &str) -> Result<Option<DbUser>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
    let user = sqlx::query_as::<_, DbUser>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Insert-or-refresh on login. Existing roles are preserved; `grant_superadmin`
/// only ever adds the role.
pub async fn upsert_user(pool: &PgPool, profile: &UserProfile, grant_superadmin: bool) -> Result<DbUser> {
    let initial_roles: Vec<String> = if grant_superadmin {
        vec!["superadmin".to_string()]
    } else {
        Vec::new()
    };

    let sql = format!(
        r#"
        INSERT INTO users (id, email, first_name, last_name, profile_image_url, roles)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
        SET email = EXCLUDED.email,
            first_name = EXCLUDED.first_name,
            last_name = EXCLUDED.last_name,
            profile_image_url = EXCLUDED.profile_image_url,
            roles = CASE
                WHEN $7 AND NOT ('superadmin' = ANY(users.roles))
                    THEN array_append(users.roles, 'superadmin')
                ELSE users.roles
            END,
            updated_at = now()
        RETURNING {USER_COLUMNS}
        "#
    );

    let user = sqlx::query_as::<_, DbUser>(&sql)
        .bind(&profile.id)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.profile_image_url)
        .bind(&initial_roles)
        .bind(grant_superadmin)
        .fetch_one(pool)
        .await?;
    Ok(user)
}

pub async fn list_users(pool: &PgPool, school: Option<Uuid>) -> Result<Vec<DbUser>> {
    let users = match school {
        None => {
            let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at");
            sqlx::query_as::<_, DbUser>(&sql).fetch_all(pool).await?
        }
        Some(school_id) => {
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users u WHERE {USER_IN_SCHOOL} ORDER BY u.created_at"
            );
            sqlx::query_as::<_, DbUser>(&sql)
                .bind(school_id)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(users)
}

/// Teachers either by their own row or through a teaching assignment.
pub async fn list_teachers(pool: &PgPool, school: Option<Uuid>) -> Result<Vec<DbUser>> {
    let sql = format!(
        "SELECT {USER_COLUMNS} FROM users u WHERE u.is_active = true AND {TEACHES_IN_SCHOOL} ORDER BY u.created_at"
    );
    let users = sqlx::query_as::<_, DbUser>(&sql)
        .bind(school)
        .fetch_all(pool)
        .await?;
    Ok(users)
}

pub async fn teaches_in_school(pool: &PgPool, user_id: &str, school_id: Uuid) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM users u WHERE u.id = $2 AND u.is_active = true AND {TEACHES_IN_SCHOOL})"
    );
    let exists = sqlx::query_scalar::<_, bool>(&sql)
        .bind(Some(school_id))
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(exists)
}

pub async fn set_user_roles(pool: &PgPool, user_id: &str, roles: &RoleSet) -> Result<Option<DbUser>> {
    let sql = format!(
        "UPDATE users SET roles = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
    );
    let user = sqlx::query_as::<_, DbUser>(&sql)
        .bind(user_id)
        .bind(roles.to_strings())
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn set_user_active(pool: &PgPool, user_id: &str, active: bool) -> Result<Option<DbUser>> {
    let sql = format!(
        "UPDATE users SET is_active = $2, updated_at = now() WHERE id = $1 RETURNING {USER_COLUMNS}"
    );
    let user = sqlx::query_as::<_, DbUser>(&sql)
        .bind(user_id)
        .bind(active)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub async fn set_primary_school(pool: &PgPool, user_id: &str, school_id: Option<Uuid>) -> Result<()> {
    sqlx::query("UPDATE users SET school_id = $2, updated_at = now() WHERE id = $1")
        .bind(user_id)
        .bind(school_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------- School assignments ----------

pub async fn list_assignments_for_user(pool: &PgPool, user_id: &str) -> Result<Vec<DbAssignment>> {
    let rows = sqlx::query_as::<_, DbAssignment>(
        r#"
        SELECT id, user_id, school_id, roles, academic_year, is_active, created_at
        FROM user_school_assignments
        WHERE user_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn find_assignment(pool: &PgPool, id: Uuid) -> Result<Option<DbAssignment>> {
    let row = sqlx::query_as::<_, DbAssignment>(
        r#"
        SELECT id, user_id, school_id, roles, academic_year, is_active, created_at
        FROM user_school_assignments
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn set_assignment_roles(pool: &PgPool, id: Uuid, roles: &RoleSet) -> Result<Option<DbAssignment>> {
    let row = sqlx::query_as::<_, DbAssignment>(
        r#"
        UPDATE user_school_assignments SET roles = $2
        WHERE id = $1
        RETURNING id, user_id, school_id, roles, academic_year, is_active, created_at
        "#,
    )
    .bind(id)
    .bind(roles.to_strings())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Re-assigning the same user to the same school and year reactivates the row
/// and replaces its roles.
pub async fn upsert_assignment(
    pool: &PgPool,
    user_id: &str,
    school_id: Uuid,
    roles: &RoleSet,
    academic_year: &str,
) -> Result<DbAssignment> {
    let row = sqlx::query_as::<_, DbAssignment>(
        r#"
        INSERT INTO user_school_assignments (id, user_id, school_id, roles, academic_year)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (user_id, school_id, academic_year) DO UPDATE
        SET roles = EXCLUDED.roles,
            is_active = true
        RETURNING id, user_id, school_id, roles, academic_year, is_active, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(school_id)
    .bind(roles.to_strings())
    .bind(academic_year)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn delete_assignment(pool: &PgPool, id: Uuid) -> Result<bool> {
    let res = sqlx::query("DELETE FROM user_school_assignments WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

// ---------- Schools ----------

const SCHOOL_COLUMNS: &str = r#"
    id,
    name,
    address,
    phone,
    email,
    principal_name,
    is_active,
    created_at,
    updated_at
"#;

pub async fn list_schools(pool: &PgPool, school: Option<Uuid>) -> Result<Vec<DbSchool>> {
    let sql = format!(
        "SELECT {SCHOOL_COLUMNS} FROM schools WHERE ($1::uuid IS NULL OR id = $1) ORDER BY name"
    );
    let rows = sqlx::query_as::<_, DbSchool>(&sql)
        .bind(school)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn find_school(pool: &PgPool, id: Uuid) -> Result<Option<DbSchool>> {
    let sql = format!("SELECT {SCHOOL_COLUMNS} FROM schools WHERE id = $1");
    let row = sqlx::query_as::<_, DbSchool>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn create_school(pool: &PgPool, name: &str, fields: &SchoolFields) -> Result<DbSchool> {
    let sql = format!(
        r#"
        INSERT INTO schools (id, name, address, phone, email, principal_name, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, true))
        RETURNING {SCHOOL_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbSchool>(&sql)
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(&fields.address)
        .bind(&fields.phone)
        .bind(&fields.email)
        .bind(&fields.principal_name)
        .bind(fields.is_active)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn update_school(pool: &PgPool, id: Uuid, fields: &SchoolFields) -> Result<Option<DbSchool>> {
    let sql = format!(
        r#"
        UPDATE schools
        SET name = COALESCE($2, name),
            address = COALESCE($3, address),
            phone = COALESCE($4, phone),
            email = COALESCE($5, email),
            principal_name = COALESCE($6, principal_name),
            is_active = COALESCE($7, is_active),
            updated_at = now()
        WHERE id = $1
        RETURNING {SCHOOL_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, DbSchool>(&sql)
        .bind(id)
        .bind(&fields.name)
        .bind(&fields.address)
        .bind(&fields.phone)
        .bind(&fields.email)
        .bind(&fields.principal_name)
        .bind(fields.is_active)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn deactivate_school(pool: &PgPool, id: Uuid) -> Result<Option<DbSchool>> {
    update_school(
        pool,
        id,
        &SchoolFields {
            is_active: Some(false),
            ..SchoolFields::default()
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(first: Option<&str>, last: Option<&str>, email: Option<&str>) -> DbUser {
        DbUser {
            id: "sso:42".to_string(),
            email: email.map(str::to_string),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            profile_image_url: None,
            roles: vec!["teacher".to_string(), "bogus".to_string()],
            is_active: true,
            school_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        assert_eq!(user(Some("Ada"), Some("Lovelace"), None).display_name(), "Ada Lovelace");
        assert_eq!(user(Some("Ada"), None, None).display_name(), "Ada");
        assert_eq!(user(None, None, Some("ada@school.org")).display_name(), "ada@school.org");
        assert_eq!(user(None, None, None).display_name(), "sso:42");
    }

    #[test]
    fn test_role_set_ignores_unknown_strings() {
        let roles = user(None, None, None).role_set();
        assert_eq!(roles.to_strings(), vec!["teacher"]);
    }

    #[test]
    fn test_user_serializes_camel_case() {
        let json = serde_json::to_value(user(Some("Ada"), None, None)).unwrap();
        assert_eq!(json["firstName"], "Ada");
        assert_eq!(json["isActive"], true);
        assert!(json.get("schoolId").is_some());
    }
}
