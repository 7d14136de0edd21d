use crate::db::{self, DbUser};
use crate::domain::policy::{self, Action};
use crate::domain::roles::{Role, RoleSet};
use crate::domain::scope::{self, Scope};
use crate::error::ApiError;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "session";
pub const STATE_COOKIE: &str = "oauth_state";
const SESSION_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub user_id: String,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid token format")]
    Invalid,
    #[error("signature mismatch")]
    Signature,
    #[error("expired")]
    Expired,
}

pub fn sign_session(user_id: &str, key: &[u8]) -> Result<String, SessionError> {
    let exp = Utc::now() + Duration::hours(SESSION_HOURS);
    sign_claims(user_id, exp.timestamp(), key)
}

fn sign_claims(user_id: &str, exp: i64, key: &[u8]) -> Result<String, SessionError> {
    let payload = format!("{}|{}", user_id, exp);
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SessionError::Invalid)?;
    mac.update(payload.as_bytes());
    let sig = mac.finalize().into_bytes();
    Ok(format!(
        "{}.{}",
        general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes()),
        general_purpose::URL_SAFE_NO_PAD.encode(sig)
    ))
}

pub fn verify_session(token: &str, key: &[u8]) -> Result<SessionClaims, SessionError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(SessionError::Invalid)?;
    let payload_bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| SessionError::Invalid)?;
    let sig_bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| SessionError::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SessionError::Invalid)?;
    mac.update(&payload_bytes);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| SessionError::Signature)?;

    let payload = String::from_utf8(payload_bytes).map_err(|_| SessionError::Invalid)?;
    // Ids are provider-qualified and never contain '|', but split from the right anyway.
    let (user_id, exp) = payload.rsplit_once('|').ok_or(SessionError::Invalid)?;
    if user_id.is_empty() {
        return Err(SessionError::Invalid);
    }
    let exp: i64 = exp.parse().map_err(|_| SessionError::Invalid)?;
    if Utc::now().timestamp() > exp {
        return Err(SessionError::Expired);
    }
    Ok(SessionClaims {
        user_id: user_id.to_string(),
        exp,
    })
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(prefix.as_str()).map(str::to_string))
}

pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        if let Ok(val) = auth.to_str() {
            if let Some(bearer) = val.strip_prefix("Bearer ") {
                return Some(bearer.trim().to_string());
            }
        }
    }
    read_cookie(headers, SESSION_COOKIE)
}

pub fn session_cookie(token: &str, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{secure_flag}",
        SESSION_HOURS * 3600
    )
}

pub fn state_cookie(value: &str, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!("{STATE_COOKIE}={value}; HttpOnly; SameSite=Lax; Path=/api; Max-Age=600{secure_flag}")
}

pub fn expired_cookie(name: &str, path: &str) -> String {
    format!("{name}=; HttpOnly; SameSite=Lax; Path={path}; Max-Age=0")
}

// ============================================
// Axum extractor for the calling user
// ============================================

/// The authenticated caller with effective scope resolved once. `roles` are the
/// roles that hold at that scope, not necessarily the ones on the user row.
///
/// ```ignore
/// async fn handler(actor: Actor) -> ApiResult<...> {
///     actor.require(Action::ViewStudents)?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Actor {
    pub user: DbUser,
    pub roles: RoleSet,
    pub scope: Scope,
}

impl Actor {
    pub fn new(user: DbUser, assignments: &[db::DbAssignment]) -> Self {
        let access = scope::resolve(&user.role_set(), user.school_id, assignments);
        Self {
            user,
            roles: access.roles,
            scope: access.scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(role)
    }

    pub fn require(&self, action: Action) -> Result<(), ApiError> {
        if policy::allows(action, &self.roles) {
            Ok(())
        } else {
            tracing::warn!("User {} denied {:?}", self.user.id, action);
            Err(ApiError::Forbidden)
        }
    }

    /// Parents without staff roles only see their own children.
    pub fn parent_only(&self) -> bool {
        self.has(Role::Parent) && !self.roles.intersects(&[Role::Superadmin, Role::Admin, Role::Teacher])
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
    crate::state::SharedState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let shared_state = crate::state::SharedState::from_ref(state);

        let token = extract_token(&parts.headers).ok_or(ApiError::Unauthorized)?;

        let claims = verify_session(&token, &shared_state.config.session_key).map_err(|e| {
            tracing::warn!("Session verification failed: {}", e);
            ApiError::Unauthorized
        })?;

        let Some(user) = db::find_user_by_id(&shared_state.pool, &claims.user_id).await? else {
            return Err(ApiError::Unauthorized);
        };

        if !user.is_active {
            return Err(ApiError::Unauthorized);
        }

        let assignments = db::list_assignments_for_user(&shared_state.pool, &user.id).await?;
        Ok(Actor::new(user, &assignments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Utc;

    const KEY: &[u8] = &[9u8; 32];

    #[test]
    fn test_sign_and_verify() {
        let token = sign_session("google:123", KEY).unwrap();
        let claims = verify_session(&token, KEY).unwrap();
        assert_eq!(claims.user_id, "google:123");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let token = sign_session("google:123", KEY).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_payload = general_purpose::URL_SAFE_NO_PAD.encode(b"google:999|99999999999");
        let forged = format!("{forged_payload}.{sig}");
        assert_eq!(verify_session(&forged, KEY), Err(SessionError::Signature));
        assert_eq!(verify_session(&token, &[8u8; 32]), Err(SessionError::Signature));
    }

    #[test]
    fn test_expired_and_malformed() {
        let token = sign_claims("sso:1", Utc::now().timestamp() - 10, KEY).unwrap();
        assert_eq!(verify_session(&token, KEY), Err(SessionError::Expired));
        assert_eq!(verify_session("nodot", KEY), Err(SessionError::Invalid));
        assert_eq!(verify_session("!!.??", KEY), Err(SessionError::Invalid));
    }

    #[test]
    fn test_extract_token_from_cookie_or_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=abc.def"));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz.123"));
        assert_eq!(extract_token(&headers).as_deref(), Some("xyz.123"));

        assert_eq!(extract_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_cookie_flags() {
        assert!(session_cookie("t", true).ends_with("; Secure"));
        assert!(!session_cookie("t", false).contains("Secure"));
        assert!(expired_cookie(SESSION_COOKIE, "/").contains("Max-Age=0"));
        assert!(state_cookie("google:abc", false).contains("Path=/api"));
    }

    fn user_with(roles: &[&str], school: Option<uuid::Uuid>) -> DbUser {
        DbUser {
            id: "google:7".to_string(),
            email: None,
            first_name: None,
            last_name: None,
            profile_image_url: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            is_active: true,
            school_id: school,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn actor_with(roles: &[&str], school: Option<uuid::Uuid>) -> Actor {
        Actor::new(user_with(roles, school), &[])
    }

    fn assignment_at(school: uuid::Uuid, roles: &[&str], age_days: i64) -> db::DbAssignment {
        db::DbAssignment {
            id: uuid::Uuid::new_v4(),
            user_id: "google:7".to_string(),
            school_id: school,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            academic_year: "2024/2025".to_string(),
            is_active: true,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_actor_scope_and_policy() {
        let school = uuid::Uuid::new_v4();
        let teacher = actor_with(&["teacher"], Some(school));
        assert_eq!(teacher.scope, Scope::School(school));
        assert!(teacher.require(Action::UpdateGrades).is_ok());
        assert!(matches!(teacher.require(Action::ManageClasses), Err(ApiError::Forbidden)));

        let parent = actor_with(&["parent"], None);
        assert_eq!(parent.scope, Scope::Nothing);
        assert!(parent.parent_only());

        let parent_teacher = actor_with(&["parent", "teacher"], Some(school));
        assert!(!parent_teacher.parent_only());
    }

    #[test]
    fn test_admin_assignment_elsewhere_grants_nothing_at_home() {
        let home = uuid::Uuid::new_v4();
        let elsewhere = uuid::Uuid::new_v4();
        let user = user_with(&["teacher"], Some(home));
        let assignments = [
            assignment_at(elsewhere, &["admin"], 1),
            assignment_at(home, &["teacher"], 200),
        ];

        let actor = Actor::new(user, &assignments);
        assert_eq!(actor.scope, Scope::School(home));
        assert!(!actor.has(Role::Admin));
        assert!(matches!(actor.require(Action::ManageUsers), Err(ApiError::Forbidden)));
        assert!(matches!(actor.require(Action::ManageClasses), Err(ApiError::Forbidden)));
        assert!(actor.require(Action::UpdateGrades).is_ok());
    }
}
