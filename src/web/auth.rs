use crate::db::{self, DbSchool, DbUser};
use crate::domain::roles::RoleSet;
use crate::domain::scope::Scope;
use crate::error::{ApiError, ApiResult};
use crate::middleware::rate_limit;
use crate::services::oauth::{self, Provider};
use crate::state::SharedState;
use crate::web::session::{self, Actor, SESSION_COOKIE, STATE_COOKIE};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    #[serde(flatten)]
    pub user: DbUser,
    pub display_name: String,
    pub role_set: RoleSet,
    pub scope: Scope,
    pub effective_school: Option<DbSchool>,
}

pub fn router(state: SharedState) -> Router {
    let login = Router::new()
        .route("/login/:provider", get(login))
        .route("/callback/:provider", get(callback))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_logins,
        ));

    Router::new()
        .merge(login)
        .route("/logout", post(logout))
        .route("/auth/user", get(current_user))
        .with_state(state)
}

fn parse_provider(state: &SharedState, raw: &str) -> ApiResult<Provider> {
    let provider = Provider::try_from(raw).map_err(|_| ApiError::NotFound("Login provider"))?;
    if state.oauth.client(provider).is_none() {
        return Err(ApiError::NotFound("Login provider"));
    }
    Ok(provider)
}

fn cookie_header(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ApiError::Internal(e.into()))
}

async fn login(State(state): State<SharedState>, Path(provider): Path<String>) -> ApiResult<Response> {
    let provider = parse_provider(&state, &provider)?;
    let nonce = oauth::generate_state();
    let url = state.oauth.authorize_url(provider, &nonce)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        cookie_header(&session::state_cookie(
            &format!("{}:{}", provider.as_str(), nonce),
            state.config.secure_cookies,
        ))?,
    );

    Ok((headers, Redirect::to(url.as_str())).into_response())
}

async fn callback(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Response> {
    let provider = parse_provider(&state, &provider)?;

    if let Some(err) = query.error {
        tracing::warn!("{} login returned error: {}", provider.as_str(), err);
        return Err(ApiError::Unauthorized);
    }

    let expected = session::read_cookie(&headers, STATE_COOKIE).ok_or(ApiError::Unauthorized)?;
    let received = format!(
        "{}:{}",
        provider.as_str(),
        query.state.as_deref().unwrap_or_default()
    );
    if query.state.is_none() || expected != received {
        tracing::warn!("OAuth state mismatch for {}", provider.as_str());
        return Err(ApiError::Unauthorized);
    }

    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("missing authorization code".to_string()))?;

    let token = state.oauth.exchange_code(provider, &code).await.map_err(|e| {
        tracing::warn!("{} code exchange failed: {:#}", provider.as_str(), e);
        ApiError::Unauthorized
    })?;
    let profile = state
        .oauth
        .fetch_profile(provider, &token.access_token)
        .await
        .map_err(|e| {
            tracing::warn!("{} profile fetch failed: {:#}", provider.as_str(), e);
            ApiError::Unauthorized
        })?;

    let bootstrap = profile
        .email
        .as_deref()
        .map(|e| state.config.is_bootstrap_superadmin(e))
        .unwrap_or(false);

    let user = db::upsert_user(&state.pool, &profile, bootstrap).await?;
    if !user.is_active {
        tracing::warn!("Inactive user {} attempted login", user.id);
        return Err(ApiError::Forbidden);
    }

    let token = session::sign_session(&user.id, &state.config.session_key)
        .map_err(|e| ApiError::Internal(e.into()))?;

    let mut out = HeaderMap::new();
    out.append(
        header::SET_COOKIE,
        cookie_header(&session::session_cookie(&token, state.config.secure_cookies))?,
    );
    out.append(
        header::SET_COOKIE,
        cookie_header(&session::expired_cookie(STATE_COOKIE, "/api"))?,
    );

    tracing::info!("User {} logged in via {}", user.id, provider.as_str());

    Ok((out, Redirect::to("/")).into_response())
}

async fn logout() -> ApiResult<impl IntoResponse> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        cookie_header(&session::expired_cookie(SESSION_COOKIE, "/"))?,
    );
    Ok((StatusCode::NO_CONTENT, headers))
}

async fn current_user(actor: Actor, State(state): State<SharedState>) -> ApiResult<Json<CurrentUser>> {
    let effective_school = match actor.scope.school_id() {
        Some(id) => db::find_school(&state.pool, id).await?,
        None => None,
    };

    Ok(Json(CurrentUser {
        display_name: actor.user.display_name(),
        role_set: actor.roles.clone(),
        scope: actor.scope,
        effective_school,
        user: actor.user,
    }))
}
