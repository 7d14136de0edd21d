pub mod auth;
pub mod classes;
pub mod grades;
pub mod schools;
pub mod session;
pub mod students;
pub mod templates;
pub mod users;

use crate::state::SharedState;
use axum::{routing::get, Router};

async fn health() -> &'static str {
    "OK"
}

pub fn routes(state: SharedState) -> Router {
    let api = Router::new()
        .merge(auth::router(state.clone()))
        .merge(schools::router(state.clone()))
        .merge(users::router(state.clone()))
        .merge(classes::router(state.clone()))
        .merge(students::router(state.clone()))
        .merge(grades::router(state.clone()))
        .merge(templates::router(state));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::PiiCipher;
    use crate::middleware::RateLimiter;
    use crate::services::oauth::OAuthService;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use base64::{engine::general_purpose, Engine as _};
    use sqlx::postgres::PgPoolOptions;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    // The pool never connects; every request here is answered before a query runs.
    fn test_state(with_google: bool, login_limit: usize) -> SharedState {
        let key = general_purpose::STANDARD.encode([3u8; 32]);
        let mut env = HashMap::new();
        env.insert("DATABASE_URL", "postgres://localhost/gradewise_test".to_string());
        env.insert("SESSION_KEY", key.clone());
        env.insert("APP_ENC_KEY", key);
        if with_google {
            env.insert("GOOGLE_CLIENT_ID", "client-123".to_string());
            env.insert("GOOGLE_CLIENT_SECRET", "secret".to_string());
        }
        let config = Config::from_lookup(|k| env.get(k).cloned()).unwrap();

        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();

        Arc::new(AppState {
            pool,
            cipher: Arc::new(PiiCipher::new(&config.enc_key).unwrap()),
            oauth: Arc::new(OAuthService::new(&config).unwrap()),
            login_limiter: RateLimiter::new(login_limit, Duration::from_secs(60)),
            config: Arc::new(config),
        })
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let resp = routes(test_state(false, 10)).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_aspects_are_public() {
        let resp = routes(test_state(false, 10)).oneshot(get("/api/aspects")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["aspects"].as_array().unwrap().len(), crate::domain::grades::ASPECTS.len());
        assert_eq!(body["maxGrade"], 6);
    }

    #[tokio::test]
    async fn test_protected_routes_need_a_session() {
        let app = routes(test_state(false, 10));
        for uri in ["/api/students", "/api/schools", "/api/auth/user", "/api/report-templates"] {
            let resp = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }

        let forged = Request::builder()
            .uri("/api/classes")
            .header(header::AUTHORIZATION, "Bearer not.a-token")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(forged).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["message"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_not_found() {
        let app = routes(test_state(false, 10));
        let resp = app.clone().oneshot(get("/api/login/google")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app.oneshot(get("/api/login/facebook")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_redirects_with_state_cookie() {
        let resp = routes(test_state(true, 10))
            .oneshot(get("/api/login/google"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);

        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://accounts.google.com/"));
        assert!(location.contains("client_id=client-123"));

        let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("oauth_state=google:"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn test_callback_rejects_missing_state() {
        let resp = routes(test_state(true, 10))
            .oneshot(get("/api/callback/google?code=abc&state=xyz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_callback_rejects_mismatched_state() {
        let req = Request::builder()
            .uri("/api/callback/google?code=abc&state=xyz")
            .header(header::COOKIE, "oauth_state=google:other")
            .body(Body::empty())
            .unwrap();
        let resp = routes(test_state(true, 10)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_login_is_rate_limited() {
        let app = routes(test_state(true, 2));
        for _ in 0..2 {
            let resp = app.clone().oneshot(get("/api/login/google")).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        }
        let resp = app.oneshot(get("/api/login/google")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_header_does_not_reset_limit() {
        let app = routes(test_state(true, 2));
        let mut statuses = Vec::new();
        for hop in 1..=6 {
            let req = Request::builder()
                .uri("/api/login/google")
                .header("x-forwarded-for", format!("198.51.100.{hop}"))
                .body(Body::empty())
                .unwrap();
            statuses.push(app.clone().oneshot(req).await.unwrap().status());
        }
        assert_eq!(&statuses[..2], &[StatusCode::SEE_OTHER, StatusCode::SEE_OTHER]);
        assert!(statuses[2..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test]
    async fn test_logout_clears_cookie() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/logout")
            .body(Body::empty())
            .unwrap();
        let resp = routes(test_state(false, 10)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("session=;"));
        assert!(cookie.contains("Max-Age=0"));
    }
}
