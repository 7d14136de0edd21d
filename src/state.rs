use crate::config::Config;
use crate::crypto::PiiCipher;
use crate::middleware::RateLimiter;
use crate::services::oauth::OAuthService;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub cipher: Arc<PiiCipher>,
    pub oauth: Arc<OAuthService>,
    pub login_limiter: RateLimiter,
}

pub type SharedState = Arc<AppState>;
