//! In-memory sliding-window limiter for the login endpoints.

use crate::error::ApiError;
use crate::state::SharedState;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            hits: Arc::new(Mutex::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut hits = self.hits.lock().await;
        let history = hits.entry(key.to_string()).or_default();

        while let Some(oldest) = history.front() {
            if now.duration_since(*oldest) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() < self.max_requests {
            history.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drops keys whose whole history has aged out.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        hits.retain(|_, history| {
            history.retain(|t| now.duration_since(*t) < self.window);
            !history.is_empty()
        });
        tracing::debug!("Rate limiter sweep: {} active keys", hits.len());
    }
}

/// The peer address, or the hop our own proxy appended to `X-Forwarded-For`
/// when one is configured. Earlier hops are client-supplied and ignored.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    let forwarded = trust_proxy
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    forwarded
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn limit_logins(
    State(state): State<SharedState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(
        request.headers(),
        peer.map(|ConnectInfo(addr)| addr),
        state.config.trust_proxy,
    );

    if !state.login_limiter.check(&key).await {
        tracing::warn!("Login rate limit exceeded for {}", key);
        return ApiError::TooManyRequests.into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocks_after_limit() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.check("10.0.0.1").await);
        assert!(limiter.check("10.0.0.1").await);
        assert!(limiter.check("10.0.0.1").await);
        assert!(!limiter.check("10.0.0.1").await);

        assert!(limiter.check("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check_at("k", start).await);
        assert!(!limiter.check_at("k", start + Duration::from_secs(5)).await);
        assert!(limiter.check_at("k", start + Duration::from_secs(11)).await);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_keys() {
        let limiter = RateLimiter::new(5, Duration::from_millis(50));
        limiter.check("a").await;
        limiter.check("b").await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        limiter.sweep().await;

        assert!(limiter.hits.lock().await.is_empty());
    }

    #[test]
    fn test_client_key_ignores_forwarded_header_by_default() {
        let peer: SocketAddr = "192.168.1.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(peer), false), "192.168.1.9");

        headers.insert("x-forwarded-for", "203.0.113.7".parse().unwrap());
        assert_eq!(client_key(&headers, Some(peer), false), "192.168.1.9");
        assert_eq!(client_key(&headers, None, false), "unknown");
    }

    #[test]
    fn test_client_key_behind_proxy_takes_last_hop() {
        let peer: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        // The client made up the first hop; the proxy appended the second.
        headers.insert("x-forwarded-for", "1.2.3.4, 203.0.113.7".parse().unwrap());
        assert_eq!(client_key(&headers, Some(peer), true), "203.0.113.7");

        assert_eq!(client_key(&HeaderMap::new(), Some(peer), true), "10.0.0.2");
    }
}
