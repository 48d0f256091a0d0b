//! Authentication/authorization for the REST surface: a JWT bearer-token
//! extractor backed by [`crate::auth_oracle`], plus the constant-time admin
//! check and per-IP rate limiter kept from the original server shape.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, FromRef, FromRequestParts, Request};
use axum::http::{header, request::Parts, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use dispatch_core::UserRole;

use crate::auth_oracle::Claims;
use crate::state::AppState;

/// Extractor for an authenticated caller. Handlers that need to know who is
/// calling (and with what role) take `AuthUser` as a parameter; axum runs
/// the extraction before the handler body.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[derive(Debug)]
pub enum AuthRejection {
    Missing,
    Invalid,
    WrongTokenType,
    Forbidden,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AuthRejection::Missing => (StatusCode::UNAUTHORIZED, "authorization required"),
            AuthRejection::Invalid => (StatusCode::UNAUTHORIZED, "invalid or expired token"),
            AuthRejection::WrongTokenType => (StatusCode::UNAUTHORIZED, "refresh token used where an access token is required"),
            AuthRejection::Forbidden => (StatusCode::FORBIDDEN, "insufficient role"),
        };
        (status, Json(serde_json::json!({ "error": error }))).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = Arc::<AppState>::from_ref(state);
        let token = bearer_token(parts).ok_or(AuthRejection::Missing)?;
        let claims = state.auth.verify(token).map_err(|_| AuthRejection::Invalid)?;
        if claims.token_type != crate::auth_oracle::TokenType::Access {
            return Err(AuthRejection::WrongTokenType);
        }
        Ok(AuthUser(claims))
    }
}

impl AuthUser {
    pub fn require_role(&self, role: UserRole) -> Result<(), AuthRejection> {
        if self.0.role == role {
            Ok(())
        } else {
            Err(AuthRejection::Forbidden)
        }
    }

    pub fn require_admin_or_manager(&self) -> Result<(), AuthRejection> {
        match self.0.role {
            UserRole::Admin | UserRole::Manager => Ok(()),
            UserRole::Customer => Err(AuthRejection::Forbidden),
        }
    }
}

/// Extractor for an admin token configured out-of-band (`DISPATCH_ADMIN_TOKEN`).
/// Kept alongside JWT auth for operator-only endpoints (e.g. `/admin/reset`)
/// that should work even before any identity has been registered.
#[derive(Clone)]
pub struct AdminToken(pub Arc<String>);

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&left, &right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

/// Middleware that requires a valid admin token in the Authorization header.
///
/// Expected header format: `Authorization: Bearer <admin_token>`
pub async fn require_admin(
    axum::extract::State(admin_token): axum::extract::State<AdminToken>,
    request: Request,
    next: Next,
) -> Response {
    let auth_header = request.headers().get(header::AUTHORIZATION).and_then(|value| value.to_str().ok());

    match auth_header {
        Some(auth) if auth.starts_with("Bearer ") => {
            let token = auth.trim_start_matches("Bearer ");
            if constant_time_eq(token.as_bytes(), admin_token.0.as_bytes()) {
                next.run(request).await
            } else {
                (
                    StatusCode::FORBIDDEN,
                    Json(serde_json::json!({
                        "error": "Invalid admin token",
                        "hint": "Check DISPATCH_ADMIN_TOKEN environment variable"
                    })),
                )
                    .into_response()
            }
        }
        Some(_) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Invalid Authorization header format", "expected": "Bearer <token>" })),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Authorization required", "hint": "Add header: Authorization: Bearer <admin_token>" })),
        )
            .into_response(),
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    window_start_epoch_s: u64,
    window_count: u32,
    last_seen_epoch_s: u64,
}

/// Per-IP sliding-window rate limiter for the telemetry ingest endpoint,
/// the one path drones hit at a frequency worth bounding.
#[derive(Clone)]
pub struct RateLimiter {
    requests: Arc<DashMap<String, RateLimitEntry>>,
    last_cleanup_epoch_s: Arc<AtomicU64>,
    cleanup_interval: Duration,
    entry_ttl: Duration,
    max_tracked_ips: usize,
    max_rps: u32,
    enabled: bool,
    trust_proxy: bool,
}

impl RateLimiter {
    pub fn new(max_rps: u32, enabled: bool, trust_proxy: bool, max_tracked_ips: usize, entry_ttl: Duration) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            last_cleanup_epoch_s: Arc::new(AtomicU64::new(0)),
            cleanup_interval: Duration::from_secs(60),
            entry_ttl,
            max_tracked_ips,
            max_rps,
            enabled,
            trust_proxy,
        }
    }

    pub fn check(&self, ip: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let now_epoch_s = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        self.maybe_cleanup(now_epoch_s);

        if !self.ensure_capacity(ip, now_epoch_s) {
            return false;
        }

        let mut entry = self
            .requests
            .entry(ip.to_string())
            .or_insert(RateLimitEntry { window_start_epoch_s: now_epoch_s, window_count: 0, last_seen_epoch_s: now_epoch_s });

        let state = entry.value_mut();
        if state.window_start_epoch_s != now_epoch_s {
            state.window_start_epoch_s = now_epoch_s;
            state.window_count = 0;
        }
        state.window_count = state.window_count.saturating_add(1);
        state.last_seen_epoch_s = now_epoch_s;

        state.window_count <= self.max_rps
    }

    fn maybe_cleanup(&self, now_epoch_s: u64) {
        if now_epoch_s == 0 {
            return;
        }
        let last_cleanup = self.last_cleanup_epoch_s.load(Ordering::Relaxed);
        if last_cleanup != 0 && now_epoch_s.saturating_sub(last_cleanup) < self.cleanup_interval.as_secs() {
            return;
        }
        if self.last_cleanup_epoch_s.compare_exchange(last_cleanup, now_epoch_s, Ordering::Relaxed, Ordering::Relaxed).is_err() {
            return;
        }
        self.purge_stale_entries(now_epoch_s);
    }

    fn ensure_capacity(&self, ip: &str, now_epoch_s: u64) -> bool {
        if self.max_tracked_ips == 0 {
            return true;
        }
        if self.requests.contains_key(ip) {
            return true;
        }
        if self.requests.len() < self.max_tracked_ips {
            return true;
        }
        self.purge_stale_entries(now_epoch_s);
        if self.requests.contains_key(ip) {
            return true;
        }
        self.requests.len() < self.max_tracked_ips
    }

    fn purge_stale_entries(&self, now_epoch_s: u64) {
        if now_epoch_s == 0 {
            return;
        }
        let ttl = self.entry_ttl.as_secs();
        if ttl == 0 {
            return;
        }
        let stale: Vec<String> =
            self.requests.iter().filter(|entry| now_epoch_s.saturating_sub(entry.value().last_seen_epoch_s) >= ttl).map(|entry| entry.key().clone()).collect();
        for key in stale {
            self.requests.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_tokens() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths_and_content() {
        assert!(!constant_time_eq(b"abc123", b"abc1234"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
    }

    #[test]
    fn rate_limiter_allows_up_to_the_configured_rps() {
        let limiter = RateLimiter::new(3, true, false, 100, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn rate_limiter_tracks_ips_independently() {
        let limiter = RateLimiter::new(1, true, false, 100, Duration::from_secs(60));
        assert!(limiter.check("1.1.1.1"));
        assert!(limiter.check("2.2.2.2"));
        assert!(!limiter.check("1.1.1.1"));
    }

    #[test]
    fn disabled_rate_limiter_always_allows() {
        let limiter = RateLimiter::new(1, false, false, 100, Duration::from_secs(60));
        for _ in 0..10 {
            assert!(limiter.check("1.2.3.4"));
        }
    }
}

/// Rate limiting middleware for the telemetry ingest endpoint.
pub async fn rate_limit(axum::extract::State(limiter): axum::extract::State<RateLimiter>, request: Request, next: Next) -> Response {
    let ip = if limiter.trust_proxy {
        request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or("unknown").trim().to_string())
    } else {
        None
    }
    .or_else(|| request.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip().to_string()))
    .unwrap_or_else(|| "unknown".to_string());

    if limiter.check(&ip) {
        next.run(request).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({ "error": "Rate limit exceeded", "retry_after": "1 second" }))).into_response()
    }
}
