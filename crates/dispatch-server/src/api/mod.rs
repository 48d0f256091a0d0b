//! REST + WebSocket API surface for the dispatch server (spec §6).
//!
//! The router is split into three pieces that share `AppState` but carry
//! different middleware: the public surface, the rate-limited telemetry
//! ingest path, and the admin-token-gated operator routes. All three get a
//! request-id span so a single log line ties a request to its handlers.

pub mod auth;
mod request_id;
mod routes;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{middleware, Router};

use crate::api::auth::{AdminToken, RateLimiter};
use crate::config::Config;
use crate::state::AppState;

const RATE_LIMIT_TRACKED_IPS: usize = 10_000;
const RATE_LIMIT_ENTRY_TTL: Duration = Duration::from_secs(300);

pub fn routes(config: &Config) -> Router<Arc<AppState>> {
    let rate_limiter = RateLimiter::new(config.rate_limit_rps, config.rate_limit_enabled, config.trust_proxy, RATE_LIMIT_TRACKED_IPS, RATE_LIMIT_ENTRY_TTL);
    let admin_token = AdminToken(Arc::new(config.admin_token.clone()));

    let telemetry_routes = Router::new()
        .route("/api/telemetry/data", axum::routing::post(routes::ingest_telemetry))
        .layer(middleware::from_fn_with_state(rate_limiter, auth::rate_limit));

    let admin_routes = Router::new()
        .route("/api/admin/reset", axum::routing::post(routes::admin_reset))
        .layer(middleware::from_fn_with_state(admin_token, auth::require_admin));

    routes::public_routes()
        .merge(telemetry_routes)
        .merge(admin_routes)
        .route("/ws/tracking/", get(ws::ws_handler))
        .layer(middleware::from_fn(request_id::ensure_request_id))
}
