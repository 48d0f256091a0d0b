//! Dispatch Server - always-on backend for drone delivery dispatch.

mod api;
mod auth_oracle;
mod config;
mod error;
mod notifications;
mod persistence;
mod pipeline;
mod providers;
mod state;
mod task_queue;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::{extract::State, routing::get, Json};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::state::AppState;
use crate::task_queue::{Executor, ExhaustedHandler, TaskQueue};

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ok: bool,
    db_ok: bool,
    db_latency_ms: Option<u128>,
    queued_tasks: u64,
    error: Option<String>,
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (db_ok, db_latency_ms, db_error) = match &state.db {
        Some(db) => {
            let started_at = Instant::now();
            match tokio::time::timeout(Duration::from_millis(750), sqlx::query("SELECT 1").execute(db.pool())).await {
                Ok(Ok(_)) => (true, Some(started_at.elapsed().as_millis()), None),
                Ok(Err(err)) => (false, Some(started_at.elapsed().as_millis()), Some(err.to_string())),
                Err(_) => (false, Some(started_at.elapsed().as_millis()), Some("database ping timed out".to_string())),
            }
        }
        None => (true, None, None),
    };

    let status = if db_ok { axum::http::StatusCode::OK } else { axum::http::StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(ReadyResponse { ok: db_ok, db_ok, db_latency_ms, queued_tasks: state.task_queue.queued_count(), error: db_error }),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("dispatch_server=debug".parse()?);
    let log_format = std::env::var("DISPATCH_LOG_FORMAT").unwrap_or_default();
    if log_format.trim().eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    tracing::info!("Starting dispatch server...");

    let config = Config::from_env();
    let port = config.server_port;

    tracing::info!("Initializing database: {}", config.database_path);
    let db = persistence::init_database(&config.database_path, config.database_max_connections).await?;
    tracing::info!("Database initialized successfully");

    let (queue, queue_handle, ready_rx) = TaskQueue::new(config.worker_concurrency, config.retry_count, Duration::from_secs(config.retry_delay_s));
    let worker_concurrency = config.worker_concurrency;

    let state = Arc::new(AppState::new(config.clone(), Some(db), queue_handle));
    state.load_from_database().await?;

    tracing::info!("Rate limiting: {} ({} rps)", config.rate_limit_enabled, config.rate_limit_rps);
    tracing::info!("CORS origins: {:?}", config.allowed_origins);

    let cancellation = queue.cancellation();
    {
        let state = state.clone();
        let executor: Executor = Arc::new(move |task, cancel| {
            let state = state.clone();
            Box::pin(async move { pipeline::run_task(&state, task, cancel).await })
        });
        let state = state.clone();
        let on_exhausted: ExhaustedHandler = Arc::new(move |task, err| {
            let state = state.clone();
            Box::pin(async move { pipeline::on_task_exhausted(&state, task, err).await })
        });
        tokio::spawn(queue.run(ready_rx, worker_concurrency, executor, on_exhausted));
    }

    let app = api::routes(&config).route("/health", get(|| async { "OK" })).route("/ready", get(ready_handler)).with_state(state);

    let app = if config.allowed_origins.is_empty() {
        tracing::warn!("No CORS origins configured - CORS disabled (same-origin only)");
        app
    } else {
        let origins: Vec<HeaderValue> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        app.layer(CorsLayer::new().allow_origin(origins).allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE]).allow_headers(Any))
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(cancellation))
        .await?;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal(cancellation: tokio_util::sync::CancellationToken) {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        Err(err) => {
            tracing::warn!("Failed to install SIGTERM handler (CTRL-C only): {}", err);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    tracing::info!("Shutdown signal received");
    cancellation.cancel();
}

#[cfg(not(unix))]
async fn shutdown_signal(cancellation: tokio_util::sync::CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
    cancellation.cancel();
}
