//! HTTP surface integration test: drives the real axum `Router` with
//! `tower::ServiceExt::oneshot` instead of calling handlers directly, so
//! routing, extractors, and middleware are exercised the way a real request
//! would hit them.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use dispatch_server::config::{Config, Environment};
use dispatch_server::state::AppState;
use dispatch_server::task_queue::TaskQueue;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        server_port: 0,
        database_path: ":memory:".to_string(),
        database_max_connections: 1,
        redis_url: None,
        secret_key: "test-secret".to_string(),
        admin_token: "test-admin".to_string(),
        allowed_hosts: Vec::new(),
        allowed_origins: Vec::new(),
        retry_count: 3,
        retry_delay_s: 60,
        worker_concurrency: 2,
        rate_limit_enabled: false,
        rate_limit_rps: 50,
        trust_proxy: false,
        optimizer: dispatch_core::OptimizerConfig::default(),
        environment: Environment::Development,
    }
}

fn build_app() -> axum::Router {
    let config = test_config();
    let (_queue, handle, _rx) = TaskQueue::new(2, 3, Duration::from_millis(10));
    let state = Arc::new(AppState::new(config.clone(), None, handle));
    dispatch_server::api::routes(&config).with_state(state)
}

async fn send(app: &axum::Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let body = match body {
        Some(v) => Body::from(serde_json::to_vec(&v).unwrap()),
        None => Body::empty(),
    };
    let request = builder.body(body).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, value)
}

#[tokio::test]
async fn create_order_then_reject_illegal_status_transition() {
    let app = build_app();

    let (status, created) = send(
        &app,
        "POST",
        "/api/deliveries/orders",
        None,
        Some(json!({
            "customer_id": "cust-1",
            "pickup": {"lat": 12.97, "lng": 77.59, "alt_m": 100.0},
            "delivery": {"lat": 12.99, "lng": 77.61, "alt_m": 100.0},
            "package": {
                "name": "box", "description": null, "package_type": "other",
                "weight_kg": 1.5, "dimensions": null, "is_fragile": false,
                "is_urgent": false, "requires_temperature_control": false,
                "temperature_range_c": null
            },
            "priority": null,
            "notes": null
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let order_id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");

    let (status, _body) = send(
        &app,
        "POST",
        &format!("/api/deliveries/orders/{order_id}/update_status"),
        None,
        Some(json!({ "status": "delivered", "changed_by": null, "notes": null })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, fetched) = send(&app, "GET", &format!("/api/deliveries/orders/{order_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "pending");
}

#[tokio::test]
async fn get_unknown_order_is_404() {
    let app = build_app();
    let (status, _body) = send(&app, "GET", "/api/deliveries/orders/does-not-exist", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_drone_requires_authentication() {
    let app = build_app();
    let (status, _body) = send(
        &app,
        "POST",
        "/api/drones",
        None,
        Some(json!({
            "serial": "d1", "max_payload_kg": 5.0, "max_speed_kmh": 60.0,
            "max_altitude_m": 400.0, "max_range_km": 20.0, "battery_capacity_mah": 5000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_can_login_and_register_a_drone() {
    let app = build_app();

    let (status, tokens) = send(&app, "POST", "/api/auth/login", None, Some(json!({ "identity": "admin", "role": null }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tokens["role"], "admin");
    let access_token = tokens["access_token"].as_str().unwrap();

    let (status, drone) = send(
        &app,
        "POST",
        "/api/drones",
        Some(access_token),
        Some(json!({
            "serial": "d1", "max_payload_kg": 5.0, "max_speed_kmh": 60.0,
            "max_altitude_m": 400.0, "max_range_km": 20.0, "battery_capacity_mah": 5000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(drone["serial"], "d1");

    let (status, drones) = send(&app, "GET", "/api/drones", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(drones.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn assign_drone_on_unknown_order_is_404() {
    let app = build_app();
    let (status, _body) = send(&app, "POST", "/api/deliveries/orders/ghost/assign_drone", None, Some(json!({ "drone_id": null }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn assign_drone_on_a_known_order_is_accepted() {
    let app = build_app();
    let (_status, created) = send(
        &app,
        "POST",
        "/api/deliveries/orders",
        None,
        Some(json!({
            "customer_id": "cust-1",
            "pickup": {"lat": 12.97, "lng": 77.59, "alt_m": 100.0},
            "delivery": {"lat": 12.99, "lng": 77.61, "alt_m": 100.0},
            "package": {
                "name": "box", "description": null, "package_type": "other",
                "weight_kg": 1.5, "dimensions": null, "is_fragile": false,
                "is_urgent": false, "requires_temperature_control": false,
                "temperature_range_c": null
            },
            "priority": null,
            "notes": null
        })),
    )
    .await;
    let order_id = created["id"].as_str().unwrap().to_string();

    let (status, _body) = send(&app, "POST", &format!("/api/deliveries/orders/{order_id}/assign_drone"), None, Some(json!({ "drone_id": null }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
