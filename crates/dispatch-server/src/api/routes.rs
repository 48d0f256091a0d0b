//! REST handlers for the delivery dispatch surface (spec §6).
//!
//! `update_status` runs the pipeline step synchronously and returns the
//! updated order, per the endpoint's explicit contract; `assign_drone`
//! enqueues its pipeline step and answers 202 since drone selection and
//! route optimization can take longer than a request round trip should
//! block for.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{http::StatusCode, Json, Router};
use chrono::Utc;
use dispatch_core::geo::GeoPoint;
use dispatch_core::{
    DeliveryOrder, Drone, DroneStatus, GeoPoint3, Notification, Package, UserRole, Zone, ZoneSeverity, ZoneType,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::error::{ServerError, ServerResult};
use crate::pipeline;
use crate::state::AppState;
use crate::task_queue::TaskQueueHandle;

const DEFAULT_NOTIFICATION_LIMIT: i64 = 50;
const ZONE_QUERY_BUFFER_DEG: f64 = 5.0;

pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/login", axum::routing::post(login))
        .route("/api/drones", axum::routing::post(register_drone).get(list_drones))
        .route("/api/drones/:serial", axum::routing::get(get_drone))
        .route("/api/deliveries/orders", axum::routing::post(create_order).get(list_orders))
        .route("/api/deliveries/orders/:id", axum::routing::get(get_order))
        .route("/api/deliveries/orders/:id/assign_drone", axum::routing::post(assign_drone))
        .route("/api/deliveries/orders/:id/update_status", axum::routing::post(update_status))
        .route("/api/routes/routes/:id", axum::routing::get(get_route))
        .route("/api/zones", axum::routing::post(create_zone).get(list_zones))
        .route("/api/zones/:id", axum::routing::delete(deactivate_zone))
        .route("/api/notifications", axum::routing::get(list_notifications))
        .route("/api/notifications/:id/read", axum::routing::post(mark_notification_read))
}

// ---- auth --------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identity: String,
    pub role: Option<UserRole>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub role: UserRole,
}

/// Issues a token pair for `identity`. A first-seen identity is registered
/// with `role` (defaulting to `Customer`); a known identity keeps its
/// existing role regardless of what the request asked for.
pub async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginRequest>) -> ServerResult<Json<LoginResponse>> {
    let requested_role = body.role.unwrap_or(UserRole::Customer);
    let role = match state.auth.role_for(&body.identity) {
        Some(existing) => existing,
        None => state
            .auth
            .upsert_identity(&body.identity, requested_role, Some(UserRole::Admin))
            .unwrap_or(requested_role),
    };
    let (access_token, refresh_token) = state.auth.issue_tokens(&body.identity, role);
    Ok(Json(LoginResponse { access_token, refresh_token, role }))
}

// ---- drones -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterDroneRequest {
    pub serial: String,
    pub max_payload_kg: f64,
    pub max_speed_kmh: f64,
    pub max_altitude_m: f64,
    pub max_range_km: f64,
    pub battery_capacity_mah: u32,
}

pub async fn register_drone(State(state): State<Arc<AppState>>, auth: AuthUser, Json(body): Json<RegisterDroneRequest>) -> ServerResult<Json<Drone>> {
    auth.require_admin_or_manager()
        .map_err(|_| ServerError::Core(dispatch_core::CoreError::Conflict("only admins or managers can register drones".into())))?;

    let drone = Drone {
        serial: body.serial,
        max_payload_kg: body.max_payload_kg,
        max_speed_kmh: body.max_speed_kmh,
        max_altitude_m: body.max_altitude_m,
        max_range_km: body.max_range_km,
        battery_capacity_mah: body.battery_capacity_mah,
        status: DroneStatus::Idle,
        battery_level: 100,
        current_position: None,
        last_heartbeat: None,
        is_active: true,
    };

    if let Some(db) = &state.db {
        crate::persistence::drones::upsert_drone(db.pool(), &drone).await.map_err(ServerError::Database)?;
    }
    state.drones.insert(drone.serial.clone(), drone.clone());
    Ok(Json(drone))
}

pub async fn list_drones(State(state): State<Arc<AppState>>) -> Json<Vec<Drone>> {
    Json(state.drones.iter().map(|e| e.value().clone()).collect())
}

pub async fn get_drone(State(state): State<Arc<AppState>>, Path(serial): Path<String>) -> ServerResult<Json<Drone>> {
    state.drones.get(&serial).map(|d| Json(d.clone())).ok_or_else(|| ServerError::NotFound(serial))
}

// ---- delivery orders -----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: String,
    pub pickup: GeoPoint3,
    pub delivery: GeoPoint3,
    pub package: Package,
    pub priority: Option<i32>,
    pub notes: Option<String>,
}

pub async fn create_order(State(state): State<Arc<AppState>>, Json(body): Json<CreateOrderRequest>) -> ServerResult<(StatusCode, Json<DeliveryOrder>)> {
    let order = DeliveryOrder {
        id: Uuid::new_v4().to_string(),
        customer_id: body.customer_id,
        pickup: body.pickup,
        delivery: body.delivery,
        package: body.package,
        drone_serial: None,
        status: dispatch_core::OrderStatus::Pending,
        requested_at: Utc::now(),
        assigned_at: None,
        picked_up_at: None,
        delivered_at: None,
        estimated_eta: None,
        estimated_duration_minutes: None,
        total_cost: None,
        priority: body.priority.unwrap_or(0),
        notes: body.notes,
    };

    if let Some(db) = &state.db {
        crate::persistence::orders::insert_order(db.pool(), &order).await.map_err(ServerError::Database)?;
    }
    state.orders.insert(order.id.clone(), order.clone());
    state.broadcast_delivery_update(&order);
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn list_orders(State(state): State<Arc<AppState>>) -> Json<Vec<DeliveryOrder>> {
    Json(state.orders.iter().map(|e| e.value().clone()).collect())
}

pub async fn get_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ServerResult<Json<DeliveryOrder>> {
    state.orders.get(&id).map(|o| Json(o.clone())).ok_or_else(|| ServerError::NotFound(id))
}

#[derive(Debug, Deserialize, Default)]
pub struct AssignDroneRequest {
    pub drone_id: Option<String>,
}

/// Enqueues the assignment step and returns 202; the client follows the
/// order over WebSocket or by polling `get_order` for the result.
pub async fn assign_drone(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(body): Json<AssignDroneRequest>) -> ServerResult<StatusCode> {
    if !state.orders.contains_key(&id) {
        return Err(ServerError::NotFound(id));
    }
    enqueue_assign_drone(&state.task_queue, &id, body.drone_id).await;
    Ok(StatusCode::ACCEPTED)
}

async fn enqueue_assign_drone(queue: &TaskQueueHandle, order_id: &str, drone_serial: Option<String>) {
    queue.enqueue(pipeline::TASK_ASSIGN_DRONE, serde_json::json!({ "order_id": order_id, "drone_serial": drone_serial })).await;
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: dispatch_core::OrderStatus,
    pub changed_by: Option<String>,
    pub notes: Option<String>,
}

/// Runs synchronously and returns the updated order, unlike `assign_drone`.
pub async fn update_status(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(body): Json<UpdateStatusRequest>) -> ServerResult<Json<DeliveryOrder>> {
    pipeline::update_status(&state, &id, body.status, body.changed_by, body.notes).await?;
    state.orders.get(&id).map(|o| Json(o.clone())).ok_or_else(|| ServerError::NotFound(id))
}

// ---- routes --------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub order_id: String,
    pub metrics: dispatch_core::RouteMetrics,
    pub confidence: f64,
    pub avoids_no_fly: bool,
    pub avoids_weather: bool,
    /// GeoJSON `LineString` Feature over the waypoint path, for map clients.
    pub geojson: serde_json::Value,
}

pub async fn get_route(State(state): State<Arc<AppState>>, Path(order_id): Path<String>) -> ServerResult<Json<RouteResponse>> {
    let route = state.routes.get(&order_id).ok_or_else(|| ServerError::NotFound(order_id.clone()))?;
    let coordinates: Vec<Vec<f64>> = route.path.iter().map(|w| vec![w.position.lng, w.position.lat, w.position.alt_m]).collect();
    let geojson = serde_json::json!({
        "type": "Feature",
        "geometry": { "type": "LineString", "coordinates": coordinates },
        "properties": { "order_id": order_id },
    });
    Ok(Json(RouteResponse {
        order_id,
        metrics: route.metrics.clone(),
        confidence: route.confidence,
        avoids_no_fly: route.avoids_no_fly,
        avoids_weather: route.avoids_weather,
        geojson,
    }))
}

// ---- telemetry ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    pub drone_serial: String,
    pub timestamp: Option<chrono::DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude_m: Option<f64>,
    pub heading_deg: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub battery_level: u8,
    pub temperature_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub gps_fix_quality: Option<f64>,
    pub is_in_flight: Option<bool>,
}

/// Routes to [`crate::telemetry::heartbeat_only`] when latitude/longitude are
/// absent (spec §8's null-position boundary case), otherwise to the full
/// position-carrying [`crate::telemetry::ingest`].
pub async fn ingest_telemetry(State(state): State<Arc<AppState>>, Json(body): Json<TelemetryRequest>) -> ServerResult<StatusCode> {
    let timestamp = body.timestamp.unwrap_or_else(Utc::now);
    match (body.latitude, body.longitude) {
        (Some(lat), Some(lng)) => {
            let data = dispatch_core::TelemetryData {
                drone_serial: body.drone_serial.clone(),
                timestamp,
                position: GeoPoint3::new(lat, lng, body.altitude_m.unwrap_or(0.0)),
                heading_deg: body.heading_deg.unwrap_or(0.0),
                speed_kmh: body.speed_kmh.unwrap_or(0.0),
                battery_level: body.battery_level,
                temperature_c: body.temperature_c,
                wind_speed_kmh: body.wind_speed_kmh,
                gps_fix_quality: body.gps_fix_quality,
            };
            crate::telemetry::ingest(&state, &body.drone_serial, data, body.is_in_flight.unwrap_or(false)).await?;
        }
        _ => {
            crate::telemetry::heartbeat_only(&state, &body.drone_serial, body.battery_level, timestamp).await?;
        }
    }
    Ok(StatusCode::ACCEPTED)
}

// ---- zones -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateZoneRequest {
    pub name: String,
    pub zone_type: ZoneType,
    pub severity: ZoneSeverity,
    pub boundary: dispatch_core::geo::Polygon,
    pub altitude_min_m: f64,
    pub altitude_max_m: Option<f64>,
    pub valid_from: Option<chrono::DateTime<Utc>>,
    pub valid_until: Option<chrono::DateTime<Utc>>,
    pub reason: Option<String>,
}

pub async fn create_zone(State(state): State<Arc<AppState>>, auth: AuthUser, Json(body): Json<CreateZoneRequest>) -> ServerResult<(StatusCode, Json<Zone>)> {
    auth.require_admin_or_manager()
        .map_err(|_| ServerError::Core(dispatch_core::CoreError::Conflict("only admins or managers can declare zones".into())))?;

    let zone = Zone {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        zone_type: body.zone_type,
        severity: body.severity,
        boundary: body.boundary,
        altitude_min_m: body.altitude_min_m,
        altitude_max_m: body.altitude_max_m,
        valid_from: body.valid_from,
        valid_until: body.valid_until,
        is_active: true,
        reason: body.reason,
    };

    if let Some(db) = &state.db {
        crate::persistence::zones::insert_zone(db.pool(), &zone).await.map_err(ServerError::Database)?;
    }
    state.zones.insert(zone.clone());
    Ok((StatusCode::CREATED, Json(zone)))
}

#[derive(Debug, Deserialize)]
pub struct ZoneQuery {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

pub async fn list_zones(State(state): State<Arc<AppState>>, query: Option<Query<ZoneQuery>>) -> Json<Vec<Zone>> {
    let now = Utc::now();
    let zones = match query {
        Some(Query(q)) => state.zones.active_zones_in_bbox(GeoPoint::new(q.min_lat, q.min_lng), GeoPoint::new(q.max_lat, q.max_lng), now),
        None => {
            let world_min = GeoPoint::new(-90.0 - ZONE_QUERY_BUFFER_DEG, -180.0 - ZONE_QUERY_BUFFER_DEG);
            let world_max = GeoPoint::new(90.0 + ZONE_QUERY_BUFFER_DEG, 180.0 + ZONE_QUERY_BUFFER_DEG);
            state.zones.active_zones_in_bbox(world_min, world_max, now)
        }
    };
    Json(zones)
}

pub async fn deactivate_zone(State(state): State<Arc<AppState>>, auth: AuthUser, Path(id): Path<String>) -> ServerResult<StatusCode> {
    auth.require_admin_or_manager()
        .map_err(|_| ServerError::Core(dispatch_core::CoreError::Conflict("only admins or managers can deactivate zones".into())))?;

    if !state.zones.deactivate(&id) {
        return Err(ServerError::NotFound(id));
    }
    if let Some(db) = &state.db {
        crate::persistence::zones::deactivate_zone(db.pool(), &id).await.map_err(ServerError::Database)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- notifications ---------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    pub user_id: String,
    pub limit: Option<i64>,
}

pub async fn list_notifications(State(state): State<Arc<AppState>>, Query(query): Query<NotificationQuery>) -> ServerResult<Json<Vec<Notification>>> {
    let Some(db) = &state.db else { return Ok(Json(Vec::new())) };
    let notifications = crate::persistence::notifications::load_for_user(db.pool(), &query.user_id, query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT))
        .await
        .map_err(ServerError::Database)?;
    Ok(Json(notifications))
}

pub async fn mark_notification_read(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ServerResult<StatusCode> {
    let Some(db) = &state.db else { return Ok(StatusCode::NO_CONTENT) };
    crate::persistence::notifications::mark_read(db.pool(), &id).await.map_err(ServerError::Database)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- admin -------------------------------------------------------------

/// Clears all in-memory state and the backing database. Gated by the admin
/// token middleware, not JWT roles, so it works even before any identity
/// has been registered with the auth oracle.
pub async fn admin_reset(State(state): State<Arc<AppState>>) -> ServerResult<impl IntoResponse> {
    state.drones.clear();
    state.orders.clear();
    state.routes.clear();
    state.drone_streams.clear();

    if let Some(db) = &state.db {
        crate::persistence::db::clear_all(db.pool()).await.map_err(ServerError::Database)?;
    }
    Ok(StatusCode::NO_CONTENT)
}
