//! Dispatch pipeline: the three steps from the spec's delivery lifecycle
//! (`assign_drone` → `optimize_route_and_predict_eta` → `update_status`),
//! plus the error-sink behavior that turns exhausted task retries into a
//! `Failed` order with a customer notification.
//!
//! Grounded on the original's `deliveries/tasks.py` / `routes/tasks.py` for
//! field-setting order and notification copy, re-expressed as async Rust
//! functions dispatched through [`crate::task_queue`] instead of Celery
//! tasks. Every step takes the per-order lock for its whole duration so two
//! concurrent triggers for the same order never race.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::eta::FeatureVector;
use dispatch_core::optimizer::Priority;
use dispatch_core::{DeliveryOrder, DroneStatus, NotificationKind, OrderStatus, OrderStatusHistory, Route};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};
use crate::notifications;
use crate::state::AppState;
use crate::task_queue::{Task, TaskError, TaskOutcome};

pub const TASK_ASSIGN_DRONE: &str = "assign_drone";
pub const TASK_OPTIMIZE_ROUTE: &str = "optimize_route_and_predict_eta";
pub const TASK_UPDATE_STATUS: &str = "update_status";

const ORDER_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DELIVERING_RADIUS_KM: f64 = 1.0;
const LOW_BATTERY_THRESHOLD: u8 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderIdPayload {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AssignDronePayload {
    order_id: String,
    /// Caller-requested drone, from the REST body's `{drone_id}`. When
    /// absent, the nearest capable idle drone is selected automatically.
    drone_serial: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateStatusPayload {
    order_id: String,
    status: OrderStatus,
    changed_by: Option<String>,
    notes: Option<String>,
}

async fn with_order_lock<F, Fut, T>(state: &AppState, order_id: &str, f: F) -> ServerResult<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ServerResult<T>>,
{
    let lock = state.order_lock(order_id);
    let _guard = tokio::time::timeout(ORDER_LOCK_TIMEOUT, lock.lock())
        .await
        .map_err(|_| ServerError::LockTimeout(format!("order {order_id}")))?;
    f().await
}

fn drone_capable(drone: &dispatch_core::Drone, order: &DeliveryOrder) -> bool {
    drone.is_active
        && drone.status == DroneStatus::Idle
        && drone.battery_level as f64 >= LOW_BATTERY_THRESHOLD as f64
        && drone.max_payload_kg >= order.package.weight_kg
}

fn select_drone(state: &AppState, order: &DeliveryOrder) -> Option<dispatch_core::Drone> {
    state
        .drones
        .iter()
        .filter(|entry| drone_capable(entry.value(), order))
        .min_by(|a, b| {
            let da = dispatch_core::geo::haversine_km(order.pickup.horizontal(), a.current_position.unwrap_or(order.pickup).horizontal());
            let db = dispatch_core::geo::haversine_km(order.pickup.horizontal(), b.current_position.unwrap_or(order.pickup).horizontal());
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|entry| entry.value().clone())
}

/// Step 1: assigns `requested_drone` if given and capable, otherwise picks
/// the nearest capable idle drone; marks both records assigned, notifies
/// the customer, and enqueues route optimization. Idempotent when the
/// order is already assigned to the same drone; reassigning to a
/// different drone is refused once the order has left `Pending`.
pub async fn assign_drone(state: &Arc<AppState>, order_id: &str, requested_drone: Option<&str>) -> ServerResult<()> {
    with_order_lock(state, order_id, || async {
        let mut order = state.orders.get_mut(order_id).ok_or_else(|| ServerError::NotFound(order_id.to_string()))?;
        if let Some(current) = &order.drone_serial {
            return match requested_drone {
                Some(requested) if requested != current => Err(ServerError::Core(dispatch_core::CoreError::Conflict(format!(
                    "order {order_id} is already assigned to drone {current}"
                )))),
                _ => Ok(()),
            };
        }

        let drone = match requested_drone {
            Some(serial) => {
                let candidate = state.drones.get(serial).ok_or_else(|| ServerError::NotFound(serial.to_string()))?.clone();
                if !drone_capable(&candidate, &order) {
                    return Err(ServerError::Core(dispatch_core::CoreError::Conflict(format!(
                        "drone {serial} is not capable of order {order_id}"
                    ))));
                }
                candidate
            }
            None => select_drone(state, &order).ok_or_else(|| {
                dispatch_core::CoreError::Conflict(format!("no capable drone available for order {order_id}"))
            })?,
        };

        order.drone_serial = Some(drone.serial.clone());
        order.assigned_at = Some(Utc::now());
        if order.status.can_advance_to(OrderStatus::Assigned) {
            order.status = OrderStatus::Assigned;
        }
        let order_snapshot = order.clone();
        drop(order);

        if let Some(mut d) = state.drones.get_mut(&drone.serial) {
            d.status = DroneStatus::Assigned;
        }

        let drone_snapshot = state.drones.get(&drone.serial).expect("just assigned").clone();
        if let Some(db) = &state.db {
            crate::persistence::orders::update_order(db.pool(), &order_snapshot).await.map_err(ServerError::Database)?;
            crate::persistence::drones::upsert_drone(db.pool(), &drone_snapshot).await.map_err(ServerError::Database)?;
        }

        state.broadcast_delivery_update(&order_snapshot);
        let notification = notifications::build(
            &order_snapshot.customer_id,
            NotificationKind::DeliveryAssigned,
            "Drone assigned",
            format!("Drone {} is en route to pick up your package", drone.serial),
            Some(order_snapshot.id.clone()),
            Some("delivery_order"),
        );
        notifications::notify(state, notification).await;

        state.task_queue.enqueue(TASK_OPTIMIZE_ROUTE, serde_json::json!({ "order_id": order_id })).await;
        Ok(())
    })
    .await
}

/// Step 2: runs the route optimizer and ETA predictor, persists the route,
/// stamps the order's ETA/cost fields, and advances it to `InTransit`.
pub async fn optimize_route_and_predict_eta(state: &Arc<AppState>, order_id: &str, cancel: &tokio_util::sync::CancellationToken) -> ServerResult<()> {
    with_order_lock(state, order_id, || async {
        let order = state.orders.get(order_id).ok_or_else(|| ServerError::NotFound(order_id.to_string()))?.clone();
        let drone_serial = order.drone_serial.clone().ok_or_else(|| {
            dispatch_core::CoreError::Conflict(format!("order {order_id} has no assigned drone"))
        })?;
        let drone = state.drones.get(&drone_serial).ok_or_else(|| ServerError::NotFound(drone_serial.clone()))?.clone();

        let priority = if order.package.is_urgent { Priority::Speed } else { Priority::Balanced };
        let weather = state.weather.snapshot(order.pickup.horizontal());

        // Search is CPU-bound; run it on a blocking thread so it never stalls
        // the async executor, and let the task queue's shutdown token cut it
        // short past its iteration/wall-clock caps.
        let state_for_search = Arc::clone(state);
        let cancel_for_search = cancel.clone();
        let pickup = order.pickup;
        let delivery = order.delivery;
        let (path, metrics) = tokio::task::spawn_blocking(move || {
            let is_cancelled = || cancel_for_search.is_cancelled();
            state_for_search.optimizer.optimize_route(
                pickup.horizontal(),
                delivery.horizontal(),
                pickup.alt_m,
                &state_for_search.zones,
                true,
                weather.is_some(),
                priority,
                state_for_search.terrain.as_ref(),
                weather,
                &is_cancelled,
            )
        })
        .await
        .map_err(|e| dispatch_core::CoreError::Fatal(format!("optimizer search thread panicked: {e}")))?;

        let altitudes: Vec<f64> = path.iter().map(|w| w.position.alt_m).collect();
        let altitude_avg_m = altitudes.iter().sum::<f64>() / altitudes.len().max(1) as f64;
        let altitude_variance = {
            let mean = altitude_avg_m;
            altitudes.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / altitudes.len().max(1) as f64
        };
        let now = Utc::now();
        let features = FeatureVector {
            distance_km: metrics.total_distance_km,
            altitude_avg_m,
            altitude_variance,
            route_complexity: metrics.complexity_score,
            wind_speed_kmh: weather.map(|w| w.wind_speed_kmh).unwrap_or(10.0),
            wind_direction_deg: weather.map(|w| w.wind_direction_deg).unwrap_or(0.0),
            payload_weight_kg: order.package.weight_kg,
            battery_level: drone.battery_level,
            time_of_day: now.format("%H").to_string().parse().unwrap_or(12),
            day_of_week: now.format("%u").to_string().parse::<u8>().unwrap_or(1) % 7,
            drone_max_speed_kmh: drone.max_speed_kmh,
            ..FeatureVector::default()
        };
        let prediction = state.eta.predict(&features, now);

        let route = Route {
            order_id: order_id.to_string(),
            path,
            metrics,
            confidence: prediction.confidence,
            avoids_no_fly: true,
            avoids_weather: weather.is_some(),
        };

        if let Some(db) = &state.db {
            crate::persistence::routes::replace_route(db.pool(), &route).await.map_err(ServerError::Database)?;
        }
        state.routes.insert(order_id.to_string(), route);

        let mut order_entry = state.orders.get_mut(order_id).ok_or_else(|| ServerError::NotFound(order_id.to_string()))?;
        order_entry.estimated_eta = Some(prediction.eta_datetime);
        order_entry.estimated_duration_minutes = Some(prediction.eta_minutes);
        order_entry.total_cost = Some(DeliveryOrder::compute_cost(features.distance_km, order_entry.package.weight_kg));
        if order_entry.status.can_advance_to(OrderStatus::InTransit) {
            order_entry.status = OrderStatus::InTransit;
        }
        order_entry.picked_up_at = order_entry.picked_up_at.or(Some(now));
        let order_snapshot = order_entry.clone();
        drop(order_entry);

        if let Some(db) = &state.db {
            crate::persistence::orders::update_order(db.pool(), &order_snapshot).await.map_err(ServerError::Database)?;
        }

        state.broadcast_delivery_update(&order_snapshot);
        let notification = notifications::build(
            &order_snapshot.customer_id,
            NotificationKind::RouteOptimized,
            "Route optimized",
            format!("Estimated delivery in {:.0} minutes", prediction.eta_minutes),
            Some(order_snapshot.id.clone()),
            Some("delivery_order"),
        );
        notifications::notify(state, notification).await;

        Ok(())
    })
    .await
}

/// Step 3: validates the forward transition, stamps timestamps, appends
/// history, persists, and notifies.
pub async fn update_status(
    state: &Arc<AppState>,
    order_id: &str,
    new_status: OrderStatus,
    changed_by: Option<String>,
    notes: Option<String>,
) -> ServerResult<()> {
    with_order_lock(state, order_id, || async {
        let mut order = state.orders.get_mut(order_id).ok_or_else(|| ServerError::NotFound(order_id.to_string()))?;
        if !order.status.can_advance_to(new_status) {
            return Err(ServerError::Core(dispatch_core::CoreError::Conflict(format!(
                "order {order_id} cannot move from {:?} to {:?}",
                order.status, new_status
            ))));
        }

        let now = Utc::now();
        order.status = new_status;
        match new_status {
            OrderStatus::Delivering => order.picked_up_at = order.picked_up_at.or(Some(now)),
            OrderStatus::Delivered => order.delivered_at = Some(now),
            _ => {}
        }
        let order_snapshot = order.clone();
        drop(order);

        let history = OrderStatusHistory { order_id: order_id.to_string(), status: new_status, changed_by: changed_by.clone(), notes: notes.clone(), timestamp: now };

        if let Some(db) = &state.db {
            crate::persistence::orders::update_order(db.pool(), &order_snapshot).await.map_err(ServerError::Database)?;
            crate::persistence::orders::insert_status_history(db.pool(), &history).await.map_err(ServerError::Database)?;
        }

        if new_status == OrderStatus::Delivered || new_status == OrderStatus::Failed || new_status == OrderStatus::Cancelled {
            if let Some(serial) = &order_snapshot.drone_serial {
                if let Some(mut drone) = state.drones.get_mut(serial) {
                    drone.status = DroneStatus::Returning;
                }
            }
        }

        state.broadcast_delivery_update(&order_snapshot);
        if let Some(kind) = notification_kind_for(new_status) {
            let notification = notifications::build(
                &order_snapshot.customer_id,
                kind,
                title_for(new_status),
                message_for(new_status, &order_snapshot),
                Some(order_snapshot.id.clone()),
                Some("delivery_order"),
            );
            notifications::notify(state, notification).await;
        }

        Ok(())
    })
    .await
}

/// Telemetry-driven refinement: `InTransit` becomes `Delivering` once the
/// drone is within [`DELIVERING_RADIUS_KM`] of the destination. Never
/// guessed at dispatch time, per the design note resolving the spec's
/// `in_transit`/`delivering` ambiguity.
pub async fn maybe_refine_to_delivering(state: &Arc<AppState>, order_id: &str, drone_position: dispatch_core::geo::GeoPoint) -> ServerResult<()> {
    let should_refine = {
        let Some(order) = state.orders.get(order_id) else { return Ok(()) };
        order.status == OrderStatus::InTransit
            && dispatch_core::geo::haversine_km(drone_position, order.delivery.horizontal()) <= DELIVERING_RADIUS_KM
    };
    if should_refine {
        update_status(state, order_id, OrderStatus::Delivering, None, Some("within delivery radius".to_string())).await?;
    }
    Ok(())
}

fn notification_kind_for(status: OrderStatus) -> Option<NotificationKind> {
    match status {
        OrderStatus::Delivering => Some(NotificationKind::DeliveryDelivering),
        OrderStatus::Delivered => Some(NotificationKind::DeliveryDelivered),
        OrderStatus::Failed => Some(NotificationKind::DeliveryFailed),
        _ => None,
    }
}

fn title_for(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Delivering => "Almost there",
        OrderStatus::Delivered => "Delivered",
        OrderStatus::Failed => "Delivery failed",
        _ => "Delivery update",
    }
}

fn message_for(status: OrderStatus, order: &DeliveryOrder) -> String {
    match status {
        OrderStatus::Delivering => format!("Drone {} is arriving at your location", order.drone_serial.clone().unwrap_or_default()),
        OrderStatus::Delivered => "Your package has been delivered".to_string(),
        OrderStatus::Failed => format!("Delivery of order {} could not be completed", order.id),
        _ => format!("Order {} status changed", order.id),
    }
}

/// Error sink (spec §7): a task that exhausted its retries never leaves an
/// order silently stuck — it's marked `Failed` with the failure reason in
/// the history row, and the customer is notified.
pub async fn on_task_exhausted(state: &Arc<AppState>, task: Task, err: TaskError) {
    let order_id = match extract_order_id(&task) {
        Some(id) => id,
        None => {
            tracing::error!(task_id = %task.id, kind = %task.kind, "exhausted task has no order_id, cannot run error sink");
            return;
        }
    };

    let lock = state.order_lock(&order_id);
    let _guard = lock.lock().await;
    let Some(mut order) = state.orders.get_mut(&order_id) else { return };
    if matches!(order.status, OrderStatus::Delivered | OrderStatus::Failed | OrderStatus::Cancelled) {
        return;
    }
    order.status = OrderStatus::Failed;
    let snapshot = order.clone();
    drop(order);

    let history = OrderStatusHistory { order_id: order_id.clone(), status: OrderStatus::Failed, changed_by: None, notes: Some(err.message.clone()), timestamp: Utc::now() };
    if let Some(db) = &state.db {
        let _ = crate::persistence::orders::update_order(db.pool(), &snapshot).await;
        let _ = crate::persistence::orders::insert_status_history(db.pool(), &history).await;
    }
    state.broadcast_delivery_update(&snapshot);
    let notification = notifications::build(
        &snapshot.customer_id,
        NotificationKind::DeliveryFailed,
        "Delivery failed",
        format!("Delivery of order {order_id} could not be completed: {}", err.message),
        Some(order_id),
        Some("delivery_order"),
    );
    notifications::notify(state, notification).await;
}

fn extract_order_id(task: &Task) -> Option<String> {
    task.payload.get("order_id").and_then(|v| v.as_str()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_drone, sample_order, test_state};
    use dispatch_core::geo::GeoPoint;

    #[tokio::test]
    async fn assign_drone_picks_nearest_capable_idle_drone_when_unspecified() {
        let state = test_state();
        state.drones.insert("d1".to_string(), sample_drone("d1"));
        state.orders.insert("o1".to_string(), sample_order("o1"));

        assign_drone(&state, "o1", None).await.unwrap();

        let order = state.orders.get("o1").unwrap();
        assert_eq!(order.drone_serial.as_deref(), Some("d1"));
        assert_eq!(order.status, OrderStatus::Assigned);
        assert_eq!(state.drones.get("d1").unwrap().status, DroneStatus::Assigned);
    }

    #[tokio::test]
    async fn assign_drone_is_idempotent_for_the_same_drone() {
        let state = test_state();
        state.drones.insert("d1".to_string(), sample_drone("d1"));
        state.orders.insert("o1".to_string(), sample_order("o1"));

        assign_drone(&state, "o1", Some("d1")).await.unwrap();
        assign_drone(&state, "o1", Some("d1")).await.unwrap();

        let order = state.orders.get("o1").unwrap();
        assert_eq!(order.drone_serial.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn assign_drone_refuses_reassignment_to_a_different_drone() {
        let state = test_state();
        state.drones.insert("d1".to_string(), sample_drone("d1"));
        state.drones.insert("d2".to_string(), sample_drone("d2"));
        state.orders.insert("o1".to_string(), sample_order("o1"));

        assign_drone(&state, "o1", Some("d1")).await.unwrap();
        let result = assign_drone(&state, "o1", Some("d2")).await;

        assert!(matches!(result, Err(ServerError::Core(dispatch_core::CoreError::Conflict(_)))));
        let order = state.orders.get("o1").unwrap();
        assert_eq!(order.drone_serial.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn assign_drone_rejects_a_requested_drone_that_cannot_carry_the_payload() {
        let state = test_state();
        let mut heavy_drone = sample_drone("d1");
        heavy_drone.max_payload_kg = 0.1;
        state.drones.insert("d1".to_string(), heavy_drone);
        state.orders.insert("o1".to_string(), sample_order("o1"));

        let result = assign_drone(&state, "o1", Some("d1")).await;
        assert!(matches!(result, Err(ServerError::Core(dispatch_core::CoreError::Conflict(_)))));
    }

    #[tokio::test]
    async fn assign_drone_accepts_a_requested_drone_at_exactly_the_low_battery_threshold() {
        let state = test_state();
        let mut drone = sample_drone("d1");
        drone.battery_level = LOW_BATTERY_THRESHOLD;
        state.drones.insert("d1".to_string(), drone);
        state.orders.insert("o1".to_string(), sample_order("o1"));

        let result = assign_drone(&state, "o1", Some("d1")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn update_status_rejects_illegal_transitions_without_mutating_state() {
        let state = test_state();
        state.orders.insert("o1".to_string(), sample_order("o1"));

        let result = update_status(&state, "o1", OrderStatus::Delivered, None, None).await;

        assert!(matches!(result, Err(ServerError::Core(dispatch_core::CoreError::Conflict(_)))));
        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn update_status_stamps_delivered_at_on_terminal_delivery() {
        let state = test_state();
        let mut order = sample_order("o1");
        order.status = OrderStatus::Delivering;
        state.orders.insert("o1".to_string(), order);

        update_status(&state, "o1", OrderStatus::Delivered, None, None).await.unwrap();

        let order = state.orders.get("o1").unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert!(order.delivered_at.is_some());
    }

    #[tokio::test]
    async fn maybe_refine_to_delivering_transitions_within_radius() {
        let state = test_state();
        let mut order = sample_order("o1");
        order.status = OrderStatus::InTransit;
        state.orders.insert("o1".to_string(), order.clone());

        let just_outside = GeoPoint { lat: order.delivery.lat + 0.5, lng: order.delivery.lng };
        maybe_refine_to_delivering(&state, "o1", just_outside).await.unwrap();
        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::InTransit);

        maybe_refine_to_delivering(&state, "o1", order.delivery.horizontal()).await.unwrap();
        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::Delivering);
    }

    #[tokio::test]
    async fn maybe_refine_to_delivering_is_a_no_op_outside_in_transit() {
        let state = test_state();
        let order = sample_order("o1");
        let delivery = order.delivery.horizontal();
        state.orders.insert("o1".to_string(), order);

        maybe_refine_to_delivering(&state, "o1", delivery).await.unwrap();
        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn on_task_exhausted_marks_the_order_failed() {
        let state = test_state();
        let mut order = sample_order("o1");
        order.status = OrderStatus::InTransit;
        state.orders.insert("o1".to_string(), order);

        let task = Task { id: "t1".to_string(), kind: TASK_OPTIMIZE_ROUTE.to_string(), payload: serde_json::json!({ "order_id": "o1" }), attempts: 3 };
        on_task_exhausted(&state, task, TaskError { message: "optimizer timed out".to_string(), retriable: true }).await;

        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::Failed);
    }

    #[tokio::test]
    async fn on_task_exhausted_does_not_reopen_a_terminal_order() {
        let state = test_state();
        let mut order = sample_order("o1");
        order.status = OrderStatus::Delivered;
        state.orders.insert("o1".to_string(), order);

        let task = Task { id: "t1".to_string(), kind: TASK_UPDATE_STATUS.to_string(), payload: serde_json::json!({ "order_id": "o1" }), attempts: 3 };
        on_task_exhausted(&state, task, TaskError { message: "boom".to_string(), retriable: false }).await;

        assert_eq!(state.orders.get("o1").unwrap().status, OrderStatus::Delivered);
    }
}

/// Task-queue executor dispatch for the three pipeline task kinds.
pub async fn run_task(state: &Arc<AppState>, task: Task, cancel: tokio_util::sync::CancellationToken) -> TaskOutcome {
    let to_task_error = |e: ServerError| TaskError { retriable: e.is_transient(), message: e.to_string() };

    match task.kind.as_str() {
        TASK_ASSIGN_DRONE => {
            let payload: AssignDronePayload = serde_json::from_value(task.payload.clone()).map_err(|e| TaskError { message: e.to_string(), retriable: false })?;
            assign_drone(state, &payload.order_id, payload.drone_serial.as_deref()).await.map_err(to_task_error)
        }
        TASK_OPTIMIZE_ROUTE => {
            let payload: OrderIdPayload = serde_json::from_value(task.payload.clone()).map_err(|e| TaskError { message: e.to_string(), retriable: false })?;
            optimize_route_and_predict_eta(state, &payload.order_id, &cancel).await.map_err(to_task_error)
        }
        TASK_UPDATE_STATUS => {
            let payload: UpdateStatusPayload = serde_json::from_value(task.payload.clone()).map_err(|e| TaskError { message: e.to_string(), retriable: false })?;
            update_status(state, &payload.order_id, payload.status, payload.changed_by, payload.notes).await.map_err(to_task_error)
        }
        crate::notifications::TASK_KIND => notifications::run_persist_task(state, task).await,
        crate::telemetry::TASK_KIND => crate::telemetry::run_persist_task(state, task).await,
        other => Err(TaskError { message: format!("unknown task kind: {other}"), retriable: false }),
    }
}
