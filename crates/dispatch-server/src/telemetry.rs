//! Telemetry ingest & fan-out (spec §4.8). The HTTP handler calls
//! [`ingest`] directly: the in-memory drone/status-stream upsert happens
//! synchronously under a per-drone lock (so concurrent posts for the same
//! drone can never interleave), then a durable persistence write is
//! enqueued onto the task queue without blocking the response. If the queue
//! is saturated, the write runs inline instead of being dropped.

use std::sync::Arc;

use chrono::Utc;
use dispatch_core::{ConnectionQuality, DroneStatusStream, TelemetryData};

use crate::error::{ServerError, ServerResult};
use crate::pipeline;
use crate::state::{AppState, GroupKey, ServerMessage};
use crate::task_queue::{Task, TaskError, TaskOutcome};

pub const TASK_KIND: &str = "persist_telemetry";
const STALE_HEARTBEAT_SECS: i64 = 30;
const LOW_BATTERY_THRESHOLD: u8 = 15;

fn connection_quality(previous: Option<&DroneStatusStream>, now: chrono::DateTime<Utc>) -> ConnectionQuality {
    match previous {
        Some(p) => {
            let gap = (now - p.last_heartbeat).num_seconds();
            if gap <= STALE_HEARTBEAT_SECS {
                ConnectionQuality::Good
            } else if gap <= STALE_HEARTBEAT_SECS * 4 {
                ConnectionQuality::Degraded
            } else {
                ConnectionQuality::Lost
            }
        }
        None => ConnectionQuality::Good,
    }
}

/// Steps 1-5 of the spec's telemetry ingest: validate the drone is known,
/// upsert position/battery/heartbeat under the per-drone lock, refresh the
/// status stream, broadcast, and durably persist. `is_in_flight` mirrors the
/// spec's `status = in_flight` update — this model has no literal
/// `in_flight` variant, so an in-flight report is reflected as `Delivering`
/// (the closest existing status meaning "airborne, under a mission").
pub async fn ingest(state: &Arc<AppState>, drone_serial: &str, data: TelemetryData, is_in_flight: bool) -> ServerResult<()> {
    if !state.drones.contains_key(drone_serial) {
        return Err(ServerError::NotFound(drone_serial.to_string()));
    }

    let lock = state.drone_lock(drone_serial);
    let _guard = lock.lock().await;

    let now = data.timestamp;
    let mut drone_snapshot = None;
    if let Some(mut drone) = state.drones.get_mut(drone_serial) {
        drone.current_position = Some(data.position);
        drone.battery_level = data.battery_level;
        drone.last_heartbeat = Some(now);
        if is_in_flight {
            drone.status = dispatch_core::DroneStatus::Delivering;
        }
        drone_snapshot = Some(drone.clone());
    }
    let Some(drone) = drone_snapshot else {
        return Err(ServerError::NotFound(drone_serial.to_string()));
    };

    let previous_stream = state.drone_streams.get(drone_serial).map(|s| s.clone());
    let quality = connection_quality(previous_stream.as_ref(), now);
    let current_mission = previous_stream.as_ref().and_then(|s| s.current_mission.clone()).or_else(|| {
        state.orders.iter().find(|o| o.drone_serial.as_deref() == Some(drone_serial) && !matches!(o.status, dispatch_core::OrderStatus::Delivered | dispatch_core::OrderStatus::Failed | dispatch_core::OrderStatus::Cancelled)).map(|o| o.id.clone())
    });
    let stream = DroneStatusStream {
        drone_serial: drone_serial.to_string(),
        is_online: true,
        last_heartbeat: now,
        connection_quality: quality,
        current_mission: current_mission.clone(),
    };
    state.drone_streams.insert(drone_serial.to_string(), stream.clone());

    state.broadcast_drone_update(&drone, &stream);
    state.publish(GroupKey::Drone(drone_serial.to_string()), ServerMessage::Telemetry { drone_serial: drone_serial.to_string(), data: data.clone() });

    let payload = serde_json::to_value(&data).expect("TelemetryData always serializes");
    if !state.task_queue.try_enqueue(TASK_KIND, payload) {
        tracing::warn!(drone_serial, "telemetry task queue saturated, persisting inline");
        if let Some(db) = &state.db {
            let _ = crate::persistence::telemetry::insert_telemetry(db.pool(), &data).await;
            let mut tx = db.pool().begin().await.map_err(ServerError::Database)?;
            crate::persistence::drones::update_drone_telemetry_tx(&mut tx, drone_serial, drone.status, drone.battery_level, drone.current_position, now)
                .await
                .map_err(ServerError::Database)?;
            tx.commit().await.map_err(ServerError::Database)?;
        }
    }

    if let Some(order_id) = &current_mission {
        pipeline::maybe_refine_to_delivering(state, order_id, data.position.horizontal()).await?;
    }

    if drone.battery_level <= LOW_BATTERY_THRESHOLD {
        if let Some(order_id) = &current_mission {
            if let Some(order) = state.orders.get(order_id) {
                let customer_id = order.customer_id.clone();
                drop(order);
                crate::notifications::notify_drone_low_battery(state, &customer_id, drone_serial, drone.battery_level).await;
            }
        }
    }

    Ok(())
}

/// Telemetry with a null position (spec §8 boundary: "does not update
/// `current_position` but still updates `last_heartbeat`"). Skips the
/// position write entirely rather than routing through [`ingest`], which
/// always carries a position on its [`TelemetryData`].
pub async fn heartbeat_only(state: &Arc<AppState>, drone_serial: &str, battery_level: u8, now: chrono::DateTime<Utc>) -> ServerResult<()> {
    if !state.drones.contains_key(drone_serial) {
        return Err(ServerError::NotFound(drone_serial.to_string()));
    }

    let lock = state.drone_lock(drone_serial);
    let _guard = lock.lock().await;

    let mut drone_snapshot = None;
    if let Some(mut drone) = state.drones.get_mut(drone_serial) {
        drone.battery_level = battery_level;
        drone.last_heartbeat = Some(now);
        drone_snapshot = Some(drone.clone());
    }
    let Some(drone) = drone_snapshot else {
        return Err(ServerError::NotFound(drone_serial.to_string()));
    };

    let previous_stream = state.drone_streams.get(drone_serial).map(|s| s.clone());
    let quality = connection_quality(previous_stream.as_ref(), now);
    let current_mission = previous_stream.as_ref().and_then(|s| s.current_mission.clone());
    let stream = DroneStatusStream {
        drone_serial: drone_serial.to_string(),
        is_online: true,
        last_heartbeat: now,
        connection_quality: quality,
        current_mission,
    };
    state.drone_streams.insert(drone_serial.to_string(), stream.clone());
    state.broadcast_drone_update(&drone, &stream);
    Ok(())
}

/// Task-queue executor for [`TASK_KIND`]: the durable write companion to
/// the synchronous in-memory upsert `ingest` already performed.
pub async fn run_persist_task(state: &Arc<AppState>, task: Task) -> TaskOutcome {
    let data: TelemetryData = serde_json::from_value(task.payload).map_err(|err| TaskError { message: format!("malformed telemetry payload: {err}"), retriable: false })?;

    let Some(db) = &state.db else { return Ok(()) };
    crate::persistence::telemetry::insert_telemetry(db.pool(), &data)
        .await
        .map_err(|err| TaskError { message: err.to_string(), retriable: true })?;

    if let Some(drone) = state.drones.get(&data.drone_serial) {
        let status = drone.status;
        let battery = drone.battery_level;
        let position = drone.current_position;
        drop(drone);
        let mut tx = db.pool().begin().await.map_err(|err| TaskError { message: err.to_string(), retriable: true })?;
        crate::persistence::drones::update_drone_telemetry_tx(&mut tx, &data.drone_serial, status, battery, position, data.timestamp)
            .await
            .map_err(|err| TaskError { message: err.to_string(), retriable: true })?;
        tx.commit().await.map_err(|err| TaskError { message: err.to_string(), retriable: true })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_degrades_with_heartbeat_gap() {
        let now = Utc::now();
        let previous = DroneStatusStream {
            drone_serial: "d1".into(),
            is_online: true,
            last_heartbeat: now - chrono::Duration::seconds(200),
            connection_quality: ConnectionQuality::Good,
            current_mission: None,
        };
        assert_eq!(connection_quality(Some(&previous), now), ConnectionQuality::Lost);
    }

    #[test]
    fn quality_good_with_no_history() {
        assert_eq!(connection_quality(None, Utc::now()), ConnectionQuality::Good);
    }

    fn sample_telemetry(serial: &str, position: dispatch_core::geo::GeoPoint3) -> TelemetryData {
        TelemetryData {
            drone_serial: serial.to_string(),
            timestamp: Utc::now(),
            position,
            heading_deg: 90.0,
            speed_kmh: 40.0,
            battery_level: 75,
            temperature_c: None,
            wind_speed_kmh: None,
            gps_fix_quality: None,
        }
    }

    #[tokio::test]
    async fn ingest_updates_position_battery_and_heartbeat() {
        let state = crate::test_support::test_state();
        state.drones.insert("d1".to_string(), crate::test_support::sample_drone("d1"));

        let position = dispatch_core::geo::GeoPoint3::new(10.0, 20.0, 150.0);
        ingest(&state, "d1", sample_telemetry("d1", position), false).await.unwrap();

        let drone = state.drones.get("d1").unwrap();
        assert_eq!(drone.current_position, Some(position));
        assert_eq!(drone.battery_level, 75);
        assert!(drone.last_heartbeat.is_some());
        assert!(state.drone_streams.contains_key("d1"));
    }

    #[tokio::test]
    async fn ingest_rejects_an_unknown_drone() {
        let state = crate::test_support::test_state();
        let position = dispatch_core::geo::GeoPoint3::new(10.0, 20.0, 150.0);
        let result = ingest(&state, "ghost", sample_telemetry("ghost", position), false).await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn heartbeat_only_updates_battery_and_heartbeat_but_not_position() {
        let state = crate::test_support::test_state();
        let drone = crate::test_support::sample_drone("d1");
        let original_position = drone.current_position;
        state.drones.insert("d1".to_string(), drone);

        let now = Utc::now();
        heartbeat_only(&state, "d1", 42, now).await.unwrap();

        let drone = state.drones.get("d1").unwrap();
        assert_eq!(drone.battery_level, 42);
        assert_eq!(drone.last_heartbeat, Some(now));
        assert_eq!(drone.current_position, original_position);
    }
}
