//! Drone persistence operations.

use anyhow::Result;
use dispatch_core::{Drone, DroneStatus, GeoPoint3};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

fn status_to_str(status: DroneStatus) -> &'static str {
    match status {
        DroneStatus::Idle => "idle",
        DroneStatus::Charging => "charging",
        DroneStatus::Assigned => "assigned",
        DroneStatus::Delivering => "delivering",
        DroneStatus::Returning => "returning",
        DroneStatus::Maintenance => "maintenance",
        DroneStatus::Offline => "offline",
    }
}

fn str_to_status(value: &str) -> DroneStatus {
    match value {
        "charging" => DroneStatus::Charging,
        "assigned" => DroneStatus::Assigned,
        "delivering" => DroneStatus::Delivering,
        "returning" => DroneStatus::Returning,
        "maintenance" => DroneStatus::Maintenance,
        "offline" => DroneStatus::Offline,
        _ => DroneStatus::Idle,
    }
}

pub async fn upsert_drone(pool: &SqlitePool, drone: &Drone) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO drones (serial, max_payload_kg, max_speed_kmh, max_altitude_m, max_range_km,
            battery_capacity_mah, status, battery_level, current_lat, current_lng, current_alt_m,
            last_heartbeat, is_active)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(serial) DO UPDATE SET
            max_payload_kg = ?2, max_speed_kmh = ?3, max_altitude_m = ?4, max_range_km = ?5,
            battery_capacity_mah = ?6, status = ?7, battery_level = ?8,
            current_lat = ?9, current_lng = ?10, current_alt_m = ?11,
            last_heartbeat = ?12, is_active = ?13
        "#,
    )
    .bind(&drone.serial)
    .bind(drone.max_payload_kg)
    .bind(drone.max_speed_kmh)
    .bind(drone.max_altitude_m)
    .bind(drone.max_range_km)
    .bind(drone.battery_capacity_mah)
    .bind(status_to_str(drone.status))
    .bind(drone.battery_level as i64)
    .bind(drone.current_position.map(|p| p.lat))
    .bind(drone.current_position.map(|p| p.lng))
    .bind(drone.current_position.map(|p| p.alt_m))
    .bind(drone.last_heartbeat.map(|t| t.to_rfc3339()))
    .bind(drone.is_active as i64)
    .execute(pool)
    .await?;

    Ok(())
}

/// Lightweight telemetry-only update, used by the coalescing persistence
/// loop so a burst of position/battery updates doesn't pay the cost of a
/// full-row upsert for fields that never change after registration.
pub async fn update_drone_telemetry_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    serial: &str,
    status: DroneStatus,
    battery_level: u8,
    position: Option<GeoPoint3>,
    last_heartbeat: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE drones SET status = ?2, battery_level = ?3, current_lat = ?4, current_lng = ?5, \
         current_alt_m = ?6, last_heartbeat = ?7 WHERE serial = ?1",
    )
    .bind(serial)
    .bind(status_to_str(status))
    .bind(battery_level as i64)
    .bind(position.map(|p| p.lat))
    .bind(position.map(|p| p.lng))
    .bind(position.map(|p| p.alt_m))
    .bind(last_heartbeat.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn load_all_drones(pool: &SqlitePool) -> Result<Vec<Drone>> {
    let rows = sqlx::query(
        "SELECT serial, max_payload_kg, max_speed_kmh, max_altitude_m, max_range_km, \
         battery_capacity_mah, status, battery_level, current_lat, current_lng, current_alt_m, \
         last_heartbeat, is_active FROM drones",
    )
    .fetch_all(pool)
    .await?;

    let mut drones = Vec::with_capacity(rows.len());
    for row in rows {
        let lat: Option<f64> = row.try_get("current_lat")?;
        let lng: Option<f64> = row.try_get("current_lng")?;
        let alt: Option<f64> = row.try_get("current_alt_m")?;
        let current_position = match (lat, lng, alt) {
            (Some(lat), Some(lng), Some(alt)) => Some(GeoPoint3::new(lat, lng, alt)),
            _ => None,
        };
        let last_heartbeat: Option<String> = row.try_get("last_heartbeat")?;
        let last_heartbeat = last_heartbeat.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)));
        let status: String = row.try_get("status")?;

        drones.push(Drone {
            serial: row.try_get("serial")?,
            max_payload_kg: row.try_get("max_payload_kg")?,
            max_speed_kmh: row.try_get("max_speed_kmh")?,
            max_altitude_m: row.try_get("max_altitude_m")?,
            max_range_km: row.try_get("max_range_km")?,
            battery_capacity_mah: row.try_get::<i64, _>("battery_capacity_mah")? as u32,
            status: str_to_status(&status),
            battery_level: row.try_get::<i64, _>("battery_level")? as u8,
            current_position,
            last_heartbeat,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
        });
    }

    Ok(drones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_drone, test_db};

    #[tokio::test]
    async fn upsert_then_load_round_trips_a_drone() {
        let db = test_db().await;
        let drone = sample_drone("d1");
        upsert_drone(db.pool(), &drone).await.unwrap();

        let loaded = load_all_drones(db.pool()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].serial, "d1");
        assert_eq!(loaded[0].current_position, drone.current_position);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_conflicting_serial() {
        let db = test_db().await;
        let mut drone = sample_drone("d1");
        upsert_drone(db.pool(), &drone).await.unwrap();

        drone.battery_level = 10;
        drone.status = DroneStatus::Charging;
        upsert_drone(db.pool(), &drone).await.unwrap();

        let loaded = load_all_drones(db.pool()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].battery_level, 10);
        assert_eq!(loaded[0].status, DroneStatus::Charging);
    }

    #[tokio::test]
    async fn telemetry_tx_update_leaves_other_fields_untouched() {
        let db = test_db().await;
        let drone = sample_drone("d1");
        upsert_drone(db.pool(), &drone).await.unwrap();

        let new_position = GeoPoint3::new(1.0, 2.0, 3.0);
        let now = Utc::now();
        let mut tx = db.pool().begin().await.unwrap();
        update_drone_telemetry_tx(&mut tx, "d1", DroneStatus::Delivering, 55, Some(new_position), now).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = load_all_drones(db.pool()).await.unwrap();
        assert_eq!(loaded[0].battery_level, 55);
        assert_eq!(loaded[0].status, DroneStatus::Delivering);
        assert_eq!(loaded[0].current_position, Some(new_position));
        assert_eq!(loaded[0].max_payload_kg, drone.max_payload_kg);
    }
}
