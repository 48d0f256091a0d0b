//! Append-only telemetry persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dispatch_core::{GeoPoint3, TelemetryData};
use sqlx::{Row, SqlitePool};

pub async fn insert_telemetry(pool: &SqlitePool, data: &TelemetryData) -> Result<()> {
    sqlx::query(
        "INSERT INTO telemetry (drone_serial, timestamp, lat, lng, alt_m, heading_deg, speed_kmh, \
         battery_level, temperature_c, wind_speed_kmh, gps_fix_quality) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(&data.drone_serial)
    .bind(data.timestamp.to_rfc3339())
    .bind(data.position.lat)
    .bind(data.position.lng)
    .bind(data.position.alt_m)
    .bind(data.heading_deg)
    .bind(data.speed_kmh)
    .bind(data.battery_level as i64)
    .bind(data.temperature_c)
    .bind(data.wind_speed_kmh)
    .bind(data.gps_fix_quality)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent `limit` telemetry rows for a drone, newest first.
pub async fn load_recent(pool: &SqlitePool, drone_serial: &str, limit: i64) -> Result<Vec<TelemetryData>> {
    let rows = sqlx::query(
        "SELECT drone_serial, timestamp, lat, lng, alt_m, heading_deg, speed_kmh, battery_level, \
         temperature_c, wind_speed_kmh, gps_fix_quality FROM telemetry \
         WHERE drone_serial = ?1 ORDER BY timestamp DESC LIMIT ?2",
    )
    .bind(drone_serial)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let timestamp: String = row.try_get("timestamp")?;
        out.push(TelemetryData {
            drone_serial: row.try_get("drone_serial")?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
            position: GeoPoint3::new(row.try_get("lat")?, row.try_get("lng")?, row.try_get("alt_m")?),
            heading_deg: row.try_get("heading_deg")?,
            speed_kmh: row.try_get("speed_kmh")?,
            battery_level: row.try_get::<i64, _>("battery_level")? as u8,
            temperature_c: row.try_get("temperature_c")?,
            wind_speed_kmh: row.try_get("wind_speed_kmh")?,
            gps_fix_quality: row.try_get("gps_fix_quality")?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    fn sample(serial: &str, battery: u8) -> TelemetryData {
        TelemetryData {
            drone_serial: serial.to_string(),
            timestamp: Utc::now(),
            position: GeoPoint3::new(12.97, 77.59, 120.0),
            heading_deg: 45.0,
            speed_kmh: 35.0,
            battery_level: battery,
            temperature_c: Some(22.0),
            wind_speed_kmh: Some(8.0),
            gps_fix_quality: Some(0.95),
        }
    }

    #[tokio::test]
    async fn insert_then_load_recent_returns_newest_first() {
        let db = test_db().await;
        insert_telemetry(db.pool(), &sample("d1", 90)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        insert_telemetry(db.pool(), &sample("d1", 88)).await.unwrap();

        let recent = load_recent(db.pool(), "d1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].battery_level, 88);
    }

    #[tokio::test]
    async fn load_recent_respects_the_limit_and_drone_filter() {
        let db = test_db().await;
        insert_telemetry(db.pool(), &sample("d1", 90)).await.unwrap();
        insert_telemetry(db.pool(), &sample("d2", 70)).await.unwrap();

        let recent = load_recent(db.pool(), "d1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].drone_serial, "d1");
    }
}
