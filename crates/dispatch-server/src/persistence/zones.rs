//! Zone persistence. The boundary polygon and altitude band are stored as
//! JSON; the in-memory `ZoneStore` (dispatch_core::zones) is the query path
//! used at runtime, this module only backs it with durable storage.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dispatch_core::{Zone, ZoneSeverity, ZoneType};
use sqlx::{Row, SqlitePool};

fn type_to_str(t: ZoneType) -> &'static str {
    match t {
        ZoneType::Airport => "airport",
        ZoneType::Military => "military",
        ZoneType::Government => "government",
        ZoneType::Private => "private",
        ZoneType::Weather => "weather",
        ZoneType::Temporary => "temporary",
        ZoneType::Operational => "operational",
    }
}

fn str_to_type(s: &str) -> ZoneType {
    match s {
        "military" => ZoneType::Military,
        "government" => ZoneType::Government,
        "private" => ZoneType::Private,
        "weather" => ZoneType::Weather,
        "temporary" => ZoneType::Temporary,
        "operational" => ZoneType::Operational,
        _ => ZoneType::Airport,
    }
}

fn severity_to_str(s: ZoneSeverity) -> &'static str {
    match s {
        ZoneSeverity::Red => "red",
        ZoneSeverity::Yellow => "yellow",
    }
}

fn str_to_severity(s: &str) -> ZoneSeverity {
    match s {
        "yellow" => ZoneSeverity::Yellow,
        _ => ZoneSeverity::Red,
    }
}

pub async fn insert_zone(pool: &SqlitePool, zone: &Zone) -> Result<()> {
    sqlx::query(
        "INSERT INTO zones (id, name, zone_type, severity, boundary_json, altitude_min_m, altitude_max_m, \
         valid_from, valid_until, is_active, reason) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(&zone.id)
    .bind(&zone.name)
    .bind(type_to_str(zone.zone_type))
    .bind(severity_to_str(zone.severity))
    .bind(serde_json::to_string(&zone.boundary)?)
    .bind(zone.altitude_min_m)
    .bind(zone.altitude_max_m)
    .bind(zone.valid_from.map(|t| t.to_rfc3339()))
    .bind(zone.valid_until.map(|t| t.to_rfc3339()))
    .bind(zone.is_active as i64)
    .bind(&zone.reason)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn deactivate_zone(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE zones SET is_active = 0 WHERE id = ?1").bind(id).execute(pool).await?;
    Ok(())
}

fn parse_dt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)))
}

pub async fn load_all_zones(pool: &SqlitePool) -> Result<Vec<Zone>> {
    let rows = sqlx::query(
        "SELECT id, name, zone_type, severity, boundary_json, altitude_min_m, altitude_max_m, \
         valid_from, valid_until, is_active, reason FROM zones",
    )
    .fetch_all(pool)
    .await?;

    let mut zones = Vec::with_capacity(rows.len());
    for row in rows {
        let zone_type: String = row.try_get("zone_type")?;
        let severity: String = row.try_get("severity")?;
        let boundary_json: String = row.try_get("boundary_json")?;
        zones.push(Zone {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            zone_type: str_to_type(&zone_type),
            severity: str_to_severity(&severity),
            boundary: serde_json::from_str(&boundary_json)?,
            altitude_min_m: row.try_get("altitude_min_m")?,
            altitude_max_m: row.try_get("altitude_max_m")?,
            valid_from: parse_dt(row.try_get("valid_from")?),
            valid_until: parse_dt(row.try_get("valid_until")?),
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            reason: row.try_get("reason")?,
        });
    }
    Ok(zones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use dispatch_core::geo::{GeoPoint, Polygon};

    fn sample_zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            name: "Test restricted area".to_string(),
            zone_type: ZoneType::Operational,
            severity: ZoneSeverity::Yellow,
            boundary: Polygon::new(vec![
                GeoPoint::new(12.90, 77.50),
                GeoPoint::new(12.91, 77.50),
                GeoPoint::new(12.91, 77.51),
                GeoPoint::new(12.90, 77.51),
            ]),
            altitude_min_m: 0.0,
            altitude_max_m: Some(150.0),
            valid_from: None,
            valid_until: None,
            is_active: true,
            reason: Some("drill".to_string()),
        }
    }

    #[tokio::test]
    async fn insert_then_load_round_trips_a_zone() {
        let db = test_db().await;
        insert_zone(db.pool(), &sample_zone("z1")).await.unwrap();

        let loaded = load_all_zones(db.pool()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].zone_type, ZoneType::Operational);
        assert_eq!(loaded[0].boundary.points.len(), 4);
    }

    #[tokio::test]
    async fn deactivate_zone_persists_inactive_flag() {
        let db = test_db().await;
        insert_zone(db.pool(), &sample_zone("z1")).await.unwrap();
        deactivate_zone(db.pool(), "z1").await.unwrap();

        let loaded = load_all_zones(db.pool()).await.unwrap();
        assert!(!loaded[0].is_active);
    }

    #[test]
    fn zone_type_round_trip_is_stable_for_every_variant() {
        for t in [
            ZoneType::Airport,
            ZoneType::Military,
            ZoneType::Government,
            ZoneType::Private,
            ZoneType::Weather,
            ZoneType::Temporary,
            ZoneType::Operational,
        ] {
            assert_eq!(str_to_type(type_to_str(t)), t);
        }
    }
}
