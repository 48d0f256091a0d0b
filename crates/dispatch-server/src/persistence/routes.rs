//! Route persistence: a route is replaced atomically (old row gone, new row
//! visible) by wrapping the delete+insert in a single transaction, so there
//! is no window where a caller can observe a partially-written route.

use anyhow::Result;
use dispatch_core::Route;
use sqlx::SqlitePool;

pub async fn replace_route(pool: &SqlitePool, route: &Route) -> Result<()> {
    let path_json = serde_json::to_string(&route.path)?;
    let metrics_json = serde_json::to_string(&route.metrics)?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM routes WHERE order_id = ?1").bind(&route.order_id).execute(&mut *tx).await?;
    sqlx::query(
        "INSERT INTO routes (order_id, path_json, metrics_json, confidence, avoids_no_fly, avoids_weather) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&route.order_id)
    .bind(&path_json)
    .bind(&metrics_json)
    .bind(route.confidence)
    .bind(route.avoids_no_fly as i64)
    .bind(route.avoids_weather as i64)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn load_route(pool: &SqlitePool, order_id: &str) -> Result<Option<Route>> {
    let row = sqlx::query_as::<_, (String, String, f64, i64, i64)>(
        "SELECT path_json, metrics_json, confidence, avoids_no_fly, avoids_weather FROM routes WHERE order_id = ?1",
    )
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    let Some((path_json, metrics_json, confidence, avoids_no_fly, avoids_weather)) = row else {
        return Ok(None);
    };

    Ok(Some(Route {
        order_id: order_id.to_string(),
        path: serde_json::from_str(&path_json)?,
        metrics: serde_json::from_str(&metrics_json)?,
        confidence,
        avoids_no_fly: avoids_no_fly != 0,
        avoids_weather: avoids_weather != 0,
    }))
}

pub async fn delete_route(pool: &SqlitePool, order_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM routes WHERE order_id = ?1").bind(order_id).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;
    use dispatch_core::{GeoPoint3, OptimizationMethod, RouteMetrics, RouteWaypoint, WaypointAction};

    fn sample_route(order_id: &str) -> Route {
        Route {
            order_id: order_id.to_string(),
            path: vec![
                RouteWaypoint {
                    sequence: 0,
                    position: GeoPoint3::new(12.97, 77.59, 100.0),
                    action: WaypointAction::Start,
                    reason: None,
                    segment_distance_km: 0.0,
                    estimated_time_minutes: 0.0,
                    wind_factor: 1.0,
                    safety_score: 1.0,
                    estimated_arrival: None,
                },
                RouteWaypoint {
                    sequence: 1,
                    position: GeoPoint3::new(12.99, 77.61, 100.0),
                    action: WaypointAction::End,
                    reason: None,
                    segment_distance_km: 2.9,
                    estimated_time_minutes: 4.0,
                    wind_factor: 1.0,
                    safety_score: 1.0,
                    estimated_arrival: None,
                },
            ],
            metrics: RouteMetrics {
                total_distance_km: 2.9,
                direct_distance_km: 2.9,
                detour_percent: 0.0,
                estimated_duration_minutes: 4.0,
                waypoint_count: 2,
                altitude_changes: 0,
                no_fly_zones_avoided: 0,
                weather_hazards_avoided: 0,
                terrain_clearance_min_m: 70.0,
                avg_segment_length_km: 2.9,
                complexity_score: 0.1,
                optimization_method: OptimizationMethod::Direct,
                computation_time_ms: 1.0,
            },
            confidence: 0.8,
            avoids_no_fly: true,
            avoids_weather: false,
        }
    }

    #[tokio::test]
    async fn replace_then_load_round_trips_a_route() {
        let db = test_db().await;
        let route = sample_route("o1");
        replace_route(db.pool(), &route).await.unwrap();

        let loaded = load_route(db.pool(), "o1").await.unwrap().unwrap();
        assert_eq!(loaded.path.len(), 2);
        assert!((loaded.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn replace_route_overwrites_rather_than_duplicates() {
        let db = test_db().await;
        replace_route(db.pool(), &sample_route("o1")).await.unwrap();
        let mut second = sample_route("o1");
        second.confidence = 0.5;
        replace_route(db.pool(), &second).await.unwrap();

        let loaded = load_route(db.pool(), "o1").await.unwrap().unwrap();
        assert!((loaded.confidence - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn load_route_returns_none_when_missing() {
        let db = test_db().await;
        assert!(load_route(db.pool(), "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_route_removes_the_row() {
        let db = test_db().await;
        replace_route(db.pool(), &sample_route("o1")).await.unwrap();
        delete_route(db.pool(), "o1").await.unwrap();
        assert!(load_route(db.pool(), "o1").await.unwrap().is_none());
    }
}
