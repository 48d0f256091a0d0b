//! Delivery order + status history persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dispatch_core::{DeliveryOrder, GeoPoint3, OrderStatus, OrderStatusHistory, Package};
use sqlx::{Row, SqlitePool};

fn status_to_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Assigned => "assigned",
        OrderStatus::InTransit => "in_transit",
        OrderStatus::Delivering => "delivering",
        OrderStatus::Delivered => "delivered",
        OrderStatus::Failed => "failed",
        OrderStatus::Cancelled => "cancelled",
    }
}

fn str_to_status(value: &str) -> OrderStatus {
    match value {
        "assigned" => OrderStatus::Assigned,
        "in_transit" => OrderStatus::InTransit,
        "delivering" => OrderStatus::Delivering,
        "delivered" => OrderStatus::Delivered,
        "failed" => OrderStatus::Failed,
        "cancelled" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

pub async fn insert_order(pool: &SqlitePool, order: &DeliveryOrder) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO delivery_orders (id, customer_id, pickup_lat, pickup_lng, pickup_alt_m,
            delivery_lat, delivery_lng, delivery_alt_m, package_json, drone_serial, status,
            requested_at, assigned_at, picked_up_at, delivered_at, estimated_eta,
            estimated_duration_minutes, total_cost, priority, notes)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
        "#,
    )
    .bind(&order.id)
    .bind(&order.customer_id)
    .bind(order.pickup.lat)
    .bind(order.pickup.lng)
    .bind(order.pickup.alt_m)
    .bind(order.delivery.lat)
    .bind(order.delivery.lng)
    .bind(order.delivery.alt_m)
    .bind(serde_json::to_string(&order.package)?)
    .bind(&order.drone_serial)
    .bind(status_to_str(order.status))
    .bind(order.requested_at.to_rfc3339())
    .bind(order.assigned_at.map(|t| t.to_rfc3339()))
    .bind(order.picked_up_at.map(|t| t.to_rfc3339()))
    .bind(order.delivered_at.map(|t| t.to_rfc3339()))
    .bind(order.estimated_eta.map(|t| t.to_rfc3339()))
    .bind(order.estimated_duration_minutes)
    .bind(order.total_cost)
    .bind(order.priority)
    .bind(&order.notes)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_order(pool: &SqlitePool, order: &DeliveryOrder) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE delivery_orders SET
            drone_serial = ?2, status = ?3, assigned_at = ?4, picked_up_at = ?5,
            delivered_at = ?6, estimated_eta = ?7, estimated_duration_minutes = ?8,
            total_cost = ?9, notes = ?10
        WHERE id = ?1
        "#,
    )
    .bind(&order.id)
    .bind(&order.drone_serial)
    .bind(status_to_str(order.status))
    .bind(order.assigned_at.map(|t| t.to_rfc3339()))
    .bind(order.picked_up_at.map(|t| t.to_rfc3339()))
    .bind(order.delivered_at.map(|t| t.to_rfc3339()))
    .bind(order.estimated_eta.map(|t| t.to_rfc3339()))
    .bind(order.estimated_duration_minutes)
    .bind(order.total_cost)
    .bind(&order.notes)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_status_history(pool: &SqlitePool, entry: &OrderStatusHistory) -> Result<()> {
    sqlx::query(
        "INSERT INTO order_status_history (order_id, status, changed_by, notes, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .bind(&entry.order_id)
    .bind(status_to_str(entry.status))
    .bind(&entry.changed_by)
    .bind(&entry.notes)
    .bind(entry.timestamp.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

fn parse_dt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)))
}

pub async fn load_all_orders(pool: &SqlitePool) -> Result<Vec<DeliveryOrder>> {
    let rows = sqlx::query(
        "SELECT id, customer_id, pickup_lat, pickup_lng, pickup_alt_m, delivery_lat, delivery_lng, \
         delivery_alt_m, package_json, drone_serial, status, requested_at, assigned_at, picked_up_at, \
         delivered_at, estimated_eta, estimated_duration_minutes, total_cost, priority, notes \
         FROM delivery_orders",
    )
    .fetch_all(pool)
    .await?;

    let mut orders = Vec::with_capacity(rows.len());
    for row in rows {
        let package_json: String = row.try_get("package_json")?;
        let package: Package = serde_json::from_str(&package_json)?;
        let status: String = row.try_get("status")?;
        orders.push(DeliveryOrder {
            id: row.try_get("id")?,
            customer_id: row.try_get("customer_id")?,
            pickup: GeoPoint3::new(row.try_get("pickup_lat")?, row.try_get("pickup_lng")?, row.try_get("pickup_alt_m")?),
            delivery: GeoPoint3::new(row.try_get("delivery_lat")?, row.try_get("delivery_lng")?, row.try_get("delivery_alt_m")?),
            package,
            drone_serial: row.try_get("drone_serial")?,
            status: str_to_status(&status),
            requested_at: DateTime::parse_from_rfc3339(&row.try_get::<String, _>("requested_at")?)?.with_timezone(&Utc),
            assigned_at: parse_dt(row.try_get("assigned_at")?),
            picked_up_at: parse_dt(row.try_get("picked_up_at")?),
            delivered_at: parse_dt(row.try_get("delivered_at")?),
            estimated_eta: parse_dt(row.try_get("estimated_eta")?),
            estimated_duration_minutes: row.try_get("estimated_duration_minutes")?,
            total_cost: row.try_get("total_cost")?,
            priority: row.try_get("priority")?,
            notes: row.try_get("notes")?,
        });
    }

    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_order, test_db};

    #[tokio::test]
    async fn insert_then_load_round_trips_an_order() {
        let db = test_db().await;
        let order = sample_order("o1");
        insert_order(db.pool(), &order).await.unwrap();

        let loaded = load_all_orders(db.pool()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "o1");
        assert_eq!(loaded[0].status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn update_order_persists_status_and_assignment() {
        let db = test_db().await;
        let mut order = sample_order("o1");
        insert_order(db.pool(), &order).await.unwrap();

        order.status = OrderStatus::Assigned;
        order.drone_serial = Some("d1".to_string());
        update_order(db.pool(), &order).await.unwrap();

        let loaded = load_all_orders(db.pool()).await.unwrap();
        assert_eq!(loaded[0].status, OrderStatus::Assigned);
        assert_eq!(loaded[0].drone_serial.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn status_round_trip_is_stable_for_every_variant() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Assigned,
            OrderStatus::InTransit,
            OrderStatus::Delivering,
            OrderStatus::Delivered,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(str_to_status(status_to_str(status)), status);
        }
    }
}
