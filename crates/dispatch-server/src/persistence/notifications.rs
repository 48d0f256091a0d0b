//! Per-user notification persistence.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dispatch_core::{Notification, NotificationKind};
use sqlx::{Row, SqlitePool};

fn kind_to_str(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::DeliveryAssigned => "delivery_assigned",
        NotificationKind::RouteOptimized => "route_optimized",
        NotificationKind::RouteOptimizedAdmin => "route_optimized_admin",
        NotificationKind::DeliveryDelivering => "delivery_delivering",
        NotificationKind::DeliveryDelivered => "delivery_delivered",
        NotificationKind::DeliveryFailed => "delivery_failed",
        NotificationKind::DroneLowBattery => "drone_low_battery",
    }
}

fn str_to_kind(value: &str) -> NotificationKind {
    match value {
        "route_optimized" => NotificationKind::RouteOptimized,
        "route_optimized_admin" => NotificationKind::RouteOptimizedAdmin,
        "delivery_delivering" => NotificationKind::DeliveryDelivering,
        "delivery_delivered" => NotificationKind::DeliveryDelivered,
        "delivery_failed" => NotificationKind::DeliveryFailed,
        "drone_low_battery" => NotificationKind::DroneLowBattery,
        _ => NotificationKind::DeliveryAssigned,
    }
}

pub async fn insert_notification(pool: &SqlitePool, n: &Notification) -> Result<()> {
    sqlx::query(
        "INSERT INTO notifications (id, user_id, kind, title, message, is_read, related_object_id, \
         related_object_type, created_at, read_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(&n.id)
    .bind(&n.user_id)
    .bind(kind_to_str(n.kind))
    .bind(&n.title)
    .bind(&n.message)
    .bind(n.is_read as i64)
    .bind(&n.related_object_id)
    .bind(&n.related_object_type)
    .bind(n.created_at.to_rfc3339())
    .bind(n.read_at.map(|t| t.to_rfc3339()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_read(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE notifications SET is_read = 1, read_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(())
}

fn parse_dt(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)))
}

pub async fn load_for_user(pool: &SqlitePool, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
    let rows = sqlx::query(
        "SELECT id, user_id, kind, title, message, is_read, related_object_id, related_object_type, \
         created_at, read_at FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.try_get("kind")?;
        let created_at: String = row.try_get("created_at")?;
        out.push(Notification {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            kind: str_to_kind(&kind),
            title: row.try_get("title")?,
            message: row.try_get("message")?,
            is_read: row.try_get::<i64, _>("is_read")? != 0,
            related_object_id: row.try_get("related_object_id")?,
            related_object_type: row.try_get("related_object_type")?,
            created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
            read_at: parse_dt(row.try_get("read_at")?),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_db;

    fn sample(id: &str, user_id: &str) -> Notification {
        Notification {
            id: id.to_string(),
            user_id: user_id.to_string(),
            kind: NotificationKind::DeliveryAssigned,
            title: "Drone assigned".to_string(),
            message: "Drone d1 is en route".to_string(),
            is_read: false,
            related_object_id: Some("o1".to_string()),
            related_object_type: Some("delivery_order".to_string()),
            created_at: Utc::now(),
            read_at: None,
        }
    }

    #[tokio::test]
    async fn insert_then_load_for_user_round_trips() {
        let db = test_db().await;
        insert_notification(db.pool(), &sample("n1", "u1")).await.unwrap();

        let loaded = load_for_user(db.pool(), "u1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].is_read);
    }

    #[tokio::test]
    async fn mark_read_sets_is_read_and_read_at() {
        let db = test_db().await;
        insert_notification(db.pool(), &sample("n1", "u1")).await.unwrap();
        mark_read(db.pool(), "n1").await.unwrap();

        let loaded = load_for_user(db.pool(), "u1", 10).await.unwrap();
        assert!(loaded[0].is_read);
        assert!(loaded[0].read_at.is_some());
    }

    #[tokio::test]
    async fn load_for_user_does_not_leak_other_users_notifications() {
        let db = test_db().await;
        insert_notification(db.pool(), &sample("n1", "u1")).await.unwrap();
        insert_notification(db.pool(), &sample("n2", "u2")).await.unwrap();

        let loaded = load_for_user(db.pool(), "u1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "n1");
    }
}
