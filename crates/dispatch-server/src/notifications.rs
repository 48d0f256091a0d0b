//! Notification service: builds per-user notification rows, persists them
//! through the task queue (so a DB hiccup never blocks the pipeline step
//! that triggered the notification), and fans them out over the user's
//! WebSocket group.

use chrono::Utc;
use dispatch_core::{Notification, NotificationKind};
use uuid::Uuid;

use crate::state::AppState;
use crate::task_queue::{Task, TaskError, TaskOutcome};

pub const TASK_KIND: &str = "persist_notification";

pub fn build(user_id: &str, kind: NotificationKind, title: impl Into<String>, message: impl Into<String>, related_object_id: Option<String>, related_object_type: Option<&str>) -> Notification {
    Notification {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kind,
        title: title.into(),
        message: message.into(),
        is_read: false,
        related_object_id,
        related_object_type: related_object_type.map(|s| s.to_string()),
        created_at: Utc::now(),
        read_at: None,
    }
}

/// Broadcasts immediately (so the recipient sees it with no DB round trip
/// in the critical path) and enqueues the durable write.
pub async fn notify(state: &AppState, notification: Notification) {
    state.broadcast_notification(&notification);
    let payload = serde_json::to_value(&notification).expect("Notification always serializes");
    state.task_queue.enqueue(TASK_KIND, payload).await;
}

pub async fn notify_drone_low_battery(state: &AppState, user_id: &str, drone_serial: &str, battery_level: u8) {
    let notification = build(
        user_id,
        NotificationKind::DroneLowBattery,
        "Drone battery low",
        format!("Drone {drone_serial} battery at {battery_level}%"),
        Some(drone_serial.to_string()),
        Some("drone"),
    );
    notify(state, notification).await;
}

/// Task-queue executor for [`TASK_KIND`]: writes the notification row.
/// Database errors are retriable; anything else is a programming error.
pub async fn run_persist_task(state: &std::sync::Arc<AppState>, task: Task) -> TaskOutcome {
    let notification: Notification = serde_json::from_value(task.payload).map_err(|err| TaskError {
        message: format!("malformed notification payload: {err}"),
        retriable: false,
    })?;

    if let Some(db) = &state.db {
        crate::persistence::notifications::insert_notification(db.pool(), &notification)
            .await
            .map_err(|err| TaskError { message: err.to_string(), retriable: true })?;
    }
    Ok(())
}
