//! Fixtures shared by this crate's unit tests. Not compiled outside `cfg(test)`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::geo::GeoPoint3;
use dispatch_core::{
    DeliveryOrder, Drone, DroneStatus, OrderStatus, Package, PackageType,
};

use crate::config::{Config, Environment};
use crate::persistence::{init_database, Database};
use crate::state::AppState;
use crate::task_queue::TaskQueue;

pub async fn test_db() -> Database {
    init_database(":memory:", 1).await.expect("in-memory sqlite init")
}

pub fn test_config() -> Config {
    Config {
        server_port: 0,
        database_path: ":memory:".to_string(),
        database_max_connections: 1,
        redis_url: None,
        secret_key: "test-secret".to_string(),
        admin_token: "test-admin".to_string(),
        allowed_hosts: Vec::new(),
        allowed_origins: Vec::new(),
        retry_count: 3,
        retry_delay_s: 60,
        worker_concurrency: 2,
        rate_limit_enabled: false,
        rate_limit_rps: 50,
        trust_proxy: false,
        optimizer: dispatch_core::OptimizerConfig::default(),
        environment: Environment::Development,
    }
}

/// A ready-to-use `AppState` with no backing database (every persistence
/// call becomes a no-op) and a task queue handle whose worker pool is never
/// started — tests that need task execution drive `pipeline::run_task`
/// directly instead of going through the queue.
pub fn test_state() -> Arc<AppState> {
    let (_queue, handle, _rx) = TaskQueue::new(2, 3, Duration::from_millis(10));
    Arc::new(AppState::new(test_config(), None, handle))
}

pub fn sample_drone(serial: &str) -> Drone {
    Drone {
        serial: serial.to_string(),
        max_payload_kg: 5.0,
        max_speed_kmh: 60.0,
        max_altitude_m: 400.0,
        max_range_km: 20.0,
        battery_capacity_mah: 5000,
        status: DroneStatus::Idle,
        battery_level: 90,
        current_position: Some(GeoPoint3::new(12.9700, 77.5900, 100.0)),
        last_heartbeat: None,
        is_active: true,
    }
}

pub fn sample_package() -> Package {
    Package {
        name: "box".to_string(),
        description: None,
        package_type: PackageType::Other,
        weight_kg: 1.5,
        dimensions: None,
        is_fragile: false,
        is_urgent: false,
        requires_temperature_control: false,
        temperature_range_c: None,
    }
}

pub fn sample_order(id: &str) -> DeliveryOrder {
    DeliveryOrder {
        id: id.to_string(),
        customer_id: "customer-1".to_string(),
        pickup: GeoPoint3::new(12.9700, 77.5900, 100.0),
        delivery: GeoPoint3::new(12.9900, 77.6100, 100.0),
        package: sample_package(),
        drone_serial: None,
        status: OrderStatus::Pending,
        requested_at: Utc::now(),
        assigned_at: None,
        picked_up_at: None,
        delivered_at: None,
        estimated_eta: None,
        estimated_duration_minutes: None,
        total_cost: None,
        priority: 0,
        notes: None,
    }
}
