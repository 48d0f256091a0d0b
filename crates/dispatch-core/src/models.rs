//! Core data models for the delivery dispatch system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint3;

/// A platform user. Role is assigned by an external authorization oracle and
/// is treated here as opaque, immutable state reflected into the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Manager,
    Customer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub role: UserRole,
}

/// Current state of a registered delivery drone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drone {
    pub serial: String,
    pub max_payload_kg: f64,
    pub max_speed_kmh: f64,
    pub max_altitude_m: f64,
    pub max_range_km: f64,
    pub battery_capacity_mah: u32,
    pub status: DroneStatus,
    /// 0..=100
    pub battery_level: u8,
    pub current_position: Option<GeoPoint3>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Drone {
    /// `Delivering` requires a known position; this is enforced at the
    /// boundary (telemetry ingest / status transition), not re-validated here.
    pub fn current_altitude_m(&self) -> f64 {
        self.current_position.map(|p| p.alt_m).unwrap_or(100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    Idle,
    Charging,
    Assigned,
    Delivering,
    Returning,
    Maintenance,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Document,
    Food,
    Medical,
    Electronics,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDimensions {
    pub length_cm: f64,
    pub width_cm: f64,
    pub height_cm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub description: Option<String>,
    pub package_type: PackageType,
    pub weight_kg: f64,
    pub dimensions: Option<PackageDimensions>,
    pub is_fragile: bool,
    pub is_urgent: bool,
    pub requires_temperature_control: bool,
    pub temperature_range_c: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    InTransit,
    Delivering,
    Delivered,
    Failed,
    Cancelled,
}

impl OrderStatus {
    /// Valid forward transitions, per the dispatch pipeline's state machine.
    /// `Failed`/`Cancelled` are reachable from any non-terminal state by the
    /// error sink or an explicit cancellation, which this table does not gate.
    pub fn can_advance_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Assigned) => true,
            (Assigned, InTransit) => true,
            (InTransit, Delivering) => true,
            (InTransit, Delivered) => true,
            (Delivering, Delivered) => true,
            (_, Failed) | (_, Cancelled) => !matches!(self, Delivered | Failed | Cancelled),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub id: String,
    pub customer_id: String,
    pub pickup: GeoPoint3,
    pub delivery: GeoPoint3,
    pub package: Package,
    pub drone_serial: Option<String>,
    pub status: OrderStatus,
    pub requested_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub estimated_eta: Option<DateTime<Utc>>,
    pub estimated_duration_minutes: Option<f64>,
    pub total_cost: Option<f64>,
    pub priority: i32,
    pub notes: Option<String>,
}

impl DeliveryOrder {
    /// `50 + distance_km * max(weight_kg, 0.5) * 10`, carried over verbatim
    /// from the cost formula used when a route is computed.
    pub fn compute_cost(distance_km: f64, weight_kg: f64) -> f64 {
        (50.0 + distance_km * weight_kg.max(0.5) * 10.0 * 100.0).round() / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusHistory {
    pub order_id: String,
    pub status: OrderStatus,
    pub changed_by: Option<String>,
    pub notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointAction {
    Start,
    Navigate,
    Ascend,
    Descend,
    Hover,
    Avoid,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteWaypoint {
    pub sequence: u32,
    pub position: GeoPoint3,
    pub action: WaypointAction,
    pub reason: Option<String>,
    pub segment_distance_km: f64,
    pub estimated_time_minutes: f64,
    pub wind_factor: f64,
    pub safety_score: f64,
    pub estimated_arrival: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    Direct,
    Dijkstra,
    AStar,
    DirectFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMetrics {
    pub total_distance_km: f64,
    pub direct_distance_km: f64,
    pub detour_percent: f64,
    pub estimated_duration_minutes: f64,
    pub waypoint_count: usize,
    pub altitude_changes: u32,
    pub no_fly_zones_avoided: u32,
    pub weather_hazards_avoided: u32,
    pub terrain_clearance_min_m: f64,
    pub avg_segment_length_km: f64,
    pub complexity_score: f64,
    pub optimization_method: OptimizationMethod,
    pub computation_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub order_id: String,
    pub path: Vec<RouteWaypoint>,
    pub metrics: RouteMetrics,
    pub confidence: f64,
    pub avoids_no_fly: bool,
    pub avoids_weather: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSeverity {
    Red,
    Yellow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    Airport,
    Military,
    Government,
    Private,
    Weather,
    Temporary,
    Operational,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub zone_type: ZoneType,
    pub severity: ZoneSeverity,
    pub boundary: crate::geo::Polygon,
    pub altitude_min_m: f64,
    pub altitude_max_m: Option<f64>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub reason: Option<String>,
}

impl Zone {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(from) = self.valid_from {
            if at < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if at > until {
                return false;
            }
        }
        true
    }

    pub fn altitude_overlaps(&self, alt_min: f64, alt_max: f64) -> bool {
        let zone_max = self.altitude_max_m.unwrap_or(f64::MAX);
        alt_min <= zone_max && self.altitude_min_m <= alt_max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryData {
    pub drone_serial: String,
    pub timestamp: DateTime<Utc>,
    pub position: GeoPoint3,
    pub heading_deg: f64,
    pub speed_kmh: f64,
    pub battery_level: u8,
    pub temperature_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub gps_fix_quality: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Good,
    Degraded,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneStatusStream {
    pub drone_serial: String,
    pub is_online: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub connection_quality: ConnectionQuality,
    pub current_mission: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeliveryAssigned,
    RouteOptimized,
    RouteOptimizedAdmin,
    DeliveryDelivering,
    DeliveryDelivered,
    DeliveryFailed,
    DroneLowBattery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub related_object_id: Option<String>,
    pub related_object_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_formula_matches_spec() {
        let cost = DeliveryOrder::compute_cost(10.0, 2.0);
        assert!((cost - 250.0).abs() < 1e-9);
    }

    #[test]
    fn cost_formula_floors_weight_at_half_kg() {
        let cost = DeliveryOrder::compute_cost(1.0, 0.1);
        assert!((cost - 55.0).abs() < 1e-9);
    }

    #[test]
    fn status_machine_allows_forward_progression_only() {
        assert!(OrderStatus::Pending.can_advance_to(OrderStatus::Assigned));
        assert!(!OrderStatus::Pending.can_advance_to(OrderStatus::Delivered));
        assert!(OrderStatus::InTransit.can_advance_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Delivered.can_advance_to(OrderStatus::Failed));
    }
}
