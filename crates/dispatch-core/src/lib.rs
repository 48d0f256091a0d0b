//! Dispatch Core - pure domain logic for drone delivery dispatch.
//!
//! Route optimization, ETA prediction, zone management and the shared data
//! model live here with NO networking or persistence dependencies.

pub mod cache;
pub mod error;
pub mod eta;
pub mod geo;
pub mod models;
pub mod optimizer;
pub mod static_zones;
pub mod zones;

pub use error::{CoreError, CoreResult};
pub use eta::{EtaPrediction, EtaPredictor, FeatureVector, ModelUsed, Regressor};
pub use geo::{GeoPoint, GeoPoint3, Polygon};
pub use models::{
    ConnectionQuality, DeliveryOrder, Drone, DroneStatus, DroneStatusStream, Notification, NotificationKind,
    OptimizationMethod, OrderStatus, OrderStatusHistory, Package, PackageDimensions, PackageType, Route, RouteMetrics,
    RouteWaypoint, TelemetryData, User, UserRole, WaypointAction, Zone, ZoneSeverity, ZoneType,
};
pub use optimizer::{OptimizerConfig, Priority, RouteOptimizer, WeatherSnapshot};
pub use zones::{ZoneStore, ZoneVersion};
