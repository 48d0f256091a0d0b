use std::sync::Arc;

use dashmap::DashMap;
use dispatch_core::{Drone, DroneStatusStream, EtaPredictor, Notification, Route, RouteOptimizer, ZoneStore};
use dispatch_core::DeliveryOrder;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::auth_oracle::AuthOracle;
use crate::config::Config;
use crate::persistence::Database;
use crate::providers::{CalmWeather, SeaLevelTerrain, TerrainProvider, WeatherSource};
use crate::task_queue::TaskQueueHandle;

const WS_BROADCAST_CAPACITY: usize = 256;

/// A WebSocket fan-out group. `DroneUpdates` carries every drone's status
/// stream change, `Drone(serial)`/`User(id)` are the per-entity channels a
/// client joins with `subscribe_drone` or by authenticating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    DroneUpdates,
    Drone(String),
    User(String),
}

/// Server→client WebSocket payloads, tagged the way the spec's three
/// message kinds are named.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    DroneUpdate { drone: Drone, stream: DroneStatusStream },
    Telemetry { drone_serial: String, data: dispatch_core::TelemetryData },
    DeliveryUpdate { order: DeliveryOrder },
    Notification { notification: Notification },
}

pub struct AppState {
    pub config: Config,
    pub db: Option<Database>,
    pub auth: AuthOracle,

    pub drones: DashMap<String, Drone>,
    pub orders: DashMap<String, DeliveryOrder>,
    pub routes: DashMap<String, Route>,
    pub drone_streams: DashMap<String, DroneStatusStream>,

    pub zones: ZoneStore,
    pub optimizer: RouteOptimizer,
    pub eta: EtaPredictor,
    pub weather: Box<dyn WeatherSource>,
    pub terrain: Box<dyn TerrainProvider>,

    pub order_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    pub drone_locks: DashMap<String, Arc<AsyncMutex<()>>>,

    ws_groups: DashMap<GroupKey, broadcast::Sender<ServerMessage>>,

    pub task_queue: TaskQueueHandle,
}

impl AppState {
    pub fn new(config: Config, db: Option<Database>, task_queue: TaskQueueHandle) -> Self {
        let auth = AuthOracle::new(config.secret_key.clone(), "admin");
        let optimizer = RouteOptimizer::new(config.optimizer);
        Self {
            config,
            db,
            auth,
            drones: DashMap::new(),
            orders: DashMap::new(),
            routes: DashMap::new(),
            drone_streams: DashMap::new(),
            zones: ZoneStore::new(),
            optimizer,
            eta: EtaPredictor::default(),
            weather: Box::new(CalmWeather),
            terrain: Box::new(SeaLevelTerrain),
            order_locks: DashMap::new(),
            drone_locks: DashMap::new(),
            ws_groups: DashMap::new(),
            task_queue,
        }
    }

    /// Per-order serialization lock, created lazily on first use.
    pub fn order_lock(&self, order_id: &str) -> Arc<AsyncMutex<()>> {
        self.order_locks.entry(order_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    pub fn drone_lock(&self, serial: &str) -> Arc<AsyncMutex<()>> {
        self.drone_locks.entry(serial.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Subscribes to a group, creating its broadcast channel on first join.
    pub fn subscribe(&self, key: GroupKey) -> broadcast::Receiver<ServerMessage> {
        self.ws_groups
            .entry(key)
            .or_insert_with(|| broadcast::channel(WS_BROADCAST_CAPACITY).0)
            .subscribe()
    }

    /// Publishes to a group if it has at least one subscriber; a group with
    /// none yet is simply skipped rather than allocated for nothing.
    pub fn publish(&self, key: GroupKey, message: ServerMessage) {
        if let Some(sender) = self.ws_groups.get(&key) {
            // Err here only means no receivers are currently attached.
            let _ = sender.send(message);
        }
    }

    pub fn broadcast_drone_update(&self, drone: &Drone, stream: &DroneStatusStream) {
        let message = ServerMessage::DroneUpdate { drone: drone.clone(), stream: stream.clone() };
        self.publish(GroupKey::DroneUpdates, message.clone());
        self.publish(GroupKey::Drone(drone.serial.clone()), message);
    }

    pub fn broadcast_delivery_update(&self, order: &DeliveryOrder) {
        self.publish(GroupKey::User(order.customer_id.clone()), ServerMessage::DeliveryUpdate { order: order.clone() });
    }

    pub fn broadcast_notification(&self, notification: &Notification) {
        self.publish(GroupKey::User(notification.user_id.clone()), ServerMessage::Notification { notification: notification.clone() });
    }

    /// Populates the in-memory DashMaps/zone store from SQLite at startup,
    /// matching the teacher's `load_from_database` bootstrap step. A no-op
    /// when running without a database (tests, ephemeral demos).
    pub async fn load_from_database(&self) -> anyhow::Result<()> {
        let Some(db) = &self.db else { return Ok(()) };
        let pool = db.pool();

        for drone in crate::persistence::drones::load_all_drones(pool).await? {
            self.drones.insert(drone.serial.clone(), drone);
        }
        for order in crate::persistence::orders::load_all_orders(pool).await? {
            self.orders.insert(order.id.clone(), order);
        }
        for zone in crate::persistence::zones::load_all_zones(pool).await? {
            self.zones.insert(zone);
        }
        for order_id in self.orders.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
            if let Some(route) = crate::persistence::routes::load_route(pool, &order_id).await? {
                self.routes.insert(order_id, route);
            }
        }

        tracing::info!(
            drones = self.drones.len(),
            orders = self.orders.len(),
            routes = self.routes.len(),
            "loaded state from database"
        );
        Ok(())
    }
}
