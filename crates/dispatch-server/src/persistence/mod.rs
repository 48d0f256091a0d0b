//! Persistence layer: SQLite via `sqlx`. WGS84 points/polygons are stored as
//! JSON-encoded coordinate arrays; spatial queries run in Rust over the
//! in-memory zone/route indexes refreshed from here at startup.

pub mod db;
pub mod drones;
pub mod notifications;
pub mod orders;
pub mod routes;
pub mod telemetry;
pub mod zones;

pub use db::{init_database, Database};
