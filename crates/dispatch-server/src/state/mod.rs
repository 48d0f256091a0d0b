//! Shared in-process state: the in-memory mirrors of drones/orders, the
//! route optimizer and ETA predictor, per-key lock tables, and the
//! WebSocket group registry. One `AppState` is built at startup and handed
//! to every handler/loop behind an `Arc`.

mod store;

pub use store::{AppState, GroupKey, ServerMessage};
