//! In-memory zone store: operator-managed zones plus the static catalog,
//! queried by the route optimizer for obstacle avoidance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::geo::{point_in_polygon, polygon_intersects_bbox, GeoPoint};
use crate::models::Zone;
use crate::static_zones;

/// Bumped on every mutation so callers holding a cached result (the route
/// cache, in particular) can detect staleness without re-querying the store.
#[derive(Debug, Default)]
pub struct ZoneVersion(AtomicU64);

impl ZoneVersion {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Read-mostly store of operator-managed zones. The static catalog is always
/// included in queries and is never mutated through this store.
#[derive(Default)]
pub struct ZoneStore {
    zones: RwLock<Vec<Zone>>,
    pub version: ZoneVersion,
}

impl ZoneStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(zones: Vec<Zone>) -> Self {
        Self {
            zones: RwLock::new(zones),
            version: ZoneVersion::default(),
        }
    }

    pub fn insert(&self, zone: Zone) {
        self.zones.write().expect("zone store lock poisoned").push(zone);
        self.version.bump();
    }

    pub fn deactivate(&self, id: &str) -> bool {
        let mut zones = self.zones.write().expect("zone store lock poisoned");
        if let Some(z) = zones.iter_mut().find(|z| z.id == id) {
            z.is_active = false;
            drop(zones);
            self.version.bump();
            true
        } else {
            false
        }
    }

    /// All active zones (operator-managed + static) whose bounding area
    /// falls anywhere near `min`..`max`, at the given instant.
    pub fn active_zones_in_bbox(&self, min: GeoPoint, max: GeoPoint, at: DateTime<Utc>) -> Vec<Zone> {
        let operator = self.zones.read().expect("zone store lock poisoned");
        operator
            .iter()
            .chain(static_zones::static_zones().iter())
            .filter(|z| z.is_valid_at(at))
            .filter(|z| polygon_intersects_bbox(&z.boundary, min, max))
            .cloned()
            .collect()
    }

    /// True if `point` at `altitude_m` falls inside any active no-fly zone,
    /// each expanded outward by `safety_buffer_m` before the test.
    pub fn point_intersects_nofly(&self, point: GeoPoint, altitude_m: f64, safety_buffer_m: f64, at: DateTime<Utc>) -> bool {
        let operator = self.zones.read().expect("zone store lock poisoned");
        operator
            .iter()
            .chain(static_zones::static_zones().iter())
            .filter(|z| z.is_valid_at(at))
            .filter(|z| z.altitude_overlaps(altitude_m, altitude_m))
            .any(|z| {
                let boundary = if safety_buffer_m > 0.0 {
                    crate::geo::buffer_polygon(&z.boundary, safety_buffer_m)
                } else {
                    z.boundary.clone()
                };
                point_in_polygon(point, &boundary)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Polygon;
    use crate::models::{ZoneSeverity, ZoneType};

    fn square_zone(id: &str) -> Zone {
        Zone {
            id: id.to_string(),
            name: "test".into(),
            zone_type: ZoneType::Temporary,
            severity: ZoneSeverity::Red,
            boundary: Polygon::new(vec![
                GeoPoint::new(0.0, 0.0),
                GeoPoint::new(0.0, 1.0),
                GeoPoint::new(1.0, 1.0),
                GeoPoint::new(1.0, 0.0),
            ]),
            altitude_min_m: 0.0,
            altitude_max_m: Some(500.0),
            valid_from: None,
            valid_until: None,
            is_active: true,
            reason: None,
        }
    }

    #[test]
    fn insert_bumps_version_and_is_queryable() {
        let store = ZoneStore::new();
        let before = store.version.current();
        store.insert(square_zone("z1"));
        assert!(store.version.current() > before);
        assert!(store.point_intersects_nofly(GeoPoint::new(0.5, 0.5), 100.0, 0.0, Utc::now()));
    }

    #[test]
    fn deactivated_zone_no_longer_intersects() {
        let store = ZoneStore::new();
        store.insert(square_zone("z1"));
        assert!(store.deactivate("z1"));
        assert!(!store.point_intersects_nofly(GeoPoint::new(0.5, 0.5), 100.0, 0.0, Utc::now()));
    }

    #[test]
    fn static_catalog_always_present() {
        let store = ZoneStore::new();
        assert!(store.point_intersects_nofly(GeoPoint::new(12.9716, 77.5946), 100.0, 0.0, Utc::now()));
    }

    #[test]
    fn bbox_query_finds_zone_whose_edge_clips_the_box_with_no_vertex_inside() {
        let store = ZoneStore::new();
        store.insert(Zone {
            id: "z2".into(),
            name: "edge-clipper".into(),
            zone_type: ZoneType::Temporary,
            severity: ZoneSeverity::Red,
            boundary: Polygon::new(vec![
                GeoPoint::new(-10.0, 0.5),
                GeoPoint::new(-10.0, 10.0),
                GeoPoint::new(10.0, 10.0),
                GeoPoint::new(10.0, 0.5),
            ]),
            altitude_min_m: 0.0,
            altitude_max_m: Some(500.0),
            valid_from: None,
            valid_until: None,
            is_active: true,
            reason: None,
        });
        let found = store.active_zones_in_bbox(GeoPoint::new(-1.0, -1.0), GeoPoint::new(1.0, 1.0), Utc::now());
        assert!(found.iter().any(|z| z.id == "z2"));
    }
}
