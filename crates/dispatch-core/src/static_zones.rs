//! Built-in catalog of circular no-fly/caution zones, approximated as
//! polygons the same way the reference zone loader does: a geodesic forward
//! offset at 64 bearings around the circle.
//!
//! Entries, radii and altitude bands are the exact values the system shipped
//! with before any operator-managed zones were added through the API.

use std::sync::OnceLock;

use crate::geo::{GeoPoint, Polygon};
use crate::models::{Zone, ZoneSeverity, ZoneType};

/// WGS84 mean earth radius in meters, matching the geodesic offset formula
/// used to build these circles.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

struct StaticZoneDef {
    name: &'static str,
    severity: ZoneSeverity,
    center: (f64, f64),
    radius_m: f64,
    altitude_min: f64,
    altitude_max: f64,
    reason: &'static str,
}

const STATIC_ZONE_DEFS: &[StaticZoneDef] = &[
    StaticZoneDef {
        name: "Red Zone - Airport",
        severity: ZoneSeverity::Red,
        center: (12.9716, 77.5946),
        radius_m: 1_500.0,
        altitude_min: 0.0,
        altitude_max: 1200.0,
        reason: "Airport critical airspace",
    },
    StaticZoneDef {
        name: "Yellow Zone - Hospital Corridor",
        severity: ZoneSeverity::Yellow,
        center: (12.985, 77.61),
        radius_m: 800.0,
        altitude_min: 0.0,
        altitude_max: 400.0,
        reason: "Hospital helipad corridor",
    },
    StaticZoneDef {
        name: "Red Zone - Sensitive Facility",
        severity: ZoneSeverity::Red,
        center: (13.01, 77.58),
        radius_m: 1_000.0,
        altitude_min: 0.0,
        altitude_max: 800.0,
        reason: "Government / sensitive facility",
    },
];

/// Approximate a geodesic circle as a closed polygon ring with `num_points`
/// vertices, using the forward-azimuth spherical offset formula.
pub fn circle_to_polygon(center: GeoPoint, radius_m: f64, num_points: usize) -> Polygon {
    let lat_r = center.lat.to_radians();
    let lng_r = center.lng.to_radians();
    let angular_distance = radius_m / EARTH_RADIUS_M;

    let mut points = Vec::with_capacity(num_points);
    for i in 0..num_points {
        let bearing = 2.0 * std::f64::consts::PI * (i as f64 / num_points as f64);
        let sin_lat = lat_r.sin() * angular_distance.cos()
            + lat_r.cos() * angular_distance.sin() * bearing.cos();
        let lat_p = sin_lat.asin();
        let y = bearing.sin() * angular_distance.sin() * lat_r.cos();
        let x = angular_distance.cos() - lat_r.sin() * sin_lat;
        let lng_p = lng_r + y.atan2(x);
        points.push(GeoPoint::new(lat_p.to_degrees(), lng_p.to_degrees()));
    }
    Polygon::new(points)
}

fn build_catalog() -> Vec<Zone> {
    STATIC_ZONE_DEFS
        .iter()
        .enumerate()
        .map(|(i, def)| {
            let boundary = circle_to_polygon(GeoPoint::new(def.center.0, def.center.1), def.radius_m, 64);
            Zone {
                id: format!("static-{i}"),
                name: def.name.to_string(),
                zone_type: ZoneType::Government,
                severity: def.severity,
                boundary,
                altitude_min_m: def.altitude_min,
                altitude_max_m: Some(def.altitude_max),
                valid_from: None,
                valid_until: None,
                is_active: true,
                reason: Some(def.reason.to_string()),
            }
        })
        .collect()
}

static CATALOG: OnceLock<Vec<Zone>> = OnceLock::new();

/// The built-in zone catalog, computed once per process.
pub fn static_zones() -> &'static [Zone] {
    CATALOG.get_or_init(build_catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::point_in_polygon;

    #[test]
    fn catalog_has_three_zones() {
        assert_eq!(static_zones().len(), 3);
    }

    #[test]
    fn airport_zone_contains_its_center() {
        let zones = static_zones();
        let airport = &zones[0];
        assert!(point_in_polygon(GeoPoint::new(12.9716, 77.5946), &airport.boundary));
    }

    #[test]
    fn airport_zone_excludes_far_point() {
        let zones = static_zones();
        let airport = &zones[0];
        assert!(!point_in_polygon(GeoPoint::new(13.5, 78.5), &airport.boundary));
    }
}
