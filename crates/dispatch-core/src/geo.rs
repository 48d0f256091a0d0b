//! Geo primitives: distance, bearing, and polygon tests over WGS84 points.
//!
//! All distances are in kilometers unless a function name says otherwise.
//! Longitude/latitude are plain decimal degrees (SRID 4326 convention).

use serde::{Deserialize, Serialize};

/// A point on the WGS84 ellipsoid (no altitude).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A point with an altitude in meters above ground/sea level, depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint3 {
    pub lat: f64,
    pub lng: f64,
    pub alt_m: f64,
}

impl GeoPoint3 {
    pub fn new(lat: f64, lng: f64, alt_m: f64) -> Self {
        Self { lat, lng, alt_m }
    }

    pub fn horizontal(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// A closed polygon ring: `points[0] == points[last]` is not enforced, callers
/// may pass an open ring and `point_in_polygon` treats it as implicitly closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<GeoPoint>,
}

impl Polygon {
    pub fn new(points: Vec<GeoPoint>) -> Self {
        Self { points }
    }

    pub fn centroid(&self) -> GeoPoint {
        let n = self.points.len().max(1) as f64;
        let (sum_lat, sum_lng) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(la, lo), p| (la + p.lat, lo + p.lng));
        GeoPoint::new(sum_lat / n, sum_lng / n)
    }
}

const EARTH_RADIUS_KM: f64 = 6_371.0;
/// Meters per degree of latitude, used for the degree-space buffer approximation.
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lng - a.lng).to_radians();
    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Combined horizontal + vertical distance, matching the route optimizer's
/// heuristic: haversine distance plus vertical delta (in km), combined in
/// quadrature.
pub fn distance_3d_km(a: GeoPoint3, b: GeoPoint3) -> f64 {
    let horizontal = haversine_km(a.horizontal(), b.horizontal());
    let vertical_km = (b.alt_m - a.alt_m).abs() / 1000.0;
    (horizontal.powi(2) + vertical_km.powi(2)).sqrt()
}

/// Initial bearing from `a` to `b`, in degrees, 0 = north, 90 = east.
pub fn bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dlambda = (b.lng - a.lng).to_radians();
    let x = dlambda.sin() * phi2.cos();
    let y = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    let deg = x.atan2(y).to_degrees();
    (deg + 360.0) % 360.0
}

/// Ray-casting point-in-polygon test. Treats `polygon.points` as a ring,
/// implicitly closed (last point connects back to the first).
pub fn point_in_polygon(p: GeoPoint, polygon: &Polygon) -> bool {
    let pts = &polygon.points;
    if pts.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = pts.len() - 1;
    for i in 0..pts.len() {
        let pi = pts[i];
        let pj = pts[j];
        let intersects = (pi.lng > p.lng) != (pj.lng > p.lng)
            && p.lat < (pj.lat - pi.lat) * (p.lng - pi.lng) / (pj.lng - pi.lng) + pi.lat;
        if intersects {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Expand a polygon outward from its centroid by `meters`, approximating a
/// geometric buffer in degree-space. This mirrors the original's
/// `geometry.buffer(safety_buffer_m / 111_000.0)` call: a uniform degree-space
/// inflation rather than a true geodesic buffer, which is adequate at the
/// scale (hundreds of meters) these zones operate at.
pub fn buffer_polygon(polygon: &Polygon, meters: f64) -> Polygon {
    let buffer_deg = meters / METERS_PER_DEGREE;
    let centroid = polygon.centroid();
    let points = polygon
        .points
        .iter()
        .map(|p| {
            let dlat = p.lat - centroid.lat;
            let dlng = p.lng - centroid.lng;
            let dist = (dlat.powi(2) + dlng.powi(2)).sqrt();
            if dist < 1e-12 {
                return *p;
            }
            let scale = (dist + buffer_deg) / dist;
            GeoPoint::new(centroid.lat + dlat * scale, centroid.lng + dlng * scale)
        })
        .collect();
    Polygon::new(points)
}

/// Bounding box (min, max) around two points, expanded by `buffer_km` on every side.
pub fn bbox_with_buffer_km(a: GeoPoint, b: GeoPoint, buffer_km: f64) -> (GeoPoint, GeoPoint) {
    let buffer_deg_lat = buffer_km / (METERS_PER_DEGREE / 1000.0);
    let mid_lat = (a.lat + b.lat) / 2.0;
    let deg_lng_km = (METERS_PER_DEGREE / 1000.0) * mid_lat.to_radians().cos().max(1e-6);
    let buffer_deg_lng = buffer_km / deg_lng_km;

    let min_lat = a.lat.min(b.lat) - buffer_deg_lat;
    let max_lat = a.lat.max(b.lat) + buffer_deg_lat;
    let min_lng = a.lng.min(b.lng) - buffer_deg_lng;
    let max_lng = a.lng.max(b.lng) + buffer_deg_lng;
    (GeoPoint::new(min_lat, min_lng), GeoPoint::new(max_lat, max_lng))
}

pub fn point_in_bbox(p: GeoPoint, min: GeoPoint, max: GeoPoint) -> bool {
    p.lat >= min.lat && p.lat <= max.lat && p.lng >= min.lng && p.lng <= max.lng
}

/// True if any point of `line` falls inside `polygon`, or any segment of
/// `line` crosses any edge of `polygon`. Good enough for obstacle-avoidance
/// checks where lines are short, densely-sampled route segments.
pub fn linestring_intersects_polygon(line: &[GeoPoint], polygon: &Polygon) -> bool {
    if line.iter().any(|p| point_in_polygon(*p, polygon)) {
        return true;
    }
    let pts = &polygon.points;
    if pts.len() < 2 || line.len() < 2 {
        return false;
    }
    for w in line.windows(2) {
        for i in 0..pts.len() {
            let j = (i + 1) % pts.len();
            if segments_intersect(w[0], w[1], pts[i], pts[j]) {
                return true;
            }
        }
    }
    false
}

/// True if `polygon`'s boundary intersects the axis-aligned box `min`..`max`
/// in any of the usual three ways: a polygon vertex falls inside the box, a
/// box corner falls inside the polygon, or an edge of one crosses an edge of
/// the other. Vertex-only containment misses a polygon edge that clips a
/// corner of the box without any polygon vertex landing inside it.
pub fn polygon_intersects_bbox(polygon: &Polygon, min: GeoPoint, max: GeoPoint) -> bool {
    let pts = &polygon.points;
    if pts.is_empty() {
        return false;
    }
    if pts.iter().any(|p| point_in_bbox(*p, min, max)) {
        return true;
    }
    let corners = [
        GeoPoint::new(min.lat, min.lng),
        GeoPoint::new(min.lat, max.lng),
        GeoPoint::new(max.lat, max.lng),
        GeoPoint::new(max.lat, min.lng),
    ];
    if corners.iter().any(|c| point_in_polygon(*c, polygon)) {
        return true;
    }
    if pts.len() < 2 {
        return false;
    }
    for i in 0..pts.len() {
        let j = (i + 1) % pts.len();
        for k in 0..corners.len() {
            let l = (k + 1) % corners.len();
            if segments_intersect(pts[i], pts[j], corners[k], corners[l]) {
                return true;
            }
        }
    }
    false
}

fn segments_intersect(p1: GeoPoint, p2: GeoPoint, p3: GeoPoint, p4: GeoPoint) -> bool {
    fn cross(o: GeoPoint, a: GeoPoint, b: GeoPoint) -> f64 {
        (a.lat - o.lat) * (b.lng - o.lng) - (a.lng - o.lng) * (b.lat - o.lat)
    }
    let d1 = cross(p3, p4, p1);
    let d2 = cross(p3, p4, p2);
    let d3 = cross(p1, p2, p3);
    let d4 = cross(p1, p2, p4);
    ((d1 > 0.0) != (d2 > 0.0)) && ((d3 > 0.0) != (d4 > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        let dist = haversine_km(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((dist - 111.194).abs() < 0.1);
    }

    #[test]
    fn haversine_same_point_is_zero() {
        let p = GeoPoint::new(12.9716, 77.5946);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn point_in_polygon_square() {
        let square = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ]);
        assert!(point_in_polygon(GeoPoint::new(0.5, 0.5), &square));
        assert!(!point_in_polygon(GeoPoint::new(2.0, 2.0), &square));
    }

    #[test]
    fn buffer_polygon_expands_outward() {
        let square = Polygon::new(vec![
            GeoPoint::new(-0.001, -0.001),
            GeoPoint::new(-0.001, 0.001),
            GeoPoint::new(0.001, 0.001),
            GeoPoint::new(0.001, -0.001),
        ]);
        let buffered = buffer_polygon(&square, 100.0);
        assert!(point_in_polygon(GeoPoint::new(0.0015, 0.0), &buffered));
        assert!(!point_in_polygon(GeoPoint::new(0.0015, 0.0), &square));
    }

    #[test]
    fn bearing_north_is_zero() {
        let b = bearing_deg(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!(b.abs() < 0.5);
    }

    #[test]
    fn polygon_intersects_bbox_true_when_vertex_inside() {
        let square = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ]);
        assert!(polygon_intersects_bbox(&square, GeoPoint::new(0.5, 0.5), GeoPoint::new(2.0, 2.0)));
    }

    #[test]
    fn polygon_intersects_bbox_true_when_edge_clips_corner_with_no_vertex_inside() {
        // A large square whose edge passes straight through a small bbox with
        // none of the square's own (far-apart) vertices landing inside it.
        let square = Polygon::new(vec![
            GeoPoint::new(-10.0, 0.5),
            GeoPoint::new(-10.0, 10.0),
            GeoPoint::new(10.0, 10.0),
            GeoPoint::new(10.0, 0.5),
        ]);
        assert!(polygon_intersects_bbox(&square, GeoPoint::new(-1.0, -1.0), GeoPoint::new(1.0, 1.0)));
    }

    #[test]
    fn polygon_intersects_bbox_true_when_polygon_fully_contains_bbox() {
        let square = Polygon::new(vec![
            GeoPoint::new(-10.0, -10.0),
            GeoPoint::new(-10.0, 10.0),
            GeoPoint::new(10.0, 10.0),
            GeoPoint::new(10.0, -10.0),
        ]);
        assert!(polygon_intersects_bbox(&square, GeoPoint::new(-0.1, -0.1), GeoPoint::new(0.1, 0.1)));
    }

    #[test]
    fn polygon_intersects_bbox_false_when_far_apart() {
        let square = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ]);
        assert!(!polygon_intersects_bbox(&square, GeoPoint::new(50.0, 50.0), GeoPoint::new(51.0, 51.0)));
    }
}
