//! Geometry kernel.
//!
//! Platform-agnostic distance, bearing and projection helpers used by
//! preprocessing, localization and marker smoothing. All coordinates use
//! WGS84 (lat/lon in degrees), all distances are meters and all angles
//! are degrees.

use serde::Serialize;

use crate::types::GeoPoint;

/// Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Result of projecting a position onto a single segment.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SegmentProjection {
    /// Distance from the position to the projected point.
    pub distance_to_route: f64,
    /// Distance from the segment start to the projected point.
    pub distance_along_segment: f64,
    pub projected_point: GeoPoint,
}

/// Haversine distance between two points in meters.
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Initial bearing (forward azimuth) from A to B in degrees [0, 360).
pub fn bearing_deg(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();

    normalize_deg(y.atan2(x).to_degrees())
}

/// Project point P onto segment V-W.
///
/// Uses a planar approximation scaled by latitude cosine, which is only
/// accurate for short segments (tens of meters). Degenerate segments
/// project onto V.
pub fn project_point_to_segment(p: &GeoPoint, v: &GeoPoint, w: &GeoPoint) -> SegmentProjection {
    let cos_lat = ((v.latitude + w.latitude) / 2.0).to_radians().cos();

    let dx = (w.longitude - v.longitude) * cos_lat;
    let dy = w.latitude - v.latitude;
    let px = (p.longitude - v.longitude) * cos_lat;
    let py = p.latitude - v.latitude;

    let seg_len_sq = dx * dx + dy * dy;
    let t = if seg_len_sq < 1e-20 {
        0.0
    } else {
        ((px * dx + py * dy) / seg_len_sq).clamp(0.0, 1.0)
    };

    let projected_point = lerp_coord(v, w, t);
    SegmentProjection {
        distance_to_route: distance_m(p, &projected_point),
        distance_along_segment: distance_m(v, &projected_point),
        projected_point,
    }
}

/// Wrap an angle into [0, 360).
pub fn normalize_deg(deg: f64) -> f64 {
    let value = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if value >= 360.0 { 0.0 } else { value }
}

/// Signed shortest rotation from `from` to `to`, in [-180, 180).
pub fn shortest_angle_delta(from: f64, to: f64) -> f64 {
    (to - from + 540.0).rem_euclid(360.0) - 180.0
}

/// Unsigned angular difference in [0, 180].
pub fn angle_delta(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % 360.0;
    if d > 180.0 { 360.0 - d } else { d }
}

/// Interpolate between two headings along the shorter arc.
pub fn lerp_angle_deg(from: f64, to: f64, alpha: f64) -> f64 {
    normalize_deg(from + shortest_angle_delta(from, to) * alpha)
}

/// Rotate from `from` toward `to` by at most `max_deg_per_sec * dt_sec`.
pub fn limit_turn_rate(from: f64, to: f64, max_deg_per_sec: f64, dt_sec: f64) -> f64 {
    if !dt_sec.is_finite() || dt_sec <= 0.0 {
        return normalize_deg(to);
    }
    let max_delta = max_deg_per_sec * dt_sec;
    let delta = shortest_angle_delta(from, to).clamp(-max_delta, max_delta);
    normalize_deg(from + delta)
}

/// Linear interpolation in lat/lon space.
pub fn lerp_coord(from: &GeoPoint, to: &GeoPoint, alpha: f64) -> GeoPoint {
    GeoPoint {
        latitude: from.latitude + (to.latitude - from.latitude) * alpha,
        longitude: from.longitude + (to.longitude - from.longitude) * alpha,
    }
}

/// Destination point given a start, bearing and distance (spherical direct problem).
pub fn offset_coord_by_meters(origin: &GeoPoint, bearing: f64, distance: f64) -> GeoPoint {
    let brng = bearing.to_radians();
    let lat1 = origin.latitude.to_radians();
    let lon1 = origin.longitude.to_radians();
    let delta = distance / EARTH_RADIUS_M;

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * brng.cos()).asin();
    let lon2 = lon1
        + (brng.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    GeoPoint {
        latitude: lat2.to_degrees(),
        longitude: lon2.to_degrees(),
    }
}

/// Cumulative along-route distance for every polyline point.
///
/// The table has one entry per point and starts at 0.
pub fn cumulative_distances(points: &[GeoPoint]) -> Vec<f64> {
    let mut table = Vec::with_capacity(points.len());
    let mut total = 0.0;
    for (i, p) in points.iter().enumerate() {
        if i > 0 {
            total += distance_m(&points[i - 1], p);
        }
        table.push(total);
    }
    table
}

/// Index of the segment containing along-route distance `s`.
///
/// Binary search for the last table entry `<= s`, clamped to a valid
/// segment start (`0..=len-2`).
pub fn find_segment_index(table: &[f64], s: f64) -> usize {
    if table.len() < 2 {
        return 0;
    }
    let upper = table.partition_point(|&d| d <= s);
    upper.saturating_sub(1).min(table.len() - 2)
}

/// Point at along-route distance `s`, clamped to the route.
///
/// Returns None for an empty route or a table that doesn't match it.
pub fn coord_at_distance(points: &[GeoPoint], table: &[f64], s: f64) -> Option<GeoPoint> {
    if points.len() < 2 || table.len() != points.len() {
        return points.first().copied();
    }
    let total = table[table.len() - 1];
    let clamped = s.clamp(0.0, total);
    let idx = find_segment_index(table, clamped);
    let seg_len = table[idx + 1] - table[idx];
    let t = if seg_len > 0.0 {
        ((clamped - table[idx]) / seg_len).clamp(0.0, 1.0)
    } else {
        0.0
    };
    Some(lerp_coord(&points[idx], &points[idx + 1], t))
}

/// Bearing of the route between the points `ahead_a` and `ahead_b`
/// meters past `s`.
pub fn bearing_along_route(
    points: &[GeoPoint],
    table: &[f64],
    s: f64,
    ahead_a: f64,
    ahead_b: f64,
) -> Option<f64> {
    if points.len() < 2 || table.len() != points.len() {
        return None;
    }
    let p1 = coord_at_distance(points, table, s + ahead_a)?;
    let p2 = coord_at_distance(points, table, s + ahead_b)?;
    Some(bearing_deg(&p1, &p2))
}

/// Projection of a position onto a whole route.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RouteProgress {
    pub along_s: f64,
    pub distance_to_route: f64,
    pub snapped_point: GeoPoint,
    pub segment_heading: f64,
    pub segment_index: usize,
}

/// Project a position onto the best segment of a route.
///
/// When `last_along` is given, candidates far from it are penalized so
/// progress stays continuous on routes that cross themselves. Returns
/// None if the route has fewer than 2 points.
pub fn route_progress(
    position: &GeoPoint,
    points: &[GeoPoint],
    table: &[f64],
    last_along: Option<f64>,
) -> Option<RouteProgress> {
    if points.len() < 2 || table.len() != points.len() {
        return None;
    }

    let mut best: Option<(f64, RouteProgress)> = None;
    for (i, segment) in points.windows(2).enumerate() {
        let projection = project_point_to_segment(position, &segment[0], &segment[1]);
        let along = table[i] + projection.distance_along_segment;

        let mut penalty = 0.0;
        if let Some(last) = last_along {
            let delta = along - last;
            if delta < -30.0 {
                penalty += delta.abs() * 2.5;
            }
            penalty += delta.abs() * 0.15;
        }
        let score = projection.distance_to_route + penalty;

        let is_better = match &best {
            Some((prev, _)) => score < *prev,
            None => true,
        };
        if is_better {
            best = Some((
                score,
                RouteProgress {
                    along_s: along,
                    distance_to_route: projection.distance_to_route,
                    snapped_point: projection.projected_point,
                    segment_heading: bearing_deg(&segment[0], &segment[1]),
                    segment_index: i,
                },
            ));
        }
    }

    best.map(|(_, progress)| progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    #[test]
    fn distance_same_point() {
        let p = pt(51.5074, -0.1278);
        assert!(distance_m(&p, &p).abs() < 0.01);
    }

    #[test]
    fn distance_known() {
        // London to Oxford ~ 83 km
        let london = pt(51.5074, -0.1278);
        let oxford = pt(51.7520, -1.2577);
        let dist = distance_m(&london, &oxford);
        assert!(dist > 78_000.0 && dist < 88_000.0, "Expected ~83 km, got {:.0} m", dist);
    }

    #[test]
    fn bearing_cardinal_directions() {
        let b = bearing_deg(&pt(0.0, 0.0), &pt(0.0, 1.0));
        assert!((b - 90.0).abs() < 0.1, "Expected ~90, got {b}");
        let b = bearing_deg(&pt(0.0, 0.0), &pt(1.0, 0.0));
        assert!(b.abs() < 0.1, "Expected ~0, got {b}");
        let b = bearing_deg(&pt(0.0, 0.0), &pt(0.0, -1.0));
        assert!((b - 270.0).abs() < 0.1, "Expected ~270, got {b}");
    }

    #[test]
    fn projection_midpoint() {
        // West-east segment, position ~11 m north of its middle
        let v = pt(51.0, -0.001);
        let w = pt(51.0, 0.001);
        let p = pt(51.0001, 0.0);
        let proj = project_point_to_segment(&p, &v, &w);
        assert!((proj.projected_point.longitude).abs() < 1e-6);
        assert!((proj.distance_to_route - 11.1).abs() < 0.5, "got {}", proj.distance_to_route);
        let half = distance_m(&v, &w) / 2.0;
        assert!((proj.distance_along_segment - half).abs() < 0.5);
    }

    #[test]
    fn projection_clamps_to_endpoints() {
        let v = pt(51.0, 0.0);
        let w = pt(51.0, 0.001);
        let before = project_point_to_segment(&pt(51.0, -0.001), &v, &w);
        assert_eq!(before.projected_point, v);
        assert!(before.distance_along_segment.abs() < 1e-6);
        let after = project_point_to_segment(&pt(51.0, 0.002), &v, &w);
        assert_eq!(after.projected_point, w);
    }

    #[test]
    fn projection_degenerate_segment() {
        let v = pt(51.0, 0.0);
        let proj = project_point_to_segment(&pt(51.0001, 0.0), &v, &v);
        assert_eq!(proj.projected_point, v);
    }

    #[test]
    fn angle_helpers() {
        assert_eq!(normalize_deg(-90.0), 270.0);
        assert_eq!(normalize_deg(720.0), 0.0);
        assert_eq!(shortest_angle_delta(350.0, 10.0), 20.0);
        assert_eq!(shortest_angle_delta(10.0, 350.0), -20.0);
        assert_eq!(angle_delta(350.0, 10.0), 20.0);
        assert!((lerp_angle_deg(350.0, 10.0, 0.5) - 0.0).abs() < 1e-9);
        assert_eq!(limit_turn_rate(0.0, 90.0, 30.0, 1.0), 30.0);
        assert_eq!(limit_turn_rate(0.0, 90.0, 30.0, 0.0), 90.0);
    }

    #[test]
    fn offset_then_measure() {
        let origin = pt(51.5, -0.1);
        let moved = offset_coord_by_meters(&origin, 45.0, 100.0);
        assert!((distance_m(&origin, &moved) - 100.0).abs() < 0.01);
        assert!((bearing_deg(&origin, &moved) - 45.0).abs() < 0.1);
    }

    #[test]
    fn cumulative_table_invariants() {
        let route = vec![pt(0.0, 0.0), pt(0.0, 0.001), pt(0.0, 0.001), pt(0.0, 0.002)];
        let table = cumulative_distances(&route);
        assert_eq!(table.len(), route.len());
        assert_eq!(table[0], 0.0);
        assert!(table.windows(2).all(|w| w[1] >= w[0]));
        assert!(cumulative_distances(&[]).is_empty());
    }

    #[test]
    fn segment_index_search() {
        let table = vec![0.0, 10.0, 20.0, 30.0];
        assert_eq!(find_segment_index(&table, -5.0), 0);
        assert_eq!(find_segment_index(&table, 0.0), 0);
        assert_eq!(find_segment_index(&table, 15.0), 1);
        assert_eq!(find_segment_index(&table, 20.0), 2);
        assert_eq!(find_segment_index(&table, 99.0), 2);
    }

    #[test]
    fn coord_at_distance_interpolates() {
        let route = vec![pt(0.0, 0.0), pt(0.0, 0.001)];
        let table = cumulative_distances(&route);
        let mid = coord_at_distance(&route, &table, table[1] / 2.0).unwrap();
        assert!((mid.longitude - 0.0005).abs() < 1e-9);
        let past = coord_at_distance(&route, &table, 1e6).unwrap();
        assert_eq!(past, route[1]);
    }

    #[test]
    fn route_progress_prefers_continuity_on_crossing() {
        // Out and back along the same line: the return leg overlaps the first
        let route = vec![pt(0.0, 0.0), pt(0.0, 0.002), pt(0.0, 0.0)];
        let table = cumulative_distances(&route);
        let p = pt(0.0, 0.0005);
        let fresh = route_progress(&p, &route, &table, None).unwrap();
        assert_eq!(fresh.segment_index, 0);
        let late = route_progress(&p, &route, &table, Some(table[2] - 60.0)).unwrap();
        assert_eq!(late.segment_index, 1);
    }

    #[test]
    fn route_progress_needs_two_points() {
        assert!(route_progress(&pt(0.0, 0.0), &[pt(0.0, 0.0)], &[0.0], None).is_none());
    }
}
