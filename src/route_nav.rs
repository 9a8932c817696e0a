//! Locally synthesized guidance for routes without service steps.
//!
//! When neither map matching nor directions produce usable steps, the
//! route is sampled at a fixed stride and the bearing change at each
//! sample is classified into a turn. Platform-agnostic.

use serde::{Deserialize, Serialize};

use crate::cache::{fnv1a64, FingerprintInput};
use crate::geometry::{bearing_deg, cumulative_distances, shortest_angle_delta};
use crate::types::{unix_time_ms, GeoPoint, Maneuver, ManeuverType, NavMeta, NavPackage, Step};

/// Where a package's geometry and steps came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageSource {
    Matching,
    Directions,
    Local,
}

impl PackageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageSource::Matching => "matching",
            PackageSource::Directions => "directions",
            PackageSource::Local => "local",
        }
    }
}

/// Turn direction categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Straight,
    SlightLeft,
    Left,
    SharpLeft,
    SlightRight,
    Right,
    SharpRight,
    UTurn,
}

impl Turn {
    /// Maneuver modifier in the routing service's vocabulary.
    pub fn modifier(self) -> &'static str {
        match self {
            Turn::Straight => "straight",
            Turn::SlightLeft => "slight left",
            Turn::Left => "left",
            Turn::SharpLeft => "sharp left",
            Turn::SlightRight => "slight right",
            Turn::Right => "right",
            Turn::SharpRight => "sharp right",
            Turn::UTurn => "uturn",
        }
    }

    fn maneuver_type(self) -> ManeuverType {
        match self {
            Turn::Straight => ManeuverType::Continue,
            _ => ManeuverType::Turn,
        }
    }
}

/// Build a step list from polyline geometry alone.
///
/// Every sampled point ends a step whose maneuver is the turn at that
/// point; a final `arrive` step covers the rest of the route. Returns an
/// empty list for fewer than 2 points.
pub fn synthesize_steps(points: &[GeoPoint]) -> Vec<Step> {
    let n = points.len();
    if n < 2 {
        return Vec::new();
    }

    let table = cumulative_distances(points);
    let stride = ((n as f64 / 8.0).round() as usize).max(5);
    let mut steps = Vec::new();
    let mut prev_end = 0;

    let mut i = 1;
    while i < n - 1 {
        let turn = compute_turn(&points[i.saturating_sub(stride)], &points[i], &points[(i + stride).min(n - 1)]);
        steps.push(local_step(
            steps.len(),
            turn.maneuver_type(),
            Some(turn.modifier()),
            points[i],
            table[prev_end],
            table[i],
        ));
        prev_end = i;
        i += stride;
    }

    steps.push(local_step(
        steps.len(),
        ManeuverType::Arrive,
        None,
        points[n - 1],
        table[prev_end],
        table[n - 1],
    ));
    steps
}

fn local_step(
    index: usize,
    kind: ManeuverType,
    modifier: Option<&str>,
    location: GeoPoint,
    start: f64,
    end: f64,
) -> Step {
    Step {
        index,
        maneuver: Maneuver {
            kind: Some(kind),
            modifier: modifier.map(str::to_string),
            location: Some(location),
            ..Default::default()
        },
        step_start_s: Some(start),
        step_end_s: Some(end),
        distance: end - start,
        ..Default::default()
    }
}

/// Wrap a polyline and its steps into a package.
///
/// Steps without ranges are laid end to end by their distances. The
/// package carries a `fallback:{source}` warning.
pub fn nav_package_from_route(points: &[GeoPoint], steps: Vec<Step>, source: PackageSource) -> NavPackage {
    let table = cumulative_distances(points);
    let route_length_m = table.last().copied().unwrap_or(0.0);

    let mut running = 0.0;
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(index, mut step)| {
            let distance = if step.distance.is_finite() { step.distance.max(0.0) } else { 0.0 };
            let start = step.step_start_s.unwrap_or(running);
            let end = step.step_end_s.unwrap_or(start + distance).max(start);
            running = end;
            step.index = index;
            step.step_start_s = Some(start);
            step.step_end_s = Some(end);
            step
        })
        .collect();

    let coords = serde_json::to_vec(&FingerprintInput::rounded_coords(points)).unwrap_or_default();

    NavPackage {
        id: format!("fallback_{}_{:016x}", source.as_str(), fnv1a64(&coords)),
        original_polyline: points.to_vec(),
        matched_polyline: points.to_vec(),
        cumulative_distances: table,
        steps,
        route_length_m,
        start_coord: points.first().copied(),
        end_coord: points.last().copied(),
        meta: NavMeta {
            created_at: unix_time_ms(),
            profile: "driving".to_string(),
            radius_m: 0.0,
            chunk_count: 1,
            warnings: vec![format!("fallback:{}", source.as_str())],
        },
    }
}

/// Bearing changes above this are U-turns.
const UTURN_DEG: f64 = 170.0;

/// Lower bounds (exclusive) of the turn bands with their left and right
/// variants, tightest first. Anything at or below the last is straight.
const TURN_BANDS: [(f64, Turn, Turn); 3] = [
    (120.0, Turn::SharpLeft, Turn::SharpRight),
    (60.0, Turn::Left, Turn::Right),
    (20.0, Turn::SlightLeft, Turn::SlightRight),
];

/// Turn at `b` when arriving from `a` and leaving toward `c`.
fn compute_turn(a: &GeoPoint, b: &GeoPoint, c: &GeoPoint) -> Turn {
    classify_turn(shortest_angle_delta(bearing_deg(a, b), bearing_deg(b, c)))
}

/// Signed bearing change to turn; positive is clockwise.
fn classify_turn(delta: f64) -> Turn {
    let magnitude = delta.abs();
    if magnitude > UTURN_DEG {
        return Turn::UTurn;
    }
    TURN_BANDS
        .iter()
        .find(|(lower, _, _)| magnitude > *lower)
        .map_or(Turn::Straight, |&(_, left, right)| if delta > 0.0 { right } else { left })
}
