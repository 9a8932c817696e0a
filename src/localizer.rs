//! Continuous GPS-to-route localization.
//!
//! A [`RouteLocalizer`] tracks one navigation session's progress along a
//! package's matched polyline. Each fix is projected onto the segments in
//! a window around the current progress and the best candidate is chosen
//! by distance, heading agreement and a penalty for moving backwards.
//! Progress is stabilized against jitter, and sustained or large
//! deviations are reported as off-route with a rejoin point ahead.

use log::info;
use serde::{Deserialize, Serialize};

use crate::geometry::{angle_delta, bearing_deg, cumulative_distances, find_segment_index, project_point_to_segment};
use crate::types::{GeoPoint, NavPackage};

/// Candidates further than this behind current progress are penalized.
const BACKTRACK_TOLERANCE_M: f64 = 10.0;
/// Maximum regression of progress per update while moving.
const MAX_REGRESSION_M: f64 = 10.0;
const MOVING_SPEED_MPS: f64 = 0.5;
const STATIONARY_SPEED_MPS: f64 = 1.0;
/// Off-route is immediate beyond `max(this, off_route_distance_m + 10)`.
const INSTANT_OFF_ROUTE_FLOOR_M: f64 = 40.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalizerOptions {
    pub behind_window_m: f64,
    pub heading_weight: f64,
    pub backtrack_weight: f64,
    pub off_route_distance_m: f64,
    pub off_route_duration_ms: i64,
    pub rejoin_ahead_m: f64,
}

impl Default for LocalizerOptions {
    fn default() -> Self {
        Self {
            behind_window_m: 50.0,
            heading_weight: 0.6,
            backtrack_weight: 3.0,
            off_route_distance_m: 30.0,
            off_route_duration_ms: 5000,
            rejoin_ahead_m: 50.0,
        }
    }
}

/// Mutable per-session state, advanced only by [`RouteLocalizer::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalizerState {
    pub current_s: f64,
    pub current_segment_index: usize,
    pub last_update_ms: Option<i64>,
    pub last_distance_to_route: f64,
    pub off_route_since_ms: Option<i64>,
    pub off_route: bool,
}

impl Default for LocalizerState {
    fn default() -> Self {
        Self {
            current_s: 0.0,
            current_segment_index: 0,
            last_update_ms: None,
            last_distance_to_route: f64::INFINITY,
            off_route_since_ms: None,
            off_route: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalizationResult {
    pub current_s: f64,
    pub current_segment_index: usize,
    pub distance_to_route: f64,
    pub snapped_location: GeoPoint,
    pub raw_location: GeoPoint,
    pub segment_heading: f64,
    pub off_route: bool,
    pub candidate_count: usize,
    pub window_start: f64,
    pub window_end: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejoin_target: Option<GeoPoint>,
}

struct Candidate {
    score: f64,
    distance: f64,
    along: f64,
    point: GeoPoint,
    heading: f64,
    segment: usize,
}

/// Progress tracker for one route. Create a fresh one per session.
#[derive(Debug, Clone)]
pub struct RouteLocalizer {
    points: Vec<GeoPoint>,
    table: Vec<f64>,
    total: f64,
    options: LocalizerOptions,
    state: LocalizerState,
}

impl RouteLocalizer {
    pub fn new(package: &NavPackage, options: LocalizerOptions) -> Self {
        let points = package.matched_polyline.clone();
        let table = if package.cumulative_distances.len() == points.len() {
            package.cumulative_distances.clone()
        } else {
            cumulative_distances(&points)
        };
        let total = table.last().copied().unwrap_or(0.0);
        Self {
            points,
            table,
            total,
            options,
            state: LocalizerState::default(),
        }
    }

    pub fn state(&self) -> &LocalizerState {
        &self.state
    }

    pub fn route(&self) -> &[GeoPoint] {
        &self.points
    }

    pub fn cumulative_distances(&self) -> &[f64] {
        &self.table
    }

    pub fn route_length_m(&self) -> f64 {
        self.total
    }

    /// Localize one fix. `heading` is degrees clockwise from north.
    pub fn update(&mut self, position: GeoPoint, heading: Option<f64>, speed_mps: f64, timestamp_ms: i64) -> LocalizationResult {
        if self.points.len() < 2 {
            return self.passthrough(position);
        }

        let heading = heading.filter(|h| h.is_finite());
        let speed = if speed_mps.is_finite() { speed_mps.max(0.0) } else { 0.0 };
        let current_s = self.state.current_s;

        let dt = match self.state.last_update_ms {
            Some(last) => ((timestamp_ms - last) as f64 / 1000.0).max(0.5),
            None => 1.0,
        };
        let ahead = (speed * dt + 120.0).max(200.0);
        let window_start = (current_s - self.options.behind_window_m).max(0.0);
        let window_end = (current_s + ahead).min(self.total);
        let first = find_segment_index(&self.table, window_start).saturating_sub(1);
        let last = find_segment_index(&self.table, window_end).min(self.points.len() - 2);

        let mut best: Option<Candidate> = None;
        let mut candidate_count = 0;
        for i in first..=last {
            let (v, w) = (&self.points[i], &self.points[i + 1]);
            let projection = project_point_to_segment(&position, v, w);
            let along = self.table[i] + projection.distance_along_segment;
            let segment_heading = bearing_deg(v, w);

            let mismatch = heading.map_or(0.0, |h| angle_delta(h, segment_heading));
            let heading_penalty = if mismatch > 90.0 {
                mismatch * self.options.heading_weight * 2.0
            } else {
                mismatch * self.options.heading_weight
            };
            let backtrack_penalty = if along < current_s - BACKTRACK_TOLERANCE_M {
                (current_s - along) * self.options.backtrack_weight
            } else {
                0.0
            };
            let score = projection.distance_to_route + heading_penalty + backtrack_penalty;
            candidate_count += 1;

            if best.as_ref().map_or(true, |b| score < b.score) {
                best = Some(Candidate {
                    score,
                    distance: projection.distance_to_route,
                    along,
                    point: projection.projected_point,
                    heading: segment_heading,
                    segment: i,
                });
            }
        }

        let best = best.unwrap_or_else(|| {
            let segment = self.state.current_segment_index.min(self.points.len() - 1);
            Candidate {
                score: f64::INFINITY,
                distance: f64::INFINITY,
                along: current_s,
                point: self.points[segment],
                heading: heading.unwrap_or(0.0),
                segment,
            }
        });

        let mut next_s = best.along;
        if speed > MOVING_SPEED_MPS && next_s < current_s - MAX_REGRESSION_M {
            next_s = current_s - MAX_REGRESSION_M;
        }
        // Parked: drift away from the line is noise, not progress
        if speed < STATIONARY_SPEED_MPS
            && (next_s - current_s).abs() < 5.0
            && best.distance > self.state.last_distance_to_route + 2.0
        {
            next_s = current_s;
        }
        if best.distance > self.state.last_distance_to_route + 8.0 && (next_s - current_s).abs() < 3.0 {
            next_s = current_s;
        }

        let off_route = self.off_route_status(best.distance, timestamp_ms);
        let rejoin_target = if off_route {
            self.rejoin_target(&position, first, last, current_s)
        } else {
            None
        };

        self.state.current_s = next_s.clamp(0.0, self.total);
        self.state.current_segment_index = best.segment;
        self.state.last_update_ms = Some(timestamp_ms);
        self.state.last_distance_to_route = best.distance;

        LocalizationResult {
            current_s: self.state.current_s,
            current_segment_index: best.segment,
            distance_to_route: best.distance,
            snapped_location: best.point,
            raw_location: position,
            segment_heading: best.heading,
            off_route,
            candidate_count,
            window_start,
            window_end,
            rejoin_target,
        }
    }

    fn off_route_status(&mut self, distance: f64, timestamp_ms: i64) -> bool {
        let instant = distance > INSTANT_OFF_ROUTE_FLOOR_M.max(self.options.off_route_distance_m + 10.0);
        if distance > self.options.off_route_distance_m {
            self.state.off_route_since_ms.get_or_insert(timestamp_ms);
        } else {
            self.state.off_route_since_ms = None;
        }
        let sustained = self
            .state
            .off_route_since_ms
            .is_some_and(|since| timestamp_ms - since >= self.options.off_route_duration_ms);
        let off_route = instant || sustained;

        if off_route != self.state.off_route {
            if off_route {
                info!("Off route: {distance:.0} m from the line");
            } else {
                info!("Back on route");
            }
            self.state.off_route = off_route;
        }
        off_route
    }

    /// Closest projection at least `rejoin_ahead_m` ahead of progress.
    fn rejoin_target(&self, position: &GeoPoint, first: usize, last: usize, current_s: f64) -> Option<GeoPoint> {
        let mut best: Option<(f64, GeoPoint)> = None;
        for i in first..=last {
            let projection = project_point_to_segment(position, &self.points[i], &self.points[i + 1]);
            let along = self.table[i] + projection.distance_along_segment;
            if along < current_s + self.options.rejoin_ahead_m {
                continue;
            }
            if best.map_or(true, |(d, _)| projection.distance_to_route < d) {
                best = Some((projection.distance_to_route, projection.projected_point));
            }
        }
        best.map(|(_, point)| point)
    }

    fn passthrough(&self, position: GeoPoint) -> LocalizationResult {
        LocalizationResult {
            current_s: self.state.current_s,
            current_segment_index: 0,
            distance_to_route: 0.0,
            snapped_location: position,
            raw_location: position,
            segment_heading: 0.0,
            off_route: false,
            candidate_count: 0,
            window_start: 0.0,
            window_end: 0.0,
            rejoin_target: None,
        }
    }
}
