//! Rendered vehicle marker smoothing.
//!
//! Turns noisy fixes into a stable on-screen position and heading. Close
//! to the guiding line the marker sits on it; it only falls back to raw
//! GPS after the fix has stayed well away from the line for a while.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geometry::{bearing_along_route, coord_at_distance, lerp_angle_deg, lerp_coord, RouteProgress};
use crate::localizer::{LocalizationResult, RouteLocalizer};
use crate::types::GeoPoint;

/// Route heading is taken between these two look-ahead distances.
const HEADING_LOOKAHEAD_A_M: f64 = 5.0;
const HEADING_LOOKAHEAD_B_M: f64 = 15.0;
/// The pre-route leg counts as off-route beyond this distance.
pub const START_OFF_ROUTE_M: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MarkerOptions {
    pub soft_snap_m: f64,
    pub hard_raw_m: f64,
    pub raw_after_ms: i64,
    pub heading_alpha: f64,
    pub freeze_speed_mps: f64,
}

impl Default for MarkerOptions {
    fn default() -> Self {
        Self {
            soft_snap_m: 60.0,
            hard_raw_m: 100.0,
            raw_after_ms: 4000,
            heading_alpha: 0.15,
            freeze_speed_mps: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerMode {
    Snapped,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CarMarkerState {
    pub coordinate: GeoPoint,
    pub heading: f64,
    pub raw_heading: Option<f64>,
    pub route_heading: Option<f64>,
    pub mode: MarkerMode,
    pub speed_mps: f64,
    pub heading_frozen: bool,
    pub distance_to_route: Option<f64>,
    pub segment_index: Option<usize>,
    pub along_s: Option<f64>,
}

/// One raw fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerInput {
    pub position: GeoPoint,
    pub heading: Option<f64>,
    pub speed_mps: f64,
    pub timestamp_ms: i64,
}

/// The line the marker should follow this tick and where the fix sits on it.
#[derive(Debug, Clone, Copy)]
pub struct MarkerGuide<'a> {
    pub route: &'a [GeoPoint],
    pub table: &'a [f64],
    pub along_s: f64,
    pub distance_to_route: f64,
    pub snapped_point: GeoPoint,
    pub segment_index: usize,
    pub off_route: bool,
}

impl<'a> MarkerGuide<'a> {
    /// Guide from the active route's localization.
    pub fn on_route(localizer: &'a RouteLocalizer, result: &LocalizationResult) -> Self {
        Self {
            route: localizer.route(),
            table: localizer.cumulative_distances(),
            along_s: result.current_s,
            distance_to_route: result.distance_to_route,
            snapped_point: result.snapped_location,
            segment_index: result.current_segment_index,
            off_route: result.off_route,
        }
    }

    /// Guide from progress along the leg toward the route start.
    pub fn toward_start(route: &'a [GeoPoint], table: &'a [f64], progress: &RouteProgress) -> Self {
        Self {
            route,
            table,
            along_s: progress.along_s,
            distance_to_route: progress.distance_to_route,
            snapped_point: progress.snapped_point,
            segment_index: progress.segment_index,
            off_route: progress.distance_to_route > START_OFF_ROUTE_M,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkerFilter {
    options: MarkerOptions,
    coordinate: Option<GeoPoint>,
    heading: Option<f64>,
    last_stable_heading: Option<f64>,
    far_since_ms: Option<i64>,
    mode: Option<MarkerMode>,
}

impl MarkerFilter {
    pub fn new(options: MarkerOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn update(&mut self, input: &MarkerInput, guide: Option<&MarkerGuide<'_>>) -> CarMarkerState {
        let speed = if input.speed_mps.is_finite() { input.speed_mps.max(0.0) } else { 0.0 };
        let raw_heading = input.heading.filter(|h| h.is_finite());
        let guide = guide.filter(|g| g.route.len() >= 2);

        let (route_heading, on_line) = match guide {
            Some(g) => (
                bearing_along_route(g.route, g.table, g.along_s, HEADING_LOOKAHEAD_A_M, HEADING_LOOKAHEAD_B_M),
                (g.table.len() == g.route.len())
                    .then(|| coord_at_distance(g.route, g.table, g.along_s))
                    .flatten(),
            ),
            None => (None, None),
        };

        let (mode, target) = match guide {
            None => {
                self.far_since_ms = None;
                (MarkerMode::Raw, input.position)
            }
            Some(g) => {
                let snapped = on_line.unwrap_or(g.snapped_point);
                if g.distance_to_route <= self.options.soft_snap_m {
                    self.far_since_ms = None;
                    (MarkerMode::Snapped, snapped)
                } else {
                    let since = *self.far_since_ms.get_or_insert(input.timestamp_ms);
                    let sustained = input.timestamp_ms - since >= self.options.raw_after_ms;
                    if sustained && g.distance_to_route >= self.options.hard_raw_m {
                        (MarkerMode::Raw, input.position)
                    } else {
                        (MarkerMode::Snapped, snapped)
                    }
                }
            }
        };
        if self.mode != Some(mode) {
            debug!("marker mode {:?} -> {mode:?}", self.mode);
            self.mode = Some(mode);
        }

        let mut target_heading = raw_heading.or(self.heading).unwrap_or(0.0);
        let heading_frozen = speed < self.options.freeze_speed_mps;
        if heading_frozen {
            if let Some(h) = self.last_stable_heading.or(route_heading) {
                target_heading = h;
            }
        } else if let Some(h) = route_heading.or(raw_heading) {
            target_heading = h;
            self.last_stable_heading = Some(h);
        }
        let off_route = guide.is_some_and(|g| g.off_route);
        if off_route && mode == MarkerMode::Raw {
            if let Some(h) = self.last_stable_heading {
                target_heading = h;
            }
        }

        let coordinate = if mode == MarkerMode::Snapped && on_line.is_some() {
            target
        } else {
            let alpha = if speed < 3.0 {
                0.15
            } else if speed < 10.0 {
                0.25
            } else {
                0.35
            };
            lerp_coord(&self.coordinate.unwrap_or(target), &target, alpha)
        };
        let heading = lerp_angle_deg(self.heading.unwrap_or(target_heading), target_heading, self.options.heading_alpha);

        self.coordinate = Some(coordinate);
        self.heading = Some(heading);

        CarMarkerState {
            coordinate,
            heading,
            raw_heading,
            route_heading,
            mode,
            speed_mps: speed,
            heading_frozen,
            distance_to_route: guide.map(|g| g.distance_to_route),
            segment_index: guide.map(|g| g.segment_index),
            along_s: guide.map(|g| g.along_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{cumulative_distances, distance_m, offset_coord_by_meters, route_progress};
    use crate::localizer::LocalizerOptions;
    use crate::route_nav::{nav_package_from_route, PackageSource};

    fn pt(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    fn east(m: f64) -> GeoPoint {
        offset_coord_by_meters(&pt(0.0, 0.0), 90.0, m)
    }

    fn input(position: GeoPoint, heading: Option<f64>, speed: f64, ts: i64) -> MarkerInput {
        MarkerInput {
            position,
            heading,
            speed_mps: speed,
            timestamp_ms: ts,
        }
    }

    fn guide<'a>(route: &'a [GeoPoint], table: &'a [f64], along: f64, distance: f64) -> MarkerGuide<'a> {
        MarkerGuide {
            route,
            table,
            along_s: along,
            distance_to_route: distance,
            snapped_point: east(along),
            segment_index: 0,
            off_route: distance > 40.0,
        }
    }

    fn route() -> (Vec<GeoPoint>, Vec<f64>) {
        let points: Vec<GeoPoint> = (0..=10).map(|k| east(k as f64 * 100.0)).collect();
        let table = cumulative_distances(&points);
        (points, table)
    }

    #[test]
    fn snapped_marker_sits_on_the_line() {
        let points: Vec<GeoPoint> = (0..=10).map(|k| east(k as f64 * 100.0)).collect();
        let pkg = nav_package_from_route(&points, Vec::new(), PackageSource::Local);
        let mut loc = RouteLocalizer::new(&pkg, LocalizerOptions::default());
        let fix = offset_coord_by_meters(&east(100.0), 0.0, 10.0);
        let result = loc.update(fix, Some(90.0), 8.0, 0);

        let mut filter = MarkerFilter::default();
        let marker = filter.update(&input(fix, Some(90.0), 8.0, 0), Some(&MarkerGuide::on_route(&loc, &result)));

        assert_eq!(marker.mode, MarkerMode::Snapped);
        assert!(distance_m(&marker.coordinate, &east(100.0)) < 0.5);
        let route_heading = marker.route_heading.unwrap();
        assert!((route_heading - 90.0).abs() < 0.1, "route heading {route_heading}");
        assert!((marker.heading - 90.0).abs() < 0.1);
    }

    #[test]
    fn far_fix_needs_to_persist_before_raw() {
        let (points, table) = route();
        let mut filter = MarkerFilter::default();
        let fix = offset_coord_by_meters(&east(300.0), 0.0, 150.0);

        let g = guide(&points, &table, 300.0, 150.0);
        assert_eq!(filter.update(&input(fix, None, 10.0, 0), Some(&g)).mode, MarkerMode::Snapped);
        assert_eq!(filter.update(&input(fix, None, 10.0, 3000), Some(&g)).mode, MarkerMode::Snapped);
        let raw = filter.update(&input(fix, None, 10.0, 4000), Some(&g));
        assert_eq!(raw.mode, MarkerMode::Raw);

        // Back near the line snaps immediately
        let g = guide(&points, &table, 300.0, 20.0);
        assert_eq!(filter.update(&input(east(300.0), None, 10.0, 5000), Some(&g)).mode, MarkerMode::Snapped);
    }

    #[test]
    fn moderate_offset_stays_snapped() {
        let (points, table) = route();
        let mut filter = MarkerFilter::default();
        let g = guide(&points, &table, 200.0, 80.0);
        for ts in (0..20_000).step_by(1000) {
            let fix = offset_coord_by_meters(&east(200.0), 0.0, 80.0);
            assert_eq!(filter.update(&input(fix, None, 5.0, ts), Some(&g)).mode, MarkerMode::Snapped);
        }
    }

    #[test]
    fn heading_freezes_when_slow() {
        let (points, table) = route();
        let mut filter = MarkerFilter::default();
        let g = guide(&points, &table, 200.0, 2.0);
        let moving = filter.update(&input(east(200.0), Some(90.0), 10.0, 0), Some(&g));
        assert!(!moving.heading_frozen);

        let parked = filter.update(&input(east(200.0), Some(0.0), 0.2, 1000), Some(&g));
        assert!(parked.heading_frozen);
        assert!((parked.heading - moving.heading).abs() < 0.1);
    }

    #[test]
    fn raw_mode_lerps_position_and_heading() {
        let mut filter = MarkerFilter::default();
        let first = filter.update(&input(pt(0.0, 0.0), Some(0.0), 2.0, 0), None);
        assert_eq!(first.mode, MarkerMode::Raw);
        assert_eq!(first.coordinate, pt(0.0, 0.0));
        assert_eq!(first.heading, 0.0);

        let second = filter.update(&input(pt(0.0, 0.001), Some(90.0), 2.0, 1000), None);
        assert!((second.coordinate.longitude - 0.00015).abs() < 1e-12);
        assert!((second.heading - 13.5).abs() < 1e-9);

        // Faster movement takes bigger steps
        let third = filter.update(&input(pt(0.0, 0.001), Some(90.0), 12.0, 2000), None);
        let expected = 0.00015 + (0.001 - 0.00015) * 0.35;
        assert!((third.coordinate.longitude - expected).abs() < 1e-12);
    }

    #[test]
    fn start_leg_guide_uses_route_progress() {
        let leg = vec![pt(0.0, 0.0), pt(0.0, 0.002)];
        let table = cumulative_distances(&leg);
        let fix = offset_coord_by_meters(&pt(0.0, 0.001), 0.0, 70.0);
        let progress = route_progress(&fix, &leg, &table, None).unwrap();
        let g = MarkerGuide::toward_start(&leg, &table, &progress);
        assert!(g.off_route);

        let mut filter = MarkerFilter::default();
        let marker = filter.update(&input(fix, None, 4.0, 0), Some(&g));
        assert_eq!(marker.mode, MarkerMode::Snapped);
        assert!((marker.along_s.unwrap() - table[1] / 2.0).abs() < 1.0);
    }
}
