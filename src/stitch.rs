//! Stitching per-chunk matching results into one continuous route.
//!
//! Matched geometry from different requests is never bit-identical, even
//! for the same input points, so overlap is detected by distance rather
//! than by coordinate equality.

use crate::geometry::{distance_m, project_point_to_segment};
use crate::types::{GeoPoint, ManeuverType, Step};

/// Points of an incoming chunk within this distance of the stitched
/// path's last point are treated as overlap.
pub const POLYLINE_OVERLAP_M: f64 = 6.0;

/// Length of the stitched tail an incoming chunk's leading overlap may
/// retrace.
pub const OVERLAP_TAIL_M: f64 = 1000.0;

/// Maneuvers closer than this to the previous kept maneuver are duplicates.
pub const DUPLICATE_MANEUVER_M: f64 = 10.0;

/// Concatenate chunk polylines, dropping each chunk's leading overlap.
///
/// A chunk's overlap is its leading run of points lying on the last
/// [`OVERLAP_TAIL_M`] of the stitched path, up to and including the points
/// within [`POLYLINE_OVERLAP_M`] of the stitched end. A chunk whose first
/// point is off the stitched tail is appended whole, even if it later
/// passes through the stitched end.
pub fn stitch_polylines(polylines: &[Vec<GeoPoint>]) -> Vec<GeoPoint> {
    let mut stitched: Vec<GeoPoint> = Vec::new();

    for poly in polylines.iter().filter(|p| !p.is_empty()) {
        let Some(last) = stitched.last().copied() else {
            stitched.extend_from_slice(poly);
            continue;
        };
        let near = |p: &GeoPoint| distance_m(&last, p) <= POLYLINE_OVERLAP_M;
        let start = match leading_overlap_anchor(poly, &stitched, &near) {
            Some(anchor) => poly[anchor..]
                .iter()
                .position(|p| !near(p))
                .map_or(poly.len(), |offset| anchor + offset),
            None => 0,
        };
        stitched.extend_from_slice(&poly[start..]);
    }

    stitched
}

/// Index of the first point near the stitched end, provided every point
/// before it retraces the stitched tail.
fn leading_overlap_anchor(
    poly: &[GeoPoint],
    stitched: &[GeoPoint],
    near: impl Fn(&GeoPoint) -> bool,
) -> Option<usize> {
    for (i, p) in poly.iter().enumerate() {
        if near(p) {
            return Some(i);
        }
        if !on_stitched_tail(p, stitched) {
            return None;
        }
    }
    None
}

fn on_stitched_tail(p: &GeoPoint, stitched: &[GeoPoint]) -> bool {
    let mut walked = 0.0;
    for w in stitched.windows(2).rev() {
        if project_point_to_segment(p, &w[0], &w[1]).distance_to_route <= POLYLINE_OVERLAP_M {
            return true;
        }
        walked += distance_m(&w[0], &w[1]);
        if walked > OVERLAP_TAIL_M {
            break;
        }
    }
    false
}

/// Merge chunk-local steps into one sequence with global step ranges.
///
/// Drops `depart` steps after the first kept step, `arrive` steps in all
/// but the last chunk, and maneuvers within [`DUPLICATE_MANEUVER_M`] of the
/// previous kept one. Each chunk's offset is anchored on its first kept
/// step so `step_end_s` never decreases across chunk boundaries.
pub fn stitch_steps(chunk_steps: &[Vec<Step>]) -> Vec<Step> {
    let chunk_count = chunk_steps.len();
    let mut stitched: Vec<Step> = Vec::new();
    let mut running_total = 0.0;

    for (chunk_idx, steps) in chunk_steps.iter().enumerate() {
        let mut local_running = 0.0;
        let mut chunk_offset: Option<f64> = None;
        let mut last_location = stitched.last().and_then(|s| s.maneuver.location);

        for step in steps {
            let distance = if step.distance.is_finite() { step.distance.max(0.0) } else { 0.0 };
            let start_local = local_running;
            let end_local = start_local + distance;
            local_running = end_local;

            if step.is_kind(&ManeuverType::Depart) && !stitched.is_empty() {
                continue;
            }
            if step.is_kind(&ManeuverType::Arrive) && chunk_idx + 1 < chunk_count {
                continue;
            }
            if let (Some(prev), Some(here)) = (last_location, step.maneuver.location) {
                if distance_m(&prev, &here) < DUPLICATE_MANEUVER_M {
                    continue;
                }
            }

            let offset = *chunk_offset.get_or_insert(running_total - start_local);
            let mut kept = step.clone();
            kept.index = stitched.len();
            kept.step_start_s = Some(offset + start_local);
            kept.step_end_s = Some(offset + end_local);
            if let Some(here) = step.maneuver.location {
                last_location = Some(here);
            }
            stitched.push(kept);
        }

        if chunk_offset.is_some() {
            if let Some(end) = stitched.last().and_then(|s| s.step_end_s) {
                running_total = end;
            }
        }
    }

    stitched
}

/// True if any adjacent pair is farther apart than `threshold_m`, or the
/// line has fewer than 2 points.
pub fn has_large_gap(points: &[GeoPoint], threshold_m: f64) -> bool {
    if points.len() < 2 {
        return true;
    }
    points.windows(2).any(|w| distance_m(&w[0], &w[1]) > threshold_m)
}
