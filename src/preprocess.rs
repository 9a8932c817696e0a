//! Route preprocessing before map matching.
//!
//! Recorded paths are dense and noisy. Before they are sent to the
//! matching service they are deduplicated, downsampled (keeping turn
//! points even when they are close together) and split into overlapping
//! chunks that respect the service's per-request point limit.

use crate::geometry::{angle_delta, bearing_deg, distance_m};
use crate::types::GeoPoint;

/// Drop points that are within `threshold_m` of the last kept point.
///
/// The first point is always kept.
pub fn remove_duplicate_coords(points: &[GeoPoint], threshold_m: f64) -> Vec<GeoPoint> {
    let Some(first) = points.first() else {
        return Vec::new();
    };

    let mut cleaned = vec![*first];
    for p in &points[1..] {
        let last = cleaned[cleaned.len() - 1];
        if distance_m(&last, p) > threshold_m {
            cleaned.push(*p);
        }
    }
    cleaned
}

/// Thin a route to roughly `min_gap_m` spacing without losing turns.
///
/// First and last points are always kept. An intermediate point is kept
/// when it is at least `min_gap_m` from the last kept point, or when the
/// bearing changes by at least `bearing_threshold_deg` there.
pub fn downsample_route(
    points: &[GeoPoint],
    min_gap_m: f64,
    bearing_threshold_deg: f64,
) -> Vec<GeoPoint> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let mut sampled = vec![points[0]];
    let mut last_kept = 0;

    for i in 1..points.len() - 1 {
        let prev = &points[last_kept];
        let current = &points[i];
        let next = &points[i + 1];

        let gap = distance_m(prev, current);
        let turn = angle_delta(bearing_deg(prev, current), bearing_deg(current, next));

        if gap >= min_gap_m || turn >= bearing_threshold_deg {
            sampled.push(*current);
            last_kept = i;
        }
    }

    sampled.push(points[points.len() - 1]);
    sampled
}

/// Split a route into windows of at most `max_points` points.
///
/// Each window after the first starts `overlap` points before the end of
/// the previous one so the matched results can be stitched back together.
pub fn create_chunks(points: &[GeoPoint], max_points: usize, overlap: usize) -> Vec<Vec<GeoPoint>> {
    let max_points = max_points.max(2);
    if points.len() <= max_points {
        return vec![points.to_vec()];
    }

    // Windows must advance even with a misconfigured overlap
    let overlap = overlap.min(max_points - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + max_points).min(points.len());
        chunks.push(points[start..end].to_vec());
        if end == points.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    fn line(n: usize) -> Vec<GeoPoint> {
        (0..n).map(|i| pt(0.0, i as f64 * 0.0001)).collect()
    }

    #[test]
    fn duplicates_are_removed() {
        let points = vec![
            pt(0.0, 0.0),
            pt(0.0, 0.000001), // ~0.1 m
            pt(0.0, 0.0001),   // ~11 m
            pt(0.0, 0.0001),
        ];
        let cleaned = remove_duplicate_coords(&points, 2.0);
        assert_eq!(cleaned, vec![pt(0.0, 0.0), pt(0.0, 0.0001)]);
        assert!(remove_duplicate_coords(&[], 2.0).is_empty());
    }

    #[test]
    fn downsample_keeps_endpoints_and_turns() {
        let coords = vec![
            pt(0.0, 0.0),
            pt(0.0, 0.001),
            pt(0.0, 0.002),
            pt(0.001, 0.002), // corner at index 2
            pt(0.002, 0.002),
        ];
        let sampled = downsample_route(&coords, 10.0, 15.0);
        assert_eq!(sampled[0], coords[0]);
        assert_eq!(sampled[sampled.len() - 1], coords[coords.len() - 1]);
        assert!(sampled.contains(&pt(0.0, 0.002)));
    }

    #[test]
    fn downsample_keeps_short_turns() {
        // 3 m spacing, far below the gap, with a right angle in the middle
        let coords = vec![
            pt(0.0, 0.0),
            pt(0.0, 0.000027),
            pt(0.0, 0.000054),
            pt(0.000027, 0.000054),
            pt(0.000054, 0.000054),
        ];
        let sampled = downsample_route(&coords, 15.0, 20.0);
        assert!(sampled.contains(&coords[2]), "corner dropped: {sampled:?}");
        assert!(!sampled.contains(&coords[1]));
    }

    #[test]
    fn downsample_short_input_unchanged() {
        let coords = vec![pt(0.0, 0.0), pt(0.0, 0.00001)];
        assert_eq!(downsample_route(&coords, 100.0, 20.0), coords);
    }

    #[test]
    fn single_chunk_when_route_fits() {
        let points = line(100);
        let chunks = create_chunks(&points, 100, 4);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], points);
    }

    #[test]
    fn chunk_count_and_overlap() {
        for (n, max, overlap) in [(101, 100, 4), (196, 100, 4), (197, 100, 4), (250, 100, 4), (1000, 25, 3)] {
            let points = line(n);
            let chunks = create_chunks(&points, max, overlap);
            let expected = (n - overlap).div_ceil(max - overlap);
            assert_eq!(chunks.len(), expected, "n={n} max={max} overlap={overlap}");
            assert!(chunks.iter().all(|c| c.len() <= max));
            for pair in chunks.windows(2) {
                let tail = &pair[0][pair[0].len() - overlap..];
                assert_eq!(tail, &pair[1][..overlap]);
            }
            assert_eq!(chunks[chunks.len() - 1].last(), points.last());
        }
    }

    #[test]
    fn pipeline_respects_point_limit() {
        let coords: Vec<GeoPoint> = (0..220).map(|i| pt(0.0, i as f64 * 0.00001)).collect();
        let cleaned = remove_duplicate_coords(&coords, 1.0);
        let sampled = downsample_route(&cleaned, 0.5, 10.0);
        let chunks = create_chunks(&sampled, 100, 4);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 100));
    }
}
