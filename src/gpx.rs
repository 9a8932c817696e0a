//! GPX 1.1 input for recorded paths.
//!
//! Wraps the `gpx` crate. A recording becomes one flat coordinate list:
//! every track segment in file order, or the route points when the file
//! has no track points at all.

use std::io::Read;

use crate::types::GeoPoint;

/// Read a recorded path from any reader.
pub fn parse<R: Read>(reader: R) -> Result<Vec<GeoPoint>, String> {
    let gpx = gpx::read(reader).map_err(|e| format!("GPX parse error: {e}"))?;

    let tracked: Vec<GeoPoint> = gpx
        .tracks
        .iter()
        .flat_map(|t| t.segments.iter())
        .flat_map(|seg| seg.points.iter())
        .map(|wp| GeoPoint::new(wp.point().y(), wp.point().x()))
        .collect();
    if !tracked.is_empty() {
        return Ok(tracked);
    }

    Ok(gpx
        .routes
        .iter()
        .flat_map(|r| r.points.iter())
        .map(|wp| GeoPoint::new(wp.point().y(), wp.point().x()))
        .collect())
}

/// Parse a recorded path from raw file bytes. Convenience wrapper for JNI.
pub fn parse_path(data: &[u8]) -> Result<Vec<GeoPoint>, String> {
    parse(data)
}

/// Parse a recorded path and return it as a JSON coordinate list.
pub fn parse_path_to_json(data: &[u8]) -> Result<String, String> {
    let points = parse_path(data)?;
    serde_json::to_string(&points).map_err(|e| format!("JSON serialize error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    fn close(a: &GeoPoint, b: &GeoPoint) -> bool {
        (a.latitude - b.latitude).abs() < 1e-6 && (a.longitude - b.longitude).abs() < 1e-6
    }

    const RECORDING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test"
     xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <name>Morning drive</name>
    <trkseg>
      <trkpt lat="51.5007" lon="-0.1246"><ele>12</ele></trkpt>
      <trkpt lat="51.5010" lon="-0.1240"><ele>13</ele></trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="51.5020" lon="-0.1230"></trkpt>
    </trkseg>
  </trk>
  <rte>
    <rtept lat="51.4000" lon="-0.2000"></rtept>
    <rtept lat="51.4100" lon="-0.2100"></rtept>
  </rte>
</gpx>"#;

    #[test]
    fn tracks_are_flattened_in_order() {
        let points = parse_path(RECORDING.as_bytes()).unwrap();
        assert_eq!(points.len(), 3);
        assert!(close(&points[0], &pt(51.5007, -0.1246)));
        assert!(close(&points[2], &pt(51.5020, -0.1230)));
    }

    #[test]
    fn route_points_when_no_tracks() {
        let gpx = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test"
     xmlns="http://www.topografix.com/GPX/1/1">
  <rte>
    <name>Planned</name>
    <rtept lat="48.2000" lon="16.3500"></rtept>
    <rtept lat="48.2100" lon="16.3600"></rtept>
  </rte>
</gpx>"#;

        let points = parse_path(gpx.as_bytes()).unwrap();
        assert_eq!(points.len(), 2);
        assert!(close(&points[1], &pt(48.21, 16.36)));
    }

    #[test]
    fn empty_gpx_is_empty_path() {
        let empty = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test"
     xmlns="http://www.topografix.com/GPX/1/1">
</gpx>"#;

        assert!(parse_path(empty.as_bytes()).unwrap().is_empty());
    }

    #[test]
    fn invalid_xml_returns_error() {
        let result = parse_path(b"not xml at all");
        assert!(result.unwrap_err().starts_with("GPX parse error"));
    }

    #[test]
    fn json_output_is_coordinate_list() {
        let json = parse_path_to_json(RECORDING.as_bytes()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(3));
        assert!(parsed[0]["latitude"].is_number());
    }
}
