//! Encoded polyline codec.
//!
//! Implements the Google encoded-polyline format used by the routing
//! service (`geometries=polyline6` means precision 6). Values are
//! latitude-first, as in the format itself.

use crate::types::GeoPoint;

/// Decode an encoded polyline.
///
/// Returns an error when the string ends inside a value or contains a
/// character outside the encoding alphabet.
pub fn decode_polyline(encoded: &str, precision: u32) -> Result<Vec<GeoPoint>, String> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while index < bytes.len() {
        lat += decode_value(bytes, &mut index)?;
        lon += decode_value(bytes, &mut index)?;
        points.push(GeoPoint {
            latitude: lat as f64 / factor,
            longitude: lon as f64 / factor,
        });
    }

    Ok(points)
}

fn decode_value(bytes: &[u8], index: &mut usize) -> Result<i64, String> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(format!("truncated polyline at byte {}", *index));
        };
        if !(63..=126).contains(&byte) {
            return Err(format!("invalid polyline character at byte {}", *index));
        }
        if shift > 60 {
            return Err(format!("polyline value overflow at byte {}", *index));
        }
        *index += 1;
        let chunk = (byte - 63) as i64;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }
    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

/// Encode points as a polyline string.
pub fn encode_polyline(points: &[GeoPoint], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut out = String::new();
    let mut prev_lat: i64 = 0;
    let mut prev_lon: i64 = 0;

    for p in points {
        let lat = (p.latitude * factor).round() as i64;
        let lon = (p.longitude * factor).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lon - prev_lon, &mut out);
        prev_lat = lat;
        prev_lon = lon;
    }

    out
}

fn encode_value(value: i64, out: &mut String) {
    let mut v = if value < 0 { !(value << 1) } else { value << 1 };
    while v >= 0x20 {
        out.push((((v & 0x1f) | 0x20) as u8 + 63) as char);
        v >>= 5;
    }
    out.push((v as u8 + 63) as char);
}
