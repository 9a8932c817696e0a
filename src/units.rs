//! Distance formatting for banners and voice prompts (UK units).

const METERS_PER_MILE: f64 = 1609.344;
const YARDS_PER_METER: f64 = 1.09361;
/// Below this distance, yards are used instead of miles.
const MILES_THRESHOLD_M: f64 = 0.2 * METERS_PER_MILE;

/// Spoken distance: "0.4 miles", "220 yards".
pub fn format_distance_voice_uk(meters: f64) -> String {
    format_uk(meters, "miles", "yards")
}

/// Spoken distance that switches to metres below `metres_under`.
pub fn format_distance_voice_uk_metres_under(meters: f64, metres_under: f64) -> String {
    if meters.is_finite() && metres_under > 0.0 && meters < metres_under {
        return format!("{} metres", meters.round() as i64);
    }
    format_distance_voice_uk(meters)
}

/// Banner distance: "0.4 mi", "220 yd".
pub fn format_distance_display_uk(meters: f64) -> String {
    format_uk(meters, "mi", "yd")
}

fn format_uk(meters: f64, miles_unit: &str, yards_unit: &str) -> String {
    if !meters.is_finite() {
        return String::new();
    }
    if meters >= MILES_THRESHOLD_M {
        return format!("{:.1} {miles_unit}", meters / METERS_PER_MILE);
    }
    let yards = meters * YARDS_PER_METER;
    if yards < 20.0 {
        return format!("{} {yards_unit}", (yards.round() as i64).max(1));
    }
    let rounded = (yards / 10.0).round() as i64 * 10;
    format!("{} {yards_unit}", rounded.max(20))
}

/// "1st", "2nd", "3rd", "4th", "11th", "22nd".
pub fn format_ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (1, r) if r != 11 => "st",
        (2, r) if r != 12 => "nd",
        (3, r) if r != 13 => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}
