//! Core value types shared by matching, localization and guidance.
//!
//! All coordinates are WGS84 degrees. Along-route distances are meters
//! measured from the first point of the matched polyline.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Build from a `[lon, lat]` pair as used in GeoJSON and service payloads.
    pub fn from_lon_lat(pair: [f64; 2]) -> Self {
        Self { latitude: pair[1], longitude: pair[0] }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

/// Maneuver categories reported by the routing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ManeuverType {
    Depart,
    Arrive,
    Turn,
    Continue,
    NewName,
    Merge,
    OnRamp,
    OffRamp,
    Fork,
    EndOfRoad,
    Roundabout,
    Rotary,
    RoundaboutTurn,
    ExitRoundabout,
    ExitRotary,
    Notification,
    Other(String),
}

impl ManeuverType {
    pub fn as_str(&self) -> &str {
        match self {
            ManeuverType::Depart => "depart",
            ManeuverType::Arrive => "arrive",
            ManeuverType::Turn => "turn",
            ManeuverType::Continue => "continue",
            ManeuverType::NewName => "new name",
            ManeuverType::Merge => "merge",
            ManeuverType::OnRamp => "on ramp",
            ManeuverType::OffRamp => "off ramp",
            ManeuverType::Fork => "fork",
            ManeuverType::EndOfRoad => "end of road",
            ManeuverType::Roundabout => "roundabout",
            ManeuverType::Rotary => "rotary",
            ManeuverType::RoundaboutTurn => "roundabout turn",
            ManeuverType::ExitRoundabout => "exit roundabout",
            ManeuverType::ExitRotary => "exit rotary",
            ManeuverType::Notification => "notification",
            ManeuverType::Other(s) => s,
        }
    }

    pub fn is_roundabout(&self) -> bool {
        matches!(self, ManeuverType::Roundabout | ManeuverType::Rotary)
    }
}

impl From<&str> for ManeuverType {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "depart" => ManeuverType::Depart,
            "arrive" => ManeuverType::Arrive,
            "turn" => ManeuverType::Turn,
            "continue" => ManeuverType::Continue,
            "new name" => ManeuverType::NewName,
            "merge" => ManeuverType::Merge,
            "on ramp" => ManeuverType::OnRamp,
            "off ramp" => ManeuverType::OffRamp,
            "fork" => ManeuverType::Fork,
            "end of road" => ManeuverType::EndOfRoad,
            "roundabout" => ManeuverType::Roundabout,
            "rotary" => ManeuverType::Rotary,
            "roundabout turn" => ManeuverType::RoundaboutTurn,
            "exit roundabout" => ManeuverType::ExitRoundabout,
            "exit rotary" => ManeuverType::ExitRotary,
            "notification" => ManeuverType::Notification,
            _ => ManeuverType::Other(value.to_string()),
        }
    }
}

impl From<String> for ManeuverType {
    fn from(value: String) -> Self {
        ManeuverType::from(value.as_str())
    }
}

impl From<ManeuverType> for String {
    fn from(value: ManeuverType) -> Self {
        value.as_str().to_string()
    }
}

/// The maneuver at a step boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maneuver {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ManeuverType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing_before: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing_after: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<u32>,
}

impl Maneuver {
    pub fn is(&self, kind: &ManeuverType) -> bool {
        self.kind.as_ref() == Some(kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BannerComponent {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_direction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbr_priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BannerText {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<BannerComponent>,
}

/// Visual instruction shown once the step has been travelled for
/// `distance_along_geometry` meters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BannerInstruction {
    #[serde(rename = "distanceAlongGeometry", default)]
    pub distance_along_geometry: f64,
    #[serde(default)]
    pub primary: BannerText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<BannerText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<BannerText>,
}

/// Spoken instruction with its trigger distance along the step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceInstruction {
    #[serde(rename = "distanceAlongGeometry")]
    pub distance_along_geometry: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announcement: Option<String>,
    #[serde(
        default,
        alias = "ssmlAnnouncement",
        skip_serializing_if = "Option::is_none"
    )]
    pub ssml_announcement: Option<String>,
}

/// One maneuver and the stretch of route it covers.
///
/// `step_start_s`/`step_end_s` are along-route distances. Steps coming out
/// of stitching always carry both; steps supplied from elsewhere may not,
/// and are normalized by the instruction engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub maneuver: Maneuver,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub road_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotary_name: Option<String>,
    #[serde(default)]
    pub banner_instructions: Vec<BannerInstruction>,
    #[serde(default)]
    pub voice_instructions: Vec<VoiceInstruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_start_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_end_s: Option<f64>,
    #[serde(default)]
    pub distance: f64,
}

impl Step {
    pub fn exit(&self) -> Option<u32> {
        self.maneuver.exit
    }

    pub fn is_kind(&self, kind: &ManeuverType) -> bool {
        self.maneuver.is(kind)
    }

    /// Roundabout or rotary, judged by the maneuver or the first banner.
    pub fn is_roundabout(&self) -> bool {
        if let Some(kind) = &self.maneuver.kind {
            return kind.is_roundabout();
        }
        self.banner_instructions
            .first()
            .and_then(|b| b.primary.kind.as_deref())
            .map(|t| ManeuverType::from(t).is_roundabout())
            .unwrap_or(false)
    }
}

/// Current unix time in milliseconds, 0 if the clock is before the epoch.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavMeta {
    /// Unix time in milliseconds.
    pub created_at: u64,
    pub profile: String,
    pub radius_m: f64,
    pub chunk_count: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// A matched route ready for guidance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavPackage {
    pub id: String,
    pub original_polyline: Vec<GeoPoint>,
    pub matched_polyline: Vec<GeoPoint>,
    pub cumulative_distances: Vec<f64>,
    pub steps: Vec<Step>,
    pub route_length_m: f64,
    pub start_coord: Option<GeoPoint>,
    pub end_coord: Option<GeoPoint>,
    pub meta: NavMeta,
}
