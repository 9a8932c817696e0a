//! Directions requests: the fallback when map matching fails, and
//! reroute/rejoin requests while off route.

use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info};
use reqwest::Url;

use crate::error::{ErrorCode, MatchError, Result};
use crate::geometry::normalize_deg;
use crate::matching::{MatchingOptions, Profile, VoiceUnits};
use crate::service::{decode_geometry, fetch_with_retry, normalize_steps, parse_body, status_error, DirectionsResponse, Transport};
use crate::types::{GeoPoint, Step};

/// Via points beyond this are dropped to stay under the waypoint cap.
pub const MAX_VIA_POINTS: usize = 20;
/// Waypoints sampled from a recorded path for the fallback request.
pub const MAX_SAMPLED_WAYPOINTS: usize = 23;
pub const DEFAULT_BEARING_TOLERANCE_DEG: f64 = 45.0;
/// Origin radius used when a bearing is given without explicit radiuses.
pub const DEFAULT_ORIGIN_RADIUS_M: f64 = 25.0;
pub const REROUTE_MIN_GAP: Duration = Duration::from_secs(8);
pub const REROUTE_AVOID_MANEUVER_RADIUS_M: f64 = 200.0;

/// Heading constraint for one coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bearing {
    pub angle: f64,
    pub tolerance: f64,
}

impl Bearing {
    pub fn new(angle: f64) -> Self {
        Self {
            angle,
            tolerance: DEFAULT_BEARING_TOLERANCE_DEG,
        }
    }

    fn param(&self) -> String {
        let angle = if self.angle.is_finite() { normalize_deg(self.angle).round() % 360.0 } else { 0.0 };
        let tolerance = self.tolerance.clamp(0.0, 180.0).round();
        format!("{angle},{tolerance}")
    }
}

/// Per-segment annotations to request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Annotations {
    /// Nothing, or congestion data on the traffic profile.
    #[default]
    Auto,
    Basic,
    Custom(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct DirectionsRequest {
    pub coordinates: Vec<GeoPoint>,
    pub profile: Profile,
    pub language: String,
    pub voice_units: VoiceUnits,
    pub annotations: Annotations,
    /// Aligned with `coordinates`; missing entries are unconstrained.
    pub bearings: Vec<Option<Bearing>>,
    /// Aligned with `coordinates`; `None` entries are unlimited.
    pub radiuses: Option<Vec<Option<f64>>>,
    pub avoid_maneuver_radius_m: Option<f64>,
    pub access_token: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl DirectionsRequest {
    /// Route from `start` through up to [`MAX_VIA_POINTS`] vias to `end`.
    pub fn new(start: GeoPoint, via: &[GeoPoint], end: GeoPoint, options: &MatchingOptions, token: &str) -> Self {
        let mut coordinates = Vec::with_capacity(via.len().min(MAX_VIA_POINTS) + 2);
        coordinates.push(start);
        coordinates.extend(via.iter().take(MAX_VIA_POINTS).copied());
        coordinates.push(end);
        Self {
            coordinates,
            profile: options.profile,
            language: options.language.clone(),
            voice_units: options.voice_units,
            annotations: Annotations::Auto,
            bearings: Vec::new(),
            radiuses: None,
            avoid_maneuver_radius_m: None,
            access_token: token.to_string(),
            base_url: options.base_url.clone(),
            timeout: options.timeout(),
        }
    }

    /// Request back onto the route from the current position.
    ///
    /// The heading constrains the departure direction and maneuvers right
    /// at the origin are avoided.
    pub fn reroute(
        position: GeoPoint,
        heading: Option<f64>,
        target: GeoPoint,
        via: &[GeoPoint],
        options: &MatchingOptions,
        token: &str,
    ) -> Self {
        let mut request = Self::new(position, via, target, options, token);
        request.bearings = vec![heading.filter(|h| h.is_finite()).map(Bearing::new)];
        request.avoid_maneuver_radius_m = Some(REROUTE_AVOID_MANEUVER_RADIUS_M);
        request
    }

    fn annotations_param(&self) -> Option<String> {
        match &self.annotations {
            Annotations::Custom(list) if !list.is_empty() => Some(list.join(",")),
            Annotations::Custom(_) => None,
            Annotations::Basic => Some("duration,distance,speed".to_string()),
            Annotations::Auto if self.profile == Profile::DrivingTraffic => {
                Some("duration,distance,speed,congestion".to_string())
            }
            Annotations::Auto => None,
        }
    }

    fn bearings_param(&self) -> Option<String> {
        if self.bearings.iter().all(Option::is_none) {
            return None;
        }
        let values: Vec<String> = (0..self.coordinates.len())
            .map(|i| match self.bearings.get(i).copied().flatten() {
                Some(b) => b.param(),
                None => String::new(),
            })
            .collect();
        Some(values.join(";"))
    }

    fn radiuses_param(&self) -> Option<String> {
        let has_bearing = self.bearings.iter().any(Option::is_some);
        let values: Vec<String> = match &self.radiuses {
            Some(radiuses) => (0..self.coordinates.len())
                .map(|i| format_radius(radiuses.get(i).copied().flatten()))
                .collect(),
            None if has_bearing => (0..self.coordinates.len())
                .map(|i| format_radius((i == 0).then_some(DEFAULT_ORIGIN_RADIUS_M)))
                .collect(),
            None => return None,
        };
        Some(values.join(";"))
    }
}

fn format_radius(radius: Option<f64>) -> String {
    match radius.filter(|r| r.is_finite()) {
        Some(r) => format!("{}", r.max(0.0).round()),
        None => "unlimited".to_string(),
    }
}

pub fn build_directions_url(request: &DirectionsRequest) -> Result<String> {
    if request.coordinates.len() < 2 {
        return Err(MatchError::new(ErrorCode::Invalid, "Directions need at least two coordinates."));
    }
    let coords = request
        .coordinates
        .iter()
        .map(|p| format!("{:.6},{:.6}", p.longitude, p.latitude))
        .collect::<Vec<_>>()
        .join(";");
    let base = request.base_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/directions/v5/mapbox/{}/{coords}", request.profile.as_str()))
        .map_err(|e| MatchError::new(ErrorCode::Invalid, format!("Invalid directions URL: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("steps", "true")
            .append_pair("overview", "full")
            .append_pair("geometries", "polyline6")
            .append_pair("banner_instructions", "true")
            .append_pair("voice_instructions", "true")
            .append_pair("roundabout_exits", "true")
            .append_pair("voice_units", request.voice_units.as_str())
            .append_pair("language", &request.language);
        if let Some(annotations) = request.annotations_param() {
            query.append_pair("annotations", &annotations);
        }
        if let Some(bearings) = request.bearings_param() {
            query.append_pair("bearings", &bearings);
        }
        if let Some(radiuses) = request.radiuses_param() {
            query.append_pair("radiuses", &radiuses);
        }
        if let Some(radius) = request.avoid_maneuver_radius_m.filter(|r| r.is_finite()) {
            query.append_pair("avoid_maneuver_radius", &format!("{}", radius.max(0.0).round()));
        }
        query.append_pair("access_token", &request.access_token);
    }

    Ok(url.into())
}

/// First route returned by the directions service.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionsRoute {
    pub polyline: Vec<GeoPoint>,
    /// Steps without along-route ranges.
    pub steps: Vec<Step>,
    pub distance_m: Option<f64>,
    pub duration_s: Option<f64>,
}

pub async fn fetch_directions<T: Transport>(transport: &T, request: &DirectionsRequest) -> Result<DirectionsRoute> {
    let url = build_directions_url(request)?;
    let body = fetch_with_retry(transport, &url, request.timeout).await?;
    let response: DirectionsResponse = parse_body(&body)?;

    if let Some(code) = response.code.as_deref().filter(|c| *c != "Ok") {
        return Err(status_error(code, response.message.as_deref()));
    }
    let route = response
        .routes
        .first()
        .ok_or_else(|| MatchError::new(ErrorCode::Empty, "No routes returned."))?;

    let polyline = decode_geometry(route.geometry.as_ref())?;
    let steps = normalize_steps(&route.legs);
    debug!("Directions returned {} points, {} steps", polyline.len(), steps.len());

    Ok(DirectionsRoute {
        polyline,
        steps,
        distance_m: route.distance,
        duration_s: route.duration,
    })
}

/// Evenly spaced waypoints from a path, always ending on its last point.
pub fn sample_waypoints(points: &[GeoPoint], max_points: usize) -> Vec<GeoPoint> {
    if points.len() <= max_points.max(2) {
        return points.to_vec();
    }
    let step = points.len().div_ceil(max_points.max(1));
    let mut sampled: Vec<GeoPoint> = points.iter().step_by(step).copied().collect();
    if (points.len() - 1) % step != 0 {
        sampled.extend(points.last().copied());
    }
    sampled
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: bool,
    last_attempt_ms: Option<i64>,
}

/// Admits at most one reroute at a time, spaced by a minimum gap.
#[derive(Debug)]
pub struct RerouteGate {
    min_gap_ms: i64,
    state: Mutex<GateState>,
}

impl Default for RerouteGate {
    fn default() -> Self {
        Self::new(REROUTE_MIN_GAP)
    }
}

impl RerouteGate {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap_ms: i64::try_from(min_gap.as_millis()).unwrap_or(i64::MAX),
            state: Mutex::new(GateState::default()),
        }
    }

    /// Start an attempt at `now_ms`, or `None` if one is running or the
    /// last one started too recently. The attempt ends when the guard drops.
    pub fn try_begin(&self, now_ms: i64) -> Option<RerouteGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.in_flight {
            return None;
        }
        if let Some(last) = state.last_attempt_ms {
            if now_ms.saturating_sub(last) < self.min_gap_ms {
                return None;
            }
        }
        state.in_flight = true;
        state.last_attempt_ms = Some(now_ms);
        Some(RerouteGuard { gate: self })
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().map(|s| s.in_flight).unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct RerouteGuard<'a> {
    gate: &'a RerouteGate,
}

impl Drop for RerouteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight = false;
    }
}

/// Fetch a reroute if the gate admits one. `None` means skipped.
pub async fn fetch_reroute<T: Transport>(
    transport: &T,
    gate: &RerouteGate,
    now_ms: i64,
    request: &DirectionsRequest,
) -> Option<Result<DirectionsRoute>> {
    let _guard = gate.try_begin(now_ms)?;
    info!("Requesting reroute from {} coordinates", request.coordinates.len());
    Some(fetch_directions(transport, request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::service::HttpReply;

    fn pt(lat: f64, lon: f64) -> GeoPoint {
        GeoPoint::new(lat, lon)
    }

    fn options() -> MatchingOptions {
        MatchingOptions {
            access_token: Some("tok".into()),
            ..Default::default()
        }
    }

    fn query(url: &str, key: &str) -> Option<String> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Answers every request with the same body.
    struct Fixed(&'static str);

    impl Transport for Fixed {
        async fn get(&self, _url: &str) -> std::result::Result<HttpReply, TransportError> {
            Ok(HttpReply { status: 200, body: self.0.as_bytes().to_vec() })
        }
    }

    #[test]
    fn url_has_core_parameters() {
        let request = DirectionsRequest::new(pt(51.5, -0.1), &[], pt(51.51, -0.12), &options(), "tok");
        let url = build_directions_url(&request).unwrap();
        assert!(url.starts_with("https://api.mapbox.com/directions/v5/mapbox/driving/"));
        assert_eq!(query(&url, "geometries").as_deref(), Some("polyline6"));
        assert_eq!(query(&url, "voice_units").as_deref(), Some("british_imperial"));
        assert_eq!(query(&url, "access_token").as_deref(), Some("tok"));
        assert_eq!(query(&url, "bearings"), None);
        assert_eq!(query(&url, "radiuses"), None);
        assert_eq!(query(&url, "annotations"), None);
    }

    #[test]
    fn via_points_are_capped() {
        let via: Vec<GeoPoint> = (0..30).map(|i| pt(51.5, -0.1 + i as f64 * 0.001)).collect();
        let request = DirectionsRequest::new(pt(51.5, -0.2), &via, pt(51.6, -0.1), &options(), "tok");
        assert_eq!(request.coordinates.len(), MAX_VIA_POINTS + 2);
        assert_eq!(request.coordinates.last(), Some(&pt(51.6, -0.1)));
    }

    #[test]
    fn reroute_sets_bearing_and_default_radius() {
        let request = DirectionsRequest::reroute(pt(51.5, -0.1), Some(-90.4), pt(51.51, -0.12), &[pt(51.505, -0.11)], &options(), "tok");
        let url = build_directions_url(&request).unwrap();
        assert_eq!(query(&url, "bearings").as_deref(), Some("270,45;;"));
        assert_eq!(query(&url, "radiuses").as_deref(), Some("25;unlimited;unlimited"));
        assert_eq!(query(&url, "avoid_maneuver_radius").as_deref(), Some("200"));
    }

    #[test]
    fn traffic_profile_requests_congestion() {
        let opts = MatchingOptions { profile: Profile::DrivingTraffic, ..options() };
        let mut request = DirectionsRequest::new(pt(51.5, -0.1), &[], pt(51.51, -0.12), &opts, "tok");
        let url = build_directions_url(&request).unwrap();
        assert_eq!(query(&url, "annotations").as_deref(), Some("duration,distance,speed,congestion"));

        request.annotations = Annotations::Basic;
        let url = build_directions_url(&request).unwrap();
        assert_eq!(query(&url, "annotations").as_deref(), Some("duration,distance,speed"));
    }

    #[test]
    fn waypoint_sampling() {
        let path: Vec<GeoPoint> = (0..100).map(|i| pt(0.0, i as f64 * 0.001)).collect();
        let sampled = sample_waypoints(&path, MAX_SAMPLED_WAYPOINTS);
        assert_eq!(sampled[0], path[0]);
        assert_eq!(sampled.last(), path.last());
        assert!(sampled.len() <= MAX_SAMPLED_WAYPOINTS + 1);

        let short = &path[..10];
        assert_eq!(sample_waypoints(short, MAX_SAMPLED_WAYPOINTS), short.to_vec());
    }

    #[tokio::test]
    async fn directions_are_parsed() {
        let body = r#"{"code":"Ok","routes":[{"geometry":"_p~iF~ps|U_ulLnnqC","distance":1234.5,"duration":99,
            "legs":[{"steps":[{"distance":1234.5,"name":"A40","maneuver":{"type":"depart","location":[-0.1,51.5]}}]}]}]}"#;
        let request = DirectionsRequest::new(pt(51.5, -0.1), &[], pt(51.51, -0.12), &options(), "tok");
        let route = fetch_directions(&Fixed(body), &request).await.unwrap();
        assert_eq!(route.polyline.len(), 2);
        assert_eq!(route.steps.len(), 1);
        assert_eq!(route.distance_m, Some(1234.5));
    }

    #[tokio::test]
    async fn empty_routes_is_empty_error() {
        let request = DirectionsRequest::new(pt(51.5, -0.1), &[], pt(51.51, -0.12), &options(), "tok");
        let err = fetch_directions(&Fixed(r#"{"code":"Ok","routes":[]}"#), &request).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Empty);

        let err = fetch_directions(&Fixed(r#"{"code":"NoRoute","message":"none"}"#), &request).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Network);
    }

    #[test]
    fn gate_enforces_single_flight_and_gap() {
        let gate = RerouteGate::default();
        let guard = gate.try_begin(0).expect("first attempt admitted");
        assert!(gate.in_flight());
        assert!(gate.try_begin(10_000).is_none(), "second attempt while in flight");
        drop(guard);
        assert!(!gate.in_flight());
        assert!(gate.try_begin(7_999).is_none(), "attempt inside the gap");
        assert!(gate.try_begin(8_000).is_some());
    }

    #[tokio::test]
    async fn reroute_skipped_when_gate_closed() {
        let gate = RerouteGate::default();
        let _held = gate.try_begin(0).unwrap();
        let request = DirectionsRequest::reroute(pt(51.5, -0.1), None, pt(51.51, -0.12), &[], &options(), "tok");
        assert!(fetch_reroute(&Fixed("{}"), &gate, 20_000, &request).await.is_none());
    }
}
