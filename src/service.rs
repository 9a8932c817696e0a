//! HTTP plumbing and wire schemas for the external routing service.
//!
//! Raw responses are parsed into explicit serde schemas here and
//! normalized into [`Step`]s before anything downstream sees them.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{ErrorCode, MatchError, Result, TransportError};
use crate::polyline::decode_polyline;
use crate::types::{BannerInstruction, GeoPoint, Maneuver, ManeuverType, Step, VoiceInstruction};

/// Delay before the single retry after HTTP 429.
pub const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Status and body of an HTTP response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues GET requests against the routing service.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str) -> impl Future<Output = std::result::Result<HttpReply, TransportError>> + Send;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> std::result::Result<HttpReply, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpReply { status, body })
    }
}

/// GET `url` within `timeout`, retrying once after HTTP 429.
///
/// The timeout bounds the whole exchange including the retry. A second
/// non-success reply after rate limiting is `rate_limit`; any other
/// failure is `network`.
pub async fn fetch_with_retry<T: Transport>(transport: &T, url: &str, timeout: Duration) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, fetch_once_retrying(transport, url)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout.into()),
    }
}

async fn fetch_once_retrying<T: Transport>(transport: &T, url: &str) -> Result<Vec<u8>> {
    let reply = transport.get(url).await?;

    if reply.status == 429 {
        warn!(
            "Rate limited by routing service, retrying in {} ms",
            RATE_LIMIT_RETRY_DELAY.as_millis()
        );
        tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
        let retry = transport.get(url).await?;
        if !retry.is_success() {
            return Err(MatchError::new(ErrorCode::RateLimit, "Rate limited by routing service.")
                .with_details(serde_json::json!({ "status": retry.status })));
        }
        return Ok(retry.body);
    }

    if !reply.is_success() {
        return Err(
            MatchError::new(ErrorCode::Network, format!("HTTP {} from routing service.", reply.status))
                .with_details(serde_json::json!({ "status": reply.status })),
        );
    }

    debug!("Routing service replied with {} bytes", reply.body.len());
    Ok(reply.body)
}

/// Route geometry: either an encoded polyline or a GeoJSON line.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireGeometry {
    Encoded(String),
    Coordinates { coordinates: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireManeuver {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub modifier: Option<String>,
    pub bearing_before: Option<f64>,
    pub bearing_after: Option<f64>,
    /// `[lon, lat]`
    pub location: Option<[f64; 2]>,
    pub exit: Option<u32>,
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireVoiceInstruction {
    #[serde(rename = "distanceAlongGeometry")]
    pub distance_along_geometry: Option<f64>,
    pub announcement: Option<String>,
    #[serde(alias = "ssmlAnnouncement")]
    pub ssml_announcement: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireStep {
    pub distance: Option<f64>,
    pub duration: Option<f64>,
    pub name: Option<String>,
    pub destinations: Option<String>,
    pub rotary_name: Option<String>,
    pub maneuver: Option<WireManeuver>,
    #[serde(default, alias = "bannerInstructions")]
    pub banner_instructions: Vec<BannerInstruction>,
    #[serde(default, alias = "voiceInstructions")]
    pub voice_instructions: Vec<WireVoiceInstruction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireLeg {
    #[serde(default)]
    pub steps: Vec<WireStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMatching {
    pub geometry: Option<WireGeometry>,
    #[serde(default)]
    pub legs: Vec<WireLeg>,
    pub confidence: Option<f64>,
}

/// Map Matching v5 response.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingResponse {
    pub code: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub matchings: Vec<WireMatching>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireRoute {
    pub geometry: Option<WireGeometry>,
    #[serde(default)]
    pub legs: Vec<WireLeg>,
    pub distance: Option<f64>,
    pub duration: Option<f64>,
}

/// Directions v5 response.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectionsResponse {
    pub code: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub routes: Vec<WireRoute>,
}

/// Parse a JSON body, mapping malformed payloads to `network`.
pub fn parse_body<'a, R: Deserialize<'a>>(body: &'a [u8]) -> Result<R> {
    serde_json::from_slice(body)
        .map_err(|e| MatchError::new(ErrorCode::Network, format!("Malformed routing response: {e}")))
}

/// Map a non-"Ok" service status code to the error taxonomy.
pub fn status_error(code: &str, message: Option<&str>) -> MatchError {
    let (kind, fallback) = match code.to_ascii_lowercase().as_str() {
        "nomatch" => (ErrorCode::NoMatch, "No match found."),
        "nosegment" => (ErrorCode::NoSegment, "No segment found."),
        "invalidinput" => (ErrorCode::Invalid, "Invalid input."),
        _ => (ErrorCode::Network, "Map Matching failed."),
    };
    MatchError::new(kind, message.unwrap_or(fallback))
        .with_details(serde_json::json!({ "serviceCode": code }))
}

/// Pick the highest-confidence matching, keeping service order on ties.
pub fn best_matching(matchings: &[WireMatching]) -> Option<&WireMatching> {
    let mut best: Option<&WireMatching> = None;
    for m in matchings {
        let better = match best {
            Some(b) => m.confidence.unwrap_or(0.0) > b.confidence.unwrap_or(0.0),
            None => true,
        };
        if better {
            best = Some(m);
        }
    }
    best
}

/// Decode route geometry into points. Empty results are an error.
pub fn decode_geometry(geometry: Option<&WireGeometry>) -> Result<Vec<GeoPoint>> {
    let points = match geometry {
        Some(WireGeometry::Encoded(encoded)) => decode_polyline(encoded, 6)
            .map_err(|e| MatchError::new(ErrorCode::DecodeError, format!("Failed to decode matched geometry: {e}")))?,
        Some(WireGeometry::Coordinates { coordinates }) => {
            coordinates.iter().map(|c| GeoPoint::from_lon_lat(*c)).collect()
        }
        None => Vec::new(),
    };
    if points.is_empty() {
        return Err(MatchError::new(ErrorCode::DecodeError, "Failed to decode matched geometry."));
    }
    Ok(points)
}

/// Flatten legs into chunk-local steps.
///
/// Step ranges are left unset; they are assigned during stitching.
pub fn normalize_steps(legs: &[WireLeg]) -> Vec<Step> {
    legs.iter()
        .flat_map(|leg| leg.steps.iter())
        .enumerate()
        .map(|(index, step)| normalize_step(index, step))
        .collect()
}

fn normalize_step(index: usize, step: &WireStep) -> Step {
    let wire = step.maneuver.clone().unwrap_or_default();
    let banner_text = step
        .banner_instructions
        .first()
        .and_then(|b| b.primary.text.as_deref());
    let exit = wire.exit.or_else(|| banner_text.and_then(parse_exit_from_text));

    let voice_instructions = step
        .voice_instructions
        .iter()
        .filter_map(|v| {
            let distance = v.distance_along_geometry.filter(|d| d.is_finite())?;
            Some(VoiceInstruction {
                distance_along_geometry: distance,
                announcement: v.announcement.clone(),
                ssml_announcement: v.ssml_announcement.clone(),
            })
        })
        .collect();

    Step {
        index,
        maneuver: Maneuver {
            kind: wire.kind.as_deref().map(ManeuverType::from),
            modifier: wire.modifier,
            bearing_before: wire.bearing_before,
            bearing_after: wire.bearing_after,
            location: wire.location.map(GeoPoint::from_lon_lat),
            exit,
        },
        road_name: step.name.clone().filter(|n| !n.is_empty()),
        destinations: step.destinations.clone(),
        rotary_name: step.rotary_name.clone(),
        banner_instructions: step.banner_instructions.clone(),
        voice_instructions,
        step_start_s: None,
        step_end_s: None,
        distance: step.distance.filter(|d| d.is_finite()).unwrap_or(0.0),
    }
}

/// Extract a roundabout exit number from text like "take the 2nd exit".
pub fn parse_exit_from_text(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    for (pos, _) in lower.match_indices("exit") {
        let before = &lower[..pos];
        let head = before.trim_end();
        if head.len() == before.len() {
            continue;
        }
        let head = ["st", "nd", "rd", "th"]
            .iter()
            .find_map(|suffix| head.strip_suffix(suffix))
            .unwrap_or(head);
        let digits_start = head
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i);
        if let Some(start) = digits_start {
            if let Ok(n) = head[start..].parse() {
                return Some(n);
            }
        }
    }
    None
}
