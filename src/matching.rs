//! Map-matching orchestration.
//!
//! A recorded path is cleaned, downsampled and split into overlapping
//! chunks. Each chunk is matched by the routing service, and the results
//! are stitched into one [`NavPackage`] with a freshly computed
//! cumulative-distance table. Built packages are cached by fingerprint,
//! and concurrent builds of the same fingerprint share one network run.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{FingerprintInput, PackageCache};
use crate::directions::{fetch_directions, sample_waypoints, DirectionsRequest, MAX_SAMPLED_WAYPOINTS};
use crate::error::{ErrorCode, MatchError, Result};
use crate::geometry::cumulative_distances;
use crate::preprocess::{create_chunks, downsample_route, remove_duplicate_coords};
use crate::route_nav::{nav_package_from_route, synthesize_steps, PackageSource};
use crate::service::{
    best_matching, decode_geometry, fetch_with_retry, normalize_steps, parse_body, status_error, MatchingResponse,
    Transport,
};
use crate::stitch::{has_large_gap, stitch_polylines, stitch_steps};
use crate::types::{unix_time_ms, GeoPoint, NavMeta, NavPackage, Step};

/// Environment variable consulted when no token is configured.
pub const TOKEN_ENV_VAR: &str = "MAPBOX_ACCESS_TOKEN";
/// Coordinate limit per matching request.
pub const SERVICE_MAX_POINTS: usize = 100;
/// Adjacent stitched points farther apart than this multiple of
/// `max_gap_m` reject the match.
pub const STITCH_GAP_FACTOR: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    #[default]
    Driving,
    DrivingTraffic,
    Walking,
    Cycling,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Driving => "driving",
            Profile::DrivingTraffic => "driving-traffic",
            Profile::Walking => "walking",
            Profile::Cycling => "cycling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceUnits {
    #[default]
    BritishImperial,
    Imperial,
    Metric,
}

impl VoiceUnits {
    pub fn as_str(self) -> &'static str {
        match self {
            VoiceUnits::BritishImperial => "british_imperial",
            VoiceUnits::Imperial => "imperial",
            VoiceUnits::Metric => "metric",
        }
    }
}

/// Tunables for a package build. Partial JSON fills in the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MatchingOptions {
    pub access_token: Option<String>,
    pub profile: Profile,
    pub radius_m: f64,
    pub max_points: usize,
    pub chunk_overlap: usize,
    pub max_gap_m: f64,
    pub bearing_threshold_deg: f64,
    pub downsample_m: f64,
    pub dedupe_m: f64,
    pub assume_speed_mps: f64,
    pub timeout_ms: u64,
    pub voice_units: VoiceUnits,
    pub language: String,
    pub tidy: bool,
    pub waypoint_names: Vec<String>,
    pub base_url: String,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            access_token: None,
            profile: Profile::Driving,
            radius_m: 15.0,
            max_points: 100,
            chunk_overlap: 4,
            max_gap_m: 25.0,
            bearing_threshold_deg: 20.0,
            downsample_m: 15.0,
            dedupe_m: 2.0,
            assume_speed_mps: 8.0,
            timeout_ms: 12_000,
            voice_units: VoiceUnits::BritishImperial,
            language: "en".to_string(),
            tidy: true,
            waypoint_names: Vec::new(),
            base_url: "https://api.mapbox.com".to_string(),
        }
    }
}

impl MatchingOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The configured token, else the environment's. Missing is `invalid`.
    pub fn resolve_token(&self) -> Result<String> {
        self.access_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.trim().is_empty()))
            .ok_or_else(|| MatchError::new(ErrorCode::Invalid, "Missing routing service access token."))
    }

    pub fn stitch_gap_threshold_m(&self) -> f64 {
        self.max_gap_m * STITCH_GAP_FACTOR
    }

    /// Cache key for building `polyline` with these options.
    pub fn fingerprint(&self, polyline: &[GeoPoint]) -> String {
        FingerprintInput {
            coords: FingerprintInput::rounded_coords(polyline),
            profile: self.profile.as_str(),
            radius: self.radius_m,
            max_gap: self.max_gap_m,
            bearing_threshold: self.bearing_threshold_deg,
            downsample: self.downsample_m,
            voice_units: self.voice_units.as_str(),
            language: &self.language,
            tidy: self.tidy,
            max_points: self.max_points,
            dedupe: self.dedupe_m,
            chunk_overlap: self.chunk_overlap,
            assume_speed: self.assume_speed_mps,
            waypoint_names: &self.waypoint_names,
        }
        .key()
    }
}

/// Strictly increasing unix timestamps as if driving at `speed_mps`.
pub fn synthetic_timestamps(points: &[GeoPoint], speed_mps: f64, start_unix_s: u64) -> Vec<u64> {
    let speed = if speed_mps.is_finite() { speed_mps.max(1.0) } else { 1.0 };
    let mut last = start_unix_s;
    cumulative_distances(points)
        .into_iter()
        .map(|d| {
            let offset = ((d / speed).round() as u64).max(1);
            last = (start_unix_s + offset).max(last + 1);
            last
        })
        .collect()
}

fn join<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    items.into_iter().map(|i| i.to_string()).collect::<Vec<_>>().join(";")
}

/// Matching request URL for one chunk.
pub fn build_match_url(
    points: &[GeoPoint],
    options: &MatchingOptions,
    token: &str,
    timestamps: Option<&[u64]>,
) -> Result<String> {
    let coords = join(points.iter().map(|p| format!("{:.6},{:.6}", p.longitude, p.latitude)));
    let base = options.base_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/matching/v5/mapbox/{}/{coords}.json", options.profile.as_str()))
        .map_err(|e| MatchError::new(ErrorCode::Invalid, format!("Invalid matching URL: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("steps", "true")
            .append_pair("banner_instructions", "true")
            .append_pair("voice_instructions", "true")
            .append_pair("voice_units", options.voice_units.as_str())
            .append_pair("language", &options.language)
            .append_pair("roundabout_exits", "true")
            .append_pair("geometries", "polyline6")
            .append_pair("overview", "full")
            .append_pair("tidy", if options.tidy { "true" } else { "false" })
            .append_pair("radiuses", &join(points.iter().map(|_| options.radius_m)))
            .append_pair("waypoints", &format!("0;{}", points.len().saturating_sub(1)));
        if let [first, second, ..] = options.waypoint_names.as_slice() {
            query.append_pair("waypoint_names", &format!("{first};{second}"));
        }
        if let Some(ts) = timestamps {
            query.append_pair("timestamps", &join(ts.iter()));
        }
        query.append_pair("access_token", token);
    }

    Ok(url.into())
}

/// Matched geometry and chunk-local steps for one chunk.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub polyline: Vec<GeoPoint>,
    pub steps: Vec<Step>,
    pub confidence: Option<f64>,
}

/// Match one chunk against the service.
pub async fn match_chunk<T: Transport>(
    transport: &T,
    chunk: &[GeoPoint],
    options: &MatchingOptions,
    token: &str,
    start_unix_s: u64,
) -> Result<ChunkMatch> {
    if chunk.len() < 2 {
        return Err(MatchError::new(ErrorCode::Invalid, "A chunk needs at least two points."));
    }

    let timestamps = synthetic_timestamps(chunk, options.assume_speed_mps, start_unix_s);
    let url = build_match_url(chunk, options, token, Some(&timestamps))?;
    let body = fetch_with_retry(transport, &url, options.timeout()).await?;
    let response: MatchingResponse = parse_body(&body)?;

    if let Some(code) = response.code.as_deref().filter(|c| *c != "Ok") {
        return Err(status_error(code, response.message.as_deref()));
    }
    let best = best_matching(&response.matchings)
        .ok_or_else(|| MatchError::new(ErrorCode::Empty, "No matchings returned."))?;

    Ok(ChunkMatch {
        polyline: decode_geometry(best.geometry.as_ref())?,
        steps: normalize_steps(&best.legs),
        confidence: best.confidence,
    })
}

/// Package plus the stage of the fallback chain that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPackage {
    pub package: NavPackage,
    pub source: PackageSource,
    /// Why map matching was not used, if it wasn't.
    pub matching_error: Option<MatchError>,
}

type FlightRegistry = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Registration of one caller for a fingerprint's build lock.
struct FlightSlot<'a> {
    registry: &'a FlightRegistry,
    key: String,
    gate: Arc<AsyncMutex<()>>,
}

impl<'a> FlightSlot<'a> {
    fn claim(registry: &'a FlightRegistry, key: &str) -> Self {
        let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
        let gate = map.entry(key.to_string()).or_default().clone();
        Self {
            registry,
            key: key.to_string(),
            gate,
        }
    }
}

impl Drop for FlightSlot<'_> {
    fn drop(&mut self) {
        let mut map = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        // Only the registry and this slot hold the lock: nobody is waiting
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.key);
        }
    }
}

/// Builds navigation packages through a [`Transport`].
pub struct MapMatcher<T> {
    transport: T,
    cache: PackageCache,
    in_flight: FlightRegistry,
}

impl<T: Transport> MapMatcher<T> {
    pub fn new(transport: T) -> Self {
        Self::with_cache(transport, PackageCache::default())
    }

    pub fn with_cache(transport: T, cache: PackageCache) -> Self {
        Self {
            transport,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }

    /// Build (or fetch from cache) the matched package for `polyline`.
    ///
    /// Dropping the returned future abandons the build; nothing is cached
    /// until it completes.
    pub async fn build_nav_package(&self, polyline: &[GeoPoint], options: &MatchingOptions) -> Result<NavPackage> {
        if polyline.is_empty() {
            return Err(MatchError::new(ErrorCode::Empty, "Route has no coordinates."));
        }
        let token = options.resolve_token()?;
        let key = options.fingerprint(polyline);

        if let Some(pkg) = self.cache.get(&key) {
            return Ok(pkg);
        }

        let slot = FlightSlot::claim(&self.in_flight, &key);
        let _turn = slot.gate.lock().await;
        // An identical build may have finished while this one waited
        if let Some(pkg) = self.cache.get(&key) {
            return Ok(pkg);
        }
        debug!("Cache miss {key}, matching {} points", polyline.len());

        let pkg = match_route(&self.transport, polyline, options, &token, &key)
            .await
            .inspect_err(|e| warn!("Map matching failed: {e}"))?;
        self.cache.put(&key, &pkg);
        info!(
            "Built nav package {key}: {} points, {} steps, {:.0} m",
            pkg.matched_polyline.len(),
            pkg.steps.len(),
            pkg.route_length_m
        );
        Ok(pkg)
    }

    /// Map matching, then directions, then locally synthesized steps.
    ///
    /// Only fails when `polyline` has fewer than 2 points. `via` defaults
    /// to waypoints sampled from the polyline.
    pub async fn resolve_nav_package(
        &self,
        polyline: &[GeoPoint],
        options: &MatchingOptions,
        via: &[GeoPoint],
    ) -> Result<ResolvedPackage> {
        match polyline.len() {
            0 => return Err(MatchError::new(ErrorCode::Empty, "Route has no coordinates.")),
            1 => return Err(MatchError::new(ErrorCode::Invalid, "Route needs at least two points.")),
            _ => {}
        }

        let matching_error = match self.build_nav_package(polyline, options).await {
            Ok(mut package) => {
                if package.steps.is_empty() {
                    package.steps = synthesize_steps(&package.matched_polyline);
                }
                info!("Using map-matched package");
                return Ok(ResolvedPackage {
                    package,
                    source: PackageSource::Matching,
                    matching_error: None,
                });
            }
            Err(e) => e,
        };

        if let Ok(token) = options.resolve_token() {
            let sampled;
            let via = if via.is_empty() {
                sampled = sample_waypoints(polyline, MAX_SAMPLED_WAYPOINTS);
                &sampled[1..sampled.len() - 1]
            } else {
                via
            };
            let start = polyline[0];
            let end = polyline[polyline.len() - 1];
            let request = DirectionsRequest::new(start, via, end, options, &token);

            match fetch_directions(&self.transport, &request).await {
                Ok(route) => {
                    let steps = if route.steps.is_empty() { synthesize_steps(&route.polyline) } else { route.steps };
                    let mut package = nav_package_from_route(&route.polyline, steps, PackageSource::Directions);
                    package.original_polyline = polyline.to_vec();
                    info!("Using directions fallback ({})", matching_error.code);
                    return Ok(ResolvedPackage {
                        package,
                        source: PackageSource::Directions,
                        matching_error: Some(matching_error),
                    });
                }
                Err(e) => warn!("Directions fallback failed: {e}"),
            }
        }

        info!("Using locally synthesized steps ({})", matching_error.code);
        let package = nav_package_from_route(polyline, synthesize_steps(polyline), PackageSource::Local);
        Ok(ResolvedPackage {
            package,
            source: PackageSource::Local,
            matching_error: Some(matching_error),
        })
    }
}

async fn match_route<T: Transport>(
    transport: &T,
    polyline: &[GeoPoint],
    options: &MatchingOptions,
    token: &str,
    key: &str,
) -> Result<NavPackage> {
    let cleaned = remove_duplicate_coords(polyline, options.dedupe_m);
    if cleaned.len() < 2 {
        return Err(MatchError::new(ErrorCode::Invalid, "Route needs at least two distinct points."));
    }
    let sampled = downsample_route(&cleaned, options.downsample_m, options.bearing_threshold_deg);
    let chunks = create_chunks(
        &sampled,
        options.max_points.clamp(2, SERVICE_MAX_POINTS),
        options.chunk_overlap,
    );

    let start_unix_s = unix_time_ms() / 1000;
    let mut polylines = Vec::with_capacity(chunks.len());
    let mut chunk_steps = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let matched = match_chunk(transport, chunk, options, token, start_unix_s).await?;
        debug!(
            "Chunk {}/{} matched: {} points, {} steps, confidence {:?}",
            i + 1,
            chunks.len(),
            matched.polyline.len(),
            matched.steps.len(),
            matched.confidence
        );
        polylines.push(matched.polyline);
        chunk_steps.push(matched.steps);
    }

    let matched = stitch_polylines(&polylines);
    let threshold = options.stitch_gap_threshold_m();
    if has_large_gap(&matched, threshold) {
        return Err(
            MatchError::new(ErrorCode::StitchGap, "Matched route has gaps between chunks.")
                .with_details(serde_json::json!({ "thresholdM": threshold, "chunks": chunks.len() })),
        );
    }

    let steps = stitch_steps(&chunk_steps);
    let cumulative = cumulative_distances(&matched);
    let route_length_m = cumulative.last().copied().unwrap_or(0.0);
    let mut warnings = Vec::new();
    if steps.is_empty() {
        warnings.push("no_steps".to_string());
    }

    Ok(NavPackage {
        id: key.to_string(),
        original_polyline: polyline.to_vec(),
        start_coord: matched.first().copied(),
        end_coord: matched.last().copied(),
        matched_polyline: matched,
        cumulative_distances: cumulative,
        steps,
        route_length_m,
        meta: NavMeta {
            created_at: unix_time_ms(),
            profile: options.profile.as_str().to_string(),
            radius_m: options.radius_m,
            chunk_count: chunks.len(),
            warnings,
        },
    })
}
