//! Turn-by-turn instruction sequencing.
//!
//! Maps along-route progress to the active step, picks banner text and
//! decides which voice prompt (if any) to speak on each update. Every
//! prompt fires at most once per session.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{BannerInstruction, ManeuverType, Step};
use crate::units::{format_distance_voice_uk, format_ordinal};

/// Progress may fall this far behind the current step's start before the
/// step index is allowed to move backward.
const BACKTRACK_TOLERANCE_M: f64 = 25.0;
/// Share of the route that must be covered before arrival is possible.
const ARRIVAL_PROGRESS_FRACTION: f64 = 0.9;
/// Prompts closer than this are phrased "Now, ...".
const NOW_DISTANCE_M: f64 = 15.0;

pub const START_ANNOUNCEMENT: &str = "You are now at the starting point. Your training route has started.";
pub const ARRIVAL_ANNOUNCEMENT: &str = "Route completed. Great job! Try another route to keep progressing.";
const ARRIVE_PENDING_TEXT: &str = "Continue on the route";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstructionOptions {
    pub start_meters: f64,
    pub arrival_meters: f64,
}

impl Default for InstructionOptions {
    fn default() -> Self {
        Self {
            start_meters: 5.0,
            arrival_meters: 35.0,
        }
    }
}

/// Session facts supplied alongside each progress update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InstructionContext {
    pub distance_to_start: Option<f64>,
    pub distance_to_end: Option<f64>,
    /// True once real GPS motion has been observed.
    pub has_started_gpx: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstructionUpdate {
    pub step_idx: usize,
    pub step: Option<Step>,
    pub banner: Option<BannerInstruction>,
    pub distance_to_maneuver: Option<f64>,
    pub remaining_distance: f64,
    pub primary_text: Option<String>,
    pub secondary_text: Option<String>,
    pub voice_to_speak: Option<String>,
    pub start_announcement: Option<String>,
    pub arrival_announcement: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FiredKey {
    /// Explicit voice instruction, trigger distance in decimeters.
    Voice { step: usize, trigger_dm: i64 },
    /// Synthetic distance band.
    Band { step: usize, band_m: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Band {
    distance_m: u32,
    now: bool,
}

const ROUNDABOUT_BANDS: [Band; 3] = [
    Band { distance_m: 200, now: false },
    Band { distance_m: 80, now: false },
    Band { distance_m: 20, now: true },
];

const TURN_BANDS: [Band; 4] = [
    Band { distance_m: 320, now: false },
    Band { distance_m: 120, now: false },
    Band { distance_m: 40, now: false },
    Band { distance_m: 15, now: true },
];

/// Mutable sequencing state. Cleared only by [`InstructionEngine::reset`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionEngineState {
    pub step_index: usize,
    pub start_announced: bool,
    pub arrival_announced: bool,
    pub has_departed: bool,
    fired: BTreeSet<FiredKey>,
    last_distance_by_step: BTreeMap<usize, f64>,
}

#[derive(Debug, Clone)]
pub struct InstructionEngine {
    steps: Vec<Step>,
    route_length_m: f64,
    options: InstructionOptions,
    state: InstructionEngineState,
}

impl InstructionEngine {
    pub fn new(steps: &[Step], route_length_m: f64, options: InstructionOptions) -> Self {
        Self {
            steps: normalize_steps(steps),
            route_length_m,
            options,
            state: InstructionEngineState::default(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn state(&self) -> &InstructionEngineState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = InstructionEngineState::default();
    }

    pub fn update(&mut self, current_s: f64, _speed_mps: f64, ctx: &InstructionContext) -> InstructionUpdate {
        let remaining_distance = (self.route_length_m - current_s).max(0.0);
        if self.steps.is_empty() {
            return InstructionUpdate {
                step_idx: 0,
                step: None,
                banner: None,
                distance_to_maneuver: None,
                remaining_distance,
                primary_text: None,
                secondary_text: None,
                voice_to_speak: None,
                start_announcement: None,
                arrival_announcement: None,
            };
        }

        if ctx.has_started_gpx {
            self.state.has_departed = true;
        }

        let last = self.steps.len() - 1;
        let candidate = self
            .steps
            .iter()
            .position(|s| current_s <= step_end(s))
            .unwrap_or(last);
        let current_start = step_start(&self.steps[self.state.step_index.min(last)]);
        if candidate > self.state.step_index || current_s < current_start - BACKTRACK_TOLERANCE_M {
            self.state.step_index = candidate;
        }

        let arrival_ready = self.state.has_departed
            && ctx.has_started_gpx
            && remaining_distance <= self.options.arrival_meters
            && current_s > self.route_length_m * ARRIVAL_PROGRESS_FRACTION;

        let mut idx = self.state.step_index.min(last);
        if self.steps[idx].is_kind(&ManeuverType::Arrive) && !arrival_ready && idx > 0 {
            idx -= 1;
            self.state.step_index = idx;
        }
        let step = &self.steps[idx];

        let along_step = current_s - step_start(step);
        let distance_to_maneuver = (step_end(step) - current_s).max(0.0);

        let banner = pick_banner(step, along_step);
        let mut primary_text = primary_text(step);
        let mut secondary_text = step.banner_instructions.first().and_then(|b| {
            b.secondary
                .as_ref()
                .and_then(|t| t.text.clone())
                .filter(|t| !t.is_empty())
                .or_else(|| b.sub.as_ref().and_then(|t| t.text.clone()).filter(|t| !t.is_empty()))
        });

        let last_distance = self.state.last_distance_by_step.insert(idx, distance_to_maneuver);
        let mut voice_to_speak = self.explicit_voice(idx, along_step, &primary_text, distance_to_maneuver);
        if voice_to_speak.is_none() {
            voice_to_speak = self.band_voice(idx, &primary_text, distance_to_maneuver, last_distance);
        }

        let step = &self.steps[idx];
        if step.is_kind(&ManeuverType::Arrive) && !arrival_ready {
            voice_to_speak = None;
            primary_text = ARRIVE_PENDING_TEXT.to_string();
            secondary_text = None;
        }
        if let Some(text) = &voice_to_speak {
            debug!("voice step {idx}: {text}");
        }

        let mut start_announcement = None;
        if !self.state.start_announced && self.state.has_departed && current_s > self.options.start_meters {
            self.state.start_announced = true;
            debug!("start announced at {current_s:.1} m");
            start_announcement = Some(START_ANNOUNCEMENT.to_string());
        }

        let mut arrival_announcement = None;
        if !self.state.arrival_announced && arrival_ready {
            self.state.arrival_announced = true;
            debug!("arrival announced at {current_s:.1} m");
            arrival_announcement = Some(ARRIVAL_ANNOUNCEMENT.to_string());
        }

        InstructionUpdate {
            step_idx: idx,
            step: Some(step.clone()),
            banner,
            distance_to_maneuver: Some(distance_to_maneuver),
            remaining_distance,
            primary_text: Some(primary_text),
            secondary_text,
            voice_to_speak,
            start_announcement,
            arrival_announcement,
        }
    }

    /// First reached, unfired voice instruction of the step.
    fn explicit_voice(&mut self, idx: usize, along_step: f64, primary: &str, distance_to_maneuver: f64) -> Option<String> {
        let mut voices: Vec<_> = self.steps[idx]
            .voice_instructions
            .iter()
            .filter(|v| v.distance_along_geometry.is_finite())
            .collect();
        voices.sort_by(|a, b| a.distance_along_geometry.total_cmp(&b.distance_along_geometry));

        for voice in voices {
            if along_step < voice.distance_along_geometry {
                continue;
            }
            let key = FiredKey::Voice {
                step: idx,
                trigger_dm: (voice.distance_along_geometry * 10.0).round() as i64,
            };
            if !self.state.fired.insert(key) {
                continue;
            }
            let text = voice
                .announcement
                .clone()
                .filter(|t| !t.is_empty())
                .or_else(|| voice.ssml_announcement.clone().filter(|t| !t.is_empty()))
                .unwrap_or_else(|| voice_text(primary, distance_to_maneuver, false));
            return Some(text);
        }
        None
    }

    /// Synthetic prompt for the closest band just crossed.
    fn band_voice(
        &mut self,
        idx: usize,
        primary: &str,
        distance_to_maneuver: f64,
        last_distance: Option<f64>,
    ) -> Option<String> {
        let step = &self.steps[idx];
        let bands: &[Band] = if step.is_kind(&ManeuverType::Arrive) {
            &[]
        } else if step.is_roundabout() {
            &ROUNDABOUT_BANDS
        } else {
            &TURN_BANDS
        };

        for band in bands {
            let limit = f64::from(band.distance_m);
            if distance_to_maneuver > limit {
                continue;
            }
            // Already inside this band on the previous tick
            if last_distance.is_some_and(|d| d <= limit) {
                continue;
            }
            if !self.state.fired.insert(FiredKey::Band { step: idx, band_m: band.distance_m }) {
                continue;
            }
            return Some(voice_text(primary, distance_to_maneuver, band.now));
        }
        None
    }
}

fn step_start(step: &Step) -> f64 {
    step.step_start_s.unwrap_or(0.0)
}

fn step_end(step: &Step) -> f64 {
    step.step_end_s.unwrap_or_else(|| step_start(step) + step.distance)
}

/// Sort steps by end distance and give every step a full range.
///
/// Missing ends are laid out from the previous step's end plus the step's
/// own distance; missing starts take the previous end.
pub fn normalize_steps(steps: &[Step]) -> Vec<Step> {
    let mut running = 0.0;
    let mut ranged: Vec<(Option<f64>, f64, Step)> = steps
        .iter()
        .map(|step| {
            let distance = if step.distance.is_finite() { step.distance.max(0.0) } else { 0.0 };
            let start = step.step_start_s.filter(|s| s.is_finite());
            let end = step
                .step_end_s
                .filter(|e| e.is_finite())
                .unwrap_or(start.unwrap_or(running) + distance);
            running = end;
            (start, end, step.clone())
        })
        .collect();
    ranged.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut prev_end = 0.0;
    ranged
        .into_iter()
        .enumerate()
        .map(|(index, (start, end, mut step))| {
            let start = start.unwrap_or(prev_end);
            let end = end.max(start);
            prev_end = end;
            step.index = index;
            step.step_start_s = Some(start);
            step.step_end_s = Some(end);
            step
        })
        .collect()
}

/// Last banner reached along the step, or the first one.
fn pick_banner(step: &Step, along_step: f64) -> Option<BannerInstruction> {
    let mut ordered: Vec<_> = step.banner_instructions.iter().collect();
    ordered.sort_by(|a, b| a.distance_along_geometry.total_cmp(&b.distance_along_geometry));
    let first = *ordered.first()?;
    let selected = ordered
        .iter()
        .take_while(|b| along_step >= b.distance_along_geometry)
        .last()
        .copied()
        .unwrap_or(first);
    Some(selected.clone())
}

fn primary_text(step: &Step) -> String {
    let upstream = step
        .banner_instructions
        .first()
        .and_then(|b| b.primary.text.as_deref())
        .filter(|t| !t.is_empty());
    let Some(text) = upstream else {
        return fallback_instruction(step);
    };

    let mut text = match step.exit() {
        Some(exit) if exit > 0 && !text.to_ascii_lowercase().contains("exit") => {
            format!("{text}. Take the {} exit", format_ordinal(exit))
        }
        _ => text.to_string(),
    };
    if step.is_roundabout() {
        if let Some(road) = step.road_name.as_deref().filter(|r| !r.is_empty() && !text.contains(*r)) {
            text = format!("{text} onto {road}");
        }
    }
    text
}

fn fallback_instruction(step: &Step) -> String {
    let modifier = step.maneuver.modifier.as_deref().filter(|m| !m.is_empty());
    let road = step.road_name.as_deref().filter(|r| !r.is_empty());
    let onto = road.map(|r| format!(" onto {r}")).unwrap_or_default();

    match &step.maneuver.kind {
        Some(ManeuverType::Arrive) => "You have arrived at your destination".to_string(),
        Some(ManeuverType::Depart) => match road {
            Some(road) => format!("Head {} on {road}", modifier.unwrap_or("straight")),
            None => "Head straight".to_string(),
        },
        Some(kind) if kind.is_roundabout() => match step.exit().filter(|e| *e > 0) {
            Some(exit) => format!("Take the {} exit at the roundabout{onto}", format_ordinal(exit)),
            None => format!("At the roundabout, continue{onto}"),
        },
        _ => match (modifier, road) {
            (Some(m), Some(road)) => format!("Turn {m} onto {road}"),
            (Some(m), None) => format!("Turn {m}"),
            (None, Some(road)) => format!("Continue on {road}"),
            (None, None) => "Continue".to_string(),
        },
    }
}

fn voice_text(instruction: &str, distance_m: f64, now: bool) -> String {
    if now || distance_m <= NOW_DISTANCE_M {
        format!("Now, {instruction}")
    } else {
        format!("In {}, {instruction}", format_distance_voice_uk(distance_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BannerText, Maneuver, VoiceInstruction};

    fn step(kind: ManeuverType, distance: f64) -> Step {
        Step {
            maneuver: Maneuver {
                kind: Some(kind),
                ..Default::default()
            },
            distance,
            ..Default::default()
        }
    }

    fn started() -> InstructionContext {
        InstructionContext {
            has_started_gpx: true,
            ..Default::default()
        }
    }

    fn engine(steps: Vec<Step>, length: f64) -> InstructionEngine {
        InstructionEngine::new(&steps, length, InstructionOptions::default())
    }

    fn voice(at: f64, text: &str) -> VoiceInstruction {
        VoiceInstruction {
            distance_along_geometry: at,
            announcement: Some(text.to_string()),
            ssml_announcement: None,
        }
    }

    #[test]
    fn skips_ahead_to_later_step() {
        let mut e = engine(vec![step(ManeuverType::Depart, 20.0), step(ManeuverType::Turn, 20.0)], 100.0);
        let ctx = InstructionContext {
            distance_to_start: Some(100.0),
            distance_to_end: Some(40.0),
            has_started_gpx: true,
        };
        let update = e.update(55.0, 5.0, &ctx);
        assert_eq!(update.step_idx, 1);
        assert_eq!(update.distance_to_maneuver, Some(0.0));
        assert_eq!(update.remaining_distance, 45.0);
    }

    #[test]
    fn explicit_voice_fires_once() {
        let mut depart = step(ManeuverType::Depart, 20.0);
        depart.voice_instructions = vec![voice(10.0, "In 10 meters, turn right")];
        let mut e = engine(vec![depart], 100.0);

        let first = e.update(15.0, 5.0, &started());
        assert_eq!(first.voice_to_speak.as_deref(), Some("In 10 meters, turn right"));
        assert_eq!(e.update(15.0, 5.0, &started()).voice_to_speak, None);
        assert_eq!(e.update(16.0, 5.0, &started()).voice_to_speak, None);
    }

    #[test]
    fn fallback_bands_fire_in_order() {
        let mut turn = step(ManeuverType::Turn, 500.0);
        turn.maneuver.modifier = Some("left".to_string());
        turn.road_name = Some("Mill Lane".to_string());
        let mut e = engine(vec![turn, step(ManeuverType::Arrive, 0.0)], 500.0);

        // 400 m out: nothing yet
        assert_eq!(e.update(100.0, 10.0, &started()).voice_to_speak, None);
        let far = e.update(200.0, 10.0, &started());
        assert_eq!(far.voice_to_speak.as_deref(), Some("In 330 yards, Turn left onto Mill Lane"));
        assert_eq!(e.update(210.0, 10.0, &started()).voice_to_speak, None);
        assert!(e.update(400.0, 10.0, &started()).voice_to_speak.is_some());
        assert!(e.update(470.0, 10.0, &started()).voice_to_speak.is_some());
        let now = e.update(490.0, 10.0, &started());
        assert_eq!(now.voice_to_speak.as_deref(), Some("Now, Turn left onto Mill Lane"));
        assert_eq!(e.update(490.0, 10.0, &started()).voice_to_speak, None);
    }

    #[test]
    fn entering_mid_step_speaks_only_once() {
        let mut e = engine(vec![step(ManeuverType::Turn, 300.0)], 1000.0);
        // Jump straight inside the 40 m band
        let update = e.update(270.0, 10.0, &started());
        assert_eq!(update.voice_to_speak.as_deref(), Some("In 30 yards, Continue"));
        assert_eq!(e.update(275.0, 10.0, &started()).voice_to_speak, None);
        assert_eq!(e.update(290.0, 10.0, &started()).voice_to_speak.as_deref(), Some("Now, Continue"));
    }

    #[test]
    fn backtracking_within_tolerance_keeps_step() {
        let mut e = engine(vec![step(ManeuverType::Turn, 100.0), step(ManeuverType::Turn, 100.0)], 300.0);
        assert_eq!(e.update(120.0, 5.0, &started()).step_idx, 1);
        assert_eq!(e.update(90.0, 5.0, &started()).step_idx, 1);
        assert_eq!(e.update(70.0, 5.0, &started()).step_idx, 0);
    }

    #[test]
    fn arrival_requires_departure_and_progress() {
        let mut e = engine(vec![step(ManeuverType::Turn, 20.0)], 100.0);
        let early = e.update(
            5.0,
            0.0,
            &InstructionContext {
                distance_to_start: Some(10.0),
                distance_to_end: Some(15.0),
                has_started_gpx: false,
            },
        );
        assert_eq!(early.arrival_announcement, None);
        assert_eq!(early.start_announcement, None);

        let later = e.update(95.0, 3.0, &started());
        assert_eq!(later.arrival_announcement.as_deref(), Some(ARRIVAL_ANNOUNCEMENT));
        assert_eq!(later.start_announcement.as_deref(), Some(START_ANNOUNCEMENT));
        let again = e.update(96.0, 3.0, &started());
        assert_eq!(again.arrival_announcement, None);
        assert_eq!(again.start_announcement, None);
    }

    #[test]
    fn loop_route_does_not_arrive_early() {
        let mut e = engine(vec![step(ManeuverType::Turn, 60.0)], 500.0);
        assert_eq!(e.update(80.0, 3.0, &started()).arrival_announcement, None);
    }

    #[test]
    fn arrive_step_is_held_back_until_confirmed() {
        let mut e = engine(vec![step(ManeuverType::Turn, 100.0), step(ManeuverType::Arrive, 100.0)], 200.0);
        // Past the turn but far from the end
        let update = e.update(120.0, 5.0, &started());
        assert_eq!(update.step_idx, 0);
        assert_eq!(update.arrival_announcement, None);

        let done = e.update(195.0, 5.0, &started());
        assert_eq!(done.step_idx, 1);
        assert_eq!(done.primary_text.as_deref(), Some("You have arrived at your destination"));
        assert!(done.arrival_announcement.is_some());
    }

    #[test]
    fn roundabout_exit_phrase() {
        let mut r = step(ManeuverType::Roundabout, 120.0);
        r.maneuver.exit = Some(2);
        r.road_name = Some("High Street".to_string());
        let mut e = engine(vec![r.clone()], 200.0);
        let update = e.update(30.0, 5.0, &started());
        assert_eq!(
            update.primary_text.as_deref(),
            Some("Take the 2nd exit at the roundabout onto High Street")
        );

        r.banner_instructions = vec![BannerInstruction {
            primary: BannerText {
                text: Some("Enter the roundabout".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }];
        let mut e = engine(vec![r], 200.0);
        let update = e.update(30.0, 5.0, &started());
        assert_eq!(
            update.primary_text.as_deref(),
            Some("Enter the roundabout. Take the 2nd exit onto High Street")
        );
    }

    #[test]
    fn banner_follows_distance_along_step() {
        let banner = |at: f64, text: &str| BannerInstruction {
            distance_along_geometry: at,
            primary: BannerText {
                text: Some(text.to_string()),
                ..Default::default()
            },
            secondary: Some(BannerText {
                text: Some("towards the coast".to_string()),
                ..Default::default()
            }),
            sub: None,
        };
        let mut turn = step(ManeuverType::Turn, 300.0);
        turn.banner_instructions = vec![banner(100.0, "late"), banner(0.0, "early")];
        let mut e = engine(vec![turn], 300.0);

        let update = e.update(50.0, 5.0, &started());
        assert_eq!(update.banner.and_then(|b| b.primary.text).as_deref(), Some("early"));
        assert_eq!(update.primary_text.as_deref(), Some("late"));
        assert_eq!(update.secondary_text.as_deref(), Some("towards the coast"));
        let update = e.update(150.0, 5.0, &started());
        assert_eq!(update.banner.and_then(|b| b.primary.text).as_deref(), Some("late"));
    }

    #[test]
    fn reset_clears_one_shots() {
        let mut depart = step(ManeuverType::Depart, 50.0);
        depart.voice_instructions = vec![voice(0.0, "Head north")];
        let mut e = engine(vec![depart], 50.0);
        assert!(e.update(10.0, 5.0, &started()).start_announcement.is_some());
        e.reset();
        assert_eq!(e.state(), &InstructionEngineState::default());
        let update = e.update(10.0, 5.0, &started());
        assert!(update.start_announcement.is_some());
        assert_eq!(update.voice_to_speak.as_deref(), Some("Head north"));
    }

    #[test]
    fn normalization_orders_and_fills_ranges() {
        let mut late = step(ManeuverType::Turn, 10.0);
        late.step_start_s = Some(40.0);
        late.step_end_s = Some(50.0);
        let mut early = step(ManeuverType::Depart, 20.0);
        early.step_end_s = Some(20.0);
        let steps = normalize_steps(&[late, early]);

        assert!(steps[0].is_kind(&ManeuverType::Depart));
        assert_eq!(steps[0].step_start_s, Some(0.0));
        assert_eq!(steps[0].step_end_s, Some(20.0));
        assert_eq!(steps[1].index, 1);
        assert_eq!(steps[1].step_start_s, Some(40.0));
    }

    #[test]
    fn no_steps_reports_remaining_only() {
        let mut e = engine(Vec::new(), 100.0);
        let update = e.update(30.0, 5.0, &started());
        assert_eq!(update.step, None);
        assert_eq!(update.remaining_distance, 70.0);
        assert_eq!(update.voice_to_speak, None);
    }
}
