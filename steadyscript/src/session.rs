//! Session controller: the IDLE / RUNNING / COMPLETE state machine and the
//! per-mode metric aggregation.
//!
//! Exactly one live session exists at a time, owned by the pipeline thread.
//! Control commands are applied between frames only, so a frame is never
//! observed in a half-applied state.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use stability_metrics::{
    feedback_for_lateral_p95, lateral_magnitude, level_for_jitter, level_for_score, mean,
    percentile, published_score, raw_tremor_score, StabilityTracker, TargetPath,
};
use steadyscript_types::{
    Calibration, ClientCommand, ExerciseMode, HsvRange, MetricsSnapshot, SessionRecord,
    SessionState,
};

use crate::config::AppConfig;
use crate::errors::ControlError;

/// How long the final score stays overlaid after completion.
pub const COMPLETE_OVERLAY_SECS: f64 = 1.0;

/// Capacity of the rolling lateral-jitter window.
const LATERAL_WINDOW: usize = 30;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Side effects of processing one frame.
#[derive(Debug)]
pub struct FrameEffects {
    /// Finalized record when the session just completed.
    pub completed: Option<SessionRecord>,
    /// Desired LED state ('1' when the marker is inside the HOLD circle).
    /// The caller deduplicates before writing to the gateway.
    pub led: bool,
}

/// Side effects of applying one control command.
#[derive(Debug, Default)]
pub struct CommandOutcome {
    pub completed: Option<SessionRecord>,
}

struct LiveSession {
    mode: ExerciseMode,
    started_at: Instant,
    duration_s: f64,
    hsv: HsvRange,
    bpm: u32,
    path: Option<TargetPath>,
    calibration: Option<Calibration>,

    jitters: Vec<f64>,
    laterals: Vec<f64>,
    lateral_window: VecDeque<f64>,
    frames_total: u64,
    frames_found: u64,
    frames_inside: u64,
    beats: u64,
}

impl LiveSession {
    fn elapsed(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.started_at).as_secs_f64()
    }

    fn lateral_now(&self) -> f64 {
        self.lateral_window.back().copied().unwrap_or(0.0)
    }

    fn lateral_p95(&self) -> f64 {
        let vals: Vec<f64> = self.lateral_window.iter().copied().collect();
        percentile(&vals, 95.0)
    }
}

enum Phase {
    Idle,
    Running(LiveSession),
    Complete {
        record: SessionRecord,
        finished_at: Instant,
    },
}

pub struct SessionController {
    cfg: AppConfig,
    mode: ExerciseMode,
    phase: Phase,
    calibration: Option<Calibration>,
    /// First click of the two-step calibration sequence.
    pending_center: Option<(i32, i32)>,
    bpm: u32,
    last_detected: bool,
}

impl SessionController {
    pub fn new(cfg: AppConfig) -> Self {
        let bpm = cfg.default_bpm;
        Self {
            cfg,
            mode: ExerciseMode::Hold,
            phase: Phase::Idle,
            calibration: None,
            pending_center: None,
            bpm,
            last_detected: false,
        }
    }

    pub fn mode(&self) -> ExerciseMode {
        self.mode
    }

    pub fn bpm(&self) -> u32 {
        self.bpm
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn session_state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::Running(_) => SessionState::Running,
            Phase::Complete { .. } => SessionState::Complete,
        }
    }

    pub fn beats(&self) -> u64 {
        match &self.phase {
            Phase::Running(live) => live.beats,
            _ => 0,
        }
    }

    /// FOLLOW target dot position, while a FOLLOW session is running.
    pub fn target_position(&self, now: Instant) -> Option<(f64, f64)> {
        match &self.phase {
            Phase::Running(live) => live.path.map(|p| p.position_at(live.elapsed(now))),
            _ => None,
        }
    }

    /// Final score to overlay, for one second after completion.
    pub fn final_overlay_score(&self, now: Instant) -> Option<f64> {
        match &self.phase {
            Phase::Complete {
                record,
                finished_at,
            } if now.saturating_duration_since(*finished_at).as_secs_f64()
                < COMPLETE_OVERLAY_SECS =>
            {
                Some(record.tremor_score)
            }
            _ => None,
        }
    }

    fn times(&self, now: Instant) -> (f64, f64) {
        match &self.phase {
            Phase::Idle => (0.0, 0.0),
            Phase::Running(live) => {
                let elapsed = live.elapsed(now);
                (elapsed, (live.duration_s - elapsed).max(0.0))
            }
            Phase::Complete { record, .. } => (record.duration_s, 0.0),
        }
    }

    /// Apply a control command. `hsv_now` is the detector range that a new
    /// session would record. Errors leave the state machine unchanged.
    pub fn apply_command(
        &mut self,
        cmd: &ClientCommand,
        hsv_now: HsvRange,
        now: Instant,
    ) -> Result<CommandOutcome, ControlError> {
        match cmd {
            ClientCommand::ModeSwitch { mode } => {
                if matches!(self.phase, Phase::Running(_)) {
                    return Err(ControlError::SessionRunning("mode_switch"));
                }
                self.mode = *mode;
                self.phase = Phase::Idle;
                self.pending_center = None;
                if *mode == ExerciseMode::Follow {
                    self.calibration = None;
                }
                info!("mode switched to {mode}");
                Ok(CommandOutcome::default())
            }
            ClientCommand::SessionStart => {
                if matches!(self.phase, Phase::Running(_)) {
                    // Idempotent: starting a running session is a no-op.
                    return Ok(CommandOutcome::default());
                }
                if !self.last_detected {
                    return Err(ControlError::MarkerNotDetected);
                }
                if self.mode == ExerciseMode::Hold && self.calibration.is_none() {
                    return Err(ControlError::NotCalibrated);
                }
                self.phase = Phase::Running(self.new_live_session(hsv_now, now));
                info!("{} session started ({}s)", self.mode, match self.mode {
                    ExerciseMode::Hold => self.cfg.hold_duration_s,
                    ExerciseMode::Follow => self.cfg.follow_duration_s,
                });
                Ok(CommandOutcome::default())
            }
            ClientCommand::SessionStop => {
                // Idempotent: a second stop is silently ignored.
                let completed = self.complete_now(now);
                Ok(CommandOutcome { completed })
            }
            ClientCommand::CalibrationClick { x, y } => {
                if self.mode != ExerciseMode::Hold {
                    return Err(ControlError::WrongMode);
                }
                if matches!(self.phase, Phase::Running(_)) {
                    return Err(ControlError::SessionRunning("calibration_click"));
                }
                self.handle_calibration_click(*x, *y)?;
                Ok(CommandOutcome::default())
            }
            ClientCommand::BpmChange { delta } => {
                if matches!(self.phase, Phase::Running(_)) {
                    return Err(ControlError::SessionRunning("bpm_change"));
                }
                self.bpm = (self.bpm as i64 + *delta as i64).clamp(30, 180) as u32;
                debug!("bpm set to {}", self.bpm);
                Ok(CommandOutcome::default())
            }
            ClientCommand::HsvUpdate(_) => {
                // Handled by the pipeline before the controller sees it.
                Ok(CommandOutcome::default())
            }
            ClientCommand::Dismiss => {
                if matches!(self.phase, Phase::Complete { .. }) {
                    self.phase = Phase::Idle;
                }
                Ok(CommandOutcome::default())
            }
        }
    }

    fn handle_calibration_click(&mut self, x: i32, y: i32) -> Result<(), ControlError> {
        match self.pending_center {
            None => {
                if self.calibration.is_some() {
                    // Third click restarts the two-step sequence.
                    self.calibration = None;
                }
                self.pending_center = Some((x, y));
                info!("calibration center set to ({x}, {y})");
                Ok(())
            }
            Some(center) => {
                let dx = (x - center.0) as f64;
                let dy = (y - center.1) as f64;
                let radius = (dx * dx + dy * dy).sqrt();
                if radius <= 0.0 {
                    return Err(ControlError::ZeroRadius);
                }
                self.calibration = Some(Calibration { center, radius });
                self.pending_center = None;
                info!("calibration radius set to {radius:.1} px");
                Ok(())
            }
        }
    }

    fn new_live_session(&self, hsv: HsvRange, now: Instant) -> LiveSession {
        let (duration_s, path, calibration) = match self.mode {
            ExerciseMode::Hold => (self.cfg.hold_duration_s, None, self.calibration),
            ExerciseMode::Follow => (
                self.cfg.follow_duration_s,
                Some(TargetPath::new(
                    self.cfg.follow_target_center(),
                    self.cfg.follow_target_radius,
                    self.bpm,
                )),
                None,
            ),
        };
        LiveSession {
            mode: self.mode,
            started_at: now,
            duration_s,
            hsv,
            bpm: self.bpm,
            path,
            calibration,
            jitters: Vec::new(),
            laterals: Vec::new(),
            lateral_window: VecDeque::with_capacity(LATERAL_WINDOW),
            frames_total: 0,
            frames_found: 0,
            frames_inside: 0,
            beats: 0,
        }
    }

    /// Process one frame while possibly RUNNING. The tracker has already
    /// been advanced with this frame's observation.
    pub fn on_frame(
        &mut self,
        position: Option<(i32, i32)>,
        tracker: &StabilityTracker,
        now: Instant,
    ) -> FrameEffects {
        let mut completed = None;

        let deadline_hit = matches!(
            &self.phase,
            Phase::Running(live) if live.elapsed(now) >= live.duration_s
        );
        if deadline_hit {
            completed = self.complete_now(now);
        } else if let Phase::Running(live) = &mut self.phase {
            live.frames_total += 1;
            if let Some((x, y)) = position {
                live.frames_found += 1;
                match live.mode {
                    ExerciseMode::Hold => {
                        live.jitters.push(tracker.jitter_now());
                        if let Some(cal) = &live.calibration {
                            if cal.contains(x, y) {
                                live.frames_inside += 1;
                            }
                        }
                    }
                    ExerciseMode::Follow => {
                        live.jitters.push(tracker.jitter_now());
                        if let (Some(smoothed), Some(path)) = (tracker.smoothed(), live.path) {
                            let t = live.elapsed(now);
                            let deviation = (x as f64 - smoothed.0, y as f64 - smoothed.1);
                            let lateral = lateral_magnitude(deviation, path.tangent_at(t));
                            live.laterals.push(lateral);
                            if live.lateral_window.len() == LATERAL_WINDOW {
                                live.lateral_window.pop_front();
                            }
                            live.lateral_window.push_back(lateral);
                        }
                    }
                }
            }
            if let (ExerciseMode::Follow, Some(path)) = (live.mode, live.path) {
                live.beats = path.beats_at(live.elapsed(now));
            }
        }

        self.last_detected = position.is_some();

        let led = match &self.phase {
            Phase::Running(live) if live.mode == ExerciseMode::Hold => match (position, &live.calibration)
            {
                (Some((x, y)), Some(cal)) => cal.contains(x, y),
                _ => false,
            },
            _ => false,
        };

        FrameEffects { completed, led }
    }

    /// Finalize the running session, if any.
    fn complete_now(&mut self, now: Instant) -> Option<SessionRecord> {
        if !matches!(self.phase, Phase::Running(_)) {
            return None;
        }
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running(live) => {
                let record = finalize(live);
                info!(
                    "{} session complete: score {:.1}, {}/{} frames with marker",
                    record.session_type,
                    record.tremor_score,
                    record.frames_marker_found,
                    record.frames_total
                );
                self.phase = Phase::Complete {
                    record: record.clone(),
                    finished_at: now,
                };
                Some(record)
            }
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Build the live metrics snapshot for this tick.
    pub fn snapshot(
        &self,
        tracker: &StabilityTracker,
        position: Option<(i32, i32)>,
        now: Instant,
    ) -> MetricsSnapshot {
        let (elapsed, time_remaining) = self.times(now);
        let session_state = self.session_state();
        let jitter = round2(tracker.jitter_now());
        let p95_jitter = round2(tracker.p95_jitter());

        match self.mode {
            ExerciseMode::Hold => {
                let (score, level) = match &self.phase {
                    Phase::Complete { record, .. } => (
                        record.tremor_score,
                        level_for_score(record.tremor_score),
                    ),
                    _ => {
                        let score = round1(published_score(tracker.p95_jitter()));
                        (
                            score,
                            level_for_jitter(
                                tracker.jitter_now(),
                                self.cfg.jitter_threshold_low,
                                self.cfg.jitter_threshold_high,
                            ),
                        )
                    }
                };
                MetricsSnapshot {
                    mode: self.mode,
                    position: position.map(Into::into),
                    marker_detected: position.is_some(),
                    jitter,
                    p95_jitter,
                    lateral_jitter: None,
                    p95_lateral_jitter: None,
                    stability_level: Some(level),
                    feedback_status: None,
                    score,
                    session_state,
                    time_remaining,
                    elapsed,
                    bpm: None,
                    beat_count: None,
                }
            }
            ExerciseMode::Follow => {
                let (lateral_now, lateral_p95, beats) = match &self.phase {
                    Phase::Running(live) => {
                        (live.lateral_now(), live.lateral_p95(), live.beats)
                    }
                    _ => (0.0, 0.0, 0),
                };
                let score = match &self.phase {
                    Phase::Complete { record, .. } => record.tremor_score,
                    _ => round1(published_score(lateral_p95)),
                };
                MetricsSnapshot {
                    mode: self.mode,
                    position: position.map(Into::into),
                    marker_detected: position.is_some(),
                    jitter,
                    p95_jitter,
                    lateral_jitter: Some(round2(lateral_now)),
                    p95_lateral_jitter: Some(round2(lateral_p95)),
                    stability_level: None,
                    feedback_status: Some(feedback_for_lateral_p95(lateral_p95)),
                    score,
                    session_state,
                    time_remaining,
                    elapsed,
                    bpm: Some(self.bpm),
                    beat_count: Some(beats),
                }
            }
        }
    }
}

fn finalize(live: LiveSession) -> SessionRecord {
    let timestamp = Utc::now().to_rfc3339();
    match live.mode {
        ExerciseMode::Hold => {
            let avg = mean(&live.jitters);
            let p95 = percentile(&live.jitters, 95.0);
            let score = if live.frames_found == 0 {
                // Degenerate session: the marker was never seen.
                0.0
            } else {
                round1(published_score(p95))
            };
            debug!(
                "raw weighted tremor score {:.2}",
                raw_tremor_score(p95, avg)
            );
            let inside_circle_pct = if live.frames_total == 0 {
                0.0
            } else {
                round2(100.0 * live.frames_inside as f64 / live.frames_total as f64)
            };
            SessionRecord {
                timestamp,
                session_type: ExerciseMode::Hold,
                duration_s: live.duration_s,
                hsv_lower: live.hsv.lower,
                hsv_upper: live.hsv.upper,
                tremor_score: score,
                frames_total: live.frames_total,
                frames_marker_found: live.frames_found,
                circle_center: live.calibration.map(|c| [c.center.0, c.center.1]),
                circle_radius: live.calibration.map(|c| round2(c.radius)),
                avg_jitter: Some(round2(avg)),
                p95_jitter: Some(round2(p95)),
                inside_circle_pct: Some(inside_circle_pct),
                avg_lateral_jitter: None,
                p95_lateral_jitter: None,
                max_lateral_jitter: None,
                beats_total: None,
            }
        }
        ExerciseMode::Follow => {
            let avg = mean(&live.laterals);
            let p95 = percentile(&live.laterals, 95.0);
            let max = live.laterals.iter().cloned().fold(0.0, f64::max);
            let score = if live.frames_found == 0 {
                0.0
            } else {
                round1(published_score(p95))
            };
            SessionRecord {
                timestamp,
                session_type: ExerciseMode::Follow,
                duration_s: live.duration_s,
                hsv_lower: live.hsv.lower,
                hsv_upper: live.hsv.upper,
                tremor_score: score,
                frames_total: live.frames_total,
                frames_marker_found: live.frames_found,
                circle_center: None,
                circle_radius: None,
                avg_jitter: None,
                p95_jitter: None,
                inside_circle_pct: None,
                avg_lateral_jitter: Some(round2(avg)),
                p95_lateral_jitter: Some(round2(p95)),
                max_lateral_jitter: Some(round2(max)),
                beats_total: Some(live.beats),
            }
        }
    }
}
