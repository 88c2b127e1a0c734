//! Rolling stability windows and scoring math.
//!
//! The jitter algorithm: maintain a rolling window of recent marker
//! positions, compute the smoothed position as the arithmetic mean of the
//! window, and define the per-frame jitter as the Euclidean distance from
//! the raw position to that mean. Larger deviation from the recent trend
//! means more tremor.

use std::collections::VecDeque;

use steadyscript_types::{FeedbackStatus, StabilityLevel};

/// Default capacity of the position and jitter windows.
pub const DEFAULT_WINDOW_SIZE: usize = 30;

/// Percentile with linear interpolation between nearest ranks.
///
/// Sort ascending; for percentile `p` ∈ [0, 100] on `n` samples the rank is
/// `r = p/100 · (n−1)`; interpolate linearly between `⌊r⌋` and `⌈r⌉`.
/// Empty input yields 0. This must stay numerically identical across
/// implementations; do not substitute another percentile definition.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Published 0–100 score from a p95 jitter figure; higher is steadier.
pub fn published_score(p95: f64) -> f64 {
    (100.0 - 5.0 * p95).max(0.0)
}

/// Raw weighted tremor figure. Logged for diagnostics; the persistent
/// record stores [published_score] instead.
pub fn raw_tremor_score(p95: f64, avg: f64) -> f64 {
    0.7 * p95 + 0.3 * avg
}

/// Stability band for a live jitter value against the configured thresholds.
pub fn level_for_jitter(jitter: f64, low: f64, high: f64) -> StabilityLevel {
    if jitter <= low {
        StabilityLevel::Stable
    } else if jitter <= high {
        StabilityLevel::Warning
    } else {
        StabilityLevel::Unstable
    }
}

/// Stability band for a published 0–100 score.
pub fn level_for_score(score: f64) -> StabilityLevel {
    if score >= 80.0 {
        StabilityLevel::Stable
    } else if score >= 50.0 {
        StabilityLevel::Warning
    } else {
        StabilityLevel::Unstable
    }
}

/// FOLLOW feedback band from the rolling p95 of lateral jitter.
pub fn feedback_for_lateral_p95(p95: f64) -> FeedbackStatus {
    if p95 <= 8.0 {
        FeedbackStatus::Good
    } else if p95 <= 15.0 {
        FeedbackStatus::Warning
    } else {
        FeedbackStatus::Poor
    }
}

/// Rolling smoother and jitter window (capacity-bounded FIFO).
///
/// Undetected frames do not advance the windows; the previous smoothed
/// position stays valid for exactly one such frame and then expires.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    window: usize,
    positions: VecDeque<(f64, f64)>,
    jitters: VecDeque<f64>,
    smoothed: Option<(f64, f64)>,
    misses_since_update: u32,
}

impl StabilityTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            positions: VecDeque::with_capacity(window),
            jitters: VecDeque::with_capacity(window),
            smoothed: None,
            misses_since_update: 0,
        }
    }

    /// Feed one detected position; returns the per-frame jitter.
    pub fn update(&mut self, x: f64, y: f64) -> f64 {
        if self.positions.len() == self.window {
            self.positions.pop_front();
        }
        self.positions.push_back((x, y));

        let n = self.positions.len() as f64;
        let sx: f64 = self.positions.iter().map(|p| p.0).sum();
        let sy: f64 = self.positions.iter().map(|p| p.1).sum();
        let smoothed = (sx / n, sy / n);
        self.smoothed = Some(smoothed);
        self.misses_since_update = 0;

        let jitter = ((x - smoothed.0).powi(2) + (y - smoothed.1).powi(2)).sqrt();
        if self.jitters.len() == self.window {
            self.jitters.pop_front();
        }
        self.jitters.push_back(jitter);
        jitter
    }

    /// Feed one undetected frame.
    pub fn update_missing(&mut self) {
        self.misses_since_update = self.misses_since_update.saturating_add(1);
        if self.misses_since_update > 1 {
            self.smoothed = None;
        }
    }

    /// Smoothed position, if still valid.
    pub fn smoothed(&self) -> Option<(f64, f64)> {
        self.smoothed
    }

    /// Most recent per-frame jitter (0 when the window is empty).
    pub fn jitter_now(&self) -> f64 {
        self.jitters.back().copied().unwrap_or(0.0)
    }

    pub fn p95_jitter(&self) -> f64 {
        let vals: Vec<f64> = self.jitters.iter().copied().collect();
        percentile(&vals, 95.0)
    }

    pub fn mean_jitter(&self) -> f64 {
        let vals: Vec<f64> = self.jitters.iter().copied().collect();
        mean(&vals)
    }

    pub fn reset(&mut self) {
        self.positions.clear();
        self.jitters.clear();
        self.smoothed = None;
        self.misses_since_update = 0;
    }
}

/// Magnitude of the component of `deviation` perpendicular to the unit
/// vector `tangent`. This is the lateral jitter: sideways wobble only,
/// ignoring motion along the expected path.
pub fn lateral_magnitude(deviation: (f64, f64), tangent: (f64, f64)) -> f64 {
    let forward = deviation.0 * tangent.0 + deviation.1 * tangent.1;
    let lat_x = deviation.0 - forward * tangent.0;
    let lat_y = deviation.1 - forward * tangent.1;
    (lat_x * lat_x + lat_y * lat_y).sqrt()
}

/// The FOLLOW-mode target: a dot circling a fixed centre at the metronome
/// rate. One revolution per beat interval scaled by 2π, i.e. angular rate
/// ω = 2π·BPM/60 rad/s.
#[derive(Debug, Clone, Copy)]
pub struct TargetPath {
    pub center: (f64, f64),
    pub radius: f64,
    pub bpm: u32,
}

impl TargetPath {
    pub fn new(center: (f64, f64), radius: f64, bpm: u32) -> Self {
        Self {
            center,
            radius,
            bpm,
        }
    }

    fn omega(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.bpm as f64 / 60.0
    }

    /// Target dot position at `t` seconds after session start.
    pub fn position_at(&self, t: f64) -> (f64, f64) {
        let theta = self.omega() * t;
        (
            self.center.0 + self.radius * theta.cos(),
            self.center.1 + self.radius * theta.sin(),
        )
    }

    /// Unit tangent of the path at `t`.
    pub fn tangent_at(&self, t: f64) -> (f64, f64) {
        let theta = self.omega() * t;
        (-theta.sin(), theta.cos())
    }

    /// Number of whole beats elapsed by `t`.
    pub fn beats_at(&self, t: f64) -> u64 {
        ((t * self.bpm as f64) / 60.0).floor().max(0.0) as u64
    }
}
