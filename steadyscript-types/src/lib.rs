//! Shared types for the SteadyScript tremor assessment service.
//!
//! Everything that crosses a crate or wire boundary lives here: the HSV
//! detection range, the HOLD-mode calibration circle, the per-tick metrics
//! snapshot, the persistent session record, and the tagged duplex messages
//! exchanged with browser clients.

use serde::{Deserialize, Serialize};

/// Hue upper bound in the OpenCV convention (H ∈ [0, 179]).
pub const HUE_MAX: u8 = 179;

/// Exercise mode of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExerciseMode {
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "FOLLOW")]
    Follow,
}

impl std::fmt::Display for ExerciseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExerciseMode::Hold => write!(f, "HOLD"),
            ExerciseMode::Follow => write!(f, "FOLLOW"),
        }
    }
}

/// Session state machine states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETE")]
    Complete,
}

/// Stability classification shown to the user while holding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StabilityLevel {
    Stable,
    Warning,
    Unstable,
}

/// FOLLOW-mode feedback classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Good,
    Warning,
    Poor,
}

/// An inclusive HSV threshold range in the OpenCV convention
/// (H ∈ [0, 179], S and V ∈ [0, 255]).
///
/// The hue bound may wrap: `lower[0] > upper[0]` selects the union of the
/// two slices `[lower_h, 179]` and `[0, upper_h]`, which is how a red
/// marker straddling hue 0 is expressed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    pub fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    /// Does the hue bound wrap around 0?
    pub fn hue_wraps(&self) -> bool {
        self.lower[0] > self.upper[0]
    }

    /// Componentwise bounds check: hue within the OpenCV scale (wrap
    /// allowed), saturation and value with `lo <= hi`.
    pub fn validate(&self) -> Result<(), String> {
        if self.lower[0] > HUE_MAX || self.upper[0] > HUE_MAX {
            return Err(format!("hue bounds must be within 0..={HUE_MAX}"));
        }
        if self.lower[1] > self.upper[1] || self.lower[2] > self.upper[2] {
            return Err("saturation/value bounds must satisfy lo <= hi".to_string());
        }
        Ok(())
    }

    /// Test a single HSV pixel against the range.
    pub fn contains(&self, h: u8, s: u8, v: u8) -> bool {
        let hue_ok = if self.hue_wraps() {
            h >= self.lower[0] || h <= self.upper[0]
        } else {
            h >= self.lower[0] && h <= self.upper[0]
        };
        hue_ok
            && s >= self.lower[1]
            && s <= self.upper[1]
            && v >= self.lower[2]
            && v <= self.upper[2]
    }
}

/// The built-in marker colour presets selectable via `PEN_COLOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenColor {
    Red,
    Green,
    Blue,
}

impl PenColor {
    pub fn hsv_range(&self) -> HsvRange {
        match self {
            PenColor::Red => HsvRange::new([0, 100, 100], [10, 255, 255]),
            PenColor::Green => HsvRange::new([35, 50, 50], [85, 255, 255]),
            PenColor::Blue => HsvRange::new([100, 50, 50], [130, 255, 255]),
        }
    }
}

impl std::str::FromStr for PenColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(PenColor::Red),
            "green" => Ok(PenColor::Green),
            "blue" => Ok(PenColor::Blue),
            other => Err(format!(
                "unknown pen color {other:?} (expected red, green or blue)"
            )),
        }
    }
}

/// The calibrated HOLD target circle, built from two user clicks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Calibration {
    pub center: (i32, i32),
    pub radius: f64,
}

impl Calibration {
    /// Euclidean inside-test, boundary inclusive.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        let dx = (x - self.center.0) as f64;
        let dy = (y - self.center.1) as f64;
        (dx * dx + dy * dy).sqrt() <= self.radius
    }
}

/// Pixel position on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl From<(i32, i32)> for Position {
    fn from((x, y): (i32, i32)) -> Self {
        Position { x, y }
    }
}

/// Live snapshot published once per pipeline tick.
///
/// Mode-specific fields are `None` (and omitted from the JSON) when the
/// other mode is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub mode: ExerciseMode,
    pub position: Option<Position>,
    pub marker_detected: bool,
    pub jitter: f64,
    pub p95_jitter: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lateral_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_lateral_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_level: Option<StabilityLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_status: Option<FeedbackStatus>,
    pub score: f64,
    pub session_state: SessionState,
    pub time_remaining: f64,
    pub elapsed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beat_count: Option<u64>,
}

/// One completed exercise, as persisted to the session history file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// ISO-8601 UTC completion time.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub session_type: ExerciseMode,
    pub duration_s: f64,
    pub hsv_lower: [u8; 3],
    pub hsv_upper: [u8; 3],
    /// Published 0–100 score; higher is steadier. For FOLLOW sessions this
    /// is the movement quality score over lateral jitter.
    pub tremor_score: f64,
    pub frames_total: u64,
    pub frames_marker_found: u64,

    // HOLD only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circle_center: Option<[i32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circle_radius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inside_circle_pct: Option<f64>,

    // FOLLOW only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_lateral_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_lateral_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lateral_jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beats_total: Option<u64>,
}

/// Commands accepted from clients, over the duplex channel or the HTTP
/// command endpoints. Unknown `type` tags fail to parse and are ignored by
/// the transport layer without closing the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    ModeSwitch { mode: ExerciseMode },
    SessionStart,
    SessionStop,
    CalibrationClick { x: i32, y: i32 },
    BpmChange { delta: i32 },
    HsvUpdate(HsvRange),
    Dismiss,
}

/// Messages sent to clients on the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One-shot greeting on connect.
    Connected { message: String },
    /// Base64-encoded JPEG of the annotated frame.
    Frame(String),
    Metrics(MetricsSnapshot),
    SessionComplete(SessionRecord),
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hsv_range_plain() {
        let r = PenColor::Blue.hsv_range();
        assert!(!r.hue_wraps());
        assert!(r.contains(115, 200, 200));
        assert!(!r.contains(99, 200, 200));
        assert!(!r.contains(115, 40, 200));
    }

    #[test]
    fn hsv_range_hue_wrap() {
        // A red marker straddling hue zero.
        let r = HsvRange::new([170, 100, 100], [10, 255, 255]);
        assert!(r.hue_wraps());
        assert!(r.contains(175, 150, 150));
        assert!(r.contains(5, 150, 150));
        assert!(!r.contains(90, 150, 150));
    }

    #[test]
    fn hsv_validation() {
        assert!(PenColor::Red.hsv_range().validate().is_ok());
        // Hue wrap is legal.
        assert!(HsvRange::new([170, 100, 100], [10, 255, 255]).validate().is_ok());
        // Hue beyond the OpenCV scale is not.
        assert!(HsvRange::new([200, 100, 100], [10, 255, 255]).validate().is_err());
        // Saturation bounds may not be inverted.
        assert!(HsvRange::new([10, 200, 100], [20, 100, 255]).validate().is_err());
    }

    #[test]
    fn calibration_boundary_inclusive() {
        let cal = Calibration {
            center: (320, 240),
            radius: 20.0,
        };
        assert!(cal.contains(320, 240));
        assert!(cal.contains(340, 240));
        assert!(!cal.contains(341, 240));
    }

    #[test]
    fn client_command_wire_format() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type": "session_start"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::SessionStart);

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type": "calibration_click", "data": {"x": 320, "y": 240}}"#)
                .unwrap();
        assert_eq!(cmd, ClientCommand::CalibrationClick { x: 320, y: 240 });

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type": "hsv_update", "data": {"lower": [100, 50, 50], "upper": [130, 255, 255]}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::HsvUpdate(HsvRange::new([100, 50, 50], [130, 255, 255]))
        );

        // Unknown command types must fail to parse (the transport ignores
        // them) rather than panic.
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn server_message_tags() {
        let msg = ServerMessage::Frame("abcd".to_string());
        let buf = serde_json::to_string(&msg).unwrap();
        assert_eq!(buf, r#"{"type":"frame","data":"abcd"}"#);

        let msg = ServerMessage::Error("camera not initialized".to_string());
        let buf = serde_json::to_string(&msg).unwrap();
        assert!(buf.starts_with(r#"{"type":"error""#));
    }

    #[test]
    fn record_omits_other_modes_fields() {
        let record = SessionRecord {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            session_type: ExerciseMode::Hold,
            duration_s: 10.0,
            hsv_lower: [100, 50, 50],
            hsv_upper: [130, 255, 255],
            tremor_score: 97.5,
            frames_total: 300,
            frames_marker_found: 300,
            circle_center: Some([320, 240]),
            circle_radius: Some(20.0),
            avg_jitter: Some(0.3),
            p95_jitter: Some(0.5),
            inside_circle_pct: Some(100.0),
            avg_lateral_jitter: None,
            p95_lateral_jitter: None,
            max_lateral_jitter: None,
            beats_total: None,
        };
        let buf = serde_json::to_string(&record).unwrap();
        assert!(buf.contains(r#""type":"HOLD""#));
        assert!(buf.contains("inside_circle_pct"));
        assert!(!buf.contains("lateral"));
        assert!(!buf.contains("beats_total"));

        // Round trip.
        let back: SessionRecord = serde_json::from_str(&buf).unwrap();
        assert_eq!(back, record);
    }
}
