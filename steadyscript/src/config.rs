use std::path::PathBuf;

use clap::Parser;
use steadyscript_types::{HsvRange, PenColor};

/// Command-line arguments. Every option can also be set through the
/// corresponding environment variable.
#[derive(Debug, Parser)]
#[command(name = "steadyscript", version, about = "Real-time hand-tremor assessment server")]
pub struct Args {
    /// V4L2 capture device index.
    #[arg(long, env = "CAMERA_INDEX", default_value_t = 0)]
    pub camera_index: usize,

    /// Address for the HTTP/WebSocket server.
    #[arg(long, env = "HTTP_SERVER_ADDR", default_value = "127.0.0.1:8000")]
    pub http_server_addr: String,

    /// Default marker colour preset (red, green or blue).
    #[arg(long, env = "PEN_COLOR", default_value = "red")]
    pub pen_color: PenColor,

    /// Capacity of the rolling position/jitter windows.
    #[arg(long, env = "STABILITY_WINDOW_SIZE", default_value_t = 30)]
    pub stability_window_size: usize,

    /// Jitter at or below this is "stable" (pixels).
    #[arg(long, env = "JITTER_THRESHOLD_LOW", default_value_t = 5.0)]
    pub jitter_threshold_low: f64,

    /// Jitter above this is "unstable" (pixels).
    #[arg(long, env = "JITTER_THRESHOLD_HIGH", default_value_t = 15.0)]
    pub jitter_threshold_high: f64,

    /// Serial device for the LED feedback box. Unset disables the gateway.
    #[arg(long, env = "LED_SERIAL_PATH")]
    pub led_serial_path: Option<String>,

    /// Session history file.
    #[arg(long, env = "SESSIONS_FILE", default_value = "./data/sessions.json")]
    pub sessions_file: PathBuf,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub camera_index: usize,
    pub http_server_addr: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_rate: u32,
    pub default_hsv: HsvRange,
    pub stability_window_size: usize,
    pub jitter_threshold_low: f64,
    pub jitter_threshold_high: f64,
    pub hold_duration_s: f64,
    pub follow_duration_s: f64,
    pub default_bpm: u32,
    pub follow_target_radius: f64,
    pub led_serial_path: Option<String>,
    pub sessions_file: PathBuf,
}

impl AppConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            camera_index: args.camera_index,
            http_server_addr: args.http_server_addr.clone(),
            frame_width: 640,
            frame_height: 480,
            frame_rate: 30,
            default_hsv: args.pen_color.hsv_range(),
            stability_window_size: args.stability_window_size,
            jitter_threshold_low: args.jitter_threshold_low,
            jitter_threshold_high: args.jitter_threshold_high,
            hold_duration_s: 10.0,
            follow_duration_s: 20.0,
            default_bpm: 60,
            follow_target_radius: 120.0,
            led_serial_path: args.led_serial_path.clone(),
            sessions_file: args.sessions_file.clone(),
        }
    }

    /// The FOLLOW target path circles the frame centre.
    pub fn follow_target_center(&self) -> (f64, f64) {
        (
            self.frame_width as f64 / 2.0,
            self.frame_height as f64 / 2.0,
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            http_server_addr: "127.0.0.1:8000".to_string(),
            frame_width: 640,
            frame_height: 480,
            frame_rate: 30,
            default_hsv: PenColor::Red.hsv_range(),
            stability_window_size: 30,
            jitter_threshold_low: 5.0,
            jitter_threshold_high: 15.0,
            hold_duration_s: 10.0,
            follow_duration_s: 20.0,
            default_bpm: 60,
            follow_target_radius: 120.0,
            led_serial_path: None,
            sessions_file: PathBuf::from("./data/sessions.json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.frame_width, 640);
        assert_eq!(cfg.frame_height, 480);
        assert_eq!(cfg.hold_duration_s, 10.0);
        assert_eq!(cfg.follow_duration_s, 20.0);
        assert_eq!(cfg.follow_target_center(), (320.0, 240.0));
        assert_eq!(cfg.follow_target_radius, 120.0);
    }
}
